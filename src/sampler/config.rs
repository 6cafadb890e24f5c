//! Sampling configuration and grammar trigger types.

use serde::{Deserialize, Serialize};

/// One stage in the non-mirostat sampler pipeline, in the order the caller
/// wants it applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplerStage {
    Penalties,
    Dry,
    TopNSigma,
    TopK,
    TypicalP,
    TopP,
    MinP,
    Xtc,
    Temperature,
    Infill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirostat {
    Disabled,
    V1,
    V2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub seed: u32,
    pub samplers: Vec<SamplerStage>,

    pub top_k: i32,
    pub top_p: f32,
    pub min_p: f32,
    pub typ_p: f32,
    pub xtc_probability: f32,
    pub xtc_threshold: f32,
    pub temp: f32,
    pub dynatemp_range: f32,
    pub dynatemp_exponent: f32,
    pub top_n_sigma: f32,

    pub penalty_last_n: i32,
    pub penalty_repeat: f32,
    pub penalty_freq: f32,
    pub penalty_present: f32,

    pub dry_multiplier: f32,
    pub dry_base: f32,
    pub dry_allowed_length: i32,
    pub dry_penalty_last_n: i32,
    pub dry_sequence_breakers: Vec<String>,

    pub mirostat: Mirostat,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,

    pub min_keep: i32,
    pub n_prev: i32,

    pub grammar: Option<GrammarConfig>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            seed: 0xFFFF_FFFF,
            samplers: vec![
                SamplerStage::Penalties,
                SamplerStage::Dry,
                SamplerStage::TopNSigma,
                SamplerStage::TopK,
                SamplerStage::TypicalP,
                SamplerStage::TopP,
                SamplerStage::MinP,
                SamplerStage::Xtc,
                SamplerStage::Temperature,
            ],
            top_k: 40,
            top_p: 0.95,
            min_p: 0.05,
            typ_p: 1.0,
            xtc_probability: 0.0,
            xtc_threshold: 0.1,
            temp: 0.8,
            dynatemp_range: 0.0,
            dynatemp_exponent: 1.0,
            top_n_sigma: -1.0,
            penalty_last_n: 64,
            penalty_repeat: 1.0,
            penalty_freq: 0.0,
            penalty_present: 0.0,
            dry_multiplier: 0.0,
            dry_base: 1.75,
            dry_allowed_length: 2,
            dry_penalty_last_n: -1,
            dry_sequence_breakers: vec!["\n".into(), ":".into(), "\"".into(), "*".into()],
            mirostat: Mirostat::Disabled,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            min_keep: 0,
            n_prev: 64,
            grammar: None,
        }
    }
}

/// Tagged grammar trigger variant: fires lazy-grammar activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GrammarTrigger {
    Word(String),
    Pattern(String),
    PatternFull(String),
    Token(i32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrammarConfig {
    pub source: String,
    pub lazy: bool,
    pub triggers: Vec<GrammarTrigger>,
    pub preserved_tokens: Vec<i32>,
}
