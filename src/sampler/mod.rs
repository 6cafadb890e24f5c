//! Per-slot stochastic token selector.
//!
//! Wraps two independently-configured [`LlamaSampler`] chains: the
//! stage pipeline (penalties/top-k/top-p/.../terminal distribution, or a
//! mirostat chain) and an optional grammar sampler. Keeping them separate
//! — rather than composing the grammar into one combined chain — is what
//! lets `sample_grammar_first` and `sample_then_check` share one routine
//! while only ever touching the grammar stage in isolation for the
//! single-token check.

pub mod config;
mod grammar;

use std::collections::VecDeque;
use std::sync::Arc;

use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::token::data::LlamaTokenData;
use llama_cpp_2::token::data_array::LlamaTokenDataArray;

pub use config::{GrammarConfig, GrammarTrigger, Mirostat, SamplerStage, SamplingConfig};
use grammar::CompiledTriggers;

use crate::error::{CoreError, Result};

fn build_chain(config: &SamplingConfig, model: &LlamaModel) -> LlamaSampler {
    match config.mirostat {
        Mirostat::V1 => LlamaSampler::chain_simple([
            LlamaSampler::temp(config.temp),
            LlamaSampler::mirostat(model.n_vocab(), config.seed, config.mirostat_tau, config.mirostat_eta, 100),
        ]),
        Mirostat::V2 => LlamaSampler::chain_simple([
            LlamaSampler::temp(config.temp),
            LlamaSampler::mirostat_v2(config.seed, config.mirostat_tau, config.mirostat_eta),
        ]),
        Mirostat::Disabled => {
            let mut stages = Vec::with_capacity(config.samplers.len() + 1);
            for stage in &config.samplers {
                let sampler = match stage {
                    SamplerStage::Penalties => LlamaSampler::penalties(
                        config.penalty_last_n,
                        config.penalty_repeat,
                        config.penalty_freq,
                        config.penalty_present,
                    ),
                    SamplerStage::Dry => LlamaSampler::dry(
                        model,
                        model.n_ctx_train(),
                        config.dry_multiplier,
                        config.dry_base,
                        config.dry_allowed_length,
                        config.dry_penalty_last_n,
                        &config
                            .dry_sequence_breakers
                            .iter()
                            .map(String::as_str)
                            .collect::<Vec<_>>(),
                    ),
                    SamplerStage::TopNSigma => LlamaSampler::top_n_sigma(config.top_n_sigma),
                    SamplerStage::TopK => LlamaSampler::top_k(config.top_k),
                    SamplerStage::TypicalP => LlamaSampler::typical(config.typ_p, config.min_keep),
                    SamplerStage::TopP => LlamaSampler::top_p(config.top_p, config.min_keep),
                    SamplerStage::MinP => LlamaSampler::min_p(config.min_p, config.min_keep),
                    SamplerStage::Xtc => LlamaSampler::xtc(
                        config.xtc_probability,
                        config.xtc_threshold,
                        config.min_keep,
                        config.seed,
                    ),
                    SamplerStage::Temperature => LlamaSampler::temp_ext(
                        config.temp,
                        config.dynatemp_range,
                        config.dynatemp_exponent,
                    ),
                    SamplerStage::Infill => LlamaSampler::infill(model),
                };
                stages.push(sampler);
            }
            stages.push(LlamaSampler::dist(config.seed));
            LlamaSampler::chain_simple(stages)
        }
    }
}

/// Per-slot sampler: stage chain, optional grammar, lazy-trigger state and
/// penalty history.
pub struct Sampler {
    model: Arc<LlamaModel>,
    chain: LlamaSampler,
    grammar: Option<LlamaSampler>,
    triggers: Option<CompiledTriggers>,
    grammar_active: bool,
    history: VecDeque<LlamaToken>,
    history_cap: usize,
}

impl Sampler {
    pub fn new(model: Arc<LlamaModel>, config: &SamplingConfig) -> Result<Self> {
        let chain = build_chain(config, &model);
        let history_cap = (config.n_prev.max(0) as usize).max(32);

        let mut sampler = Self {
            model,
            chain,
            grammar: None,
            triggers: None,
            grammar_active: false,
            history: VecDeque::with_capacity(history_cap),
            history_cap,
        };
        if let Some(grammar_config) = &config.grammar {
            sampler.set_grammar(grammar_config)?;
        }
        Ok(sampler)
    }

    pub fn set_grammar(&mut self, config: &GrammarConfig) -> Result<()> {
        let grammar = LlamaSampler::grammar(&self.model, &config.source, "root").map_err(|e| {
            CoreError::Configuration(format!("failed to compile grammar: {e}"))
        })?;
        self.triggers = if config.triggers.is_empty() {
            None
        } else {
            Some(grammar::compile_triggers(&config.triggers)?)
        };
        self.grammar_active = !config.lazy || self.triggers.is_none();
        self.grammar = Some(grammar);
        Ok(())
    }

    /// Update lazy-activation state given the text generated so far and the
    /// last sampled token. No-op once already active or when no grammar or
    /// no triggers are configured.
    pub fn update_lazy_trigger(&mut self, generated_so_far: &str, last_token: LlamaToken) {
        if self.grammar_active {
            return;
        }
        if let Some(triggers) = &self.triggers {
            if triggers.matches(generated_so_far, last_token.0) {
                self.grammar_active = true;
            }
        }
    }

    fn active_grammar(&self) -> Option<&LlamaSampler> {
        if self.grammar_active { self.grammar.as_ref() } else { None }
    }

    /// Sample the next token from logits row `idx` (-1 = most recent).
    /// `grammar_first` selects `sample_grammar_first` vs `sample_then_check`
    /// — two entry points into the same candidate-building/selection code.
    pub fn sample(&self, ctx: &LlamaContext, idx: i32, grammar_first: bool) -> Result<LlamaToken> {
        let grammar = self.active_grammar();

        if grammar_first {
            let mut array = LlamaTokenDataArray::from_iter(ctx.candidates_ith(idx), false);
            if let Some(grammar) = grammar {
                array.apply_sampler(grammar);
            }
            array.apply_sampler(&self.chain);
            return array.selected_token().ok_or(CoreError::SamplerFailure);
        }

        let mut array = LlamaTokenDataArray::from_iter(ctx.candidates_ith(idx), false);
        array.apply_sampler(&self.chain);
        let candidate = array.selected_token().ok_or(CoreError::SamplerFailure)?;

        let Some(grammar) = grammar else {
            return Ok(candidate);
        };

        // Single-token check: the grammar sampler sets disallowed logits to
        // -infinity, so anything else means the candidate satisfies it.
        let mut check =
            LlamaTokenDataArray::from_iter([LlamaTokenData::new(candidate, 1.0, 0.0)], false);
        check.apply_sampler(grammar);
        let satisfies = check
            .data
            .iter()
            .find(|d| d.id() == candidate)
            .map(|d| d.logit() != f32::NEG_INFINITY)
            .unwrap_or(false);
        if satisfies {
            return Ok(candidate);
        }

        // Resample from the original logits with grammar applied first.
        let mut retry = LlamaTokenDataArray::from_iter(ctx.candidates_ith(idx), false);
        retry.apply_sampler(grammar);
        retry.apply_sampler(&self.chain);
        retry.selected_token().ok_or(CoreError::SamplerFailure)
    }

    /// Advance internal history. The grammar only observes the token when
    /// `accept_grammar` is true — prompt ingestion passes `false` so only
    /// the penalty history is updated.
    pub fn accept(&mut self, token: LlamaToken, accept_grammar: bool) {
        self.chain.accept(token);
        if accept_grammar {
            if let Some(grammar) = &mut self.grammar {
                grammar.accept(token);
            }
        }
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Clear chain and grammar internal state, not configuration.
    pub fn reset(&mut self) {
        self.chain.reset();
        if let Some(grammar) = &mut self.grammar {
            grammar.reset();
        }
        self.history.clear();
    }

    pub fn history(&self) -> impl Iterator<Item = &LlamaToken> {
        self.history.iter()
    }
}
