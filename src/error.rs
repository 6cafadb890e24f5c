//! Error taxonomy for the inference core.
//!
//! Variants map directly onto the failure classes the scheduler and
//! admission stage can produce: construction-time configuration problems,
//! admission/tokenization rejections, decode failures, sampler bugs, and
//! cooperative cancellation on shutdown. Stop conditions (EOG, max tokens,
//! stop string) are not represented here — they are normal terminations.

use llama_cpp_2::{
    ChatTemplateError, DecodeError, LlamaContextLoadError, LlamaModelLoadError,
    StringToTokenError, TokenToStringError, context::kv_cache::KvCacheConversionError,
    llama_batch::BatchAddError,
};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("could not load model: {0}")]
    ModelLoad(#[from] LlamaModelLoadError),

    #[error("could not create context: {0}")]
    ContextCreate(#[from] LlamaContextLoadError),

    #[error("request rejected at admission: {0}")]
    AdmissionRejected(String),

    #[error("could not tokenize prompt: {0}")]
    Tokenization(#[from] StringToTokenError),

    #[error("could not detokenize token: {0}")]
    Detokenize(#[from] TokenToStringError),

    #[error("could not add token to batch: {0}")]
    BatchAdd(#[from] BatchAddError),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("kv cache operation failed: {0}")]
    KvCache(#[from] KvCacheConversionError),

    #[error("could not read chat template: {0}")]
    ChatTemplate(#[from] ChatTemplateError),

    #[error("sampler produced no candidate token")]
    SamplerFailure,

    #[error("unknown special token: {0}")]
    UnknownSpecialToken(String),

    #[error("request cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, CoreError>;
