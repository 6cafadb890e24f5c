//! Continuous-batching inference core: a slot pool, FIFO admission queue,
//! and an update loop that interleaves prompt prefill with token generation
//! across concurrent requests in one decode call per tick.

mod admission;
mod error;
mod hash;
mod request;
mod runtime;
mod sampler;
mod scheduler;
mod slot;
mod stream;
mod token_buffer;

pub use error::{CoreError, Result};
pub use request::{Callbacks, MediaAttachment, Request, RequestId, StreamEvent, TaskParams};
pub use runtime::{Core, CoreConfig, FALLBACK_CHAT_TEMPLATE};
pub use sampler::config::{GrammarConfig, GrammarTrigger, Mirostat, SamplerStage, SamplingConfig};
pub use token_buffer::MediaKind;
