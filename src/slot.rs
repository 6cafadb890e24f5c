//! Per-stream slot state.

use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::mtmd::MtmdInputChunks;
use llama_cpp_2::token::LlamaToken;

use crate::error::CoreError;
use crate::request::Request;
use crate::sampler::Sampler;
use crate::stream::Utf8Streamer;
use crate::token_buffer::TokenBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Started,
    ProcessingPrompt,
    DonePrompt,
    Generating,
}

pub struct Slot {
    pub id: i32,
    pub seq_id: i32,
    pub state: SlotState,
    pub request: Option<Request>,
    pub sampler: Option<Sampler>,

    /// The prompt, as tokens/placeholders, for the currently bound request.
    pub prompt: TokenBuffer,
    /// Mirror of what the runtime's KV cache actually holds for this slot's
    /// sequence id.
    pub cache: TokenBuffer,
    /// Set when the prompt carries media: the tokenized-but-not-yet-decoded
    /// chunk list, evaluated in one shot by the scheduler's prefill step
    /// (the safe mtmd binding has no incremental per-chunk decode).
    pub pending_chunks: Option<MtmdInputChunks>,

    pub n_past: i32,
    pub n_prompt_tokens_processed: i32,
    pub n_decoded: i32,
    pub i_batch: i32,
    pub sampled: LlamaToken,
    pub truncated: bool,
    pub generated_text: String,
    pub streamer: Utf8Streamer,
}

impl Slot {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            seq_id: id,
            state: SlotState::Idle,
            request: None,
            sampler: None,
            prompt: TokenBuffer::new(),
            cache: TokenBuffer::new(),
            pending_chunks: None,
            n_past: 0,
            n_prompt_tokens_processed: 0,
            n_decoded: 0,
            i_batch: -1,
            sampled: LlamaToken::new(0),
            truncated: false,
            generated_text: String::new(),
            streamer: Utf8Streamer::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SlotState::Idle) && self.request.is_none()
    }

    /// Bind a freshly tokenized request to this (idle) slot. `chunks` is
    /// `Some` when the prompt carries media still awaiting evaluation.
    pub fn bind(
        &mut self,
        request: Request,
        prompt: TokenBuffer,
        sampler: Sampler,
        chunks: Option<MtmdInputChunks>,
    ) {
        debug_assert!(self.is_idle());
        self.request = Some(request);
        self.prompt = prompt;
        self.sampler = Some(sampler);
        self.cache = TokenBuffer::new();
        self.pending_chunks = chunks;
        self.n_past = 0;
        self.n_prompt_tokens_processed = 0;
        self.n_decoded = 0;
        self.i_batch = -1;
        self.truncated = false;
        self.generated_text.clear();
        self.streamer = Utf8Streamer::new();
        self.state = SlotState::Started;
    }

    /// Normal completion: fulfil the request with the accumulated text.
    pub fn release(&mut self) {
        if let Some(mut request) = self.request.take() {
            let text = std::mem::take(&mut self.generated_text);
            request.complete(Ok(text));
        }
        self.sampler = None;
        self.pending_chunks = None;
        self.state = SlotState::Idle;
    }

    /// Abnormal termination: fulfil the request with `error` (when present)
    /// and return to idle.
    pub fn reset(&mut self, error: Option<CoreError>) {
        if let Some(mut request) = self.request.take() {
            match error {
                Some(err) => request.complete(Err(err)),
                None => {
                    let text = std::mem::take(&mut self.generated_text);
                    request.complete(Ok(text));
                }
            }
        }
        self.sampler = None;
        self.pending_chunks = None;
        self.state = SlotState::Idle;
    }

    /// Whether generation should stop after sampling `id`.
    pub fn process_token(&self, model: &LlamaModel, id: LlamaToken, piece: &str) -> bool {
        if model.is_eog_token(id) {
            return false;
        }
        let Some(request) = &self.request else { return false };
        if request.params.maximum_tokens >= 0 && self.n_decoded >= request.params.maximum_tokens {
            return false;
        }
        if request
            .params
            .stop_strings
            .iter()
            .any(|stop| !stop.is_empty() && piece.contains(stop.as_str()))
        {
            return false;
        }
        true
    }

    /// Whether `self` and `other` are in the same macro-phase and can share
    /// a tick's batch.
    pub fn can_batch_with(&self, other: &Slot) -> bool {
        self.state == other.state
    }
}
