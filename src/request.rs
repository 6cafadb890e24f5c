//! Requests and task parameters submitted by callers.

use tokio::sync::{mpsc, oneshot};

use crate::error::CoreError;
use crate::sampler::SamplingConfig;
use crate::token_buffer::MediaKind;

pub type RequestId = u64;

/// A caller-supplied media attachment (not yet hashed/bitmapped).
#[derive(Debug, Clone)]
pub struct MediaAttachment {
    pub bytes: Vec<u8>,
    pub kind: MediaKind,
}

/// Optional callbacks invoked on the scheduler thread as a slot progresses.
/// Streaming callers typically only set `on_token`/`on_done`/`on_error`;
/// completion-only callers can leave all three unset and rely on the
/// [`Request`]'s completion channel instead.
pub struct Callbacks {
    pub on_token: Option<Box<dyn FnMut(&str) + Send>>,
    pub on_done: Option<Box<dyn FnMut(&str) + Send>>,
    pub on_error: Option<Box<dyn FnMut(&CoreError) + Send>>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_token", &self.on_token.is_some())
            .field("on_done", &self.on_done.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self { on_token: None, on_done: None, on_error: None }
    }
}

#[derive(Debug)]
pub struct TaskParams {
    pub prompt: String,
    pub sampling: SamplingConfig,
    pub stream: bool,
    /// Negative means unbounded up to the context limit.
    pub maximum_tokens: i32,
    pub stop_strings: Vec<String>,
    pub media: Vec<MediaAttachment>,
}

impl Default for TaskParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            sampling: SamplingConfig::default(),
            stream: false,
            maximum_tokens: -1,
            stop_strings: Vec::new(),
            media: Vec::new(),
        }
    }
}

/// Emitted to a streaming caller's queue; mirrors the `on_token`/`on_done`/
/// `on_error` callback contract for clients that prefer to drain a channel.
#[derive(Debug)]
pub enum StreamEvent {
    Token(String),
    Done(String),
    Error(CoreError),
}

pub struct Request {
    pub id: RequestId,
    pub params: TaskParams,
    pub callbacks: Callbacks,
    pub stream_tx: Option<mpsc::UnboundedSender<StreamEvent>>,
    completion: Option<oneshot::Sender<Result<String, CoreError>>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("prompt_len", &self.params.prompt.len())
            .finish()
    }
}

impl Request {
    pub fn new(
        id: RequestId,
        params: TaskParams,
        callbacks: Callbacks,
        stream_tx: Option<mpsc::UnboundedSender<StreamEvent>>,
        completion: oneshot::Sender<Result<String, CoreError>>,
    ) -> Self {
        Self { id, params, callbacks, stream_tx, completion: Some(completion) }
    }

    /// Single-assignment fulfilment of the completion channel, firing the
    /// matching callback/stream event. Does nothing on a second call.
    pub fn complete(&mut self, result: Result<String, CoreError>) {
        match &result {
            Ok(text) => {
                if let Some(cb) = &mut self.callbacks.on_done {
                    cb(text);
                }
                if let Some(tx) = &self.stream_tx {
                    let _ = tx.send(StreamEvent::Done(text.clone()));
                }
            }
            Err(err) => {
                if let Some(cb) = &mut self.callbacks.on_error {
                    cb(err);
                }
                if let Some(tx) = &self.stream_tx {
                    let _ = tx.send(StreamEvent::Error(clone_error(err)));
                }
            }
        }
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(result);
        }
    }

    pub fn emit_token(&mut self, piece: &str) {
        if let Some(cb) = &mut self.callbacks.on_token {
            cb(piece);
        }
        if let Some(tx) = &self.stream_tx {
            let _ = tx.send(StreamEvent::Token(piece.to_string()));
        }
    }
}

/// `CoreError` doesn't implement `Clone` (it wraps upstream error types that
/// don't either); stream delivery needs its own copy, so render to a string.
fn clone_error(err: &CoreError) -> CoreError {
    CoreError::Configuration(err.to_string())
}
