//! FIFO request queue and the tokenization worker that binds requests to
//! slots.
//!
//! Submission only ever touches the queue's own mutex+condvar; binding a
//! slot happens on the tokenization thread, which waits on a *separate*
//! condvar notified by the scheduler on every slot release — replacing the
//! original's 10 ms polling sleep.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::mtmd::{MtmdBitmap, MtmdContext, MtmdInputChunks, MtmdInputText};

use crate::error::{CoreError, Result};
use crate::hash::hash_media;
use crate::request::Request;
use crate::sampler::Sampler;
use crate::slot::Slot;
use crate::token_buffer::TokenBuffer;

pub struct PendingTask {
    pub request: Request,
}

#[derive(Default)]
pub struct AdmissionQueue {
    queue: Mutex<VecDeque<PendingTask>>,
    has_work: Condvar,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self { queue: Mutex::new(VecDeque::new()), has_work: Condvar::new() }
    }

    pub fn push(&self, task: PendingTask) {
        let mut queue = self.queue.lock().unwrap();
        queue.push_back(task);
        self.has_work.notify_one();
    }

    /// Block until a task is available or `running` flips false.
    fn pop_blocking(&self, running: &AtomicBool) -> Option<PendingTask> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            if !running.load(Ordering::Acquire) {
                return None;
            }
            let (guard, _timeout) = self
                .has_work
                .wait_timeout(queue, std::time::Duration::from_millis(100))
                .unwrap();
            queue = guard;
        }
    }

    /// Drain and return every still-queued task, used on shutdown.
    pub fn drain(&self) -> Vec<PendingTask> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

/// Runs on the dedicated tokenization thread until `running` goes false.
pub fn run_tokenizer(
    queue: Arc<AdmissionQueue>,
    slots: Arc<Vec<Mutex<Slot>>>,
    free_slot: Arc<Condvar>,
    free_slot_lock: Arc<Mutex<()>>,
    model: Arc<LlamaModel>,
    mm_ctx: Option<Arc<MtmdContext>>,
    running: Arc<AtomicBool>,
) {
    while let Some(task) = queue.pop_blocking(&running) {
        let slot_idx = match wait_for_free_slot(&slots, &free_slot, &free_slot_lock, &running) {
            Some(idx) => idx,
            None => {
                // Shutdown raced us; the request is simply abandoned, per
                // the documented drop-queued-requests-on-stop behavior.
                break;
            }
        };
        bind_request(task.request, &slots[slot_idx], &model, mm_ctx.as_deref());
    }
}

/// Wait until some slot is IDLE, returning its index. `None` means shutdown
/// was requested while waiting.
fn wait_for_free_slot(
    slots: &[Mutex<Slot>],
    free_slot: &Condvar,
    free_slot_lock: &Mutex<()>,
    running: &AtomicBool,
) -> Option<usize> {
    loop {
        if let Some(idx) = slots.iter().position(|s| s.lock().unwrap().is_idle()) {
            return Some(idx);
        }
        if !running.load(Ordering::Acquire) {
            return None;
        }
        let guard = free_slot_lock.lock().unwrap();
        let _ = free_slot.wait_timeout(guard, std::time::Duration::from_millis(100));
    }
}

fn bind_request(
    mut request: Request,
    slot: &Mutex<Slot>,
    model: &Arc<LlamaModel>,
    mm_ctx: Option<&MtmdContext>,
) {
    match tokenize_request(&request, model, mm_ctx) {
        Ok((prompt, sampler, chunks)) => slot.lock().unwrap().bind(request, prompt, sampler, chunks),
        Err(err) => request.complete(Err(err)),
    }
}

fn tokenize_request(
    request: &Request,
    model: &Arc<LlamaModel>,
    mm_ctx: Option<&MtmdContext>,
) -> Result<(TokenBuffer, Sampler, Option<MtmdInputChunks>)> {
    let sampler = Sampler::new(model.clone(), &request.params.sampling)?;

    if request.params.media.is_empty() {
        let tokens = model.str_to_token(&request.params.prompt, AddBos::Never)?;
        return Ok((TokenBuffer::from_tokens(tokens), sampler, None));
    }

    let mm_ctx = mm_ctx.ok_or_else(|| {
        CoreError::Configuration("request has media but no multimodal projector was loaded".into())
    })?;

    let hash_ids: Vec<String> =
        request.params.media.iter().map(|attachment| hash_media(&attachment.bytes)).collect();
    let bitmaps = request
        .params
        .media
        .iter()
        .map(|attachment| {
            MtmdBitmap::from_bytes(&attachment.bytes).map_err(|e| {
                CoreError::Configuration(format!("failed to decode media bitmap: {e}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let bitmap_refs: Vec<&MtmdBitmap> = bitmaps.iter().collect();

    let input =
        MtmdInputText { text: request.params.prompt.clone(), add_special: true, parse_special: true };
    let chunks = mm_ctx
        .tokenize(input, &bitmap_refs)
        .map_err(|e| CoreError::Configuration(format!("mtmd tokenization failed: {e}")))?;

    let mut buffer = TokenBuffer::new();
    buffer.append_chunks(&chunks, &hash_ids);
    Ok((buffer, sampler, Some(chunks)))
}
