//! The continuous-batching update loop: one tick assembles a batch from
//! whichever slots are in compatible states, decodes it (retrying with a
//! halved window on transient failure), then fans the resulting logits back
//! out to samplers.
//!
//! Token rows destined for this tick's batch are collected into `rows`
//! rather than added straight into the shared [`LlamaBatch`] — the decode
//! retry loop needs to resubmit shrinking windows of the same rows, and the
//! safe batch wrapper only exposes whole-batch `decode`, not a way to
//! re-slice one already built.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use llama_cpp_2::DecodeError;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::{LlamaModel, Special};
use llama_cpp_2::mtmd::MtmdContext;
use llama_cpp_2::token::LlamaToken;

use crate::error::CoreError;
use crate::slot::{Slot, SlotState};
use crate::token_buffer::eval_mtmd_chunks;

pub struct SchedulerConfig {
    pub n_ctx: i32,
    pub n_batch: i32,
    pub n_ubatch: i32,
    pub n_keep: i32,
    /// Fixed context-shift discard size; `<= 0` means "half of `n_left`".
    pub n_discard: i32,
}

struct PendingRow {
    slot_idx: usize,
    token: LlamaToken,
    pos: i32,
    seq_id: i32,
    logits: bool,
}

/// Runs the update loop until `running` is cleared. Owns `ctx`/`batch`
/// exclusively for the lifetime of the call — they must not be touched from
/// any other thread.
pub fn run(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    mm_ctx: Option<&MtmdContext>,
    batch: &mut LlamaBatch,
    slots: &[Mutex<Slot>],
    config: &SchedulerConfig,
    free_slot_lock: &Mutex<()>,
    free_slot_cond: &Condvar,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        tick(ctx, model, mm_ctx, batch, slots, config, free_slot_lock, free_slot_cond);
    }
}

fn lock_all(slots: &[Mutex<Slot>]) -> Vec<MutexGuard<'_, Slot>> {
    slots.iter().map(|s| s.lock().unwrap()).collect()
}

fn tick(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    mm_ctx: Option<&MtmdContext>,
    batch: &mut LlamaBatch,
    slots: &[Mutex<Slot>],
    config: &SchedulerConfig,
    free_slot_lock: &Mutex<()>,
    free_slot_cond: &Condvar,
) {
    let mut guards = lock_all(slots);

    // 1. Idle check.
    if guards.iter().all(|s| s.is_idle()) {
        drop(guards);
        std::thread::sleep(Duration::from_millis(1));
        return;
    }

    // 2. Context-shift pass.
    for slot in guards.iter_mut() {
        context_shift_slot(slot, ctx, model, config);
    }

    // 3. Compatibility set: anchor is the first non-idle slot; the rest must
    // share its macro-phase.
    let Some(anchor) = guards.iter().position(|s| !s.is_idle()) else { return };
    let admitted: Vec<usize> =
        (0..guards.len()).filter(|&i| !guards[i].is_idle() && guards[i].can_batch_with(&guards[anchor])).collect();

    let mut rows: Vec<PendingRow> = Vec::new();

    // 4. Generation phase: one row per slot already producing tokens.
    for &i in &admitted {
        let slot = &mut guards[i];
        if slot.state != SlotState::Generating {
            continue;
        }
        let i_batch = rows.len();
        rows.push(PendingRow {
            slot_idx: i,
            token: slot.sampled,
            pos: slot.n_past,
            seq_id: slot.seq_id,
            logits: true,
        });
        slot.i_batch = i_batch as i32;
        slot.n_past += 1;
        slot.cache.append(slot.sampled);
    }

    // 5. Prefill phase: admit prompt work up to `n_batch` rows.
    for &i in &admitted {
        if rows.len() as i32 >= config.n_batch {
            break;
        }
        prefill_slot(&mut guards[i], i, ctx, mm_ctx, config, &mut rows);
    }

    if rows.is_empty() {
        return;
    }

    // 6. Decode with retry, replaying shrinking windows of `rows`.
    let outcome = decode_rows(ctx, batch, &rows, config.n_batch);

    let mut any_released = false;
    match outcome {
        DecodeOutcome::Aborted => {
            for slot in guards.iter_mut() {
                if !slot.is_idle() {
                    slot.reset(Some(CoreError::SamplerFailure));
                    any_released = true;
                }
            }
        }
        DecodeOutcome::Completed(ready_rows) => {
            // 7. Per-slot post-decode.
            for (global_idx, local_idx) in ready_rows {
                let row = &rows[global_idx];
                let slot = &mut guards[row.slot_idx];
                if slot.i_batch != global_idx as i32 {
                    continue;
                }
                if slot.state == SlotState::DonePrompt {
                    slot.state = SlotState::Generating;
                }
                if slot.state != SlotState::Generating {
                    continue;
                }
                slot.i_batch = -1;

                let token = match slot
                    .sampler
                    .as_ref()
                    .ok_or(CoreError::SamplerFailure)
                    .and_then(|s| s.sample(ctx, local_idx as i32, false))
                {
                    Ok(t) => t,
                    Err(err) => {
                        slot.reset(Some(err));
                        any_released = true;
                        continue;
                    }
                };
                let bytes = model.token_to_bytes(token, Special::Tokenize).unwrap_or_default();
                let piece = slot.streamer.push(&bytes);
                slot.generated_text.push_str(&piece);
                if let Some(sampler) = &mut slot.sampler {
                    sampler.accept(token, true);
                    sampler.update_lazy_trigger(&slot.generated_text, token);
                }
                slot.n_decoded += 1;

                let keep_going = slot.process_token(model, token, &piece);

                if let Some(request) = &mut slot.request {
                    if request.params.stream {
                        request.emit_token(&piece);
                    }
                }

                if keep_going {
                    slot.sampled = token;
                } else {
                    slot.release();
                    any_released = true;
                }
            }
        }
    }

    drop(guards);
    if any_released {
        notify_free_slot(free_slot_lock, free_slot_cond);
    }
}

fn context_shift_slot(slot: &mut Slot, ctx: &mut LlamaContext, model: &LlamaModel, config: &SchedulerConfig) {
    if slot.is_idle() || slot.n_past + 1 < config.n_ctx {
        return;
    }
    if slot.cache.has_media() || slot.pending_chunks.is_some() {
        return; // not supported; the slot will fail on its next decode
    }
    let add_bos = model.add_bos_token() as i32;
    let n_keep = config.n_keep.max(0) + add_bos;
    let n_left = slot.n_past - n_keep;
    let n_discard = if config.n_discard > 0 { config.n_discard.min(n_left) } else { n_left / 2 };
    if n_discard <= 0 {
        return;
    }
    if ctx
        .clear_kv_cache_seq(Some(slot.seq_id as u32), Some(n_keep as u32), Some((n_keep + n_discard) as u32))
        .is_err()
    {
        return;
    }
    let _ = ctx.kv_cache_seq_add(
        slot.seq_id,
        Some((n_keep + n_discard) as u32),
        Some(slot.n_past as u32),
        -n_discard,
    );
    ctx.kv_cache_update();
    slot.cache.shift(n_keep as usize, n_discard as usize);
    slot.n_past -= n_discard;
    slot.truncated = true;
}

fn prefill_slot(
    slot: &mut Slot,
    slot_idx: usize,
    ctx: &mut LlamaContext,
    mm_ctx: Option<&MtmdContext>,
    config: &SchedulerConfig,
    rows: &mut Vec<PendingRow>,
) {
    if slot.state != SlotState::Started && slot.state != SlotState::ProcessingPrompt {
        return;
    }

    if slot.state == SlotState::Started {
        slot.n_past = 0;
        slot.state = SlotState::ProcessingPrompt;
        if slot.prompt.is_empty() {
            slot.reset(Some(CoreError::AdmissionRejected("empty prompt".into())));
            return;
        }
        if slot.prompt.len() as i32 > config.n_ubatch {
            slot.reset(Some(CoreError::AdmissionRejected("prompt exceeds micro-batch".into())));
            return;
        }
        if slot.prompt.len() as i32 >= config.n_ctx {
            slot.reset(Some(CoreError::AdmissionRejected("prompt exceeds context window".into())));
            return;
        }
    }

    let prompt_size = slot.prompt.len() as i32;
    if rows.len() as i32 + (prompt_size - slot.n_past) > config.n_batch && slot.pending_chunks.is_none() {
        return; // defer to a future tick
    }

    if ctx.clear_kv_cache_seq(Some(slot.seq_id as u32), Some(slot.n_past as u32), None).is_err() {
        let _ = ctx.clear_kv_cache_seq(Some(slot.seq_id as u32), None, None);
        slot.n_past = 0;
    }
    slot.cache.keep_first(slot.n_past as usize);

    if let Some(chunks) = slot.pending_chunks.take() {
        let Some(mm_ctx) = mm_ctx else {
            slot.reset(Some(CoreError::Configuration("media prompt with no mtmd context".into())));
            return;
        };
        let prior_past = slot.n_past;
        match eval_mtmd_chunks(&chunks, mm_ctx, ctx, slot.n_past, slot.seq_id, config.n_batch) {
            Ok(new_past) => {
                slot.cache = slot.prompt.clone();
                slot.n_past = new_past;
                slot.n_prompt_tokens_processed += new_past - prior_past;
            }
            Err(err) => {
                slot.reset(Some(err));
                return;
            }
        }
    } else {
        while slot.n_past < prompt_size && rows.len() as i32 + 1 <= config.n_batch {
            let tok = slot.prompt.as_slice()[slot.n_past as usize];
            rows.push(PendingRow { slot_idx, token: tok, pos: slot.n_past, seq_id: slot.seq_id, logits: false });
            slot.cache.append(tok);
            slot.n_past += 1;
            slot.n_prompt_tokens_processed += 1;
        }
    }

    if slot.n_past == prompt_size {
        slot.state = SlotState::DonePrompt;
        if let Some(sampler) = &mut slot.sampler {
            for &tok in slot.cache.as_slice() {
                if tok != crate::token_buffer::NULL_TOKEN {
                    sampler.accept(tok, false);
                }
            }
        }
        if let Some(idx) = rows.iter().rposition(|r| r.slot_idx == slot_idx) {
            rows[idx].logits = true;
            slot.i_batch = idx as i32;
        } else {
            // Whole prompt was a single front-loaded media eval: there is no
            // row to flip, so manufacture the post-decode hook directly.
            slot.state = SlotState::Generating;
        }
    }
}

enum DecodeOutcome {
    /// `(global row index, local row index within the window it decoded in)`
    /// for every row whose logits were requested.
    Completed(Vec<(usize, usize)>),
    Aborted,
}

fn decode_rows(
    ctx: &mut LlamaContext,
    batch: &mut LlamaBatch,
    rows: &[PendingRow],
    configured_n_batch: i32,
) -> DecodeOutcome {
    let total = rows.len() as i32;
    let mut window = configured_n_batch.max(1);
    let mut i = 0i32;
    let mut ready = Vec::new();

    while i < total {
        let size = window.min(total - i);
        batch.clear();
        for row in &rows[i as usize..(i + size) as usize] {
            if batch.add(row.token, row.pos, &[row.seq_id], row.logits).is_err() {
                return DecodeOutcome::Aborted;
            }
        }
        match ctx.decode(batch) {
            Ok(()) => {
                for (local, row) in rows[i as usize..(i + size) as usize].iter().enumerate() {
                    if row.logits {
                        ready.push((i as usize + local, local));
                    }
                }
                i += size;
                window = configured_n_batch;
            }
            // Code 1: no KV slot for the batch — retryable by shrinking the
            // window, same as llama.cpp server's own batch-splitting path.
            // Any other (negative) code is a compute error and is fatal
            // regardless of window size.
            Err(DecodeError::NoKvCacheSlot) if size > 1 => {
                window /= 2;
                if window == 0 {
                    return DecodeOutcome::Aborted;
                }
            }
            Err(_) => return DecodeOutcome::Aborted,
        }
    }
    DecodeOutcome::Completed(ready)
}

fn notify_free_slot(lock: &Mutex<()>, cond: &Condvar) {
    let _guard = lock.lock().unwrap();
    cond.notify_all();
}
