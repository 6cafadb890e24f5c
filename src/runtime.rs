//! Public handle: construct, run, submit, and tear down.
//!
//! The scheduler owns its [`LlamaContext`] locally on its own thread — the
//! same shape as `nobodywho-core`'s `completion_worker_actor`, which builds
//! the context inside the worker closure rather than threading a borrowed
//! context back out through the handle. That sidesteps `LlamaContext`'s
//! borrow of `LlamaModel`/`LlamaBackend` entirely: the handle only ever
//! holds `Arc`s, and the thread closure captures clones of those `Arc`s,
//! so nothing here needs an `unsafe` lifetime extension.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::mtmd::{MtmdContext, MtmdContextParams};
use tokio::sync::{mpsc, oneshot};

use crate::admission::{self, AdmissionQueue, PendingTask};
use crate::error::{CoreError, Result};
use crate::request::{Callbacks, Request, RequestId, StreamEvent, TaskParams};
use crate::scheduler::{self, SchedulerConfig};
use crate::slot::Slot;

/// The ChatML fallback used when the model carries no usable template,
/// mirroring `nobodywho-core`'s note that `get_chat_template` should fall
/// back rather than panic.
pub const FALLBACK_CHAT_TEMPLATE: &str = concat!(
    "{% for message in messages %}",
    "{{ '<|im_start|>' + message['role'] + '\n' + message['content'] + '<|im_end|>\n' }}",
    "{% endfor %}",
    "{% if add_generation_prompt %}{{ '<|im_start|>assistant\n' }}{% endif %}",
);

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub model_path: String,
    pub projector_path: Option<String>,
    pub n_gpu_layers: u32,
    pub n_threads: i32,
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_keep: i32,
    pub n_discard: i32,
    pub n_slots: usize,
    pub use_mmap: bool,
    pub embedding: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            projector_path: None,
            n_gpu_layers: u32::MAX,
            n_threads: std::thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(1),
            n_ctx: 4096,
            n_batch: 512,
            n_keep: 0,
            n_discard: 0,
            n_slots: 1,
            use_mmap: true,
            embedding: false,
        }
    }
}

/// The inference runtime handle: one per loaded model, shared freely via
/// `Clone` (all shared state is reference-counted or already synchronized).
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    backend: Arc<LlamaBackend>,
    model: Arc<LlamaModel>,
    mm_ctx: Option<Arc<MtmdContext>>,
    config: CoreConfig,
    slots: Arc<Vec<Mutex<Slot>>>,
    queue: Arc<AdmissionQueue>,
    free_slot_lock: Arc<Mutex<()>>,
    free_slot_cond: Arc<Condvar>,
    running: Arc<AtomicBool>,
    next_id: AtomicU64,
    scheduler_thread: Mutex<Option<JoinHandle<()>>>,
    tokenizer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Core {
    /// Load the model (and, if configured, a multimodal projector), and
    /// build an idle slot pool. Does not start the update loop — call
    /// [`Core::run`] for that.
    pub fn construct(config: CoreConfig) -> Result<Self> {
        llama_cpp_2::send_logs_to_tracing(llama_cpp_2::LogOptions::default().with_logs_enabled(true));

        let backend = LlamaBackend::init()
            .map_err(|e| CoreError::Configuration(format!("failed to init llama backend: {e}")))?;
        let model_params = LlamaModelParams::default()
            .with_n_gpu_layers(config.n_gpu_layers)
            .with_use_mmap(config.use_mmap);
        let model = LlamaModel::load_from_file(&backend, &config.model_path, &model_params)?;

        let mm_ctx = match &config.projector_path {
            Some(path) => {
                let params = MtmdContextParams::default();
                let ctx = MtmdContext::init_from_file(path, &model, params).map_err(|e| {
                    CoreError::Configuration(format!("failed to load multimodal projector: {e}"))
                })?;
                Some(Arc::new(ctx))
            }
            None => None,
        };

        let slots = (0..config.n_slots.max(1) as i32)
            .map(|id| Mutex::new(Slot::new(id)))
            .collect::<Vec<_>>();

        Ok(Self {
            inner: Arc::new(CoreInner {
                backend: Arc::new(backend),
                model: Arc::new(model),
                mm_ctx,
                config,
                slots: Arc::new(slots),
                queue: Arc::new(AdmissionQueue::new()),
                free_slot_lock: Arc::new(Mutex::new(())),
                free_slot_cond: Arc::new(Condvar::new()),
                running: Arc::new(AtomicBool::new(false)),
                next_id: AtomicU64::new(0),
                scheduler_thread: Mutex::new(None),
                tokenizer_thread: Mutex::new(None),
            }),
        })
    }

    /// Start the scheduler and tokenization threads. Idempotent: a second
    /// call while already running is a no-op.
    pub fn run(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let backend = self.inner.backend.clone();
        let model = self.inner.model.clone();
        let mm_ctx = self.inner.mm_ctx.clone();
        let slots = self.inner.slots.clone();
        let free_slot_lock = self.inner.free_slot_lock.clone();
        let free_slot_cond = self.inner.free_slot_cond.clone();
        let running = self.inner.running.clone();
        let config = self.inner.config.clone();

        let scheduler_thread = std::thread::Builder::new()
            .name("infer-core-scheduler".into())
            .spawn(move || {
                let n_ctx = NonZeroU32::new(config.n_ctx.max(1));
                let ctx_params = LlamaContextParams::default()
                    .with_n_ctx(n_ctx)
                    .with_n_batch(config.n_batch)
                    .with_n_ubatch(config.n_batch)
                    .with_n_threads(config.n_threads)
                    .with_n_threads_batch(config.n_threads)
                    .with_n_seq_max(config.n_slots.max(1) as u32)
                    .with_embeddings(config.embedding);
                let mut ctx = match model.new_context(&backend, ctx_params) {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        tracing::error!(%err, "failed to create inference context; scheduler thread exiting");
                        running.store(false, Ordering::Release);
                        return;
                    }
                };
                let mut batch = LlamaBatch::new(config.n_batch as usize, config.n_slots.max(1) as i32);
                let scheduler_config = SchedulerConfig {
                    n_ctx: config.n_ctx as i32,
                    n_batch: config.n_batch as i32,
                    n_ubatch: config.n_batch as i32,
                    n_keep: config.n_keep,
                    n_discard: config.n_discard,
                };
                scheduler::run(
                    &mut ctx,
                    &model,
                    mm_ctx.as_deref(),
                    &mut batch,
                    &slots,
                    &scheduler_config,
                    &free_slot_lock,
                    &free_slot_cond,
                    &running,
                );
            })
            .map_err(|e| CoreError::Configuration(format!("failed to spawn scheduler thread: {e}")))?;

        let queue = self.inner.queue.clone();
        let slots = self.inner.slots.clone();
        let free_slot_cond = self.inner.free_slot_cond.clone();
        let free_slot_lock = self.inner.free_slot_lock.clone();
        let model = self.inner.model.clone();
        let mm_ctx = self.inner.mm_ctx.clone();
        let running = self.inner.running.clone();

        let tokenizer_thread = std::thread::Builder::new()
            .name("infer-core-tokenizer".into())
            .spawn(move || {
                admission::run_tokenizer(queue, slots, free_slot_cond, free_slot_lock, model, mm_ctx, running);
            })
            .map_err(|e| CoreError::Configuration(format!("failed to spawn tokenization thread: {e}")))?;

        *self.inner.scheduler_thread.lock().unwrap() = Some(scheduler_thread);
        *self.inner.tokenizer_thread.lock().unwrap() = Some(tokenizer_thread);
        Ok(())
    }

    /// Stop the update loop, draining any still-queued requests with
    /// `CoreError::Cancelled` rather than leaking them, and join both
    /// worker threads. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        {
            let _guard = self.inner.free_slot_lock.lock().unwrap();
            self.inner.free_slot_cond.notify_all();
        }
        for task in self.inner.queue.drain() {
            let PendingTask { mut request } = task;
            request.complete(Err(CoreError::Cancelled));
        }
        if let Some(handle) = self.inner.scheduler_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.inner.tokenizer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Enqueue a request for admission. Returns immediately; the caller
    /// awaits the returned receiver (or drains `stream_rx`, if requested)
    /// for the result.
    pub fn add_task(
        &self,
        params: TaskParams,
        callbacks: Callbacks,
    ) -> (RequestId, oneshot::Receiver<std::result::Result<String, CoreError>>, Option<mpsc::UnboundedReceiver<StreamEvent>>)
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (completion_tx, completion_rx) = oneshot::channel();
        let (stream_tx, stream_rx) =
            if params.stream { let (tx, rx) = mpsc::unbounded_channel(); (Some(tx), Some(rx)) } else { (None, None) };
        let request = Request::new(id, params, callbacks, stream_tx, completion_tx);
        self.inner.queue.push(PendingTask { request });
        (id, completion_rx, stream_rx)
    }

    /// The model's chat template, falling back to [`FALLBACK_CHAT_TEMPLATE`]
    /// when the model carries none.
    pub fn get_template(&self) -> String {
        self.inner
            .model
            .chat_template(None)
            .map(|t| t.to_string())
            .unwrap_or_else(|_| FALLBACK_CHAT_TEMPLATE.to_string())
    }

    /// Piece for a named special token ("BOS" or "EOS").
    pub fn get_token(&self, name: &str) -> Result<String> {
        let token = match name {
            "BOS" => self.inner.model.token_bos(),
            "EOS" => self.inner.model.token_eos(),
            other => return Err(CoreError::UnknownSpecialToken(other.to_string())),
        };
        Ok(self.inner.model.token_to_str(token, Special::Tokenize)?)
    }

    /// Embed `text`: one vector per token, unless the handle was constructed
    /// with `embedding: true`, in which case a single L2-normalized pooled
    /// vector is returned.
    ///
    /// Builds a short-lived context dedicated to this call, grounded on
    /// `nobodywho-core::run_embedding_worker_result`'s
    /// `ctx.embeddings_seq_ith` usage — the scheduler's own context is
    /// exclusively owned by its thread once `run()` has started.
    pub fn get_embedding(&self, text: &str) -> Result<Vec<Vec<f32>>> {
        let n_ctx = NonZeroU32::new(self.inner.config.n_ctx.max(1));
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(n_ctx)
            .with_n_threads(self.inner.config.n_threads)
            .with_embeddings(true);
        let mut ctx = self.inner.model.new_context(&self.inner.backend, ctx_params)?;

        let tokens = self.inner.model.str_to_token(text, AddBos::Always)?;
        if tokens.is_empty() {
            return Err(CoreError::AdmissionRejected("empty text for embedding".into()));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        for (i, &tok) in tokens.iter().enumerate() {
            batch.add(tok, i as i32, &[0], true)?;
        }
        ctx.decode(&mut batch)?;

        if self.inner.config.embedding {
            let raw = ctx
                .embeddings_seq_ith(0)
                .map_err(|e| CoreError::Configuration(format!("failed to read pooled embedding: {e}")))?;
            Ok(vec![l2_normalize(raw)])
        } else {
            let mut per_token = Vec::with_capacity(tokens.len());
            for i in 0..tokens.len() as i32 {
                let row = ctx
                    .embeddings_ith(i)
                    .map_err(|e| CoreError::Configuration(format!("failed to read token embedding: {e}")))?;
                per_token.push(row.to_vec());
            }
            Ok(per_token)
        }
    }
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let _guard = self.free_slot_lock.lock().unwrap();
            self.free_slot_cond.notify_all();
        }
        if let Some(handle) = self.scheduler_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.tokenizer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn l2_normalize(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return values.to_vec();
    }
    values.iter().map(|v| v / norm).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::TaskParams;
    use crate::sampler::config::{GrammarConfig, SamplingConfig};

    #[test]
    fn l2_normalize_unit_vector() {
        let out = l2_normalize(&[3.0, 4.0]);
        assert!((out[0] - 0.6).abs() < 1e-6);
        assert!((out[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_zero_vector_is_unchanged() {
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    /// Every end-to-end scenario below needs a real GGUF model and is
    /// skipped unless `TEST_MODEL` is set, the same gate
    /// `nobodywho-core`'s own worker tests use.
    macro_rules! test_model_path {
        () => {
            std::env::var("TEST_MODEL").unwrap_or_else(|_| "model.gguf".to_string())
        };
    }

    fn test_core(n_slots: usize) -> Core {
        let config = CoreConfig {
            model_path: test_model_path!(),
            n_gpu_layers: 0,
            n_ctx: 512,
            n_batch: 128,
            n_slots,
            ..CoreConfig::default()
        };
        let core = Core::construct(config).expect("failed to load TEST_MODEL");
        core.run().expect("failed to start core");
        core
    }

    #[test]
    #[ignore = "requires TEST_MODEL"]
    fn single_completion_returns_nonempty_text() {
        let core = test_core(1);
        let params = TaskParams { prompt: "Say hello.".into(), maximum_tokens: 16, ..TaskParams::default() };
        let (_id, rx, _stream) = core.add_task(params, Callbacks::default());
        let text = rx.blocking_recv().unwrap().unwrap();
        assert!(!text.is_empty());
        core.stop();
    }

    #[test]
    #[ignore = "requires TEST_MODEL"]
    fn parallel_completions_both_complete() {
        let core = test_core(2);
        let a = TaskParams { prompt: "Count to three.".into(), maximum_tokens: 16, ..TaskParams::default() };
        let b = TaskParams { prompt: "Name a color.".into(), maximum_tokens: 16, ..TaskParams::default() };
        let (_, rx_a, _) = core.add_task(a, Callbacks::default());
        let (_, rx_b, _) = core.add_task(b, Callbacks::default());
        assert!(rx_a.blocking_recv().unwrap().is_ok());
        assert!(rx_b.blocking_recv().unwrap().is_ok());
        core.stop();
    }

    #[test]
    #[ignore = "requires TEST_MODEL"]
    fn stop_string_truncates_generation() {
        let core = test_core(1);
        let params = TaskParams {
            prompt: "Count from one to ten: 1, 2, 3,".into(),
            maximum_tokens: 64,
            stop_strings: vec!["6".into()],
            ..TaskParams::default()
        };
        let (_id, rx, _stream) = core.add_task(params, Callbacks::default());
        let text = rx.blocking_recv().unwrap().unwrap();
        assert!(!text.contains('7'));
        core.stop();
    }

    #[test]
    #[ignore = "requires TEST_MODEL"]
    fn context_shift_keeps_generating_past_n_ctx() {
        // n_ctx/n_keep small enough that a long generation forces at least
        // one context-shift discard before completing.
        let config = CoreConfig {
            model_path: test_model_path!(),
            n_gpu_layers: 0,
            n_ctx: 64,
            n_batch: 32,
            n_keep: 4,
            n_slots: 1,
            ..CoreConfig::default()
        };
        let core = Core::construct(config).unwrap();
        core.run().unwrap();
        let params = TaskParams { prompt: "Write a long story.".into(), maximum_tokens: 200, ..TaskParams::default() };
        let (_id, rx, _stream) = core.add_task(params, Callbacks::default());
        assert!(rx.blocking_recv().unwrap().is_ok());
        core.stop();
    }

    #[test]
    #[ignore = "requires TEST_MODEL"]
    fn grammar_constrains_output_to_yes_or_no() {
        let core = test_core(1);
        let grammar = GrammarConfig {
            source: "root ::= \"yes\" | \"no\"\n".into(),
            lazy: false,
            triggers: Vec::new(),
            preserved_tokens: Vec::new(),
        };
        let sampling = SamplingConfig { grammar: Some(grammar), ..SamplingConfig::default() };
        let params = TaskParams {
            prompt: "Is the sky blue?".into(),
            sampling,
            maximum_tokens: 4,
            ..TaskParams::default()
        };
        let (_id, rx, _stream) = core.add_task(params, Callbacks::default());
        let text = rx.blocking_recv().unwrap().unwrap();
        assert!(text == "yes" || text == "no");
        core.stop();
    }
}
