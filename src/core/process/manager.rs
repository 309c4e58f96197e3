use super::gate::CommandGate;
use super::{Pid, ProcessControlBlock, StatusSnapshot, TokenSummary};
use crate::core::backend::{Backend, TokenId};
use crate::core::config::ProcessConfig;
use crate::core::error::{CommandError, CreationError};
use crate::core::system;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// First pid handed out by a manager.
pub const FIRST_PID: Pid = 384;

/// Creates, commands and destroys processes over one backend.
///
/// Operations on a single PCB may be called from several threads: the
/// `Ready -> Thinking -> Ready` transition admits one command at a time and
/// every other caller gets [`CommandError::Busy`].
pub struct ProcessManager<B: Backend> {
    backend: Arc<B>,
    next_pid: AtomicU32,
}

impl<B: Backend> ProcessManager<B> {
    pub fn new(backend: B) -> Self {
        Self::with_shared(Arc::new(backend))
    }

    pub fn with_shared(backend: Arc<B>) -> Self {
        Self {
            backend,
            next_pid: AtomicU32::new(FIRST_PID),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Loads `model_path` and returns a `Ready` process named after the file stem.
    ///
    /// [`crate::init`] must have run first.
    pub fn create<P: AsRef<Path>>(
        &self,
        model_path: P,
        config: ProcessConfig,
    ) -> Result<ProcessControlBlock<B>, CreationError> {
        let path = model_path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "process".to_string());
        self.create_named(name, path, config)
    }

    /// Like [`create`](Self::create) with an explicit label.
    ///
    /// Steps:
    /// 1. Translate the config into backend parameters.
    /// 2. Load weights.
    /// 3. Build a context from them; on failure release the weights.
    /// 4. Assign a pid and return the PCB in `Ready`.
    pub fn create_named<N, P>(
        &self,
        name: N,
        model_path: P,
        config: ProcessConfig,
    ) -> Result<ProcessControlBlock<B>, CreationError>
    where
        N: Into<String>,
        P: AsRef<Path>,
    {
        let path = model_path.as_ref();
        if !system::is_initialized() {
            tracing::warn!("creating a process before the backend runtime was initialized");
        }

        let (load_params, ctx_params) = config.backend_params();
        tracing::info!("loading brain from {}", path.display());

        let weights = self
            .backend
            .load_weights(path, &load_params)
            .map_err(|e| {
                tracing::error!("failed to load model file {}: {}", path.display(), e);
                CreationError::WeightsLoadFailed {
                    path: path.to_path_buf(),
                    reason: e.reason,
                }
            })?;

        let context = match self.backend.create_context(&weights, &ctx_params) {
            Ok(context) => context,
            Err(e) => {
                tracing::error!("failed to create context for {}: {}", path.display(), e);
                self.backend.release_weights(weights);
                return Err(CreationError::ContextCreateFailed {
                    path: path.to_path_buf(),
                    reason: e.reason,
                });
            }
        };

        let ram_usage_bytes = self.backend.resident_bytes(&weights, &context);
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let pcb = ProcessControlBlock::new(
            pid,
            name.into(),
            path.to_path_buf(),
            config,
            weights,
            context,
            ram_usage_bytes,
            Arc::clone(&self.backend),
        );

        tracing::info!(pid, name = pcb.name(), "brain active");
        Ok(pcb)
    }

    /// Releases the context, then the weights, then the PCB itself.
    /// Passing `None` is a no-op. Safe in any state, including `Error`.
    pub fn destroy(&self, pcb: Option<ProcessControlBlock<B>>) {
        let Some(mut pcb) = pcb else {
            return;
        };
        let pid = pcb.pid();
        pcb.release_resources();
        drop(pcb);
        tracing::info!(pid, "process destroyed");
    }

    /// Sends `input_text` to the process and returns a readable answer.
    /// Blocks until the backend is done.
    pub fn send_command(
        &self,
        pcb: &ProcessControlBlock<B>,
        input_text: &str,
    ) -> Result<String, CommandError> {
        self.query(pcb, input_text).map(|summary| summary.to_string())
    }

    /// Structured form of [`send_command`](Self::send_command).
    pub fn query(
        &self,
        pcb: &ProcessControlBlock<B>,
        input_text: &str,
    ) -> Result<TokenSummary, CommandError> {
        let pid = pcb.pid();
        let mut gate = CommandGate::enter(pid, &pcb.state).inspect_err(|e| {
            tracing::warn!(pid, "command rejected: {}", e);
        })?;

        let resources = pcb.resources.lock();
        let Some(weights) = resources.weights.as_ref() else {
            tracing::error!(pid, "weights handle is missing");
            return Err(CommandError::InvalidModel { pid });
        };
        let backend = &*pcb.backend;

        let checked = panic::catch_unwind(AssertUnwindSafe(|| backend.vocabulary_size(weights)));
        let n_vocab = match checked {
            Ok(Ok(n)) if n > 0 => n,
            Ok(Ok(n)) => {
                return Err(corrupted(&mut gate, pid, format!("vocabulary size {n}")));
            }
            Ok(Err(fault)) => return Err(corrupted(&mut gate, pid, fault.detail)),
            Err(payload) => return Err(corrupted(&mut gate, pid, panic_message(&*payload))),
        };
        tracing::debug!(pid, n_vocab, "model sanity check passed");

        let capacity = pcb.config().context_size as usize;
        let mut tokens = vec![TokenId::default(); capacity];
        tracing::debug!(pid, len = input_text.len(), capacity, "tokenizing input");

        let n_tokens = backend.tokenize(weights, input_text, &mut tokens, true, false);
        if n_tokens < 0 {
            tracing::warn!(pid, code = n_tokens, "tokenization failed");
            return Err(CommandError::TokenizeFailed {
                pid,
                code: i64::from(n_tokens),
            });
        }
        let n_tokens = n_tokens as usize;
        if n_tokens > capacity {
            tracing::warn!(pid, n_tokens, capacity, "tokenizer overran its buffer");
            return Err(CommandError::TokenizeFailed {
                pid,
                code: n_tokens as i64,
            });
        }

        let summary = TokenSummary::from_tokens(&tokens[..n_tokens]);
        tracing::debug!(pid, count = summary.token_count, "tokenization success");

        if let Some(context) = resources.context.as_ref() {
            pcb.ram_usage_bytes
                .store(backend.resident_bytes(weights, context), Ordering::Relaxed);
        }

        Ok(summary)
    }

    /// Reads pid, state and memory telemetry without touching the process.
    pub fn status(&self, pcb: &ProcessControlBlock<B>) -> StatusSnapshot {
        pcb.snapshot()
    }
}

fn corrupted(gate: &mut CommandGate<'_>, pid: Pid, detail: String) -> CommandError {
    tracing::error!(pid, "model sanity check failed: {}", detail);
    gate.fault();
    CommandError::FatalCorruption { pid, detail }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("vocabulary check panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("vocabulary check panicked: {s}")
    } else {
        "vocabulary check panicked".to_string()
    }
}
