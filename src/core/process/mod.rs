//! The Process Control Block: one loaded inference session.
//!
//! A PCB is created only by [`ProcessManager::create`], mutated only by the
//! manager, and destroyed by [`ProcessManager::destroy`] or by being dropped.
//! Either way the context is released before the weights it was built from.

mod gate;
pub mod manager;

pub use manager::{ProcessManager, FIRST_PID};

use super::backend::{Backend, TokenId};
use super::config::ProcessConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Pid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    /// Never observed on a constructed PCB.
    Uninitialized,
    /// Weights and context are loaded; commands are accepted.
    Ready,
    /// A command is in flight.
    Thinking,
    /// Handles are untrusted; no further commands are accepted.
    Error,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::Ready => "READY",
            Self::Thinking => "THINKING",
            Self::Error => "ERROR",
        }
    }

    pub fn accepts_commands(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Resources<B: Backend> {
    weights: Option<B::Weights>,
    context: Option<B::Context>,
}

pub struct ProcessControlBlock<B: Backend> {
    pid: Pid,
    name: String,
    model_path: PathBuf,
    config: ProcessConfig,
    started_at: DateTime<Utc>,
    state: Mutex<ProcessState>,
    ram_usage_bytes: AtomicU64,
    resources: Mutex<Resources<B>>,
    backend: Arc<B>,
}

impl<B: Backend> ProcessControlBlock<B> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        pid: Pid,
        name: String,
        model_path: PathBuf,
        config: ProcessConfig,
        weights: B::Weights,
        context: B::Context,
        ram_usage_bytes: u64,
        backend: Arc<B>,
    ) -> Self {
        Self {
            pid,
            name,
            model_path,
            config,
            started_at: Utc::now(),
            state: Mutex::new(ProcessState::Ready),
            ram_usage_bytes: AtomicU64::new(ram_usage_bytes),
            resources: Mutex::new(Resources {
                weights: Some(weights),
                context: Some(context),
            }),
            backend,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn ram_usage_bytes(&self) -> u64 {
        self.ram_usage_bytes.load(Ordering::Relaxed)
    }

    /// Blocks while a command is in flight.
    pub fn has_weights(&self) -> bool {
        self.resources.lock().weights.is_some()
    }

    /// Blocks while a command is in flight.
    pub fn has_context(&self) -> bool {
        self.resources.lock().context.is_some()
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            pid: self.pid,
            name: self.name.clone(),
            state: self.state(),
            ram_usage_bytes: self.ram_usage_bytes(),
        }
    }

    /// Releases the context, then the weights. Each handle is taken out of
    /// the PCB, so a second call releases nothing.
    fn release_resources(&mut self) {
        let resources = self.resources.get_mut();
        if let Some(context) = resources.context.take() {
            self.backend.release_context(context);
            tracing::debug!(pid = self.pid, "context released");
        }
        if let Some(weights) = resources.weights.take() {
            self.backend.release_weights(weights);
            tracing::debug!(pid = self.pid, "weights released");
        }
    }
}

impl<B: Backend> Drop for ProcessControlBlock<B> {
    fn drop(&mut self) {
        self.release_resources();
    }
}

impl<B: Backend> std::fmt::Debug for ProcessControlBlock<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessControlBlock")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("model_path", &self.model_path)
            .field("config", &self.config)
            .field("state", &self.state())
            .field("ram_usage_bytes", &self.ram_usage_bytes())
            .field("backend", &self.backend.name())
            .finish()
    }
}

/// Point-in-time telemetry for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub pid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub ram_usage_bytes: u64,
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "--- [ PROCESS PID: {} ] ---", self.pid)?;
        writeln!(f, "Name:  {}", self.name)?;
        writeln!(f, "State: {}", self.state)?;
        writeln!(f, "RAM:   {}", crate::format::human_bytes(self.ram_usage_bytes))?;
        write!(f, "------------------------------")
    }
}

/// What the model made of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenSummary {
    pub token_count: usize,
    /// The first token, or [`TokenId::NONE`] when no tokens were produced.
    pub first_token: TokenId,
}

impl TokenSummary {
    pub fn from_tokens(tokens: &[TokenId]) -> Self {
        Self {
            token_count: tokens.len(),
            first_token: tokens.first().copied().unwrap_or(TokenId::NONE),
        }
    }
}

impl std::fmt::Display for TokenSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Model understood your input as {} tokens.\nFirst ID: {}",
            self.token_count, self.first_token
        )
    }
}
