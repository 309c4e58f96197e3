//! Error taxonomy for process creation, commands and the backend boundary.

use super::process::{Pid, ProcessState};
use std::path::PathBuf;

/// Why a process could not be created. No PCB exists after either variant.
#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    /// The backend could not load weights from the model file.
    #[error("failed to load weights from '{}': {reason}", path.display())]
    WeightsLoadFailed { path: PathBuf, reason: String },

    /// Weights loaded but the execution context could not be allocated.
    /// The weights were released before this error was returned.
    #[error("failed to create context for '{}': {reason}", path.display())]
    ContextCreateFailed { path: PathBuf, reason: String },
}

/// Why a command against a live process failed.
///
/// Only [`CommandError::FatalCorruption`] and `Busy` in the `Error` state mean
/// the process will never accept another command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The process is not `Ready`: either a command is in flight or it is in `Error`.
    #[error("process {pid} is busy ({state})")]
    Busy { pid: Pid, state: ProcessState },

    /// The weights handle is missing.
    #[error("process {pid} has an invalid model")]
    InvalidModel { pid: Pid },

    /// Tokenization returned a failure code or overflowed the token buffer.
    #[error("process {pid} could not understand input (tokenizer code {code})")]
    TokenizeFailed { pid: Pid, code: i64 },

    /// The vocabulary sanity check faulted; the process has moved to `Error`.
    #[error("process {pid} is corrupted: {detail}")]
    FatalCorruption { pid: Pid, detail: String },
}

impl CommandError {
    /// Returns `true` if the process can still accept commands after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::FatalCorruption { .. }
                | Self::Busy {
                    state: ProcessState::Error,
                    ..
                }
        )
    }
}

/// A load or context failure reported by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct BackendError {
    pub reason: String,
}

impl BackendError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A native-layer fault surfaced by a read-only query. The owned handles can
/// no longer be trusted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("backend fault: {detail}")]
pub struct BackendFault {
    pub detail: String,
}

impl BackendFault {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// Configuration could not be read or parsed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}
