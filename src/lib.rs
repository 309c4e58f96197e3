//! Lifecycle management for local inference sessions.
//!
//! Each loaded model is a process with a pid, a launch configuration, a
//! state and the backend handles it owns. [`ProcessManager`] creates,
//! commands and destroys them over any [`Backend`]. [`GgufBackend`] is the
//! bundled CPU implementation.

pub mod core;
pub mod envconfig;
pub mod format;
pub mod infra;

pub use self::core::{
    init, is_initialized, Backend, BackendError, BackendFault, CommandError, ConfigError,
    ContextParams, CreationError, LoadParams, Pid, ProcessConfig, ProcessControlBlock,
    ProcessManager, ProcessState, StatusSnapshot, TokenId, TokenSummary,
};
pub use self::core::process::FIRST_PID;
pub use envconfig::EnvConfig;
pub use infra::{GgufBackend, GgufWriter};
