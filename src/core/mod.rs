pub mod backend;
pub mod config;
pub mod error;
pub mod process;
pub mod system;

pub use backend::{Backend, ContextParams, LoadParams, TokenId};
pub use config::ProcessConfig;
pub use error::{BackendError, BackendFault, CommandError, ConfigError, CreationError};
pub use process::{
    Pid, ProcessControlBlock, ProcessManager, ProcessState, StatusSnapshot, TokenSummary,
};
pub use system::{init, is_initialized};
