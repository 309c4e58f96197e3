use super::backend::{ContextParams, LoadParams};
use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CTX_SIZE: u32 = 2048;
pub const DEFAULT_THREADS: u32 = 4;

/// Launch configuration for one process. Copied into the PCB at creation
/// and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Token capacity of the backend context.
    #[serde(default = "default_ctx_size")]
    pub context_size: u32,
    /// Backend worker threads. Non-positive values mean "use the default".
    #[serde(default = "default_threads")]
    pub thread_count: i32,
    /// Offload hint; backends may ignore it.
    #[serde(default)]
    pub use_gpu: bool,
}

fn default_ctx_size() -> u32 {
    DEFAULT_CTX_SIZE
}

fn default_threads() -> i32 {
    DEFAULT_THREADS as i32
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CTX_SIZE,
            thread_count: DEFAULT_THREADS as i32,
            use_gpu: false,
        }
    }
}

impl ProcessConfig {
    pub fn new(context_size: u32, thread_count: i32, use_gpu: bool) -> Self {
        Self {
            context_size,
            thread_count,
            use_gpu,
        }
    }

    /// Thread count after normalization: non-positive input becomes 4.
    pub fn effective_threads(&self) -> u32 {
        if self.thread_count > 0 {
            self.thread_count as u32
        } else {
            DEFAULT_THREADS
        }
    }

    /// Translates this config into backend-native load and context parameters.
    /// The context size is passed through verbatim.
    pub fn backend_params(&self) -> (LoadParams, ContextParams) {
        let n_threads = self.effective_threads();
        let load = LoadParams {
            use_gpu: self.use_gpu,
            use_mmap: true,
        };
        let ctx = ContextParams {
            n_ctx: self.context_size,
            n_threads,
            n_threads_batch: n_threads,
        };
        (load, ctx)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}
