use crate::core::ProcessConfig;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_MODEL_FILE: &str = "tinyllama-1.1b-chat-v1.0.Q4_0.gguf";
const DEFAULT_MODELS_DIR: &str = "~/.neuroix/models";

/// Settings read from `NEUROIX_*` environment variables.
///
/// Unset or unparsable values stay `None` so they never override an
/// explicit configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub model: Option<PathBuf>,
    pub models_dir: PathBuf,
    pub context_size: Option<u32>,
    pub thread_count: Option<i32>,
    pub use_gpu: Option<bool>,
    pub log: Option<String>,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            model: lookup("NEUROIX_MODEL")
                .filter(|v| !v.is_empty())
                .map(|v| expand_home(&v)),
            models_dir: expand_home(
                &lookup("NEUROIX_MODELS").unwrap_or_else(|| DEFAULT_MODELS_DIR.to_string()),
            ),
            context_size: parse_num(lookup("NEUROIX_CTX_SIZE")),
            thread_count: parse_num(lookup("NEUROIX_THREADS")),
            use_gpu: lookup("NEUROIX_USE_GPU").and_then(|v| parse_bool(&v)),
            log: lookup("NEUROIX_LOG").filter(|v| !v.is_empty()),
        }
    }

    /// Overlays the values that were set.
    pub fn apply(&self, config: &mut ProcessConfig) {
        if let Some(n) = self.context_size {
            config.context_size = n;
        }
        if let Some(n) = self.thread_count {
            config.thread_count = n;
        }
        if let Some(gpu) = self.use_gpu {
            config.use_gpu = gpu;
        }
    }

    /// `NEUROIX_MODEL` if set, otherwise the default model inside the models directory.
    pub fn model_path(&self) -> PathBuf {
        self.model
            .clone()
            .unwrap_or_else(|| self.models_dir.join(DEFAULT_MODEL_FILE))
    }
}

pub fn default_model_path() -> PathBuf {
    EnvConfig::from_env().model_path()
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.trim_start_matches('~').trim_start_matches('/'));
        }
    }
    PathBuf::from(path)
}

fn parse_num<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
