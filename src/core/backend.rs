//! The contract between the process manager and an inference backend.
//!
//! A backend owns the native side: loading weights, allocating an execution
//! context from them, probing model properties and tokenizing text. The
//! manager never looks inside a handle. It only hands handles back to the
//! backend that produced them.
//!
//! Handles are plain owned values. `release_context` and `release_weights`
//! take them by value, so a handle cannot be released twice and cannot be
//! used after release.

use super::error::{BackendError, BackendFault};
use std::path::Path;

/// A token identifier as understood by the model's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
pub struct TokenId(pub i32);

impl TokenId {
    /// Sentinel for "no token".
    pub const NONE: Self = Self(-1);
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameters used when loading weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadParams {
    pub use_gpu: bool,
    pub use_mmap: bool,
}

/// Parameters used when creating an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    pub n_ctx: u32,
    pub n_threads: u32,
    pub n_threads_batch: u32,
}

pub trait Backend: Send + Sync + 'static {
    /// Read-only loaded model parameters.
    type Weights: Send + Sync;
    /// Read-write per-session execution state derived from the weights.
    type Context: Send;

    fn name(&self) -> &'static str;

    /// Process-wide runtime setup. Called through [`crate::init`].
    fn init(&self);

    /// Loads weights from `path`. On failure nothing observable is left behind.
    fn load_weights(&self, path: &Path, params: &LoadParams) -> Result<Self::Weights, BackendError>;

    /// Every command on the resulting session allocates `n_ctx` token slots,
    /// so an adapter must reject sizes it cannot serve.
    fn create_context(
        &self,
        weights: &Self::Weights,
        params: &ContextParams,
    ) -> Result<Self::Context, BackendError>;

    fn release_context(&self, context: Self::Context);

    /// Must only be called once every context built from `weights` is released.
    fn release_weights(&self, weights: Self::Weights);

    /// Reads the vocabulary size without side effects. An `Err` means the weights are
    /// no longer coherent.
    fn vocabulary_size(&self, weights: &Self::Weights) -> Result<i32, BackendFault>;

    /// Tokenizes `text` into `out` and returns the number of tokens written.
    ///
    /// A negative return is a failure code. `-n` conventionally means `n`
    /// tokens were needed but `out` was too small; nothing past `out.len()`
    /// is ever written.
    fn tokenize(
        &self,
        weights: &Self::Weights,
        text: &str,
        out: &mut [TokenId],
        add_bos: bool,
        parse_special: bool,
    ) -> i32;

    /// Best-effort resident memory estimate for a loaded session.
    fn resident_bytes(&self, _weights: &Self::Weights, _context: &Self::Context) -> u64 {
        0
    }
}
