//! CPU backend over memory-mapped GGUF files.
//!
//! Loading maps the file, parses the metadata table and builds the tokenizer
//! from the embedded vocabulary. A context only carries its parameters and
//! the KV cache size it would need; no tensors are evaluated.

use super::gguf::{GgufHeader, GGUF_MAGIC};
use super::tokenizer::{SpmTokenizer, Vocabulary};
use crate::core::{Backend, BackendError, BackendFault, ContextParams, LoadParams, TokenId};
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};

/// Bytes per KV cache element (f16).
const KV_ELEMENT_BYTES: u64 = 2;

/// Largest context a session may ask for. Every command allocates a token
/// buffer of this many entries.
pub const MAX_CONTEXT_TOKENS: u32 = 1 << 20;

enum ModelBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for ModelBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(map) => map,
            Self::Owned(buf) => buf,
        }
    }
}

pub struct GgufWeights {
    path: PathBuf,
    bytes: ModelBytes,
    header: GgufHeader,
    tokenizer: SpmTokenizer,
}

impl GgufWeights {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &GgufHeader {
        &self.header
    }

    pub fn tokenizer(&self) -> &SpmTokenizer {
        &self.tokenizer
    }

    pub fn file_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.bytes, ModelBytes::Mapped(_))
    }

    /// `n_ctx × layers × (embedding × kv_heads / heads) × 2 (K and V) × 2 bytes`.
    /// `None` when the header's dimensions overflow the estimate.
    pub fn kv_cache_bytes(&self, n_ctx: u32) -> Option<u64> {
        let h = &self.header;
        let n_embd_kv = match h.head_count() {
            0 => h.embedding_length(),
            heads => h.embedding_length().checked_mul(h.head_count_kv())? / heads,
        };
        u64::from(n_ctx)
            .checked_mul(h.block_count())?
            .checked_mul(n_embd_kv)?
            .checked_mul(2 * KV_ELEMENT_BYTES)
    }
}

impl std::fmt::Debug for GgufWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GgufWeights")
            .field("path", &self.path)
            .field("architecture", &self.header.architecture())
            .field("vocab_size", &self.tokenizer.vocab_size())
            .field("file_len", &self.file_len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufContext {
    pub n_ctx: u32,
    pub n_threads: u32,
    pub n_threads_batch: u32,
    pub kv_cache_bytes: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GgufBackend;

impl GgufBackend {
    pub fn new() -> Self {
        Self
    }
}

fn read_model(path: &Path, use_mmap: bool) -> Result<ModelBytes, BackendError> {
    let mut file = File::open(path)
        .map_err(|e| BackendError::new(format!("cannot open {}: {}", path.display(), e)))?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Err(BackendError::new(format!("{} is empty", path.display())));
    }

    if use_mmap {
        // SAFETY: the mapping is read-only and owned by the weights handle.
        // Truncating the file underneath a loaded model is not supported.
        let map = unsafe { Mmap::map(&file)? };
        Ok(ModelBytes::Mapped(map))
    } else {
        let mut buf = Vec::with_capacity(len as usize);
        file.read_to_end(&mut buf)?;
        Ok(ModelBytes::Owned(buf))
    }
}

impl Backend for GgufBackend {
    type Weights = GgufWeights;
    type Context = GgufContext;

    fn name(&self) -> &'static str {
        "gguf-cpu"
    }

    fn init(&self) {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        tracing::info!(cpus, "gguf cpu backend ready");
    }

    fn load_weights(&self, path: &Path, params: &LoadParams) -> Result<GgufWeights, BackendError> {
        if params.use_gpu {
            tracing::warn!("GPU offload requested but this backend runs on the CPU only");
        }

        let bytes = read_model(path, params.use_mmap)?;
        let header = GgufHeader::parse(&bytes)
            .map_err(|e| BackendError::new(format!("{}: {}", path.display(), e)))?;
        let vocab = Vocabulary::from_metadata(&header.metadata).ok_or_else(|| {
            BackendError::new(format!("{} has no tokenizer vocabulary", path.display()))
        })?;

        if let Some(declared) = header.declared_vocab_size() {
            if declared != vocab.size() as u64 {
                return Err(BackendError::new(format!(
                    "declared vocabulary size {} does not match {} tokens",
                    declared,
                    vocab.size()
                )));
            }
        }

        tracing::debug!(
            arch = header.architecture(),
            version = header.version,
            tensors = header.tensor_count,
            metadata = header.metadata.len(),
            vocab = vocab.size(),
            "parsed gguf header"
        );

        Ok(GgufWeights {
            path: path.to_path_buf(),
            bytes,
            header,
            tokenizer: SpmTokenizer::new(vocab),
        })
    }

    fn create_context(
        &self,
        weights: &GgufWeights,
        params: &ContextParams,
    ) -> Result<GgufContext, BackendError> {
        if params.n_ctx == 0 {
            return Err(BackendError::new("context size must be positive"));
        }
        if params.n_ctx > MAX_CONTEXT_TOKENS {
            return Err(BackendError::new(format!(
                "context size {} exceeds the maximum of {} tokens",
                params.n_ctx, MAX_CONTEXT_TOKENS
            )));
        }
        if params.n_threads == 0 || params.n_threads_batch == 0 {
            return Err(BackendError::new("thread count must be positive"));
        }
        let kv_cache_bytes = weights.kv_cache_bytes(params.n_ctx).ok_or_else(|| {
            BackendError::new("model dimensions overflow the KV cache estimate")
        })?;
        if let Some(trained) = weights.header.context_length() {
            if u64::from(params.n_ctx) > trained {
                tracing::warn!(
                    n_ctx = params.n_ctx,
                    trained,
                    "context size exceeds the trained context length"
                );
            }
        }

        Ok(GgufContext {
            n_ctx: params.n_ctx,
            n_threads: params.n_threads,
            n_threads_batch: params.n_threads_batch,
            kv_cache_bytes,
        })
    }

    fn release_context(&self, context: GgufContext) {
        tracing::debug!(n_ctx = context.n_ctx, "context released");
    }

    fn release_weights(&self, weights: GgufWeights) {
        tracing::debug!(path = %weights.path.display(), "weights released");
    }

    fn vocabulary_size(&self, weights: &GgufWeights) -> Result<i32, BackendFault> {
        let bytes: &[u8] = &weights.bytes;
        if (bytes.len() as u64) < weights.header.header_len {
            return Err(BackendFault::new("model bytes shorter than the parsed header"));
        }
        let magic = bytes
            .get(..4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));
        if magic != Some(GGUF_MAGIC) {
            return Err(BackendFault::new("GGUF magic no longer present"));
        }

        let n = weights.tokenizer.vocab_size();
        if let Some(declared) = weights.header.declared_vocab_size() {
            if declared != n as u64 {
                return Err(BackendFault::new(format!(
                    "vocabulary holds {n} tokens but the model declares {declared}"
                )));
            }
        }
        i32::try_from(n).map_err(|_| BackendFault::new(format!("vocabulary size {n} out of range")))
    }

    fn tokenize(
        &self,
        weights: &GgufWeights,
        text: &str,
        out: &mut [TokenId],
        add_bos: bool,
        parse_special: bool,
    ) -> i32 {
        weights.tokenizer.encode_into(text, out, add_bos, parse_special)
    }

    fn resident_bytes(&self, weights: &GgufWeights, context: &GgufContext) -> u64 {
        weights.file_len().saturating_add(context.kv_cache_bytes)
    }
}
