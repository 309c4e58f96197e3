#![allow(dead_code)]

use neuroix::{Backend, BackendError, BackendFault, ContextParams, LoadParams, TokenId};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};

pub const BOS: TokenId = TokenId(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Init,
    LoadWeights(PathBuf),
    CreateContext { weights: u32, n_ctx: u32, n_threads: u32 },
    ReleaseContext(u32),
    ReleaseWeights(u32),
    VocabularySize(u32),
    Tokenize { weights: u32, capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabOutcome {
    Size(i32),
    Fault,
    Panic,
}

/// Behaviour knobs; every field defaults to the happy path.
#[derive(Clone)]
pub struct Script {
    pub fail_load: bool,
    pub fail_context: bool,
    pub vocab: VocabOutcome,
    /// Returned verbatim from `tokenize` instead of tokenizing.
    pub tokenize_code: Option<i32>,
    /// `(entered, release)`: tokenize waits on both, in order.
    pub block_tokenize: Option<(Arc<Barrier>, Arc<Barrier>)>,
    pub resident_bytes: u64,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_load: false,
            fail_context: false,
            vocab: VocabOutcome::Size(32000),
            tokenize_code: None,
            block_tokenize: None,
            resident_bytes: 637 * 1024 * 1024,
        }
    }
}

/// Backend double that records every call in order.
///
/// Handles are sequence numbers, so release calls can be matched to the
/// load or create call that produced them. Tokenizing emits BOS followed
/// by one token per whitespace-separated word, with ids starting at 100.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<Call>>,
    script: Mutex<Script>,
    next_handle: AtomicU32,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Script) -> Self {
        let backend = Self::default();
        *backend.script.lock() = script;
        backend
    }

    pub fn script(&self) -> parking_lot::MutexGuard<'_, Script> {
        self.script.lock()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl Backend for RecordingBackend {
    type Weights = u32;
    type Context = u32;

    fn name(&self) -> &'static str {
        "recording"
    }

    fn init(&self) {
        self.record(Call::Init);
    }

    fn load_weights(&self, path: &Path, _params: &LoadParams) -> Result<u32, BackendError> {
        self.record(Call::LoadWeights(path.to_path_buf()));
        if self.script.lock().fail_load {
            return Err(BackendError::new("scripted load failure"));
        }
        Ok(self.handle())
    }

    fn create_context(&self, weights: &u32, params: &ContextParams) -> Result<u32, BackendError> {
        self.record(Call::CreateContext {
            weights: *weights,
            n_ctx: params.n_ctx,
            n_threads: params.n_threads,
        });
        if self.script.lock().fail_context {
            return Err(BackendError::new("scripted context failure"));
        }
        Ok(self.handle())
    }

    fn release_context(&self, context: u32) {
        self.record(Call::ReleaseContext(context));
    }

    fn release_weights(&self, weights: u32) {
        self.record(Call::ReleaseWeights(weights));
    }

    fn vocabulary_size(&self, weights: &u32) -> Result<i32, BackendFault> {
        self.record(Call::VocabularySize(*weights));
        let outcome = self.script.lock().vocab;
        match outcome {
            VocabOutcome::Size(n) => Ok(n),
            VocabOutcome::Fault => Err(BackendFault::new("scripted fault")),
            VocabOutcome::Panic => panic!("scripted vocabulary panic"),
        }
    }

    fn tokenize(
        &self,
        weights: &u32,
        text: &str,
        out: &mut [TokenId],
        add_bos: bool,
        _parse_special: bool,
    ) -> i32 {
        self.record(Call::Tokenize {
            weights: *weights,
            capacity: out.len(),
        });

        let (code, block) = {
            let script = self.script.lock();
            (script.tokenize_code, script.block_tokenize.clone())
        };
        if let Some((entered, release)) = block {
            entered.wait();
            release.wait();
        }
        if let Some(code) = code {
            return code;
        }

        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(
            text.split_whitespace()
                .enumerate()
                .map(|(i, _)| TokenId(100 + i as i32)),
        );
        if tokens.len() > out.len() {
            return -(tokens.len() as i32);
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        tokens.len() as i32
    }

    fn resident_bytes(&self, _weights: &u32, _context: &u32) -> u64 {
        self.script.lock().resident_bytes
    }
}

/// Unique path in the system temp directory.
pub fn temp_model_path(stem: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}-{}.gguf", stem, uuid::Uuid::new_v4()))
}
