pub mod backend;
pub mod gguf;
pub mod tokenizer;

pub use backend::{GgufBackend, GgufContext, GgufWeights};
pub use gguf::{GgufError, GgufHeader, GgufMetadata, GgufWriter, MetadataValue};
pub use tokenizer::{SpmTokenizer, Vocabulary};
