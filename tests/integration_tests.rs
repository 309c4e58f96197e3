mod common;

use neuroix::{GgufBackend, GgufWriter, ProcessConfig, ProcessManager};
use std::path::PathBuf;

/// A metadata-only TinyLlama-shaped GGUF file with a small vocabulary.
fn tiny_llama() -> PathBuf {
    let path = common::temp_model_path("valid.model");
    GgufWriter::new()
        .architecture("llama")
        .name("tinyllama-fixture")
        .uint("llama.context_length", 2048)
        .uint("llama.block_count", 22)
        .uint("llama.embedding_length", 2048)
        .uint("llama.attention.head_count", 32)
        .uint("llama.attention.head_count_kv", 4)
        .uint("tokenizer.ggml.bos_token_id", 1)
        .uint("tokenizer.ggml.eos_token_id", 2)
        .uint("tokenizer.ggml.unknown_token_id", 0)
        .vocabulary(
            &[
                "<unk>", "<s>", "</s>", "▁", "▁Hello", "▁Hal", "o", ",", "▁apa", "▁kabar", "?",
            ],
            None,
        )
        .write_to(&path)
        .unwrap();
    path
}

fn manager() -> ProcessManager<GgufBackend> {
    let backend = GgufBackend::new();
    neuroix::init(&backend);
    ProcessManager::new(backend)
}

mod test_end_to_end {
    use super::*;
    use neuroix::{ProcessState, TokenId};

    #[test]
    fn test_valid_model_round_trip() {
        let path = tiny_llama();
        let manager = manager();

        let pcb = manager
            .create(&path, ProcessConfig::new(2048, 4, false))
            .unwrap();
        assert_eq!(pcb.state(), ProcessState::Ready);

        let summary = manager.query(&pcb, "Hello").unwrap();
        assert!(summary.token_count >= 1);
        assert!(summary.first_token.0 >= 0);
        assert_eq!(summary.first_token, TokenId(1));

        let answer = manager.send_command(&pcb, "Halo, apa kabar?").unwrap();
        assert!(answer.starts_with("Model understood your input as "));
        assert_eq!(pcb.state(), ProcessState::Ready);

        // KV estimate: 2048 × 22 × (2048 × 4 / 32) × 2 × 2 bytes.
        let kv = 2048u64 * 22 * 256 * 4;
        assert!(manager.status(&pcb).ram_usage_bytes > kv);

        manager.destroy(Some(pcb));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        let manager = manager();
        let err = manager
            .create(
                common::temp_model_path("missing.model"),
                ProcessConfig::default(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            neuroix::CreationError::WeightsLoadFailed { .. }
        ));
    }

    #[test]
    fn test_zero_context_fails_context_creation() {
        let path = tiny_llama();
        let manager = manager();
        let err = manager
            .create(&path, ProcessConfig::new(0, 4, false))
            .unwrap_err();
        assert!(matches!(
            err,
            neuroix::CreationError::ContextCreateFailed { .. }
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_unbounded_context_fails_context_creation() {
        let path = tiny_llama();
        let manager = manager();
        let err = manager
            .create(&path, ProcessConfig::new(u32::MAX, 4, false))
            .unwrap_err();
        assert!(matches!(
            err,
            neuroix::CreationError::ContextCreateFailed { .. }
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_overlong_input_is_recoverable() {
        let path = tiny_llama();
        let manager = manager();
        let pcb = manager
            .create(&path, ProcessConfig::new(2, 1, false))
            .unwrap();

        let err = manager.query(&pcb, "Hello apa kabar").unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(pcb.state(), ProcessState::Ready);
        assert!(manager.query(&pcb, "Hello").is_ok());

        manager.destroy(Some(pcb));
        std::fs::remove_file(path).ok();
    }
}

mod test_config {
    use super::*;

    #[test]
    fn test_yaml_config_drives_creation() {
        let config = ProcessConfig::from_yaml_str("context_size: 512\nthread_count: -1\n").unwrap();
        assert_eq!(config.effective_threads(), 4);

        let path = tiny_llama();
        let manager = manager();
        let pcb = manager.create(&path, config).unwrap();
        assert_eq!(pcb.config().context_size, 512);
        assert_eq!(pcb.name(), path.file_stem().unwrap().to_string_lossy());

        manager.destroy(Some(pcb));
        std::fs::remove_file(path).ok();
    }
}
