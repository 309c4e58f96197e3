use crate::progress;
use anyhow::{bail, Context, Result};
use clap::Args;
use neuroix::envconfig::EnvConfig;
use neuroix::format::human_uptime;
use neuroix::{
    Backend, CommandError, GgufBackend, LoadParams, ProcessConfig, ProcessControlBlock,
    ProcessManager, TokenId,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const SANITY_TEXT: &str = "Hello";
const SANITY_CAPACITY: usize = 128;

#[derive(Args, Debug, Clone, Default)]
pub struct LaunchArgs {
    /// Model file (defaults to NEUROIX_MODEL or the bundled TinyLlama path)
    #[arg(short, long)]
    pub model: Option<PathBuf>,

    /// YAML file with context_size, thread_count and use_gpu
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub ctx_size: Option<u32>,

    /// Worker threads; zero or negative picks the default
    #[arg(long, allow_hyphen_values = true)]
    pub threads: Option<i32>,

    #[arg(long)]
    pub gpu: bool,
}

impl LaunchArgs {
    /// Defaults, then the config file, then `NEUROIX_*`, then flags.
    fn resolve(&self) -> Result<(PathBuf, ProcessConfig)> {
        let env = EnvConfig::from_env();
        let mut config = match &self.config {
            Some(path) => ProcessConfig::from_file(path)?,
            None => ProcessConfig::default(),
        };
        env.apply(&mut config);

        if let Some(n) = self.ctx_size {
            config.context_size = n;
        }
        if let Some(n) = self.threads {
            config.thread_count = n;
        }
        if self.gpu {
            config.use_gpu = true;
        }

        let model = self.model.clone().unwrap_or_else(|| env.model_path());
        Ok((model, config))
    }
}

pub fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvConfig::from_env()
            .log
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

struct Session {
    manager: ProcessManager<GgufBackend>,
    pcb: ProcessControlBlock<GgufBackend>,
}

impl Session {
    fn start(args: &LaunchArgs) -> Result<Self> {
        let (model, config) = args.resolve()?;

        let backend = GgufBackend::new();
        neuroix::init(&backend);
        let manager = ProcessManager::new(backend);

        let pcb = progress::with_spinner(&format!("Loading {}", model.display()), || {
            manager.create(&model, config)
        })
        .with_context(|| format!("failed to create a process for {}", model.display()))?;

        Ok(Self { manager, pcb })
    }

    fn send(&self, text: &str) -> Result<String, CommandError> {
        self.manager.send_command(&self.pcb, text)
    }

    fn print_status(&self) {
        println!("{}", self.manager.status(&self.pcb));
        let uptime = human_uptime(self.pcb.started_at(), chrono::Utc::now());
        println!("Uptime: {}", uptime);
    }

    fn shutdown(self) {
        self.manager.destroy(Some(self.pcb));
    }
}

fn banner() {
    println!("======================================");
    println!("     NEUROIX PROCESS MANAGER {}", env!("CARGO_PKG_VERSION"));
    println!("======================================\n");
}

pub fn run(args: &LaunchArgs, prompt: &[String]) -> Result<()> {
    let prompt = if prompt.is_empty() {
        "Hello, how are you?".to_string()
    } else {
        prompt.join(" ")
    };

    banner();
    let session = Session::start(args)?;
    session.print_status();

    println!("\n[USER] > {}", prompt);
    let answer = session.send(&prompt);
    session.shutdown();

    println!("[AI]   > {}\n", answer?);
    println!("System shutdown.");
    Ok(())
}

pub fn chat(args: &LaunchArgs) -> Result<()> {
    banner();
    let session = Session::start(args)?;
    session.print_status();
    println!("\nType /status for process status, /bye to exit.");

    let mut editor = DefaultEditor::new()?;
    let outcome = chat_loop(&session, &mut editor);
    session.shutdown();
    outcome
}

fn chat_loop(session: &Session, editor: &mut DefaultEditor) -> Result<()> {
    loop {
        let line = match editor.readline(">>> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match line {
            "/bye" | "/exit" => return Ok(()),
            "/status" => session.print_status(),
            _ => match session.send(line) {
                Ok(answer) => println!("{}", answer),
                Err(e) if e.is_recoverable() => eprintln!("Error: {}", e),
                Err(e) => bail!(e),
            },
        }
    }
}

pub fn status(args: &LaunchArgs, json: bool) -> Result<()> {
    let session = Session::start(args)?;
    if json {
        let snapshot = session.manager.status(&session.pcb);
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        session.print_status();
    }
    session.shutdown();
    Ok(())
}

/// Exercises the backend directly, without a process around it.
pub fn sanity(model: Option<&Path>) -> Result<()> {
    let model = model
        .map(Path::to_path_buf)
        .unwrap_or_else(neuroix::envconfig::default_model_path);

    println!("=== SANITY CHECK START ===");

    let backend = GgufBackend::new();
    neuroix::init(&backend);
    println!("[1] Backend initialized ({}).", backend.name());

    println!("[2] Loading model from: {}", model.display());
    let params = LoadParams {
        use_gpu: false,
        use_mmap: true,
    };
    let weights = progress::with_spinner("Loading weights", || backend.load_weights(&model, &params))
        .with_context(|| format!("failed to load {}", model.display()))?;
    println!("[3] Model loaded: {:?}", weights);

    println!("[4] Testing property access (n_vocab)...");
    let n_vocab = match backend.vocabulary_size(&weights) {
        Ok(n) => n,
        Err(fault) => {
            backend.release_weights(weights);
            bail!("vocabulary check failed: {}", fault);
        }
    };
    println!("SUCCESS: n_vocab = {}", n_vocab);

    println!("[5] Testing tokenize...");
    let mut tokens = [TokenId::default(); SANITY_CAPACITY];
    let n = backend.tokenize(&weights, SANITY_TEXT, &mut tokens, true, false);
    backend.release_weights(weights);

    if n <= 0 {
        bail!("tokenize returned {}", n);
    }
    println!(
        "SUCCESS: Tokenized '{}' into {} tokens. First ID: {}",
        SANITY_TEXT, n, tokens[0]
    );
    println!("=== SANITY CHECK PASSED ===");
    Ok(())
}
