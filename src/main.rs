mod cmd;
mod progress;

use clap::{Parser, Subcommand};
use cmd::LaunchArgs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "neuroix")]
#[command(version)]
#[command(about = "Load local models as managed processes", long_about = None)]
struct Cli {
    /// Log at debug level regardless of NEUROIX_LOG
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a process, send one prompt, print the answer and shut down
    Run {
        #[command(flatten)]
        launch: LaunchArgs,
        #[arg(trailing_var_arg = true)]
        prompt: Vec<String>,
    },
    /// Interactive session over one process
    Chat {
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Print the status block of a freshly created process
    Status {
        #[command(flatten)]
        launch: LaunchArgs,
        #[arg(long)]
        json: bool,
    },
    /// Load, check and tokenize directly through the backend
    Sanity {
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    cmd::init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run { launch, prompt } => cmd::run(&launch, &prompt),
        Commands::Chat { launch } => cmd::chat(&launch),
        Commands::Status { launch, json } => cmd::status(&launch, json),
        Commands::Sanity { model } => cmd::sanity(model.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
