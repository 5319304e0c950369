use std::path::PathBuf;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use repotest::cli;

#[derive(Parser)]
#[command(name = "repotest", version)]
#[command(about = "Generate and run unit tests for a repository", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate unit tests for a repository and run them
    Analyze(cli::analyze::AnalyzeArgs),

    /// Serve the push webhook endpoint
    Serve {
        /// Address to listen on (defaults to [webhook] bind)
        #[arg(long)]
        bind: Option<String>,

        /// Path to config file
        #[arg(long)]
        config: Option<String>,

        /// Use the canned mock LLM client
        #[arg(long)]
        dry_run: bool,
    },

    /// Show how a file is split into token-budgeted chunks
    Split {
        file: PathBuf,

        /// Token budget per chunk (defaults to the configured safe budget)
        #[arg(long)]
        budget: Option<usize>,

        /// Path to config file
        #[arg(long)]
        config: Option<String>,
    },

    /// Print shell completions
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Analyze(args) => cli::analyze::run(args).await?,
        Commands::Serve { bind, config, dry_run } => cli::serve::run(config, bind, dry_run).await?,
        Commands::Split { file, budget, config } => cli::split::run(&file, budget, config)?,
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "repotest", &mut std::io::stdout());
        }
    }

    Ok(())
}
