//! Weaver - a tool-using agent for automation workflows

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{init_command, run_command, status_command, RunArgs};

/// Weaver - workflow assistant for your terminal
#[derive(Parser)]
#[command(name = "weaver")]
#[command(about = "◆ A tool-using agent for building automation workflows")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the config file
    Init,
    /// Show configuration status
    Status,
    /// Run the agent on one message
    Run(RunArgs),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(matches!(&cli.command, Commands::Run(args) if args.verbose));

    let result = match cli.command {
        Commands::Init => init_command().await,
        Commands::Status => status_command().await,
        Commands::Run(args) => run_command(args).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
