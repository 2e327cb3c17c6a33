mod commands;
mod logging;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::{migrate, resolve_config, GlobalArgs};
use logging::{init_logging, LoggingConfig};

#[derive(Parser)]
#[command(name = "tessera", version)]
#[command(about = "Versioned SQL migrations for monorepos with shared package schemas")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply all pending migrations
    Up,

    /// Roll back the most recently applied migrations
    Down {
        /// Number of versions to roll back
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },

    /// Show applied and pending migrations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Create a new migration file in the app's migrations directory
    Create {
        /// Migration name
        name: String,

        /// Print the file that would be created without writing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Check database connectivity
    Ping,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig::from_flags(cli.global.verbose, cli.global.log_json);
    if let Err(e) = init_logging(&logging) {
        eprintln!("⚠️  Could not initialize logging: {}", e);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "Command failed");
            eprintln!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli.global)?;

    match cli.command {
        Commands::Up => migrate::up(config).await,
        Commands::Down { steps } => migrate::down(config, steps).await,
        Commands::Status { json } => migrate::status(config, json).await,
        Commands::Create { name, dry_run } => migrate::create(config, &name, dry_run),
        Commands::Ping => migrate::ping(config).await,
    }
}
