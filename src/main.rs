//! # Fest Tracker CLI (`fest`)
//!
//! ```bash
//! fest --config ./config/fest.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fest init` | Create the SQLite database and schema |
//! | `fest run` | Run the collection pipeline once |
//! | `fest stats` | Print a dataset overview |
//! | `fest history <id>` | Print one title and its snapshot series |
//!
//! `fest run` exits with `0` when every title was collected, `3` when the
//! run completed but some titles failed or were skipped, and `1` when the
//! run could not happen at all (discovery failed, bad config).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use fest_tracker::pipeline::RunOutcome;
use fest_tracker::{config, history, migrate, pipeline, stats};

/// Fest Tracker: daily dataset collector for a storefront demo festival.
#[derive(Parser)]
#[command(
    name = "fest",
    about = "Fest Tracker: daily dataset collector for a storefront demo festival",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fest.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Run the collection pipeline once.
    ///
    /// Discover titles, enrich every known and new title, and append
    /// today's snapshots. Intended to be triggered once a day.
    Run,

    /// Show dataset statistics.
    Stats,

    /// Show a title's master record and snapshot series.
    History {
        /// Storefront identifier (e.g. app id).
        identifier: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match execute(cli).await {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(RunOutcome::Failed.exit_code())
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<RunOutcome> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run => return pipeline::run_once(&cfg).await,
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::History { identifier } => {
            history::run_history(&cfg, &identifier).await?;
        }
    }

    Ok(RunOutcome::Success)
}
