//! # Opinion Themes CLI (`themes`)
//!
//! ## Usage
//!
//! ```bash
//! themes --config ./config/themes.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `themes init` | Create the SQLite database and run schema migrations |
//! | `themes run` | Cluster unclustered opinions and persist the result |
//! | `themes run --test-mode` | Cluster a fixture set without writing anything |
//! | `themes clusters` | List stored clusters |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); the run summary goes to
//! stdout. A failed run exits with status 1 after printing its summary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use opinion_themes::cluster_cmd::{self, RunArgs};
use opinion_themes::config::{self, Config};
use opinion_themes::{migrate, report};

/// Opinion Themes — groups citizen opinions into titled themes.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/themes.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "themes", version)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/themes.toml`. Test-mode runs fall back to
    /// built-in defaults when the file does not exist.
    #[arg(long, global = true, default_value = "./config/themes.toml")]
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

    /// Run one clustering pass.
    Run {
        /// Cluster a fixture set instead of the database; nothing is written.
        #[arg(
            long,
            env = "TEST_MODE",
            action = clap::ArgAction::SetTrue,
            value_parser = clap::builder::BoolishValueParser::new()
        )]
        test_mode: bool,

        /// Fixture file (TOML) for test mode. Defaults to the built-in set.
        #[arg(long)]
        fixture: Option<PathBuf>,

        /// Maximum number of opinions to process.
        #[arg(long)]
        limit: Option<usize>,

        /// Similarity threshold override, in [-1, 1].
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// List stored clusters, newest first.
    Clusters,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let cfg = config::load_config(&cli.config)?;
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Run {
            test_mode,
            fixture,
            limit,
            threshold,
        } => {
            let cfg = if test_mode && !cli.config.exists() {
                Config::test_mode_defaults()
            } else {
                config::load_config(&cli.config)?
            };
            let args = RunArgs {
                test_mode,
                fixture,
                limit,
                threshold,
            };
            let run = cluster_cmd::run_cluster(&cfg, &args).await?;
            if !run.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Clusters => {
            let cfg = config::load_config(&cli.config)?;
            report::run_list_clusters(&cfg).await?;
        }
    }

    Ok(())
}
