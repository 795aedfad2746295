//! abus - tiered backup retention

use abus_cli::settings::Settings;
use abus_cli::{cmd, logging, util};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit status when a purge finished but skipped failed items
const EXIT_PARTIAL: u8 = 2;

/// abus - content-addressed backups with tiered retention
#[derive(Parser)]
#[command(name = "abus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: <config dir>/abus/abus.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up changed files from the source directory
    Backup {
        /// Unix time to name the run after (default: now)
        #[arg(long)]
        now: Option<f64>,
    },
    /// Delete versions the retention schedule no longer keeps
    Purge {
        /// Unix time to compute ages from (default: now)
        #[arg(long)]
        now: Option<f64>,
        /// Only show what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Show every stored version of a path
    History {
        /// Path relative to the source directory
        path: String,
    },
    /// List backup runs
    Runs,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Settings::load(cli.config.as_deref())?;

    let log_dir = match cli.command {
        Commands::Backup { .. } | Commands::Purge { .. } => Some(settings.log_dir()),
        _ => None,
    };
    let _guard = logging::init(cli.verbose, log_dir.as_deref())?;

    // Archive work is blocking I/O and rayon; keep it off the async workers
    let config_path = cli.config.clone();
    tokio::task::spawn_blocking(move || dispatch(cli.command, &settings, config_path))
        .await
        .context("Command task panicked")?
}

fn dispatch(command: Commands, settings: &Settings, config_path: Option<PathBuf>) -> Result<ExitCode> {
    match command {
        Commands::Backup { now } => {
            cmd::backup::run(settings, now.unwrap_or_else(util::now_timestamp))?;
        }
        Commands::Purge { now, dry_run } => {
            let clean = cmd::purge::run(settings, now.unwrap_or_else(util::now_timestamp), dry_run)?;
            if !clean {
                return Ok(ExitCode::from(EXIT_PARTIAL));
            }
        }
        Commands::History { path } => cmd::history::run(settings, &path)?,
        Commands::Runs => cmd::runs::run(settings)?,
        Commands::Config => cmd::config::run(settings, config_path.as_deref())?,
    }
    Ok(ExitCode::SUCCESS)
}
