use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

use garmin_drive_sync::config::parse_day_offsets;
use garmin_drive_sync::{logging, run, Result, RunOptions, SyncConfig, SyncError, SyncReport};

#[derive(Parser)]
#[command(name = "garmin-drive-sync")]
#[command(author, version, about = "Sync Garmin daily data into a CSV history on Google Drive", long_about = None)]
struct Cli {
    /// Date to sync (YYYY-MM-DD), repeatable. Overrides the day offsets.
    #[arg(short, long = "date", value_parser = parse_date)]
    dates: Vec<NaiveDate>,

    /// Comma-separated days before today to sync, e.g. "1,0"
    #[arg(long, env = "SYNC_DAY_OFFSETS")]
    offsets: Option<String>,

    /// Download and merge but do not upload
    #[arg(long)]
    dry_run: bool,

    /// Also write the merged table to a local CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| SyncError::InvalidDateFormat(raw.to_string()).to_string())
}

async fn execute(cli: Cli) -> Result<SyncReport> {
    let mut config = SyncConfig::from_env()?;
    if let Some(raw) = &cli.offsets {
        config.day_offsets = parse_day_offsets(raw)?;
    }

    let options = RunOptions {
        dates: cli.dates,
        dry_run: cli.dry_run,
        output: cli.output,
    };
    run(&config, options).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match execute(cli).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("CRITICAL ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}
