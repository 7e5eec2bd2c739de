//! One sync run: fetch the target dates, merge them into the history table
//! and write the table back.
//!
//! - [`fetcher`] pulls the four buckets per date and assembles rows
//! - [`reconcile`] owns download, merge and upload
//! - [`table`] is the CSV model of the history
//! - [`source`] is the Garmin Connect implementation of [`DataSource`]

pub mod fetcher;
pub mod flatten;
pub mod reconcile;
pub mod source;
pub mod table;

use chrono::{Local, NaiveDate};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::client::DriveClient;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::storage::{LocalTableStore, TableStore};

pub use fetcher::{Bucket, BucketOutcome, DailyFetch, DataSource, Fetcher};
pub use reconcile::{merge, ReconcileOutcome, Reconciler};
pub use source::GarminSource;
pub use table::{DailyRecord, HistoryTable};

/// Per-invocation choices that do not come from the environment
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit target dates; empty means "use the configured offsets"
    pub dates: Vec<NaiveDate>,
    pub dry_run: bool,
    /// Also write the merged table to this local file
    pub output: Option<PathBuf>,
}

/// Knobs for [`run_with`]
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub activity_limit: u32,
    pub timeout: Duration,
    pub dry_run: bool,
    pub output: Option<PathBuf>,
}

impl RunSettings {
    pub fn new(config: &SyncConfig, options: &RunOptions) -> Self {
        Self {
            activity_limit: config.activity_limit,
            timeout: config.http_timeout,
            dry_run: options.dry_run,
            output: options.output.clone(),
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub dates: Vec<NaiveDate>,
    /// Buckets that failed across all dates
    pub failed_buckets: usize,
    pub existing_rows: usize,
    pub rows: usize,
    pub uploaded: bool,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} date(s) synced, {} bucket(s) unavailable, {} -> {} rows",
            self.dates.len(),
            self.failed_buckets,
            self.existing_rows,
            self.rows
        )?;
        if !self.uploaded {
            write!(f, " (not uploaded)")?;
        }
        Ok(())
    }
}

/// Production run against Garmin Connect and Google Drive.
pub async fn run(config: &SyncConfig, options: RunOptions) -> Result<SyncReport> {
    let dates = if options.dates.is_empty() {
        config.target_dates(Local::now().date_naive())
    } else {
        options.dates.clone()
    };
    let settings = RunSettings::new(config, &options);

    let source = GarminSource::connect(config).await?;
    let store = DriveClient::new(
        config.service_account.clone(),
        config.drive_file_id.as_str(),
        config.http_timeout,
    )?;

    run_with(&source, &store, &dates, &settings).await
}

/// Fetch `dates` from `source` and reconcile them into `store`.
pub async fn run_with<S, T>(
    source: &S,
    store: &T,
    dates: &[NaiveDate],
    settings: &RunSettings,
) -> Result<SyncReport>
where
    S: DataSource,
    T: TableStore,
{
    let listed: Vec<String> = dates.iter().map(|d| d.to_string()).collect();
    info!("Syncing data for: {}", listed.join(", "));

    let days = Fetcher::new(source, settings.activity_limit, settings.timeout)
        .fetch_days(dates)
        .await;
    let failed_buckets = days.iter().map(|day| day.failed_buckets().len()).sum();
    let records = days
        .iter()
        .map(DailyFetch::to_record)
        .collect::<Result<Vec<_>>>()?;

    let outcome = Reconciler::new(store, settings.timeout)
        .dry_run(settings.dry_run)
        .reconcile(records)
        .await?;

    if let Some(path) = &settings.output {
        let local = LocalTableStore::new(path);
        local.replace(outcome.csv.clone()).await?;
        info!("Wrote merged history to {}", local.describe());
    }

    let report = SyncReport {
        dates: dates.to_vec(),
        failed_buckets,
        existing_rows: outcome.existing_rows,
        rows: outcome.rows,
        uploaded: outcome.uploaded,
    };
    info!("Success! {}", report);
    Ok(report)
}
