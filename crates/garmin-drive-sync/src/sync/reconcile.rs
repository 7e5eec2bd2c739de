//! Merge freshly fetched rows into the persisted history table.
//!
//! The run is linear: download, combine, deduplicate, sort, upload. A
//! download that fails at the protocol level aborts before anything is
//! written, since the remote table's real contents are then unknown.

use bytes::Bytes;
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};
use crate::storage::{DownloadedTable, TableStore};
use crate::sync::table::{DailyRecord, HistoryTable, ParsedTable};

/// What a reconcile pass did
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Rows found in the downloaded table
    pub existing_rows: usize,
    /// Rows in the merged table
    pub rows: usize,
    /// Whether the merged table was written back
    pub uploaded: bool,
    /// The merged table as written (or as it would have been written)
    pub csv: Bytes,
}

/// Combine `existing` with `fresh`, keep the last row per date, sort by date.
///
/// Fresh rows come after existing ones, so a re-fetched date replaces the
/// stored row for that date. New columns follow the stored ones in the
/// order they first appear in that combined sequence, not in date order.
pub fn merge(existing: HistoryTable, fresh: Vec<DailyRecord>) -> HistoryTable {
    let (mut columns, existing_rows) = existing.into_parts();
    let combined: Vec<DailyRecord> = existing_rows.into_iter().chain(fresh).collect();

    let mut known: HashSet<String> = columns.iter().cloned().collect();
    let mut last_index: HashMap<NaiveDate, usize> = HashMap::with_capacity(combined.len());
    for (i, row) in combined.iter().enumerate() {
        last_index.insert(row.date(), i);
        for key in row.fields().keys() {
            if known.insert(key.clone()) {
                columns.push(key.clone());
            }
        }
    }

    let mut rows: Vec<DailyRecord> = combined
        .into_iter()
        .enumerate()
        .filter(|(i, row)| last_index.get(&row.date()) == Some(i))
        .map(|(_, row)| row)
        .collect();
    rows.sort_by_key(DailyRecord::date);

    HistoryTable::new(columns, rows)
}

/// Runs the download → merge → upload cycle against one [`TableStore`].
pub struct Reconciler<'a, S: TableStore> {
    store: &'a S,
    timeout: Duration,
    dry_run: bool,
}

impl<'a, S: TableStore> Reconciler<'a, S> {
    pub fn new(store: &'a S, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            dry_run: false,
        }
    }

    /// Merge without writing the result back
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn reconcile(&self, fresh: Vec<DailyRecord>) -> Result<ReconcileOutcome> {
        let existing = match self.load_existing().await {
            Ok(table) => table,
            Err(e) => {
                error!("CRITICAL DOWNLOAD ERROR: {}", e);
                error!("Aborting to protect existing history in {}", self.store.describe());
                return Err(e);
            }
        };
        let existing_rows = existing.len();

        let merged = merge(existing, fresh);
        let csv = Bytes::from(merged.to_csv()?);

        if self.dry_run {
            info!("Dry run: would upload {} rows to {}", merged.len(), self.store.describe());
        } else {
            info!("Uploading updated history ({} rows)...", merged.len());
            self.bounded("upload history table", self.store.replace(csv.clone()))
                .await?;
        }

        Ok(ReconcileOutcome {
            existing_rows,
            rows: merged.len(),
            uploaded: !self.dry_run,
            csv,
        })
    }

    /// Download and parse the current table. Only store errors are returned;
    /// unreadable content becomes an empty table.
    async fn load_existing(&self) -> Result<HistoryTable> {
        let bytes = match self.bounded("download history table", self.store.download()).await? {
            DownloadedTable::Empty => {
                info!("No existing history found. Starting fresh.");
                return Ok(HistoryTable::default());
            }
            DownloadedTable::Content(bytes) => bytes,
        };

        match HistoryTable::parse(&bytes)? {
            ParsedTable::Table(table) => {
                info!("Found {} previous records.", table.len());
                Ok(table)
            }
            ParsedTable::Unreadable(reason) => {
                warn!("Existing history is not a readable table ({}). Starting fresh.", reason);
                Ok(HistoryTable::default())
            }
        }
    }

    async fn bounded<T>(&self, operation: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| SyncError::timeout(operation, self.timeout.as_secs()))?
    }
}
