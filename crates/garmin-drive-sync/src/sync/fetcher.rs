//! Per-date retrieval of the four data buckets and row assembly.

use chrono::NaiveDate;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::sync::flatten::{flatten, prefixed, to_json_text};
use crate::sync::table::{DailyRecord, ACTIVITIES_COLUMN};

/// Prefix for flattened sleep fields
pub const SLEEP_PREFIX: &str = "sleep_";
/// Prefix for flattened HRV fields
pub const HRV_PREFIX: &str = "hrv_";

const START_TIME_LOCAL: &str = "startTimeLocal";

/// The fitness data provider, one query per bucket.
///
/// An empty bucket is `Ok(Value::Null)` or an empty object; `Err` means the
/// query itself failed.
#[allow(async_fn_in_trait)]
pub trait DataSource {
    async fn daily_stats(&self, date: NaiveDate) -> Result<Value>;

    async fn sleep(&self, date: NaiveDate) -> Result<Value>;

    async fn hrv(&self, date: NaiveDate) -> Result<Value>;

    /// The `limit` most recent activities, newest first
    async fn recent_activities(&self, limit: u32) -> Result<Vec<Value>>;
}

/// One category of fetched data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Stats,
    Sleep,
    Hrv,
    Activities,
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Bucket::Stats => "stats",
            Bucket::Sleep => "sleep",
            Bucket::Hrv => "HRV",
            Bucket::Activities => "activities",
        };
        f.write_str(name)
    }
}

/// Result of fetching a single bucket.
///
/// A failure keeps its error so a report can tell "fetch failed" apart from
/// "no data that day"; row assembly treats both as empty.
#[derive(Debug)]
pub enum BucketOutcome<T> {
    Fetched(T),
    Failed { error: SyncError },
}

impl<T> BucketOutcome<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, BucketOutcome::Failed { .. })
    }

    pub fn fetched(&self) -> Option<&T> {
        match self {
            BucketOutcome::Fetched(data) => Some(data),
            BucketOutcome::Failed { .. } => None,
        }
    }
}

/// Everything fetched for one date
#[derive(Debug)]
pub struct DailyFetch {
    pub date: NaiveDate,
    pub stats: BucketOutcome<Value>,
    pub sleep: BucketOutcome<Value>,
    pub hrv: BucketOutcome<Value>,
    /// Activities already narrowed to this date
    pub activities: BucketOutcome<Vec<Value>>,
}

impl DailyFetch {
    /// Buckets that failed, in fetch order
    pub fn failed_buckets(&self) -> Vec<Bucket> {
        let mut failed = Vec::new();
        if self.stats.is_failed() {
            failed.push(Bucket::Stats);
        }
        if self.sleep.is_failed() {
            failed.push(Bucket::Sleep);
        }
        if self.hrv.is_failed() {
            failed.push(Bucket::Hrv);
        }
        if self.activities.is_failed() {
            failed.push(Bucket::Activities);
        }
        failed
    }

    /// Assemble the row: stats unprefixed, then sleep, HRV and the activity
    /// list as JSON text (`[]` when unavailable).
    pub fn to_record(&self) -> Result<DailyRecord> {
        let mut record = DailyRecord::new(self.date);
        record.extend(bucket_fields(self.stats.fetched())?);
        record.extend(prefixed(bucket_fields(self.sleep.fetched())?, SLEEP_PREFIX));
        record.extend(prefixed(bucket_fields(self.hrv.fetched())?, HRV_PREFIX));

        let activities: &[Value] = self.activities.fetched().map(Vec::as_slice).unwrap_or(&[]);
        record.set(ACTIVITIES_COLUMN, Value::String(to_json_text(activities)?));
        Ok(record)
    }
}

fn bucket_fields(data: Option<&Value>) -> Result<Map<String, Value>> {
    match data {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(value) => flatten(value),
    }
}

/// Keep activities whose local start time falls on `date`
pub fn activities_on(activities: Vec<Value>, date: NaiveDate) -> Vec<Value> {
    let day = date.format("%Y-%m-%d").to_string();
    activities
        .into_iter()
        .filter(|activity| {
            activity
                .get(START_TIME_LOCAL)
                .and_then(Value::as_str)
                .is_some_and(|start| start.starts_with(&day))
        })
        .collect()
}

/// Fetches buckets one after another, never letting a bucket failure escape.
pub struct Fetcher<'a, S: DataSource> {
    source: &'a S,
    activity_limit: u32,
    timeout: Duration,
}

impl<'a, S: DataSource> Fetcher<'a, S> {
    pub fn new(source: &'a S, activity_limit: u32, timeout: Duration) -> Self {
        Self {
            source,
            activity_limit,
            timeout,
        }
    }

    pub async fn fetch_days(&self, dates: &[NaiveDate]) -> Vec<DailyFetch> {
        let mut days = Vec::with_capacity(dates.len());
        for &date in dates {
            days.push(self.fetch_day(date).await);
        }
        days
    }

    pub async fn fetch_day(&self, date: NaiveDate) -> DailyFetch {
        debug!("Fetching buckets for {}", date);
        let stats = self.bucket(date, Bucket::Stats, self.source.daily_stats(date)).await;
        let sleep = self.bucket(date, Bucket::Sleep, self.source.sleep(date)).await;
        let hrv = self.bucket(date, Bucket::Hrv, self.source.hrv(date)).await;
        let activities = match self
            .bucket(
                date,
                Bucket::Activities,
                self.source.recent_activities(self.activity_limit),
            )
            .await
        {
            BucketOutcome::Fetched(all) => BucketOutcome::Fetched(activities_on(all, date)),
            failed => failed,
        };

        DailyFetch {
            date,
            stats,
            sleep,
            hrv,
            activities,
        }
    }

    async fn bucket<T>(
        &self,
        date: NaiveDate,
        bucket: Bucket,
        call: impl Future<Output = Result<T>>,
    ) -> BucketOutcome<T> {
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::timeout(
                format!("{} for {}", bucket, date),
                self.timeout.as_secs(),
            )),
        };
        match result {
            Ok(data) => BucketOutcome::Fetched(data),
            Err(error) => {
                warn!("Could not fetch {} for {}: {}", bucket, date, error);
                BucketOutcome::Failed { error }
            }
        }
    }
}
