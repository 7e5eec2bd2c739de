//! Run configuration, read once from the process environment.
//!
//! Every required value is validated before any network call is made, so a
//! scheduled run with a missing secret fails immediately with a message naming
//! the variable.

mod credentials;

pub use credentials::TokenCache;

use crate::error::{Result, SyncError};
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Directory name under the platform data dir for cached tokens
const DATA_DIR_NAME: &str = "garmin-drive-sync";

pub const ENV_GARMIN_EMAIL: &str = "GARMIN_EMAIL";
pub const ENV_GARMIN_PASSWORD: &str = "GARMIN_PASSWORD";
pub const ENV_DRIVE_FILE_ID: &str = "DRIVE_FILE_ID";
pub const ENV_DRIVE_KEY: &str = "GDRIVE_JSON_KEY";
pub const ENV_DAY_OFFSETS: &str = "SYNC_DAY_OFFSETS";
pub const ENV_ACTIVITY_LIMIT: &str = "SYNC_ACTIVITY_LIMIT";
pub const ENV_HTTP_TIMEOUT: &str = "SYNC_HTTP_TIMEOUT_SECS";
pub const ENV_GARMIN_DOMAIN: &str = "GARMIN_DOMAIN";
pub const ENV_TOKEN_DIR: &str = "GARMIN_TOKEN_DIR";

/// Yesterday (settled) and today (fresh sleep data)
pub const DEFAULT_DAY_OFFSETS: &[u32] = &[1, 0];
pub const DEFAULT_ACTIVITY_LIMIT: u32 = 20;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_GARMIN_DOMAIN: &str = "garmin.com";

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// The subset of a Google service-account key file the Drive client needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    /// Parse the key JSON blob and check the fields signing depends on.
    pub fn from_json(raw: &str) -> Result<Self> {
        let key: ServiceAccountKey = serde_json::from_str(raw).map_err(|e| {
            SyncError::config(format!("{} is not a valid service-account key: {}", ENV_DRIVE_KEY, e))
        })?;
        if key.client_email.trim().is_empty() {
            return Err(SyncError::config(format!("{} has an empty client_email", ENV_DRIVE_KEY)));
        }
        if !key.private_key.contains("PRIVATE KEY") {
            return Err(SyncError::config(format!(
                "{} private_key is not a PEM private key",
                ENV_DRIVE_KEY
            )));
        }
        Ok(key)
    }
}

/// Garmin Connect login credentials
#[derive(Clone)]
pub struct GarminCredentials {
    pub email: String,
    pub password: String,
    pub domain: String,
}

impl fmt::Debug for GarminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GarminCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Everything a sync run needs, validated up front.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub garmin: GarminCredentials,
    pub drive_file_id: String,
    pub service_account: ServiceAccountKey,
    /// Days before the local calendar date to fetch, in fetch order
    pub day_offsets: Vec<u32>,
    /// How many recent activities to pull before filtering by date
    pub activity_limit: u32,
    pub http_timeout: Duration,
    pub token_dir: PathBuf,
}

impl SyncConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| SyncError::config(format!("{} is not set", key)))
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let email = required(ENV_GARMIN_EMAIL)?;
        let password = required(ENV_GARMIN_PASSWORD)?;
        let drive_file_id = required(ENV_DRIVE_FILE_ID)?;
        let service_account = ServiceAccountKey::from_json(&required(ENV_DRIVE_KEY)?)?;

        let day_offsets = match optional(ENV_DAY_OFFSETS) {
            Some(raw) => parse_day_offsets(&raw)?,
            None => DEFAULT_DAY_OFFSETS.to_vec(),
        };

        let activity_limit = match optional(ENV_ACTIVITY_LIMIT) {
            Some(raw) => u32::try_from(parse_positive(ENV_ACTIVITY_LIMIT, &raw)?)
                .map_err(|_| SyncError::config(format!("{} is too large", ENV_ACTIVITY_LIMIT)))?,
            None => DEFAULT_ACTIVITY_LIMIT,
        };

        let timeout_secs = match optional(ENV_HTTP_TIMEOUT) {
            Some(raw) => parse_positive(ENV_HTTP_TIMEOUT, &raw)?,
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        let token_dir = match optional(ENV_TOKEN_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => data_dir()?,
        };

        Ok(Self {
            garmin: GarminCredentials {
                email,
                password,
                domain: optional(ENV_GARMIN_DOMAIN)
                    .unwrap_or_else(|| DEFAULT_GARMIN_DOMAIN.to_string()),
            },
            drive_file_id,
            service_account,
            day_offsets,
            activity_limit,
            http_timeout: Duration::from_secs(timeout_secs),
            token_dir,
        })
    }

    /// Resolve the configured offsets against `today`.
    pub fn target_dates(&self, today: NaiveDate) -> Vec<NaiveDate> {
        dates_from_offsets(&self.day_offsets, today)
    }
}

/// Turn day offsets into calendar dates, keeping the offsets' order
pub fn dates_from_offsets(offsets: &[u32], today: NaiveDate) -> Vec<NaiveDate> {
    offsets
        .iter()
        .map(|&days| today - ChronoDuration::days(i64::from(days)))
        .collect()
}

/// Parse a comma-separated offset list such as `1,0`.
pub fn parse_day_offsets(raw: &str) -> Result<Vec<u32>> {
    let mut offsets = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let offset: u32 = part.parse().map_err(|_| {
            SyncError::config(format!(
                "{} must be non-negative integers, got '{}'",
                ENV_DAY_OFFSETS, part
            ))
        })?;
        if !offsets.contains(&offset) {
            offsets.push(offset);
        }
    }
    if offsets.is_empty() {
        return Err(SyncError::config(format!("{} lists no offsets", ENV_DAY_OFFSETS)));
    }
    Ok(offsets)
}

fn parse_positive(key: &str, raw: &str) -> Result<u64> {
    match raw.trim().parse::<u64>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(SyncError::config(format!(
            "{} must be a positive integer, got '{}'",
            key, raw
        ))),
    }
}

/// Get the data directory path for storing tokens
/// Returns ~/.local/share/garmin-drive-sync on Unix, ~/Library/Application Support/garmin-drive-sync on macOS
pub fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|p| p.join(DATA_DIR_NAME))
        .ok_or_else(|| SyncError::config("Could not determine data directory"))
}

#[cfg(test)]
pub(crate) mod test_support {
    /// A throwaway RSA key in PKCS#8 PEM form for service-account tests.
    pub const TEST_PRIVATE_KEY: &str = include_str!("../../tests/fixtures/test_service_account.pem");
}
