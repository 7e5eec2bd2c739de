//! Where the history table lives.
//!
//! The sync job reads the whole table once at the start of a run and replaces
//! it once at the end. [`TableStore`] is that contract; Google Drive
//! ([`crate::client::DriveClient`]) is the production store and
//! [`LocalTableStore`] keeps the table in a file on disk.
//!
//! A store reports "nothing there yet" as [`DownloadedTable::Empty`]. Any
//! `Err` from [`TableStore::download`] means the true state of the remote
//! table is unknown, and callers must not overwrite it.

mod local;

pub use local::LocalTableStore;

use bytes::Bytes;

use crate::error::Result;

/// Result of a successful table download
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadedTable {
    /// No object yet, or an object with zero bytes
    Empty,
    /// Raw table bytes, not yet parsed
    Content(Bytes),
}

impl DownloadedTable {
    /// Classify raw bytes; zero bytes is the same as no object.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            Self::Empty
        } else {
            Self::Content(bytes)
        }
    }
}

/// Single-object read/replace access to the persisted history table.
#[allow(async_fn_in_trait)]
pub trait TableStore {
    /// Human-readable location for log lines
    fn describe(&self) -> String;

    /// Fetch the current table bytes.
    async fn download(&self) -> Result<DownloadedTable>;

    /// Replace the whole table with `csv`.
    async fn replace(&self, csv: Bytes) -> Result<()>;
}
