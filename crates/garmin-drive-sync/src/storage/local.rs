use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{DownloadedTable, TableStore};
use crate::error::Result;

/// History table kept in a local CSV file.
///
/// Writes go to a sibling temp file which is then renamed over the target, so
/// readers see either the old table or the new one.
#[derive(Debug, Clone)]
pub struct LocalTableStore {
    path: PathBuf,
}

impl LocalTableStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "history.csv".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl TableStore for LocalTableStore {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn download(&self) -> Result<DownloadedTable> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(DownloadedTable::from_bytes(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DownloadedTable::Empty),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, csv: Bytes) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &csv).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}
