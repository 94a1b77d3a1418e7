//! Durable, append-only history store backed by a JSON Lines file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage_traits::{HistoryQuery, HistoryStore, OutcomeRecord, StorageResult};

/// History ledger persisted as one JSON object per line.
///
/// Every append is a single `write_all` of a complete line to a file opened
/// with `O_APPEND`, followed by `sync_data`, all while holding the store's
/// writer lock. Records already on disk are loaded once at open time.
pub struct JsonlHistoryStore {
    path: PathBuf,
    records: Mutex<Vec<OutcomeRecord>>,
}

impl JsonlHistoryStore {
    /// Open (or create) the ledger at `path`.
    ///
    /// Malformed lines, e.g. a torn final line after a crash, are skipped
    /// with a warning rather than failing the open.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                if !content.is_empty() && !content.ends_with('\n') {
                    // Terminate a torn tail so the next append starts a fresh line.
                    let mut file = tokio::fs::OpenOptions::new()
                        .append(true)
                        .open(&path)
                        .await?;
                    file.write_all(b"\n").await?;
                    file.sync_data().await?;
                }
                parse_lines(&path, &content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::Io(e)),
        };

        debug!(path = %path.display(), records = records.len(), "history store opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_lines(path: &Path, content: &str) -> Vec<OutcomeRecord> {
    let mut records = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<OutcomeRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => warn!(
                path = %path.display(),
                line = idx + 1,
                error = %e,
                "skipping malformed history line"
            ),
        }
    }
    records
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, record: OutcomeRecord) -> StorageResult<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut records = self.records.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        records.push(record);
        Ok(())
    }

    async fn query(&self, query: &HistoryQuery) -> StorageResult<Vec<OutcomeRecord>> {
        let records = self.records.lock().await;
        Ok(query.select(records.iter()))
    }

    async fn len(&self) -> StorageResult<usize> {
        Ok(self.records.lock().await.len())
    }
}
