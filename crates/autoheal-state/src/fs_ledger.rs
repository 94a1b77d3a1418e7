//! Filesystem-backed throttle ledger.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::storage_traits::{StorageResult, ThrottleEntry, ThrottleLedger};

/// Throttle ledger stored as a single JSON array.
///
/// Saves write a temp file in the same directory and rename it over the
/// ledger, so a reader sees either the old or the new snapshot, never a mix.
pub struct FsThrottleLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FsThrottleLedger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ThrottleLedger for FsThrottleLedger {
    async fn load(&self) -> StorageResult<Vec<ThrottleEntry>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| StorageError::Deserialization {
            path: self.path.display().to_string(),
            detail: e.to_string(),
        })
    }

    async fn save(&self, entries: &[ThrottleEntry]) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        let _guard = self.write_lock.lock().await;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir).await?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_data()?;
        tmp.persist(&self.path).map_err(|e| StorageError::Persist {
            path: self.path.display().to_string(),
            detail: e.error.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn missing_ledger_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsThrottleLedger::new(dir.path().join("throttle.json"));
        assert!(ledger.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsThrottleLedger::new(dir.path().join("nested").join("throttle.json"));
        let entries = vec![
            ThrottleEntry::new("sig-a", Utc::now()),
            ThrottleEntry::new("sig-b", Utc::now()),
        ];
        ledger.save(&entries).await.unwrap();

        let loaded = ledger.load().await.unwrap();
        assert_eq!(loaded, entries);
    }

    #[tokio::test]
    async fn save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsThrottleLedger::new(dir.path().join("throttle.json"));
        ledger
            .save(&[ThrottleEntry::new("old", Utc::now())])
            .await
            .unwrap();
        ledger
            .save(&[ThrottleEntry::new("new", Utc::now())])
            .await
            .unwrap();

        let loaded = ledger.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].signature, "new");
    }

    #[tokio::test]
    async fn corrupt_ledger_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = FsThrottleLedger::new(&path).load().await.unwrap_err();
        assert!(matches!(err, StorageError::Deserialization { .. }));
    }
}
