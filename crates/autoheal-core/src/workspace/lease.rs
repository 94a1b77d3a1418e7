//! Lease-based mutual exclusion keyed by repository.
//!
//! A [`LeaseMutex`] backend only knows how to create, read, and remove
//! leases atomically. Whether a lease is abandoned is decided by a
//! [`StalenessPolicy`] held by the caller, so reclamation can be tested
//! against [`MemoryLeaseMutex`] without touching the filesystem.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::error::{WorkspaceError, WorkspaceResult};

/// Lease record: `{holderId, acquiredAt, repoKey}` on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub repo_key: String,
}

impl Lease {
    pub fn new(repo_key: impl Into<String>, holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            acquired_at: Utc::now(),
            repo_key: repo_key.into(),
        }
    }
}

/// Age threshold past which a lease is considered abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub stale_after: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(600_000))
    }
}

impl StalenessPolicy {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn is_stale(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        let Ok(stale_after) = chrono::Duration::from_std(self.stale_after) else {
            return false;
        };
        now.signed_duration_since(lease.acquired_at) >= stale_after
    }
}

/// Atomic create-or-fail lease storage.
#[async_trait]
pub trait LeaseMutex: Send + Sync {
    /// Create a lease for `key` held by `holder_id`. Returns `false` if a
    /// lease already exists; never overwrites one.
    async fn try_acquire(&self, key: &str, holder_id: &str) -> WorkspaceResult<bool>;

    /// Current lease for `key`, if any.
    async fn inspect(&self, key: &str) -> WorkspaceResult<Option<Lease>>;

    /// Remove the lease for `key`. Idempotent.
    async fn release(&self, key: &str) -> WorkspaceResult<()>;

    /// Remove the lease for `key` only if it is still exactly `observed`.
    /// Returns `true` if this call removed it.
    async fn reclaim_if(&self, key: &str, observed: &Lease) -> WorkspaceResult<bool>;
}

/// File name for a repository key: readable prefix plus a short digest so
/// keys that sanitize identically still map to distinct files.
pub fn lease_file_name(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}-{}.lock", sanitize_key(key), &digest[..8])
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

// ---------------------------------------------------------------------------
// FsLeaseMutex
// ---------------------------------------------------------------------------

/// A guard file older than this was left by a process that died while
/// holding it.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(30);

/// Lease files under a locks directory.
///
/// A lease is written to a temp file in the same directory and linked into
/// place with `persist_noclobber`, so it appears with its full content or
/// not at all, and an existing lease is never replaced.
///
/// Creating and reclaiming a lease both happen while holding an exclusive
/// `<lease>.guard` file. A reclaimer re-reads the lease under the guard and
/// removes it only if it is still the one it observed, and no acquire can
/// slip in between that read and the removal. The lease itself never leaves
/// its path while it is live.
#[derive(Debug, Clone)]
pub struct FsLeaseMutex {
    dir: PathBuf,
}

/// Held `<lease>.guard` file; removed on drop.
struct KeyGuard {
    path: PathBuf,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not remove lease guard");
            }
        }
    }
}

impl FsLeaseMutex {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn lease_path(&self, key: &str) -> PathBuf {
        self.dir.join(lease_file_name(key))
    }

    pub fn guard_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.guard", lease_file_name(key)))
    }

    /// Run blocking filesystem work off the async runtime.
    async fn blocking<T, F>(&self, work: F) -> WorkspaceResult<T>
    where
        F: FnOnce(FsLeaseMutex) -> WorkspaceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || work(this))
            .await
            .map_err(|e| WorkspaceError::Blocking(e.to_string()))?
    }

    /// Take the per-key guard. `None` if another process holds it; a guard
    /// abandoned by a dead process is cleared so the next attempt can proceed.
    fn lock_key(&self, key: &str) -> WorkspaceResult<Option<KeyGuard>> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.guard_path(key);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(_) => Ok(Some(KeyGuard { path })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let abandoned = std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age >= GUARD_STALE_AFTER);
                if abandoned {
                    warn!(path = %path.display(), "removing abandoned lease guard");
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse a lease file. Unreadable content falls back to the file's
    /// modification time so a torn lease still ages out.
    fn read_lease(path: &Path, key: &str) -> WorkspaceResult<Option<Lease>> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice::<Lease>(&bytes) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable lease, using mtime");
                let modified = std::fs::metadata(path)?.modified()?;
                Ok(Some(Lease {
                    holder_id: "unknown".to_string(),
                    acquired_at: DateTime::<Utc>::from(modified),
                    repo_key: key.to_string(),
                }))
            }
        }
    }

    fn acquire_blocking(&self, key: &str, holder_id: &str) -> WorkspaceResult<bool> {
        let Some(_guard) = self.lock_key(key)? else {
            return Ok(false);
        };
        let path = self.lease_path(key);
        let lease = Lease::new(key, holder_id);

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&serde_json::to_vec(&lease)?)?;
        tmp.as_file().sync_data()?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => {
                debug!(repo_key = %key, holder_id = %holder_id, "lease created");
                Ok(true)
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(WorkspaceError::Persist {
                path,
                detail: e.error.to_string(),
            }),
        }
    }

    fn release_blocking(&self, key: &str) -> WorkspaceResult<()> {
        match std::fs::remove_file(self.lease_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn reclaim_blocking(&self, key: &str, observed: &Lease) -> WorkspaceResult<bool> {
        let Some(_guard) = self.lock_key(key)? else {
            return Ok(false);
        };
        let path = self.lease_path(key);
        if Self::read_lease(&path, key)?.as_ref() != Some(observed) {
            debug!(repo_key = %key, "lease changed since it was observed, not reclaiming");
            return Ok(false);
        }
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            // The holder released it while we were looking.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LeaseMutex for FsLeaseMutex {
    async fn try_acquire(&self, key: &str, holder_id: &str) -> WorkspaceResult<bool> {
        let (key, holder_id) = (key.to_string(), holder_id.to_string());
        self.blocking(move |m| m.acquire_blocking(&key, &holder_id))
            .await
    }

    async fn inspect(&self, key: &str) -> WorkspaceResult<Option<Lease>> {
        let key = key.to_string();
        self.blocking(move |m| Self::read_lease(&m.lease_path(&key), &key))
            .await
    }

    async fn release(&self, key: &str) -> WorkspaceResult<()> {
        let key = key.to_string();
        self.blocking(move |m| m.release_blocking(&key)).await
    }

    async fn reclaim_if(&self, key: &str, observed: &Lease) -> WorkspaceResult<bool> {
        let (key, observed) = (key.to_string(), observed.clone());
        self.blocking(move |m| m.reclaim_blocking(&key, &observed))
            .await
    }
}

// ---------------------------------------------------------------------------
// MemoryLeaseMutex
// ---------------------------------------------------------------------------

/// In-memory lease table (testing only).
#[derive(Debug, Default)]
pub struct MemoryLeaseMutex {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a lease directly, e.g. one left behind by a crashed holder.
    pub fn insert(&self, lease: Lease) {
        self.leases
            .lock()
            .unwrap()
            .insert(lease.repo_key.clone(), lease);
    }
}

#[async_trait]
impl LeaseMutex for MemoryLeaseMutex {
    async fn try_acquire(&self, key: &str, holder_id: &str) -> WorkspaceResult<bool> {
        let mut leases = self.leases.lock().unwrap();
        if leases.contains_key(key) {
            return Ok(false);
        }
        leases.insert(key.to_string(), Lease::new(key, holder_id));
        Ok(true)
    }

    async fn inspect(&self, key: &str) -> WorkspaceResult<Option<Lease>> {
        Ok(self.leases.lock().unwrap().get(key).cloned())
    }

    async fn release(&self, key: &str) -> WorkspaceResult<()> {
        self.leases.lock().unwrap().remove(key);
        Ok(())
    }

    async fn reclaim_if(&self, key: &str, observed: &Lease) -> WorkspaceResult<bool> {
        let mut leases = self.leases.lock().unwrap();
        if leases.get(key) == Some(observed) {
            leases.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
