//! Isolated per-job workspaces and per-repository locking.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::{WorkspaceError, WorkspaceResult};
use super::lease::{sanitize_key, FsLeaseMutex, LeaseMutex, StalenessPolicy};
use crate::config::HealerConfig;
use crate::metrics::METRICS;

/// Metadata file written at the root of every workspace.
pub const METADATA_FILE: &str = ".workspace.json";

/// Contents of [`METADATA_FILE`], read back by [`WorkspaceManager::cleanup_stale`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceMetadata {
    pub owner: String,
    pub repo_key: String,
    pub job_id: String,
    pub created_at: DateTime<Utc>,
}

pub struct WorkspaceManager {
    root: PathBuf,
    leases: Arc<dyn LeaseMutex>,
    staleness: StalenessPolicy,
    poll_interval: Duration,
    owner: String,
}

impl WorkspaceManager {
    pub fn new(
        root: impl AsRef<Path>,
        leases: Arc<dyn LeaseMutex>,
        staleness: StalenessPolicy,
        poll_interval: Duration,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            leases,
            staleness,
            poll_interval,
            owner: format!("autoheal-{}", std::process::id()),
        }
    }

    /// Filesystem-backed manager rooted at `config.base_dir`.
    pub fn from_config(config: &HealerConfig) -> Self {
        Self::new(
            config.workspaces_dir(),
            Arc::new(FsLeaseMutex::new(config.locks_dir())),
            StalenessPolicy::new(Duration::from_millis(config.lock_stale_after_ms)),
            Duration::from_millis(config.lock_poll_interval_ms),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn leases(&self) -> &Arc<dyn LeaseMutex> {
        &self.leases
    }

    /// Create a fresh directory for one job and return its absolute path.
    ///
    /// The name combines the sanitized repository key, the job id, and the
    /// creation time in milliseconds. An existing directory is never reused.
    pub async fn create_isolated_workspace(
        &self,
        job_id: &str,
        repo_key: &str,
    ) -> WorkspaceResult<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;

        let now = Utc::now();
        let name = format!(
            "{}-{}-{}",
            sanitize_key(repo_key),
            sanitize_key(job_id),
            now.timestamp_millis()
        );
        let path = self.root.join(name);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(path));
            }
            Err(e) => return Err(e.into()),
        }
        let path = tokio::fs::canonicalize(&path).await?;

        let metadata = WorkspaceMetadata {
            owner: self.owner.clone(),
            repo_key: repo_key.to_string(),
            job_id: job_id.to_string(),
            created_at: now,
        };
        tokio::fs::write(path.join(METADATA_FILE), serde_json::to_vec(&metadata)?).await?;

        debug!(repo_key = %repo_key, job_id = %job_id, path = %path.display(), "workspace created");
        Ok(path)
    }

    /// Acquire the repository lock as this process.
    pub async fn acquire_lock(&self, repo_key: &str, timeout: Duration) -> WorkspaceResult<bool> {
        let holder = self.owner.clone();
        self.acquire_lock_as(repo_key, &holder, timeout).await
    }

    /// Acquire the repository lock for `holder_id`, polling until `timeout`.
    ///
    /// A stale lease is reclaimed and the acquire retried without waiting.
    /// Returns `false` on timeout; never proceeds without the lease.
    pub async fn acquire_lock_as(
        &self,
        repo_key: &str,
        holder_id: &str,
        timeout: Duration,
    ) -> WorkspaceResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.leases.try_acquire(repo_key, holder_id).await? {
                debug!(repo_key = %repo_key, holder_id = %holder_id, "lock acquired");
                return Ok(true);
            }

            let retry_now = match self.leases.inspect(repo_key).await? {
                // Released between our two calls.
                None => true,
                Some(lease) if self.staleness.is_stale(&lease, Utc::now()) => {
                    if self.leases.reclaim_if(repo_key, &lease).await? {
                        METRICS.inc_locks_reclaimed();
                        warn!(
                            repo_key = %repo_key,
                            stale_holder = %lease.holder_id,
                            acquired_at = %lease.acquired_at,
                            "reclaimed stale lock"
                        );
                        // The reclaimer always gets one attempt at the freed lease.
                        continue;
                    }
                    false
                }
                Some(_) => false,
            };

            let now = Instant::now();
            if now >= deadline {
                info!(repo_key = %repo_key, timeout_ms = timeout.as_millis() as u64, "lock acquisition timed out");
                return Ok(false);
            }
            if !retry_now {
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        }
    }

    /// Release the repository lock. Idempotent.
    pub async fn release_lock(&self, repo_key: &str) -> WorkspaceResult<()> {
        self.leases.release(repo_key).await?;
        debug!(repo_key = %repo_key, "lock released");
        Ok(())
    }

    /// Recursively remove a workspace. Idempotent; refuses paths outside the
    /// workspace root.
    pub async fn cleanup(&self, path: &Path) -> WorkspaceResult<()> {
        let resolved = match tokio::fs::canonicalize(path).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let root = tokio::fs::canonicalize(&self.root).await?;
        if resolved == root || !resolved.starts_with(&root) {
            return Err(WorkspaceError::OutsideBase {
                path: resolved,
                base: root,
            });
        }

        match tokio::fs::remove_dir_all(&resolved).await {
            Ok(()) => {
                debug!(path = %resolved.display(), "workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every workspace older than `max_age`. Returns how many were
    /// removed. Age comes from the metadata record, else the directory mtime.
    pub async fn cleanup_stale(&self, max_age: Duration) -> WorkspaceResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let max_age = chrono::Duration::milliseconds(max_age.as_millis().min(i64::MAX as u128) as i64);
        let now = Utc::now();
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let Some(created_at) = workspace_created_at(&path).await else {
                continue;
            };
            if now.signed_duration_since(created_at) < max_age {
                continue;
            }
            match self.cleanup(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "stale workspace not removed"),
            }
        }

        if removed > 0 {
            info!(removed, "swept stale workspaces");
        }
        Ok(removed)
    }
}

async fn workspace_created_at(path: &Path) -> Option<DateTime<Utc>> {
    if let Ok(bytes) = tokio::fs::read(path.join(METADATA_FILE)).await {
        if let Ok(meta) = serde_json::from_slice::<WorkspaceMetadata>(&bytes) {
            return Some(meta.created_at);
        }
    }
    let modified = tokio::fs::metadata(path).await.ok()?.modified().ok()?;
    Some(DateTime::<Utc>::from(modified))
}
