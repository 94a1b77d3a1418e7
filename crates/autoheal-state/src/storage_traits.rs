//! Storage trait definitions for autoheal
//!
//! These traits define the two durable ledgers of the healing core:
//! - `HistoryStore`: append-only outcome records (reporting + throttle input)
//! - `ThrottleLedger`: per-signature attempt ledger snapshot
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// HealingResult / OutcomeRecord
// ---------------------------------------------------------------------------

/// Outcome of one healing job. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealingResult {
    pub success: bool,
    /// Free-form label describing how the fix was produced
    pub strategy: String,
    /// Ordered list of changed paths, relative to the repository root
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub pull_request_url: Option<String>,
    pub issue_url: Option<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl HealingResult {
    /// A failed result with no published artifacts.
    pub fn failure(strategy: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            strategy: strategy.into(),
            files_changed: Vec::new(),
            pull_request_url: None,
            issue_url: None,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Terminal status of a recorded job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl OutcomeStatus {
    /// Whether the job actually started work (and so counts as an attempt).
    pub fn is_attempt(&self) -> bool {
        !matches!(self, OutcomeStatus::Skipped)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One row of the history ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeRecord {
    pub job_id: String,
    pub repo_key: String,
    pub signature: String,
    pub branch: Option<String>,
    pub platform: String,
    pub error_type: String,
    pub status: OutcomeStatus,
    /// Skip reason, when `status` is `Skipped`
    pub reason: Option<String>,
    pub result: Option<HealingResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Filter for history lookups. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    pub signature: Option<String>,
    pub repo_key: Option<String>,
    /// Inclusive lower bound on `started_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`
    pub until: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn for_signature(signature: impl Into<String>) -> Self {
        Self {
            signature: Some(signature.into()),
            ..Default::default()
        }
    }

    pub fn for_repo(repo_key: impl Into<String>) -> Self {
        Self {
            repo_key: Some(repo_key.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &OutcomeRecord) -> bool {
        if let Some(sig) = &self.signature {
            if &record.signature != sig {
                return false;
            }
        }
        if let Some(repo) = &self.repo_key {
            if &record.repo_key != repo {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.started_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.started_at >= until {
                return false;
            }
        }
        true
    }

    /// Apply this query to records held in append order.
    ///
    /// Returns matches newest first, truncated to `limit`.
    pub fn select<'a, I>(&self, records: I) -> Vec<OutcomeRecord>
    where
        I: DoubleEndedIterator<Item = &'a OutcomeRecord>,
    {
        let limit = self.limit.unwrap_or(usize::MAX);
        records
            .rev()
            .filter(|r| self.matches(r))
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Append-only outcome ledger.
///
/// Guarantees:
/// - Records are never modified or removed once appended.
/// - Records survive process restart (for durable backends).
/// - Concurrent appends never interleave or corrupt one another.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Durably append one record.
    async fn append(&self, record: OutcomeRecord) -> StorageResult<()>;

    /// Query records, newest first.
    async fn query(&self, query: &HistoryQuery) -> StorageResult<Vec<OutcomeRecord>>;

    /// Number of records held.
    async fn len(&self) -> StorageResult<usize>;

    async fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len().await? == 0)
    }
}

// ---------------------------------------------------------------------------
// ThrottleLedger
// ---------------------------------------------------------------------------

/// Per-signature throttle row.
///
/// `recent_attempts` holds the start time of every attempt still inside the
/// rolling window; entries are aged out, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleEntry {
    pub signature: String,
    pub last_attempt_at: DateTime<Utc>,
    #[serde(default)]
    pub recent_attempts: Vec<DateTime<Utc>>,
}

impl ThrottleEntry {
    pub fn new(signature: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            signature: signature.into(),
            last_attempt_at: at,
            recent_attempts: vec![at],
        }
    }

    /// Attempts whose start lies within `window` of `now`.
    pub fn attempt_count_within_window(&self, now: DateTime<Utc>, window: Duration) -> usize {
        self.recent_attempts
            .iter()
            .filter(|at| now.signed_duration_since(**at) < window)
            .count()
    }

    /// Register an attempt started at `at`, pruning attempts outside `window`.
    pub fn push_attempt(&mut self, at: DateTime<Utc>, window: Duration) {
        self.recent_attempts
            .retain(|prev| at.signed_duration_since(*prev) < window);
        self.recent_attempts.push(at);
        if at > self.last_attempt_at {
            self.last_attempt_at = at;
        }
    }
}

/// Durable snapshot of the throttle ledger.
#[async_trait]
pub trait ThrottleLedger: Send + Sync {
    /// Load all entries. A missing ledger yields an empty list.
    async fn load(&self) -> StorageResult<Vec<ThrottleEntry>>;

    /// Replace the persisted ledger with `entries`.
    async fn save(&self, entries: &[ThrottleEntry]) -> StorageResult<()>;
}
