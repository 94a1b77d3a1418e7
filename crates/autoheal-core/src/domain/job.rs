//! Healing jobs and their lifecycle.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use autoheal_state::{HealingResult, OutcomeRecord, OutcomeStatus};

use super::error::{HealError, Result};
use super::report::ErrorReport;

/// Opaque, process-unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        JobId(format!("job-{}", &uuid[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job state machine:
///
/// ```text
/// created ─┬─> throttled      (terminal, skipped)
///          ├─> lock-timeout   (terminal, skipped)
///          └─> running ─┬─> succeeded (terminal)
///                       └─> failed    (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Created,
    Throttled,
    LockTimeout,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Created | JobStatus::Running)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, JobStatus::Throttled | JobStatus::LockTimeout)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Created, JobStatus::Throttled)
                | (JobStatus::Created, JobStatus::LockTimeout)
                | (JobStatus::Created, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Throttled => "throttled",
            JobStatus::LockTimeout => "lock-timeout",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Blocklisted,
    Cooldown,
    MaxAttempts,
    InvalidSignature,
    LockTimeout,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Blocklisted => "blocklisted",
            SkipReason::Cooldown => "cooldown",
            SkipReason::MaxAttempts => "max-attempts",
            SkipReason::InvalidSignature => "invalid-signature",
            SkipReason::LockTimeout => "lock-timeout",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled attempt to fix a specific report.
///
/// A job exclusively owns its workspace for its lifetime; `lock_key` is the
/// repository key the job holds a lease on while running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealingJob {
    pub id: JobId,
    pub report: ErrorReport,
    pub workspace_path: Option<PathBuf>,
    pub lock_key: String,
    pub status: JobStatus,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<HealingResult>,
}

impl HealingJob {
    /// Create a job for a keyed report.
    pub fn new(report: ErrorReport) -> Result<Self> {
        let lock_key = report.key().ok_or(HealError::MissingRepoKey)?.to_string();
        Ok(Self {
            id: JobId::new(),
            report,
            workspace_path: None,
            lock_key,
            status: JobStatus::Created,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            result: None,
        })
    }

    pub fn repo_key(&self) -> &str {
        &self.lock_key
    }

    pub fn signature(&self) -> &str {
        &self.report.signature
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HealError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Terminal skip with a reason.
    pub fn skip(&mut self, reason: SkipReason) -> Result<()> {
        let next = match reason {
            SkipReason::LockTimeout => JobStatus::LockTimeout,
            _ => JobStatus::Throttled,
        };
        self.transition(next)?;
        self.skip_reason = Some(reason);
        Ok(())
    }

    /// Terminal completion from a running job.
    pub fn finish(&mut self, result: HealingResult) -> Result<()> {
        let next = if result.success {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        self.transition(next)?;
        self.result = Some(result);
        Ok(())
    }

    /// History row for a terminal job.
    pub fn to_record(&self) -> OutcomeRecord {
        let status = match self.status {
            JobStatus::Succeeded => OutcomeStatus::Succeeded,
            JobStatus::Throttled | JobStatus::LockTimeout => OutcomeStatus::Skipped,
            _ => OutcomeStatus::Failed,
        };
        let finished_at = self.finished_at.unwrap_or_else(Utc::now);
        OutcomeRecord {
            job_id: self.id.to_string(),
            repo_key: self.lock_key.clone(),
            signature: self.report.signature.clone(),
            branch: self.report.branch.clone(),
            platform: self.report.platform.to_string(),
            error_type: self.report.error_type.clone(),
            status,
            reason: self.skip_reason.map(|r| r.to_string()),
            result: self.result.clone(),
            started_at: self.started_at.unwrap_or(finished_at),
            finished_at,
        }
    }
}
