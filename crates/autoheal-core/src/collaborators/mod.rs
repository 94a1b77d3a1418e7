//! Capability interfaces for everything the core delegates: fix
//! generation, repository hosting, and notification delivery.
//!
//! The pipeline holds each as an optional `Arc<dyn _>` injected at
//! construction time. Process-backed implementations live alongside.

pub mod command_agent;
pub mod git_host;
pub mod notify;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::ErrorReport;
use crate::events::HealingEvent;

pub use command_agent::CommandFixAgent;
pub use git_host::GitCliHost;
pub use notify::{LogNotifier, WebhookNotifier};

/// Errors from collaborator calls. The pipeline converts these into
/// `HealingResult.error` strings; they never abort a run.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("{program} timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

// ---------------------------------------------------------------------------
// Fix generation
// ---------------------------------------------------------------------------

/// Structured healing request handed to the fix agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixRequest {
    pub job_id: String,
    pub repo_key: String,
    pub branch: Option<String>,
    pub platform: String,
    pub error_type: String,
    pub message: String,
    pub raw_log: String,
    pub signature: String,
    pub workspace_path: PathBuf,
}

impl FixRequest {
    pub fn new(job_id: &str, report: &ErrorReport, workspace_path: &Path) -> Self {
        Self {
            job_id: job_id.to_string(),
            repo_key: report.key().unwrap_or_default().to_string(),
            branch: report.branch.clone(),
            platform: report.platform.as_str().to_string(),
            error_type: report.error_type.clone(),
            message: report.message.clone(),
            raw_log: report.raw_log.clone(),
            signature: report.signature.clone(),
            workspace_path: workspace_path.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FixResponse {
    pub success: bool,
    pub strategy: String,
    pub files_changed: Vec<String>,
    pub message: Option<String>,
}

#[async_trait]
pub trait FixAgent: Send + Sync {
    /// Generate a fix inside `request.workspace_path`.
    async fn request_fix(&self, request: &FixRequest) -> CollaboratorResult<FixResponse>;
}

// ---------------------------------------------------------------------------
// Repository host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSpec {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
}

/// Git hosting operations. `clone` is retried by the caller.
#[async_trait]
pub trait RepoHost: Send + Sync {
    async fn clone_repo(&self, repo_key: &str, branch: &str, dest: &Path)
        -> CollaboratorResult<()>;

    async fn create_branch(&self, workspace: &Path, branch: &str) -> CollaboratorResult<()>;

    async fn commit(&self, workspace: &Path, message: &str) -> CollaboratorResult<()>;

    async fn push(&self, workspace: &Path, branch: &str) -> CollaboratorResult<()>;

    async fn create_pull_request(
        &self,
        repo_key: &str,
        spec: &PullRequestSpec,
    ) -> CollaboratorResult<PullRequest>;

    /// Wait up to `timeout` for checks on `git_ref`; `true` only if all pass.
    async fn poll_checks(
        &self,
        repo_key: &str,
        git_ref: &str,
        timeout: Duration,
    ) -> CollaboratorResult<bool>;

    async fn merge(&self, repo_key: &str, pr: &PullRequest) -> CollaboratorResult<()>;

    /// Open an issue and return its URL.
    async fn create_issue(&self, repo_key: &str, title: &str, body: &str)
        -> CollaboratorResult<String>;
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &HealingEvent) -> CollaboratorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Platform;

    #[test]
    fn fix_request_carries_report_fields() {
        let report = ErrorReport::new(Platform::DeployPlatform, "x/y", "deploy", "missing env")
            .with_branch("release");
        let req = FixRequest::new("job-1", &report, Path::new("/tmp/ws"));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["repoKey"], "x/y");
        assert_eq!(value["platform"], "deploy-platform");
        assert_eq!(value["branch"], "release");
        assert_eq!(value["workspacePath"], "/tmp/ws");
        assert_eq!(value["signature"], report.signature);
    }

    #[test]
    fn fix_response_tolerates_missing_fields() {
        let resp: FixResponse = serde_json::from_str(r#"{"success":true}"#).unwrap();
        assert!(resp.success);
        assert!(resp.files_changed.is_empty());
        assert_eq!(resp.strategy, "");
    }
}
