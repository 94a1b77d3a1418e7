//! Healing Job Pipeline: the per-report unit of work.
//!
//! `created → lock-timeout | running → succeeded | failed`. While running:
//! workspace, clone, fix agent, branch/commit/push/PR, optional CI wait and
//! merge. Lock release and workspace removal run after every attempt, in
//! that order, whichever step stopped it (a panicking step included).

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tracing::{error, info, warn, Instrument};

use autoheal_state::{HealingResult, HistoryStore};

use crate::collaborators::{FixAgent, FixRequest, PullRequest, PullRequestSpec, RepoHost};
use crate::config::HealerConfig;
use crate::domain::{HealError, HealingJob, JobStatus, Result, SkipReason};
use crate::events::HealingEvent;
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::throttle::SafetyThrottle;
use crate::workspace::lease::sanitize_key;
use crate::workspace::WorkspaceManager;

pub const NO_CHANGES_ERROR: &str = "no changes generated";
pub const FIX_AGENT_UNAVAILABLE: &str = "fix agent unavailable";
pub const REPO_HOST_UNAVAILABLE: &str = "repository host unavailable; changes not published";
pub const SIMULATED_STRATEGY: &str = "simulated";

/// Directory inside a workspace that holds the checkout.
pub const CHECKOUT_DIR: &str = "repo";

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub lock_timeout: Duration,
    pub clone_retry: RetryPolicy,
    pub auto_merge: bool,
    pub ci_wait_timeout: Duration,
    pub open_issue_on_failure: bool,
    pub base_branch_fallback: String,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&HealerConfig::default())
    }
}

impl PipelineOptions {
    pub fn from_config(config: &HealerConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            clone_retry: RetryPolicy::new(
                config.clone_retries,
                Duration::from_millis(config.clone_backoff_base_ms),
            ),
            auto_merge: config.auto_merge,
            ci_wait_timeout: Duration::from_millis(config.ci_wait_timeout_ms),
            open_issue_on_failure: config.open_issue_on_failure,
            base_branch_fallback: config.base_branch_fallback.clone(),
        }
    }
}

/// Final job state plus the events it produced, in order.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: HealingJob,
    pub events: Vec<HealingEvent>,
}

impl JobReport {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }
}

/// What an attempt produced before it stopped.
#[derive(Debug, Default)]
struct Progress {
    strategy: String,
    files_changed: Vec<String>,
    pull_request: Option<PullRequest>,
}

pub struct HealingPipeline {
    workspaces: Arc<WorkspaceManager>,
    throttle: Arc<SafetyThrottle>,
    history: Arc<dyn HistoryStore>,
    fix_agent: Option<Arc<dyn FixAgent>>,
    repo_host: Option<Arc<dyn RepoHost>>,
    options: PipelineOptions,
}

impl HealingPipeline {
    pub fn new(
        workspaces: Arc<WorkspaceManager>,
        throttle: Arc<SafetyThrottle>,
        history: Arc<dyn HistoryStore>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            workspaces,
            throttle,
            history,
            fix_agent: None,
            repo_host: None,
            options,
        }
    }

    pub fn with_fix_agent(mut self, agent: Arc<dyn FixAgent>) -> Self {
        self.fix_agent = Some(agent);
        self
    }

    pub fn with_repo_host(mut self, host: Arc<dyn RepoHost>) -> Self {
        self.repo_host = Some(host);
        self
    }

    pub fn workspaces(&self) -> &Arc<WorkspaceManager> {
        &self.workspaces
    }

    pub fn throttle(&self) -> &Arc<SafetyThrottle> {
        &self.throttle
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    /// Run one job to a terminal state.
    ///
    /// Step failures become a failed [`HealingResult`]; the only error is a
    /// job that was not freshly created.
    pub async fn run_job(&self, job: HealingJob) -> Result<JobReport> {
        let span = obs::job_span(job.id.as_str(), job.repo_key());
        self.run_job_inner(job).instrument(span).await
    }

    async fn run_job_inner(&self, mut job: HealingJob) -> Result<JobReport> {
        if job.status != JobStatus::Created {
            return Err(HealError::InvalidTransition {
                from: job.status,
                to: JobStatus::Running,
            });
        }
        let mut events = Vec::new();
        let job_id = job.id.to_string();
        let repo_key = job.repo_key().to_string();

        let lock_error = match self
            .workspaces
            .acquire_lock_as(&repo_key, &job_id, self.options.lock_timeout)
            .await
        {
            Ok(true) => None,
            Ok(false) => return self.skip(job, SkipReason::LockTimeout, events).await,
            Err(e) => {
                warn!(error = %e, "lock backend failed");
                Some(e)
            }
        };

        // Re-checked at start: a job sharing this signature may have started
        // since the run was planned.
        let denied = match self.throttle.try_begin(&job.report).await {
            Ok(decision) => decision.reason,
            Err(e) => {
                error!(error = %e, "failed to record throttle attempt");
                None
            }
        };
        if let Some(reason) = denied {
            if lock_error.is_none() {
                self.release_lock(&repo_key).await;
            }
            return self.skip(job, reason, events).await;
        }

        job.transition(JobStatus::Running)?;
        METRICS.inc_jobs_started();
        obs::emit_job_started(&job_id, &repo_key, job.signature());
        events.push(HealingEvent::JobStarted {
            job_id: job_id.clone(),
            repo_key: repo_key.clone(),
            signature: job.signature().to_string(),
            at: Utc::now(),
        });

        // The backend failed without granting the lease: a counted attempt
        // that cannot proceed.
        if let Some(e) = lock_error {
            let result = HealingResult::failure("none", format!("lock acquisition failed: {e}"), 0);
            return self.complete(job, result, events).await;
        }

        let start = Instant::now();
        let mut result = match AssertUnwindSafe(self.heal(&mut job)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => HealingResult::failure(
                "none",
                "job panicked",
                start.elapsed().as_millis() as u64,
            ),
        };

        // Guaranteed cleanup: lock first, then workspace.
        self.release_lock(&repo_key).await;
        if let Some(path) = &job.workspace_path {
            if let Err(e) = self.workspaces.cleanup(path).await {
                error!(path = %path.display(), error = %e, "failed to remove workspace");
            }
        }

        if !result.success {
            result.issue_url = self.open_failure_issue(&job, &result).await;
        }
        self.complete(job, result, events).await
    }

    async fn release_lock(&self, repo_key: &str) {
        if let Err(e) = self.workspaces.release_lock(repo_key).await {
            error!(error = %e, "failed to release lock");
        }
    }

    /// End a job that never ran: lock timeout or a throttle verdict at start.
    async fn skip(
        &self,
        mut job: HealingJob,
        reason: SkipReason,
        mut events: Vec<HealingEvent>,
    ) -> Result<JobReport> {
        job.skip(reason)?;
        METRICS.inc_jobs_skipped();
        obs::emit_job_skipped(job.repo_key(), job.signature(), reason);
        events.push(HealingEvent::JobSkipped {
            repo_key: job.repo_key().to_string(),
            signature: job.signature().to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.persist(&job).await;
        Ok(JobReport { job, events })
    }

    /// Record the terminal state, emit the terminal event, and persist.
    async fn complete(
        &self,
        mut job: HealingJob,
        result: HealingResult,
        mut events: Vec<HealingEvent>,
    ) -> Result<JobReport> {
        obs::emit_job_finished(
            job.id.as_str(),
            result.success,
            result.duration_ms,
            result.error.as_deref(),
        );
        let event = if result.success {
            METRICS.inc_jobs_healed();
            HealingEvent::JobSucceeded {
                job_id: job.id.to_string(),
                repo_key: job.repo_key().to_string(),
                strategy: result.strategy.clone(),
                pull_request_url: result.pull_request_url.clone(),
                at: Utc::now(),
            }
        } else {
            METRICS.inc_jobs_failed();
            HealingEvent::JobFailed {
                job_id: job.id.to_string(),
                repo_key: job.repo_key().to_string(),
                error: result.error.clone().unwrap_or_default(),
                issue_url: result.issue_url.clone(),
                at: Utc::now(),
            }
        };
        events.push(event);
        job.finish(result)?;
        self.persist(&job).await;
        Ok(JobReport { job, events })
    }

    async fn persist(&self, job: &HealingJob) {
        if let Err(e) = self.history.append(job.to_record()).await {
            error!(job_id = %job.id, error = %e, "failed to persist outcome");
        }
    }

    async fn heal(&self, job: &mut HealingJob) -> HealingResult {
        let start = Instant::now();
        let mut progress = Progress::default();
        let outcome = self.attempt(job, &mut progress).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        HealingResult {
            success: outcome.is_ok(),
            strategy: progress.strategy,
            files_changed: progress.files_changed,
            pull_request_url: progress.pull_request.map(|pr| pr.url),
            issue_url: None,
            duration_ms,
            error: outcome.err(),
        }
    }

    async fn attempt(
        &self,
        job: &mut HealingJob,
        progress: &mut Progress,
    ) -> std::result::Result<(), String> {
        let repo_key = job.repo_key().to_string();
        let workspace = self
            .workspaces
            .create_isolated_workspace(job.id.as_str(), &repo_key)
            .await
            .map_err(|e| format!("workspace creation failed: {e}"))?;
        job.workspace_path = Some(workspace.clone());
        let checkout = workspace.join(CHECKOUT_DIR);

        let base_branch = job
            .report
            .branch
            .clone()
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| self.options.base_branch_fallback.clone());

        match &self.repo_host {
            Some(host) => {
                retry_with_backoff(&self.options.clone_retry, "clone", |_| {
                    host.clone_repo(&repo_key, &base_branch, &checkout)
                })
                .await
                .map_err(|e| format!("clone failed: {e}"))?;
            }
            None => {
                tokio::fs::create_dir_all(&checkout)
                    .await
                    .map_err(|e| format!("workspace creation failed: {e}"))?;
            }
        }

        let Some(agent) = &self.fix_agent else {
            progress.strategy = SIMULATED_STRATEGY.to_string();
            return Err(FIX_AGENT_UNAVAILABLE.to_string());
        };
        let request = FixRequest::new(job.id.as_str(), &job.report, &checkout);
        let response = agent
            .request_fix(&request)
            .await
            .map_err(|e| format!("fix agent failed: {e}"))?;

        progress.strategy = if response.strategy.trim().is_empty() {
            "agent".to_string()
        } else {
            response.strategy.clone()
        };
        progress.files_changed = response.files_changed.clone();

        if !response.success {
            return Err(response
                .message
                .unwrap_or_else(|| "fix agent reported failure".to_string()));
        }
        if response.files_changed.is_empty() {
            return Err(NO_CHANGES_ERROR.to_string());
        }
        let Some(host) = &self.repo_host else {
            return Err(REPO_HOST_UNAVAILABLE.to_string());
        };

        let fix_branch = fix_branch_name(job);
        host.create_branch(&checkout, &fix_branch)
            .await
            .map_err(|e| format!("branch creation failed: {e}"))?;
        host.commit(&checkout, &commit_message(job, &progress.strategy))
            .await
            .map_err(|e| format!("commit failed: {e}"))?;
        host.push(&checkout, &fix_branch)
            .await
            .map_err(|e| format!("push failed: {e}"))?;

        let spec = PullRequestSpec {
            head: fix_branch.clone(),
            base: base_branch,
            title: format!("autoheal: fix {} failure", job.report.error_type),
            body: pull_request_body(job, progress),
        };
        let pr = host
            .create_pull_request(&repo_key, &spec)
            .await
            .map_err(|e| format!("pull request creation failed: {e}"))?;
        info!(url = %pr.url, "pull request opened");
        progress.pull_request = Some(pr.clone());

        if self.options.auto_merge {
            self.try_merge(host.as_ref(), &repo_key, &fix_branch, &pr).await;
        }
        Ok(())
    }

    /// Merge once checks pass. A PR that cannot be merged stays open; the
    /// job still counts as healed.
    async fn try_merge(&self, host: &dyn RepoHost, repo_key: &str, git_ref: &str, pr: &PullRequest) {
        match host
            .poll_checks(repo_key, git_ref, self.options.ci_wait_timeout)
            .await
        {
            Ok(true) => match host.merge(repo_key, pr).await {
                Ok(()) => info!(number = pr.number, "pull request merged"),
                Err(e) => warn!(number = pr.number, error = %e, "auto-merge failed"),
            },
            Ok(false) => info!(number = pr.number, "checks did not pass; leaving pull request open"),
            Err(e) => warn!(number = pr.number, error = %e, "check polling failed"),
        }
    }

    async fn open_failure_issue(&self, job: &HealingJob, result: &HealingResult) -> Option<String> {
        if !self.options.open_issue_on_failure {
            return None;
        }
        let host = self.repo_host.as_ref()?;
        let error = result.error.as_deref().unwrap_or("unknown error");
        if error == NO_CHANGES_ERROR {
            return None;
        }
        let title = format!("autoheal could not fix {} failure", job.report.error_type);
        let body = format!(
            "Automated healing failed.\n\n- signature: `{}`\n- strategy: {}\n- error: {}\n\n```\n{}\n```",
            job.signature(),
            result.strategy,
            error,
            job.report.message,
        );
        match host.create_issue(job.repo_key(), &title, &body).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "failed to open failure issue");
                None
            }
        }
    }
}

/// `autoheal/fix-<error type>-<job id>`.
pub fn fix_branch_name(job: &HealingJob) -> String {
    let kind = sanitize_key(&job.report.error_type.to_lowercase());
    format!("autoheal/fix-{}-{}", kind, job.id)
}

fn commit_message(job: &HealingJob, strategy: &str) -> String {
    format!(
        "fix: automated {} repair ({})\n\nSignature: {}",
        job.report.error_type,
        strategy,
        job.signature()
    )
}

fn pull_request_body(job: &HealingJob, progress: &Progress) -> String {
    let files: Vec<String> = progress
        .files_changed
        .iter()
        .map(|f| format!("- `{f}`"))
        .collect();
    format!(
        "Automated fix for a {} failure on {}.\n\nStrategy: {}\n\nFiles changed:\n{}\n\nSignature: `{}`",
        job.report.error_type,
        job.report.platform,
        progress.strategy,
        files.join("\n"),
        job.signature(),
    )
}
