//! Job pipeline scenarios: outcomes, cleanup on every path, lock skips.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoheal_core::fakes::{RecordingRepoHost, ScriptedFixAgent};
use autoheal_core::{
    ErrorReport, FsLeaseMutex, HealingJob, HealingPipeline, JobReport, JobStatus, Lease,
    LeaseMutex, PipelineOptions, Platform, RetryPolicy, SafetyThrottle, StalenessPolicy,
    ThrottlePolicy, WorkspaceError, WorkspaceManager, FIX_AGENT_UNAVAILABLE, NO_CHANGES_ERROR,
    REPO_HOST_UNAVAILABLE, SIMULATED_STRATEGY,
};
use autoheal_state::fakes::{MemoryHistoryStore, MemoryThrottleLedger};
use autoheal_state::{HistoryStore, OutcomeStatus};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    workspaces: Arc<WorkspaceManager>,
    throttle: Arc<SafetyThrottle>,
    history: Arc<MemoryHistoryStore>,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let workspaces = Arc::new(WorkspaceManager::new(
        dir.path().join("workspaces"),
        Arc::new(FsLeaseMutex::new(dir.path().join("locks"))),
        StalenessPolicy::default(),
        Duration::from_millis(10),
    ));
    let throttle = Arc::new(
        SafetyThrottle::load(
            ThrottlePolicy::default(),
            Arc::new(MemoryThrottleLedger::new()),
            None,
        )
        .await
        .unwrap(),
    );
    Harness {
        dir,
        workspaces,
        throttle,
        history: Arc::new(MemoryHistoryStore::new()),
    }
}

fn options() -> PipelineOptions {
    PipelineOptions {
        lock_timeout: Duration::from_millis(100),
        clone_retry: RetryPolicy::new(3, Duration::from_millis(1)),
        ..PipelineOptions::default()
    }
}

impl Harness {
    fn pipeline(&self, opts: PipelineOptions) -> HealingPipeline {
        HealingPipeline::new(
            self.workspaces.clone(),
            self.throttle.clone(),
            self.history.clone(),
            opts,
        )
    }

    fn workspace_count(&self) -> usize {
        let root = self.dir.path().join("workspaces");
        match std::fs::read_dir(root) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    async fn lock_held(&self, repo_key: &str) -> bool {
        self.workspaces
            .leases()
            .inspect(repo_key)
            .await
            .unwrap()
            .is_some()
    }

    /// Cleanup totality: no workspace and no lease survive a finished job.
    async fn assert_clean(&self, repo_key: &str, report: &JobReport) {
        assert_eq!(self.workspace_count(), 0, "workspace left behind");
        assert!(!self.lock_held(repo_key).await, "lease left behind");
        if let Some(path) = &report.job.workspace_path {
            assert!(!Path::new(path).exists());
        }
    }
}

fn job(repo: &str) -> HealingJob {
    HealingJob::new(
        ErrorReport::new(Platform::CiActions, repo, "build", "error[E0308]: mismatched types")
            .with_branch("main"),
    )
    .unwrap()
}

fn kinds(report: &JobReport) -> Vec<&'static str> {
    report.events.iter().map(|e| e.kind()).collect()
}

#[tokio::test]
async fn no_changes_is_a_recorded_failure_with_full_cleanup() {
    let h = harness().await;
    let agent = Arc::new(ScriptedFixAgent::no_changes());
    let host = Arc::new(RecordingRepoHost::new());
    let pipeline = h
        .pipeline(PipelineOptions {
            open_issue_on_failure: true,
            ..options()
        })
        .with_fix_agent(agent.clone())
        .with_repo_host(host.clone());

    let job = job("x/y");
    let signature = job.signature().to_string();
    let report = pipeline.run_job(job).await.unwrap();

    assert_eq!(report.status(), JobStatus::Failed);
    let result = report.job.result.clone().unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some(NO_CHANGES_ERROR));
    assert_eq!(result.issue_url, None, "no issue for no-change outcomes");
    assert_eq!(host.count("issue"), 0);
    assert_eq!(kinds(&report), vec!["job-started", "job-failed"]);

    assert_eq!(agent.requests().len(), 1);
    h.assert_clean("x/y", &report).await;

    let entry = h.throttle.entry(&signature).await.unwrap();
    assert_eq!(entry.recent_attempts.len(), 1);

    let records = h.history.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OutcomeStatus::Failed);
    assert_eq!(records[0].repo_key, "x/y");
}

#[tokio::test]
async fn changes_are_published_as_a_pull_request() {
    let h = harness().await;
    let agent = Arc::new(ScriptedFixAgent::changes("type-fix", &["src/lib.rs"]));
    let host = Arc::new(RecordingRepoHost::new());
    let pipeline = h
        .pipeline(options())
        .with_fix_agent(agent.clone())
        .with_repo_host(host.clone());

    let report = pipeline.run_job(job("x/y")).await.unwrap();

    assert_eq!(report.status(), JobStatus::Succeeded);
    let result = report.job.result.clone().unwrap();
    assert!(result.success);
    assert_eq!(result.strategy, "type-fix");
    assert_eq!(result.files_changed, vec!["src/lib.rs".to_string()]);
    assert_eq!(
        result.pull_request_url.as_deref(),
        Some("https://git.example.test/x/y/pull/1")
    );
    assert_eq!(
        host.calls(),
        vec!["clone", "branch", "commit", "push", "pull_request"]
    );
    assert_eq!(kinds(&report), vec!["job-started", "job-succeeded"]);

    // The agent worked inside the clone of this job's workspace.
    let request = &agent.requests()[0];
    assert_eq!(host.clone_destinations(), vec![request.workspace_path.clone()]);
    assert!(request
        .workspace_path
        .starts_with(report.job.workspace_path.as_ref().unwrap()));

    h.assert_clean("x/y", &report).await;
    assert_eq!(h.history.snapshot()[0].status, OutcomeStatus::Succeeded);
}

#[tokio::test]
async fn auto_merge_waits_for_passing_checks() {
    let h = harness().await;
    let host = Arc::new(RecordingRepoHost::new().with_checks(true));
    let pipeline = h
        .pipeline(PipelineOptions {
            auto_merge: true,
            ..options()
        })
        .with_fix_agent(Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"])))
        .with_repo_host(host.clone());

    pipeline.run_job(job("x/y")).await.unwrap();
    assert_eq!(
        host.calls(),
        vec!["clone", "branch", "commit", "push", "pull_request", "checks", "merge"]
    );
}

#[tokio::test]
async fn failing_checks_leave_the_pull_request_open() {
    let h = harness().await;
    let host = Arc::new(RecordingRepoHost::new().with_checks(false));
    let pipeline = h
        .pipeline(PipelineOptions {
            auto_merge: true,
            ..options()
        })
        .with_fix_agent(Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"])))
        .with_repo_host(host.clone());

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    assert_eq!(report.status(), JobStatus::Succeeded);
    assert_eq!(host.count("checks"), 1);
    assert_eq!(host.count("merge"), 0);
}

#[tokio::test]
async fn transient_clone_failures_are_retried() {
    let h = harness().await;
    let host = Arc::new(RecordingRepoHost::new().failing_clones(2));
    let pipeline = h
        .pipeline(options())
        .with_fix_agent(Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"])))
        .with_repo_host(host.clone());

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    assert_eq!(report.status(), JobStatus::Succeeded);
    assert_eq!(host.count("clone"), 3);
}

#[tokio::test]
async fn exhausted_clone_retries_fail_the_job() {
    let h = harness().await;
    let agent = Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"]));
    let host = Arc::new(RecordingRepoHost::new().failing_clones(10));
    let pipeline = h
        .pipeline(options())
        .with_fix_agent(agent.clone())
        .with_repo_host(host.clone());

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    let result = report.job.result.clone().unwrap();
    assert!(result.error.unwrap().starts_with("clone failed"));
    assert_eq!(host.count("clone"), 4);
    assert!(agent.requests().is_empty());
    h.assert_clean("x/y", &report).await;
}

#[tokio::test]
async fn push_failure_opens_an_issue_and_cleans_up() {
    let h = harness().await;
    let host = Arc::new(RecordingRepoHost::new().failing_push());
    let pipeline = h
        .pipeline(PipelineOptions {
            open_issue_on_failure: true,
            ..options()
        })
        .with_fix_agent(Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"])))
        .with_repo_host(host.clone());

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    let result = report.job.result.clone().unwrap();
    assert!(result.error.as_deref().unwrap().starts_with("push failed"));
    assert_eq!(result.strategy, "fix");
    assert_eq!(
        result.issue_url.as_deref(),
        Some("https://git.example.test/x/y/issues/1")
    );
    assert_eq!(host.count("pull_request"), 0);
    h.assert_clean("x/y", &report).await;
}

#[tokio::test]
async fn agent_error_is_a_job_failure() {
    let h = harness().await;
    let pipeline = h
        .pipeline(options())
        .with_fix_agent(Arc::new(ScriptedFixAgent::failing("model overloaded")))
        .with_repo_host(Arc::new(RecordingRepoHost::new()));

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    let error = report.job.result.clone().unwrap().error.unwrap();
    assert!(error.starts_with("fix agent failed"));
    assert!(error.contains("model overloaded"));
    h.assert_clean("x/y", &report).await;
}

#[tokio::test]
async fn panicking_step_still_releases_everything() {
    let h = harness().await;
    let pipeline = h
        .pipeline(options())
        .with_fix_agent(Arc::new(ScriptedFixAgent::panicking()))
        .with_repo_host(Arc::new(RecordingRepoHost::new()));

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    assert_eq!(report.status(), JobStatus::Failed);
    assert_eq!(
        report.job.result.clone().unwrap().error.as_deref(),
        Some("job panicked")
    );
    h.assert_clean("x/y", &report).await;
}

#[tokio::test]
async fn missing_fix_agent_yields_simulated_result() {
    let h = harness().await;
    let pipeline = h.pipeline(options());

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    let result = report.job.result.clone().unwrap();
    assert!(!result.success);
    assert_eq!(result.strategy, SIMULATED_STRATEGY);
    assert_eq!(result.error.as_deref(), Some(FIX_AGENT_UNAVAILABLE));
    h.assert_clean("x/y", &report).await;
}

#[tokio::test]
async fn missing_repo_host_does_not_publish() {
    let h = harness().await;
    let pipeline = h
        .pipeline(options())
        .with_fix_agent(Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"])));

    let report = pipeline.run_job(job("x/y")).await.unwrap();
    let result = report.job.result.clone().unwrap();
    assert_eq!(result.strategy, "fix");
    assert_eq!(result.error.as_deref(), Some(REPO_HOST_UNAVAILABLE));
    h.assert_clean("x/y", &report).await;
}

#[tokio::test]
async fn held_lock_skips_the_job_without_an_attempt() {
    let h = harness().await;
    assert!(h
        .workspaces
        .acquire_lock_as("x/y", "other-process", Duration::ZERO)
        .await
        .unwrap());

    let agent = Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"]));
    let pipeline = h.pipeline(options()).with_fix_agent(agent.clone());

    let job = job("x/y");
    let signature = job.signature().to_string();
    let report = pipeline.run_job(job).await.unwrap();

    assert_eq!(report.status(), JobStatus::LockTimeout);
    assert_eq!(kinds(&report), vec!["job-skipped"]);
    assert!(agent.requests().is_empty());
    assert!(h.throttle.entry(&signature).await.is_none());
    assert_eq!(h.workspace_count(), 0);

    // The other holder keeps its lease.
    let lease = h.workspaces.leases().inspect("x/y").await.unwrap().unwrap();
    assert_eq!(lease.holder_id, "other-process");

    let records = h.history.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OutcomeStatus::Skipped);
    assert_eq!(records[0].reason.as_deref(), Some("lock-timeout"));
    assert_eq!(h.history.len().await.unwrap(), 1);
}

#[tokio::test]
async fn finished_job_cannot_be_rerun() {
    let h = harness().await;
    let pipeline = h.pipeline(options());
    let report = pipeline.run_job(job("x/y")).await.unwrap();
    assert!(pipeline.run_job(report.job).await.is_err());
}

#[tokio::test]
async fn throttled_at_start_releases_the_lock() {
    let h = harness().await;
    let agent = Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"]));
    let pipeline = h.pipeline(options()).with_fix_agent(agent.clone());

    // Another job with the same signature started after this run was planned.
    let job = job("x/y");
    let signature = job.signature().to_string();
    h.throttle.record_attempt(&job.report).await.unwrap();

    let report = pipeline.run_job(job).await.unwrap();

    assert_eq!(report.status(), JobStatus::Throttled);
    assert_eq!(kinds(&report), vec!["job-skipped"]);
    assert!(agent.requests().is_empty());
    assert_eq!(
        h.throttle.entry(&signature).await.unwrap().recent_attempts.len(),
        1
    );
    h.assert_clean("x/y", &report).await;

    let records = h.history.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OutcomeStatus::Skipped);
    assert_eq!(records[0].reason.as_deref(), Some("cooldown"));
}

/// Lease backend whose storage is gone.
struct BrokenLeases;

#[async_trait]
impl LeaseMutex for BrokenLeases {
    async fn try_acquire(&self, _key: &str, _holder_id: &str) -> Result<bool, WorkspaceError> {
        Err(WorkspaceError::Io(std::io::Error::other("disk gone")))
    }

    async fn inspect(&self, _key: &str) -> Result<Option<Lease>, WorkspaceError> {
        Ok(None)
    }

    async fn release(&self, _key: &str) -> Result<(), WorkspaceError> {
        Ok(())
    }

    async fn reclaim_if(&self, _key: &str, _observed: &Lease) -> Result<bool, WorkspaceError> {
        Ok(false)
    }
}

#[tokio::test]
async fn lock_backend_error_is_a_counted_failure() {
    let h = harness().await;
    let workspaces = Arc::new(WorkspaceManager::new(
        h.dir.path().join("workspaces"),
        Arc::new(BrokenLeases),
        StalenessPolicy::default(),
        Duration::from_millis(10),
    ));
    let agent = Arc::new(ScriptedFixAgent::changes("fix", &["a.txt"]));
    let pipeline = HealingPipeline::new(workspaces, h.throttle.clone(), h.history.clone(), options())
        .with_fix_agent(agent.clone());

    let job = job("x/y");
    let signature = job.signature().to_string();
    let report = pipeline.run_job(job).await.unwrap();

    assert_eq!(report.status(), JobStatus::Failed);
    assert_eq!(kinds(&report), vec!["job-started", "job-failed"]);
    let error = report.job.result.as_ref().unwrap().error.clone().unwrap();
    assert!(error.contains("disk gone"), "{error}");
    assert!(agent.requests().is_empty());
    assert_eq!(h.workspace_count(), 0);

    // Counted like any other started job, so a ledger rebuilt from history agrees.
    assert_eq!(
        h.throttle.entry(&signature).await.unwrap().recent_attempts.len(),
        1
    );
    let records = h.history.snapshot();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, OutcomeStatus::Failed);
}
