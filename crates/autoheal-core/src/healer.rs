//! Run orchestration: dedup, throttle, batch, heal, summarise.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, warn};

use autoheal_state::{
    FsThrottleLedger, HealingResult, HistoryStore, JsonlHistoryStore, OutcomeStatus,
};

use crate::collaborators::{CommandFixAgent, GitCliHost, LogNotifier, WebhookNotifier};
use crate::config::HealerConfig;
use crate::dedup::group_by_repository;
use crate::domain::{ErrorReport, HealingJob, Result, SkipReason};
use crate::events::{EventDispatcher, HealingEvent};
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::{HealingPipeline, PipelineOptions};
use crate::scheduler::create_batches;
use crate::throttle::{SafetyThrottle, ThrottlePolicy};
use crate::workspace::WorkspaceManager;

/// Per-report line of a [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub repo_key: String,
    pub signature: String,
    pub job_id: Option<String>,
    pub status: OutcomeStatus,
    pub reason: Option<String>,
    pub result: Option<HealingResult>,
}

impl JobOutcome {
    fn from_job(job: &HealingJob) -> Self {
        let record = job.to_record();
        Self {
            repo_key: record.repo_key,
            signature: record.signature,
            job_id: Some(record.job_id),
            status: record.status,
            reason: record.reason,
            result: record.result,
        }
    }

    fn throttled(report: &ErrorReport, reason: SkipReason) -> Self {
        Self {
            repo_key: report.key().unwrap_or_default().to_string(),
            signature: report.signature.clone(),
            job_id: None,
            status: OutcomeStatus::Skipped,
            reason: Some(reason.to_string()),
            result: None,
        }
    }
}

/// Aggregate result of [`Healer::run`]. `total` counts deduplicated reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub healed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub outcomes: Vec<JobOutcome>,
}

impl RunSummary {
    fn push(&mut self, outcome: JobOutcome) {
        match outcome.status {
            OutcomeStatus::Succeeded => self.healed += 1,
            OutcomeStatus::Failed => self.failed += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
        }
        self.outcomes.push(outcome);
    }
}

/// What a run would do, without doing it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunPlan {
    pub total: usize,
    pub skipped: Vec<JobOutcome>,
    pub batches: Vec<Vec<String>>,
}

pub struct Healer {
    pipeline: HealingPipeline,
    dispatcher: EventDispatcher,
    concurrency: usize,
    workspace_max_age: Duration,
}

impl Healer {
    pub fn new(
        pipeline: HealingPipeline,
        dispatcher: EventDispatcher,
        concurrency: usize,
        workspace_max_age: Duration,
    ) -> Self {
        Self {
            pipeline,
            dispatcher,
            concurrency: concurrency.max(1),
            workspace_max_age,
        }
    }

    /// Wire the filesystem stores, throttle, and configured collaborators.
    pub async fn from_config(config: &HealerConfig) -> Result<Self> {
        config.validate()?;

        let history: Arc<dyn HistoryStore> =
            Arc::new(JsonlHistoryStore::open(config.history_path()).await?);
        let ledger = Arc::new(FsThrottleLedger::new(config.throttle_path()));
        let throttle = SafetyThrottle::load(
            ThrottlePolicy::from_config(config),
            ledger,
            Some(history.as_ref()),
        )
        .await?;

        let mut pipeline = HealingPipeline::new(
            Arc::new(WorkspaceManager::from_config(config)),
            Arc::new(throttle),
            history,
            PipelineOptions::from_config(config),
        );
        if let Some(agent) = &config.fix_agent {
            pipeline = pipeline.with_fix_agent(Arc::new(CommandFixAgent::from_config(agent)));
        }
        if let Some(host) = &config.repo_host {
            pipeline = pipeline.with_repo_host(Arc::new(GitCliHost::new(
                host,
                Duration::from_millis(config.ci_poll_interval_ms),
            )));
        }

        let mut dispatcher = EventDispatcher::new().with_notifier(Arc::new(LogNotifier));
        if let Some(url) = &config.webhook_url {
            dispatcher = dispatcher.with_notifier(Arc::new(WebhookNotifier::new(url.clone())?));
        }

        Ok(Self::new(
            pipeline,
            dispatcher,
            config.concurrency,
            config.workspace_max_age(),
        ))
    }

    pub fn pipeline(&self) -> &HealingPipeline {
        &self.pipeline
    }

    /// Dedup and throttle verdicts plus the batch layout, with no side effects.
    pub async fn plan(&self, reports: Vec<ErrorReport>) -> RunPlan {
        let (runnable, skipped) = self.filter(group_by_repository(reports)).await;
        RunPlan {
            total: runnable.len() + skipped.len(),
            skipped: skipped
                .iter()
                .map(|(r, reason)| JobOutcome::throttled(r, *reason))
                .collect(),
            batches: create_batches(runnable, self.concurrency)
                .iter()
                .map(|b| b.iter().filter_map(|r| r.key().map(str::to_string)).collect())
                .collect(),
        }
    }

    /// Heal a set of reports.
    ///
    /// Batches run one after another; jobs inside a batch run concurrently
    /// and every job's outcome is collected, so one failure never stops the
    /// others or the run.
    pub async fn run(&self, reports: Vec<ErrorReport>) -> RunSummary {
        match self
            .pipeline
            .workspaces()
            .cleanup_stale(self.workspace_max_age)
            .await
        {
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale workspace sweep failed"),
        }

        let mut summary = RunSummary::default();
        let (runnable, skipped) = self.filter(group_by_repository(reports)).await;
        summary.total = runnable.len() + skipped.len();

        let mut skip_events = Vec::with_capacity(skipped.len());
        for (report, reason) in &skipped {
            METRICS.inc_jobs_skipped();
            let repo_key = report.key().unwrap_or_default();
            obs::emit_job_skipped(repo_key, &report.signature, *reason);
            skip_events.push(HealingEvent::JobSkipped {
                repo_key: repo_key.to_string(),
                signature: report.signature.clone(),
                reason: reason.to_string(),
                at: Utc::now(),
            });
            summary.push(JobOutcome::throttled(report, *reason));
        }
        self.dispatcher.dispatch(&skip_events).await;

        let batches = create_batches(runnable, self.concurrency);
        obs::emit_run_started(summary.total, batches.len());

        for (index, batch) in batches.into_iter().enumerate() {
            obs::emit_batch_started(index, batch.len());
            let jobs: Vec<HealingJob> = batch
                .into_iter()
                .filter_map(|report| HealingJob::new(report).ok())
                .collect();
            let keys: Vec<(String, String)> = jobs
                .iter()
                .map(|j| (j.repo_key().to_string(), j.signature().to_string()))
                .collect();

            let reports = join_all(jobs.into_iter().map(|job| self.pipeline.run_job(job))).await;

            let mut events = Vec::new();
            for (report, (repo_key, signature)) in reports.into_iter().zip(keys) {
                match report {
                    Ok(report) => {
                        summary.push(JobOutcome::from_job(&report.job));
                        events.extend(report.events);
                    }
                    Err(e) => {
                        error!(repo_key = %repo_key, error = %e, "job aborted");
                        summary.push(JobOutcome {
                            repo_key,
                            signature,
                            job_id: None,
                            status: OutcomeStatus::Failed,
                            reason: Some(e.to_string()),
                            result: None,
                        });
                    }
                }
            }
            self.dispatcher.dispatch(&events).await;
        }

        obs::emit_run_finished(summary.total, summary.healed, summary.failed, summary.skipped);
        METRICS.flush();
        summary
    }

    /// Split deduplicated reports into runnable ones and throttle skips.
    /// Runnable reports are checked again when their job starts.
    async fn filter(
        &self,
        reports: Vec<ErrorReport>,
    ) -> (Vec<ErrorReport>, Vec<(ErrorReport, SkipReason)>) {
        let mut runnable = Vec::new();
        let mut skipped = Vec::new();
        for report in reports {
            let decision = self.pipeline.throttle().should_skip(&report).await;
            match decision.reason {
                Some(reason) if decision.skip => skipped.push((report, reason)),
                _ => runnable.push(report),
            }
        }
        (runnable, skipped)
    }
}
