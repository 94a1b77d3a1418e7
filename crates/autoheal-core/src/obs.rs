//! Structured lifecycle events for healing runs.
//!
//! - `job_span` tags everything inside a job with `job_id` and `repo_key`
//! - `emit_*` helpers with a stable `event` field for log pipelines

use tracing::{info, warn};

use crate::domain::SkipReason;

/// Span for one healing job, attached with `Instrument::instrument`.
pub fn job_span(job_id: &str, repo_key: &str) -> tracing::Span {
    tracing::info_span!("autoheal.job", job_id = %job_id, repo_key = %repo_key)
}

pub fn emit_run_started(reports: usize, batches: usize) {
    info!(event = "run.started", reports, batches);
}

pub fn emit_batch_started(batch: usize, jobs: usize) {
    info!(event = "batch.started", batch, jobs);
}

pub fn emit_job_started(job_id: &str, repo_key: &str, signature: &str) {
    info!(event = "job.started", job_id = %job_id, repo_key = %repo_key, signature = %signature);
}

/// Skips are expected outcomes and log at `info`.
pub fn emit_job_skipped(repo_key: &str, signature: &str, reason: SkipReason) {
    info!(
        event = "job.skipped",
        repo_key = %repo_key,
        signature = %signature,
        reason = reason.as_str(),
    );
}

pub fn emit_job_finished(job_id: &str, success: bool, duration_ms: u64, error: Option<&str>) {
    if success {
        info!(event = "job.succeeded", job_id = %job_id, duration_ms);
    } else {
        warn!(
            event = "job.failed",
            job_id = %job_id,
            duration_ms,
            error = error.unwrap_or("unknown"),
        );
    }
}

pub fn emit_run_finished(total: usize, healed: usize, failed: usize, skipped: usize) {
    info!(event = "run.finished", total, healed, failed, skipped);
}

/// Notification delivery failure (never fails the job).
pub fn emit_notify_error(event_kind: &str, error: &dyn std::fmt::Display) {
    warn!(event = "notify.error", kind = %event_kind, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_inside_job_span() {
        let _entered = job_span("job-test", "x/y").entered();
        emit_job_started("job-test", "x/y", "abc");
        emit_job_finished("job-test", false, 10, Some("no changes generated"));
    }
}
