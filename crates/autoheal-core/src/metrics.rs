//! Process-wide counters for healing runs.
//!
//! Incremented at the call site; [`Metrics::flush`] emits the current
//! values as one `tracing::info!` event at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    jobs_started: AtomicU64,
    jobs_healed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_skipped: AtomicU64,
    locks_reclaimed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_healed: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub locks_reclaimed: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            jobs_started: AtomicU64::new(0),
            jobs_healed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_skipped: AtomicU64::new(0),
            locks_reclaimed: AtomicU64::new(0),
        }
    }

    pub fn inc_jobs_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_started", "counter incremented");
    }

    pub fn inc_jobs_healed(&self) {
        self.jobs_healed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_healed", "counter incremented");
    }

    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_failed", "counter incremented");
    }

    pub fn inc_jobs_skipped(&self) {
        self.jobs_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "jobs_skipped", "counter incremented");
    }

    pub fn inc_locks_reclaimed(&self) {
        self.locks_reclaimed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "locks_reclaimed", "counter incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_healed: self.jobs_healed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            locks_reclaimed: self.locks_reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Emit all counters as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            jobs_started = s.jobs_started,
            jobs_healed = s.jobs_healed,
            jobs_failed = s.jobs_failed,
            jobs_skipped = s.jobs_skipped,
            locks_reclaimed = s.locks_reclaimed,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.jobs_started.store(0, Ordering::Relaxed);
        self.jobs_healed.store(0, Ordering::Relaxed);
        self.jobs_failed.store(0, Ordering::Relaxed);
        self.jobs_skipped.store(0, Ordering::Relaxed);
        self.locks_reclaimed.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_jobs_started();
        m.inc_jobs_started();
        m.inc_jobs_healed();
        m.inc_jobs_failed();
        m.inc_locks_reclaimed();
        let s = m.snapshot();
        assert_eq!(s.jobs_started, 2);
        assert_eq!(s.jobs_healed, 1);
        assert_eq!(s.jobs_failed, 1);
        assert_eq!(s.jobs_skipped, 0);
        assert_eq!(s.locks_reclaimed, 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_jobs_started();
        m.inc_jobs_skipped();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
