//! Safety throttle: per-signature cooldown, rolling attempt ceiling, blocklist.
//!
//! The ledger is owned state: loaded once, mutated only through
//! [`SafetyThrottle::try_begin`] and [`SafetyThrottle::record_attempt`], and
//! flushed to the durable [`ThrottleLedger`] on every mutation while the
//! writer lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use autoheal_state::{HistoryQuery, HistoryStore, ThrottleEntry, ThrottleLedger};

use crate::config::HealerConfig;
use crate::domain::{ErrorReport, Result, SkipReason};

/// Limits applied by the throttle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottlePolicy {
    pub cooldown: Duration,
    pub max_attempts: u32,
    pub window: Duration,
    pub blocklist: HashSet<String>,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self::from_config(&HealerConfig::default())
    }
}

impl ThrottlePolicy {
    pub fn from_config(config: &HealerConfig) -> Self {
        Self {
            cooldown: Duration::milliseconds(config.cooldown_ms as i64),
            max_attempts: config.max_attempts_per_error,
            window: Duration::milliseconds(config.attempt_window_ms as i64),
            blocklist: config.blocklist.iter().map(|r| r.trim().to_string()).collect(),
        }
    }
}

/// `(skip, reason)` verdict for one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleDecision {
    pub skip: bool,
    pub reason: Option<SkipReason>,
}

impl ThrottleDecision {
    fn allow() -> Self {
        Self {
            skip: false,
            reason: None,
        }
    }

    fn deny(reason: SkipReason) -> Self {
        Self {
            skip: true,
            reason: Some(reason),
        }
    }
}

pub struct SafetyThrottle {
    policy: ThrottlePolicy,
    entries: Mutex<HashMap<String, ThrottleEntry>>,
    ledger: Arc<dyn ThrottleLedger>,
}

impl SafetyThrottle {
    /// Load the ledger. When it is empty and a history store is given, the
    /// ledger is rebuilt from recorded attempts and flushed.
    pub async fn load(
        policy: ThrottlePolicy,
        ledger: Arc<dyn ThrottleLedger>,
        history: Option<&dyn HistoryStore>,
    ) -> Result<Self> {
        let mut entries: HashMap<String, ThrottleEntry> = ledger
            .load()
            .await?
            .into_iter()
            .map(|e| (e.signature.clone(), e))
            .collect();

        if entries.is_empty() {
            if let Some(history) = history {
                let mut attempts: Vec<_> = history
                    .query(&HistoryQuery::default())
                    .await?
                    .into_iter()
                    .filter(|r| r.status.is_attempt())
                    .map(|r| (r.signature, r.started_at))
                    .collect();
                attempts.sort_by_key(|(_, at)| *at);

                for (signature, at) in attempts {
                    entries
                        .entry(signature.clone())
                        .and_modify(|e| e.push_attempt(at, policy.window))
                        .or_insert_with(|| ThrottleEntry::new(signature, at));
                }
                if !entries.is_empty() {
                    info!(
                        signatures = entries.len(),
                        "throttle ledger rebuilt from history"
                    );
                    let snapshot: Vec<_> = entries.values().cloned().collect();
                    ledger.save(&snapshot).await?;
                }
            }
        }

        Ok(Self {
            policy,
            entries: Mutex::new(entries),
            ledger,
        })
    }

    pub fn policy(&self) -> &ThrottlePolicy {
        &self.policy
    }

    pub async fn should_skip(&self, report: &ErrorReport) -> ThrottleDecision {
        self.should_skip_at(report, Utc::now()).await
    }

    /// Pure read: repeated calls without an intervening `record_attempt`
    /// return the same verdict for the same `now`.
    pub async fn should_skip_at(&self, report: &ErrorReport, now: DateTime<Utc>) -> ThrottleDecision {
        if let Some(denied) = self.static_verdict(report) {
            return denied;
        }
        let entries = self.entries.lock().await;
        self.verdict(&entries, report, now)
    }

    pub async fn try_begin(&self, report: &ErrorReport) -> Result<ThrottleDecision> {
        self.try_begin_at(report, Utc::now()).await
    }

    /// Check and record in one step: if the report is allowed, its attempt
    /// is registered before the entries lock is released, so two jobs with
    /// the same signature can never both pass on the same ledger state.
    ///
    /// An `Err` means the attempt was recorded in memory but the ledger
    /// could not be flushed.
    pub async fn try_begin_at(
        &self,
        report: &ErrorReport,
        now: DateTime<Utc>,
    ) -> Result<ThrottleDecision> {
        if let Some(denied) = self.static_verdict(report) {
            return Ok(denied);
        }
        let mut entries = self.entries.lock().await;
        let decision = self.verdict(&entries, report, now);
        if decision.skip {
            debug!(signature = %report.signature, reason = ?decision.reason, "job start throttled");
            return Ok(decision);
        }
        self.push_and_flush(&mut entries, report, now).await?;
        Ok(decision)
    }

    /// Verdicts that do not depend on the ledger.
    fn static_verdict(&self, report: &ErrorReport) -> Option<ThrottleDecision> {
        if let Some(key) = report.key() {
            if self.policy.blocklist.contains(key) {
                return Some(ThrottleDecision::deny(SkipReason::Blocklisted));
            }
        }
        if !report.has_valid_signature() {
            return Some(ThrottleDecision::deny(SkipReason::InvalidSignature));
        }
        None
    }

    fn verdict(
        &self,
        entries: &HashMap<String, ThrottleEntry>,
        report: &ErrorReport,
        now: DateTime<Utc>,
    ) -> ThrottleDecision {
        let Some(entry) = entries.get(&report.signature) else {
            return ThrottleDecision::allow();
        };

        if now.signed_duration_since(entry.last_attempt_at) < self.policy.cooldown {
            return ThrottleDecision::deny(SkipReason::Cooldown);
        }
        let recent = entry.attempt_count_within_window(now, self.policy.window);
        if recent >= self.policy.max_attempts as usize {
            return ThrottleDecision::deny(SkipReason::MaxAttempts);
        }
        ThrottleDecision::allow()
    }

    pub async fn record_attempt(&self, report: &ErrorReport) -> Result<()> {
        self.record_attempt_at(report, Utc::now()).await
    }

    /// Register a job start for the report's signature and flush the ledger.
    pub async fn record_attempt_at(&self, report: &ErrorReport, at: DateTime<Utc>) -> Result<()> {
        if !report.has_valid_signature() {
            debug!("ignoring attempt for malformed signature");
            return Ok(());
        }

        let mut entries = self.entries.lock().await;
        self.push_and_flush(&mut entries, report, at).await
    }

    async fn push_and_flush(
        &self,
        entries: &mut HashMap<String, ThrottleEntry>,
        report: &ErrorReport,
        at: DateTime<Utc>,
    ) -> Result<()> {
        entries
            .entry(report.signature.clone())
            .and_modify(|e| e.push_attempt(at, self.policy.window))
            .or_insert_with(|| ThrottleEntry::new(report.signature.clone(), at));

        let snapshot: Vec<_> = entries.values().cloned().collect();
        self.ledger.save(&snapshot).await?;
        debug!(signature = %report.signature, "throttle attempt recorded");
        Ok(())
    }

    pub async fn entry(&self, signature: &str) -> Option<ThrottleEntry> {
        self.entries.lock().await.get(signature).cloned()
    }
}
