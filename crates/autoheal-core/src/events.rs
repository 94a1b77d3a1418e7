//! Outbound healing events and their dispatch to notifiers.
//!
//! The pipeline never notifies directly; it returns the events it produced
//! and the [`EventDispatcher`] drains them after each batch. Delivery
//! failures are logged and dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::Notifier;
use crate::obs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum HealingEvent {
    #[serde(rename_all = "camelCase")]
    JobStarted {
        job_id: String,
        repo_key: String,
        signature: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobSucceeded {
        job_id: String,
        repo_key: String,
        strategy: String,
        pull_request_url: Option<String>,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobFailed {
        job_id: String,
        repo_key: String,
        error: String,
        issue_url: Option<String>,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    JobSkipped {
        repo_key: String,
        signature: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl HealingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HealingEvent::JobStarted { .. } => "job-started",
            HealingEvent::JobSucceeded { .. } => "job-succeeded",
            HealingEvent::JobFailed { .. } => "job-failed",
            HealingEvent::JobSkipped { .. } => "job-skipped",
        }
    }

    pub fn repo_key(&self) -> &str {
        match self {
            HealingEvent::JobStarted { repo_key, .. }
            | HealingEvent::JobSucceeded { repo_key, .. }
            | HealingEvent::JobFailed { repo_key, .. }
            | HealingEvent::JobSkipped { repo_key, .. } => repo_key,
        }
    }

    /// One-line human summary, used by chat-style notifiers.
    pub fn summary(&self) -> String {
        match self {
            HealingEvent::JobStarted { repo_key, job_id, .. } => {
                format!("healing started for {repo_key} ({job_id})")
            }
            HealingEvent::JobSucceeded {
                repo_key,
                pull_request_url,
                ..
            } => match pull_request_url {
                Some(url) => format!("healed {repo_key}: {url}"),
                None => format!("healed {repo_key}"),
            },
            HealingEvent::JobFailed { repo_key, error, .. } => {
                format!("healing failed for {repo_key}: {error}")
            }
            HealingEvent::JobSkipped { repo_key, reason, .. } => {
                format!("healing skipped for {repo_key}: {reason}")
            }
        }
    }
}

/// Fans events out to every registered notifier.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Deliver `events` in order. Never fails.
    pub async fn dispatch(&self, events: &[HealingEvent]) {
        for event in events {
            for notifier in &self.notifiers {
                if let Err(e) = notifier.notify(event).await {
                    obs::emit_notify_error(event.kind(), &e);
                }
            }
        }
    }
}
