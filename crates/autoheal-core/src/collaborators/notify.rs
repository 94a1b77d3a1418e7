//! Notifiers: structured log lines and JSON webhooks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use super::{CollaboratorResult, Notifier};
use crate::events::HealingEvent;

/// Writes every event as an `info!` line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &HealingEvent) -> CollaboratorResult<()> {
        info!(
            event = "notify",
            kind = event.kind(),
            repo_key = %event.repo_key(),
            summary = %event.summary(),
        );
        Ok(())
    }
}

/// POSTs `{"text": <summary>, "event": <event>}` to a URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> CollaboratorResult<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn payload(event: &HealingEvent) -> serde_json::Value {
        json!({
            "text": event.summary(),
            "event": event,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &HealingEvent) -> CollaboratorResult<()> {
        self.client
            .post(&self.url)
            .json(&Self::payload(event))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
