//! Fire-and-forget operator notifications.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

/// Delivery is best effort: implementations report success but never fail the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> bool;
}

pub fn escape_slack_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn slack_payload(text: &str, is_safe: bool) -> JsonValue {
    let text = if is_safe {
        text.to_string()
    } else {
        escape_slack_text(text)
    };
    json!({ "text": text })
}

/// Posts messages to a Slack incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

/// Upper bound on one webhook call.
pub const SLACK_TIMEOUT: Duration = Duration::from_secs(10);

impl SlackNotifier {
    pub fn new(webhook_url: Option<String>) -> Result<Self, reqwest::Error> {
        Self::with_timeout(webhook_url, SLACK_TIMEOUT)
    }

    pub fn with_timeout(webhook_url: Option<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.filter(|url| !url.is_empty()),
        })
    }

    pub async fn send_payload(&self, payload: &JsonValue) -> bool {
        let Some(url) = &self.webhook_url else {
            debug!("SLACK_WEBHOOK_URL is empty; not sending message.");
            return false;
        };
        match self.client.post(url).json(payload).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "slack webhook rejected message");
                false
            }
            Err(err) => {
                warn!(error = %err, "posting to slack webhook failed");
                false
            }
        }
    }

    pub async fn send_message(&self, text: &str, is_safe: bool) -> bool {
        info!(notification = text);
        self.send_payload(&slack_payload(text, is_safe)).await
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, message: &str) -> bool {
        self.send_message(message, false).await
    }
}

/// Keeps every message in memory; used where notifications are asserted on.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    outbox: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &str) -> bool {
        self.outbox
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message.to_string());
        true
    }
}
