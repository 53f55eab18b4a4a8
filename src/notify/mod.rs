use async_trait::async_trait;
use std::time::Duration;

use crate::error::{HelmError, HelmResult};

/// Outbound channel for human alerts (help requests, cap breaches,
/// viewer failures).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> HelmResult<()>;
}

/// Default sink: alerts land in the log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, subject: &str, body: &str) -> HelmResult<()> {
        tracing::warn!(subject, body, "operator attention requested");
        Ok(())
    }
}

/// Chat-bot push over a webhook URL taking `{"text": "..."}` payloads.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, subject: &str, body: &str) -> HelmResult<()> {
        let payload = serde_json::json!({
            "text": format!("*{}*\n{}", subject, body),
        });
        let response = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(10))
            .json(&payload)
            .send()
            .await
            .map_err(|e| HelmError::BackendUnavailable(format!("notification webhook: {}", e)))?;

        if !response.status().is_success() {
            return Err(HelmError::BackendUnavailable(format!(
                "notification webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}
