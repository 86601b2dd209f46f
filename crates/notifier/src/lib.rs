use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),
    #[error("Webhook responded with status {0}")]
    BadStatus(u16),
}

/// Metadata describing one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_requests: usize,
    pub total_results: usize,
    pub output_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 10_000,
        }
    }
}

pub struct Notifier {
    config: NotificationConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: NotificationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();

        Self { config, client }
    }

    /// POSTs `summary` as JSON. Without a configured URL this does nothing.
    pub async fn send(&self, summary: &RunSummary) -> Result<(), NotifierError> {
        let Some(url) = self.config.webhook_url.as_deref() else {
            debug!("No finish webhook configured");
            return Ok(());
        };

        info!("Sending finish webhook to {}", url);

        let response = self
            .client
            .post(url)
            .json(summary)
            .send()
            .await
            .map_err(|e| NotifierError::SendFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifierError::BadStatus(status.as_u16()));
        }

        debug!("Finish webhook delivered ({})", status);
        Ok(())
    }

    /// Like [`Notifier::send`], but delivery failures are only logged.
    pub async fn notify_run_finished(&self, summary: &RunSummary) {
        if let Err(e) = self.send(summary).await {
            error!("Finish webhook error: {}", e);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(NotificationConfig::default())
    }
}
