use crate::config::types::{NotificationConfig, NotificationMode};
use crate::storage::LoadStatements;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Notification target returned error status {status}: {message}")]
    TargetError { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, NotifyError>;

/// Channel for batch completion and operational alarms.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, target: &str, subject: &str, payload: &serde_json::Value)
        -> Result<()>;
}

/// Payload published when a batch closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchNotification {
    pub batch_id: String,
    pub prefix: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub load_statements: BTreeMap<String, LoadStatements>,
}

/// Webhook body: `{"subject": .., "message": ..}`.
#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    subject: &'a str,
    message: &'a serde_json::Value,
}

/// POSTs notifications to the target URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn publish(
        &self,
        target: &str,
        subject: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let body = WebhookBody {
            subject,
            message: payload,
        };
        let response = self.client.post(target).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(NotifyError::TargetError {
                status: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn publish(
        &self,
        target: &str,
        subject: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        info!(target_ref = %target, subject = %subject, payload = %payload, "Notification");
        Ok(())
    }
}

/// Build the notifier selected by the service configuration.
pub fn from_config(config: &NotificationConfig) -> Result<Arc<dyn Notifier>> {
    Ok(match config.mode {
        NotificationMode::Log => Arc::new(LogNotifier),
        NotificationMode::Webhook => Arc::new(WebhookNotifier::new(config)?),
    })
}

/// Publish to `target` if one is configured. Failures are logged and
/// swallowed.
pub async fn publish_best_effort(
    notifier: &dyn Notifier,
    target: Option<&str>,
    subject: &str,
    payload: &serde_json::Value,
) {
    let Some(target) = target else {
        info!(subject = %subject, "No notification target configured");
        return;
    };
    if let Err(e) = notifier.publish(target, subject, payload).await {
        warn!(target_ref = %target, subject = %subject, error = %e, "Failed to publish notification");
    }
}
