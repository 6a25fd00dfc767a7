//! Pre-deployment release notifications
//!
//! Before a release is applied the updater POSTs a JSON payload to the
//! configured webhook. Delivery is retried with doubling backoff; a final
//! failure blocks the release until the next pass.

use crate::controller::settings::{NotificationAuth, NotificationConfig, Subject};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-request timeout for webhook calls
pub const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const NOTIFICATION_ATTEMPTS: u32 = 5;
pub const NOTIFICATION_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("webhook unreachable: {0}")]
    Unreachable(String),

    #[error("webhook returned HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("webhook call timed out after {0:?}")]
    Timeout(Duration),

    #[error("notification failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// JSON body sent to the webhook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookData {
    pub subject: String,
    pub version: String,
    #[serde(default)]
    pub requirements: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changelog_link: Option<String>,
    pub apply_time: String,
    pub message: String,
}

impl WebhookData {
    pub fn new(
        subject: Subject,
        version: &str,
        requirements: &BTreeMap<String, String>,
        changelog_link: Option<&str>,
        apply_time: DateTime<Utc>,
    ) -> Self {
        let apply_time_str = apply_time.to_rfc3339_opts(SecondsFormat::Secs, true);
        Self {
            subject: subject.as_str().to_string(),
            version: version.to_string(),
            requirements: requirements.clone(),
            changelog_link: changelog_link.map(str::to_string),
            message: format!(
                "{} release {} is scheduled to be applied at {}",
                subject.as_str(),
                version,
                apply_time_str
            ),
            apply_time: apply_time_str,
        }
    }
}

/// Trait for delivering release notifications
///
/// Production code uses `HttpNotificationSink` (webhook POST).
/// Tests use `MockNotificationSink` which records payloads in memory.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, data: &WebhookData) -> Result<(), NotificationError>;
}

/// No-op sink used when no webhook is configured
pub struct NoopNotificationSink;

#[async_trait]
impl NotificationSink for NoopNotificationSink {
    async fn notify(&self, data: &WebhookData) -> Result<(), NotificationError> {
        debug!(version = %data.version, "No notification webhook configured, skipping");
        Ok(())
    }
}

pub struct HttpNotificationSink {
    client: reqwest::Client,
    url: String,
    auth: Option<NotificationAuth>,
    attempts: u32,
    initial_backoff: Duration,
}

impl HttpNotificationSink {
    pub fn new(url: String, auth: Option<NotificationAuth>) -> Self {
        let client = match reqwest::Client::builder()
            .timeout(NOTIFICATION_TIMEOUT)
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build notification HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            client,
            url,
            auth,
            attempts: NOTIFICATION_ATTEMPTS,
            initial_backoff: NOTIFICATION_INITIAL_BACKOFF,
        }
    }

    /// Sink for the configured webhook, or `None` when no URL is set
    pub fn from_config(config: &NotificationConfig) -> Option<Self> {
        config
            .webhook_url
            .as_ref()
            .map(|url| Self::new(url.clone(), config.auth.clone()))
    }

    /// Override retry behaviour (attempt count and first backoff)
    pub fn with_retry(mut self, attempts: u32, initial_backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.initial_backoff = initial_backoff;
        self
    }

    async fn send_once(&self, data: &WebhookData) -> Result<(), NotificationError> {
        let mut request = self.client.post(&self.url).json(data);
        if let Some(header) = authorization_header(self.auth.as_ref()) {
            request = request.header(reqwest::header::AUTHORIZATION, header);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                NotificationError::Timeout(NOTIFICATION_TIMEOUT)
            } else {
                NotificationError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for HttpNotificationSink {
    async fn notify(&self, data: &WebhookData) -> Result<(), NotificationError> {
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.send_once(data).await {
                Ok(()) => {
                    debug!(version = %data.version, attempt, "Release notification delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        version = %data.version,
                        attempt,
                        error = %e,
                        "Release notification attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(NotificationError::Exhausted {
            attempts: self.attempts,
            last: last_error,
        })
    }
}

/// `Authorization` header value for the configured auth, if any
pub fn authorization_header(auth: Option<&NotificationAuth>) -> Option<String> {
    match auth? {
        NotificationAuth::Basic { user, password } => Some(format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", user, password))
        )),
        NotificationAuth::Bearer { token } => Some(format!("Bearer {}", token)),
    }
}

/// Mock sink for testing - stores payloads in memory
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockNotificationSink {
    sent: std::sync::Arc<std::sync::Mutex<Vec<WebhookData>>>,
    failing: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<WebhookData> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl NotificationSink for MockNotificationSink {
    async fn notify(&self, data: &WebhookData) -> Result<(), NotificationError> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotificationError::Unreachable("connection refused".into()));
        }
        #[allow(clippy::unwrap_used)]
        self.sent.lock().unwrap().push(data.clone());
        Ok(())
    }
}

#[cfg(test)]
#[path = "notification_test.rs"]
mod tests;
