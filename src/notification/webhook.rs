use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};

use super::Notifier;

/// Payload posted to the notification webhook.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationEvent {
    pub event_type: String,
    /// ISO-8601 timestamp of when the event occurred.
    pub timestamp: String,
    pub recipient: String,
    pub subject: String,
    pub content: String,
}

impl NotificationEvent {
    pub fn new(subject: &str, recipient: &str, content: &str) -> Self {
        Self {
            event_type: "quota_notice".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            content: content.to_string(),
        }
    }
}

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret` as `sha256=<hex>`.
fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Posts notifications to an HTTP endpoint (mail relay, chat bridge, ...).
/// Bodies are signed with HMAC-SHA256 in `x-relay-signature` when a
/// secret is configured. Retries with back-off, always off the request path.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
    backoff_secs: Vec<u64>,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .user_agent("relay-gateway-notify/1.0")
                .build()?,
            url: url.into(),
            secret,
            backoff_secs: vec![0, 1, 5],
        })
    }

    pub fn with_backoff(mut self, backoff_secs: Vec<u64>) -> Self {
        self.backoff_secs = backoff_secs;
        self
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let signature = match &self.secret {
            Some(s) => Some(hmac_sha256_hex(s, &payload)?),
            None => None,
        };

        let mut last_err = anyhow::anyhow!("no delivery attempted");
        for (attempt, &delay) in self.backoff_secs.iter().enumerate() {
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }

            let mut req = self
                .client
                .post(&self.url)
                .header("content-type", "application/json")
                .header("x-relay-delivery-id", &delivery_id);
            if let Some(ref sig) = signature {
                req = req.header("x-relay-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        recipient = %event.recipient,
                        delivery_id = %delivery_id,
                        attempt,
                        "notification delivered"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    let status = resp.status();
                    warn!(delivery_id = %delivery_id, attempt, status = %status, "notification rejected");
                    last_err = anyhow::anyhow!("webhook returned {}", status);
                }
                Err(e) => {
                    warn!(delivery_id = %delivery_id, attempt, "notification transport error: {}", e);
                    last_err = e.into();
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, subject: &str, recipient_email: &str, content: &str) -> Result<()> {
        self.deliver(&NotificationEvent::new(subject, recipient_email, content))
            .await
    }
}
