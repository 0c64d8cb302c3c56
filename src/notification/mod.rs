//! Low-balance notifications.
//!
//! Delivery always happens on a background task via [`dispatch`]; the
//! request path never awaits a notifier and never sees its errors.

pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, recipient_email: &str, content: &str) -> anyhow::Result<()>;
}

/// Used when no delivery channel is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, recipient_email: &str, content: &str) -> anyhow::Result<()> {
        tracing::info!(subject, recipient = recipient_email, content, "notification (not delivered)");
        Ok(())
    }
}

/// Submit a notification to the background executor and return at once.
pub fn dispatch(notifier: Arc<dyn Notifier>, subject: String, recipient_email: String, content: String) {
    tokio::spawn(async move {
        if let Err(e) = notifier.send(&subject, &recipient_email, &content).await {
            tracing::error!(subject = %subject, recipient = %recipient_email, "notification failed: {}", e);
        }
    });
}
