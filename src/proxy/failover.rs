//! Sequential failover across channels.
//!
//! Attempts run one after another, never in parallel: a struggling tier
//! should not see its load multiplied. Each failed channel is excluded from
//! later picks within the same request.

use std::future::Future;
use std::sync::Arc;

use crate::errors::{AppError, ChannelError};
use crate::models::channel::Channel;
use crate::proxy::selector::ChannelSelector;

/// A successful attempt and how many channels failed before it.
#[derive(Debug)]
pub struct FailoverOutcome<T> {
    pub value: T,
    pub channel: Channel,
    pub failed_attempts: u32,
}

pub struct FailoverController {
    selector: Arc<ChannelSelector>,
    retry_times: u32,
}

impl FailoverController {
    pub fn new(selector: Arc<ChannelSelector>, retry_times: u32) -> Self {
        Self {
            selector,
            retry_times,
        }
    }

    pub fn selector(&self) -> &Arc<ChannelSelector> {
        &self.selector
    }

    /// Run `attempt` against up to `retry_times + 1` channels.
    ///
    /// Retryable channel errors move on to the next channel. Anything else
    /// (protocol errors, non-retryable statuses) is returned immediately.
    /// When every channel fails, the last error is returned with the number
    /// of channels tried.
    pub async fn execute<T, F, Fut>(&self, model: &str, mut attempt: F) -> Result<FailoverOutcome<T>, AppError>
    where
        F: FnMut(Channel) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.retry_times as usize + 1;
        let mut tried: Vec<i64> = Vec::with_capacity(max_attempts);
        let mut last_error: Option<ChannelError> = None;

        while tried.len() < max_attempts {
            let Some(channel) = self.selector.select(model, &tried).await? else {
                break;
            };
            tried.push(channel.id);

            match attempt(channel.clone()).await {
                Ok(value) => {
                    self.selector.report_success(&channel).await;
                    return Ok(FailoverOutcome {
                        value,
                        channel,
                        failed_attempts: (tried.len() - 1) as u32,
                    });
                }
                Err(AppError::Channel(err)) => {
                    self.selector.report_failure(&channel, &err).await;
                    let err = err.with_channel(channel.id).with_attempts(tried.len() as u32);
                    if !err.is_retryable() {
                        return Err(err.into());
                    }
                    tracing::warn!(
                        model,
                        channel_id = channel.id,
                        attempt = tried.len(),
                        max_attempts,
                        "channel failed: {}",
                        err.message
                    );
                    last_error = Some(err);
                }
                Err(other) => return Err(other),
            }
        }

        match last_error {
            Some(err) => Err(err.with_attempts(tried.len() as u32).into()),
            None => Err(AppError::NoChannel(model.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelHealthConfig;
    use crate::errors::ChannelErrorKind;
    use crate::models::channel::{ChannelConfig, ChannelStatus, ProviderKind};
    use crate::models::channel_cache::ChannelCache;
    use crate::proxy::selector::PriorityWeighted;
    use crate::store::memory::MemoryStore;
    use std::sync::Mutex;

    fn channel(id: i64, priority: i64) -> Channel {
        Channel {
            id,
            name: format!("ch-{}", id),
            provider: ProviderKind::OpenAi,
            key: "sk-x".into(),
            base_url: String::new(),
            models: vec!["gpt-4o".into()],
            model_mapping: Default::default(),
            priority,
            weight: 1,
            status: ChannelStatus::Enabled,
            config: ChannelConfig::default(),
        }
    }

    async fn controller(channels: Vec<Channel>, retry_times: u32) -> FailoverController {
        let cache = ChannelCache::new();
        cache.reload(channels).await;
        let selector = ChannelSelector::new(cache, Arc::new(MemoryStore::new()), ChannelHealthConfig::default())
            .with_policy(PriorityWeighted::seeded(1));
        FailoverController::new(Arc::new(selector), retry_times)
    }

    #[tokio::test]
    async fn test_retryable_errors_fail_over_in_priority_order() {
        let ctl = controller(vec![channel(1, 3), channel(2, 2), channel(3, 1)], 2).await;
        let seen = Mutex::new(Vec::new());
        let outcome = ctl
            .execute("gpt-4o", |ch| {
                seen.lock().unwrap().push(ch.id);
                async move {
                    if ch.id == 3 {
                        Ok("ok")
                    } else {
                        Err(ChannelError::status(503, "down").into())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(outcome.channel.id, 3);
        assert_eq!(outcome.failed_attempts, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error_with_attempts() {
        let ctl = controller(vec![channel(1, 3), channel(2, 2), channel(3, 1)], 1).await;
        let err = ctl
            .execute("gpt-4o", |ch| async move {
                Err::<(), _>(ChannelError::new(ChannelErrorKind::Timeout, format!("slow {}", ch.id)).into())
            })
            .await
            .unwrap_err();
        match err {
            AppError::Channel(e) => {
                assert_eq!(e.attempts, 2);
                assert_eq!(e.channel_id, Some(2));
                assert_eq!(e.message, "slow 2");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_protocol_and_non_retryable_errors_surface_immediately() {
        let ctl = controller(vec![channel(1, 3), channel(2, 2)], 3).await;
        let calls = Mutex::new(0);
        let err = ctl
            .execute("gpt-4o", |_| {
                *calls.lock().unwrap() += 1;
                async { Err::<(), _>(AppError::Protocol("bad mapping".into())) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Protocol(_)));
        assert_eq!(*calls.lock().unwrap(), 1);

        let err = ctl
            .execute("gpt-4o", |_| async {
                Err::<(), _>(ChannelError::status(400, r#"{"error":{"message":"bad"}}"#).into())
            })
            .await
            .unwrap_err();
        match err {
            AppError::Channel(e) => {
                assert_eq!(e.kind, ChannelErrorKind::Status(400));
                assert_eq!(e.attempts, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_channel_for_model() {
        let ctl = controller(vec![channel(1, 1)], 2).await;
        let err = ctl
            .execute("claude-3-opus-20240229", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NoChannel(_)));
    }
}
