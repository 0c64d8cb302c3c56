use crate::cache::TieredCache;
use crate::config::RateLimits;
use crate::errors::AppError;

/// Route classes with independent admission budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitClass {
    Api,
    Web,
    Upload,
    Download,
    Critical,
}

impl RateLimitClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitClass::Api => "api",
            RateLimitClass::Web => "web",
            RateLimitClass::Upload => "upload",
            RateLimitClass::Download => "download",
            RateLimitClass::Critical => "critical",
        }
    }
}

/// Fixed-window limiter over the cache layer's counters.
///
/// Each `(class, identity)` pair gets a counter keyed
/// `rate:{class}:{identity}` whose TTL equals the class window. The first
/// admission starts the window; once it expires the counter starts over.
/// Backed by Redis when configured, otherwise by in-process counters.
#[derive(Clone)]
pub struct RateLimiter {
    cache: TieredCache,
    limits: RateLimits,
}

impl RateLimiter {
    pub fn new(cache: TieredCache, limits: RateLimits) -> Self {
        Self { cache, limits }
    }

    /// Admit or reject one request. Cache failures reject the request.
    pub async fn check(&self, class: RateLimitClass, identity: &str) -> Result<(), AppError> {
        let rule = self.limits.rule(class);
        if rule.count == 0 {
            return Ok(());
        }

        let key = format!("rate:{}:{}", class.as_str(), identity);
        let count = self
            .cache
            .increment(&key, rule.window_secs)
            .await
            .map_err(AppError::Internal)?;

        if count > rule.count {
            let retry_after_secs = self
                .cache
                .counter_ttl(&key)
                .await
                .unwrap_or(rule.window_secs);
            tracing::warn!(
                rate_limit = true,
                class = class.as_str(),
                identity,
                limit = rule.count,
                count,
                "rate limit exceeded"
            );
            return Err(AppError::RateLimit {
                class: class.as_str(),
                retry_after_secs,
            });
        }
        Ok(())
    }
}
