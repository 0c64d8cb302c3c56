use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Entry stored in the local DashMap with an expiry timestamp.
#[derive(Clone)]
pub(crate) struct CacheEntry {
    value: String,
    pub(crate) expires_at: Instant,
}

/// In-process window counter used when Redis is not configured.
#[derive(Clone, Copy)]
struct Counter {
    count: u64,
    expires_at: Instant,
}

/// Two-tier cache: in-memory DashMap (tier 1) optionally backed by Redis
/// (tier 2). The store is the source of truth and is handled by callers.
///
/// Without Redis every operation, including `increment`, is served by the
/// local tier with the same TTL semantics, so callers never branch on it.
#[derive(Clone)]
pub struct TieredCache {
    pub(crate) local: Arc<DashMap<String, CacheEntry>>,
    counters: Arc<DashMap<String, Counter>>,
    redis: Option<ConnectionManager>,
}

impl TieredCache {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        Self {
            local: Arc::new(DashMap::new()),
            counters: Arc::new(DashMap::new()),
            redis,
        }
    }

    /// Local-only cache.
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn is_distributed(&self) -> bool {
        self.redis.is_some()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        // tier 1: in-memory (with TTL check)
        if let Some(entry) = self.local.get(key) {
            if Instant::now() < entry.expires_at {
                return serde_json::from_str(&entry.value).ok();
            }
            drop(entry);
            self.local.remove(key);
        }

        // tier 2: redis
        let mut conn = self.redis.clone()?;
        if let Ok(Some(v)) = conn.get::<_, Option<String>>(key).await {
            let ttl_secs: i64 = conn.ttl(key).await.unwrap_or(60);
            let ttl = if ttl_secs > 0 {
                Duration::from_secs(ttl_secs as u64)
            } else {
                Duration::from_secs(60)
            };
            self.local.insert(
                key.to_string(),
                CacheEntry {
                    value: v.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
            return serde_json::from_str(&v).ok();
        }

        None
    }

    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(value)?;
        self.local.insert(
            key.to_string(),
            CacheEntry {
                value: json.clone(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );

        if let Some(mut conn) = self.redis.clone() {
            conn.set_ex::<_, _, ()>(key, json, ttl_secs).await?;
        }
        Ok(())
    }

    /// Drop a key from both tiers.
    pub async fn invalidate(&self, key: &str) -> anyhow::Result<()> {
        self.local.remove(key);
        if let Some(mut conn) = self.redis.clone() {
            conn.del::<_, ()>(key).await?;
        }
        Ok(())
    }

    /// Remove all locally-expired entries and counters. Call this
    /// periodically from a background task to bound memory usage.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.local.len() + self.counters.len();
        self.local.retain(|_, entry| entry.expires_at > now);
        self.counters.retain(|_, c| c.expires_at > now);
        before - (self.local.len() + self.counters.len())
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// Increment a fixed-window counter, starting the window on first use.
    /// Returns the count including this call.
    pub async fn increment(&self, key: &str, window_secs: u64) -> anyhow::Result<u64> {
        if let Some(mut conn) = self.redis.clone() {
            // Atomic INCR + EXPIRE
            let script = redis::Script::new(
                r#"
                local current = redis.call("INCR", KEYS[1])
                if current == 1 then
                    redis.call("EXPIRE", KEYS[1], ARGV[1])
                end
                return current
            "#,
            );
            let count: u64 = script
                .key(key)
                .arg(window_secs)
                .invoke_async(&mut conn)
                .await?;
            return Ok(count);
        }

        let now = Instant::now();
        let mut entry = self.counters.entry(key.to_string()).or_insert(Counter {
            count: 0,
            expires_at: now + Duration::from_secs(window_secs),
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + Duration::from_secs(window_secs);
        }
        entry.count += 1;
        Ok(entry.count)
    }

    /// Seconds until the counter at `key` resets, if it exists.
    pub async fn counter_ttl(&self, key: &str) -> Option<u64> {
        if let Some(mut conn) = self.redis.clone() {
            let ttl: i64 = conn.ttl(key).await.ok()?;
            return (ttl > 0).then_some(ttl as u64);
        }
        let c = self.counters.get(key)?;
        let remaining = c.expires_at.saturating_duration_since(Instant::now());
        Some(remaining.as_secs().max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_local_entries_expire() {
        let cache = TieredCache::in_memory();
        cache.set("k", &42u32, 10).await.unwrap();
        assert_eq!(cache.get::<u32>("k").await, Some(42));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get::<u32>("k").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_counter_resets_after_window() {
        let cache = TieredCache::in_memory();
        assert_eq!(cache.increment("c", 5).await.unwrap(), 1);
        assert_eq!(cache.increment("c", 5).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.increment("c", 5).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired_drops_stale_counters() {
        let cache = TieredCache::in_memory();
        cache.increment("a", 1).await.unwrap();
        cache.set("b", &"x", 100).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.local_len(), 1);
    }
}
