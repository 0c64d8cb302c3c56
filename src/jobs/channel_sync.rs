//! Background job: reload the channel index from the store.
//!
//! Runs every `sync_frequency_secs`. Also sweeps expired entries out of the
//! local cache tier, which otherwise only evicts on read.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::TieredCache;
use crate::models::channel_cache::ChannelCache;
use crate::store::RelayStore;

/// Load every channel into the index once. Used at startup and by the job.
pub async fn sync_once(store: &dyn RelayStore, channels: &ChannelCache) -> anyhow::Result<usize> {
    let all = store.list_channels().await?;
    let count = all.len();
    channels.reload(all).await;
    Ok(count)
}

/// Spawn the periodic sync task. Call this once at startup.
pub fn spawn(
    store: Arc<dyn RelayStore>,
    channels: ChannelCache,
    cache: TieredCache,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        // First tick fires immediately; startup already loaded the index.
        interval.tick().await;
        loop {
            interval.tick().await;
            match sync_once(store.as_ref(), &channels).await {
                Ok(count) => tracing::debug!(count, "channel index synced"),
                Err(e) => tracing::error!("channel sync failed: {}", e),
            }
            let evicted = cache.evict_expired();
            if evicted > 0 {
                tracing::debug!(evicted, "evicted expired cache entries");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{Channel, ChannelConfig, ChannelStatus, ProviderKind};
    use crate::store::memory::MemoryStore;
    use crate::store::AdminStore;

    #[tokio::test]
    async fn test_sync_picks_up_new_channels() {
        let store = MemoryStore::new();
        let channels = ChannelCache::new();
        assert_eq!(sync_once(&store, &channels).await.unwrap(), 0);
        assert!(channels.is_populated().await);
        assert_eq!(channels.candidates("gpt-4o").await.unwrap().len(), 0);

        store
            .insert_channels(&[Channel {
                id: 0,
                name: "a".into(),
                provider: ProviderKind::OpenAi,
                key: "k".into(),
                base_url: String::new(),
                models: vec!["gpt-4o".into()],
                model_mapping: Default::default(),
                priority: 0,
                weight: 1,
                status: ChannelStatus::Enabled,
                config: ChannelConfig::default(),
            }])
            .await
            .unwrap();

        sync_once(&store, &channels).await.unwrap();
        assert_eq!(channels.candidates("gpt-4o").await.unwrap().len(), 1);
        assert_eq!(channels.enabled_models().await, vec!["gpt-4o".to_string()]);
    }
}
