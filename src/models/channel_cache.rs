//! In-memory channel index keyed by model name.
//!
//! Loaded at startup and refreshed by the `channel_sync` job. The selector
//! reads from here so that a warm cache never costs a store round trip.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::models::channel::{Channel, ChannelStatus};

#[derive(Default)]
struct Index {
    loaded: bool,
    by_model: HashMap<String, Vec<Channel>>,
}

/// Shared, cheaply-cloneable channel cache.
#[derive(Clone, Default)]
pub struct ChannelCache(Arc<RwLock<Index>>);

impl ChannelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entire index with a fresh set of channels.
    pub async fn reload(&self, channels: Vec<Channel>) {
        let mut by_model: HashMap<String, Vec<Channel>> = HashMap::new();
        for channel in channels {
            for model in &channel.models {
                by_model.entry(model.clone()).or_default().push(channel.clone());
            }
        }
        let mut guard = self.0.write().await;
        guard.by_model = by_model;
        guard.loaded = true;
    }

    /// All channels declaring `model`, whatever their status. `None` means
    /// the cache has never been loaded and the caller should ask the store.
    pub async fn candidates(&self, model: &str) -> Option<Vec<Channel>> {
        let guard = self.0.read().await;
        if !guard.loaded {
            return None;
        }
        Some(guard.by_model.get(model).cloned().unwrap_or_default())
    }

    /// Reflect a status change without waiting for the next sync.
    pub async fn set_status(&self, channel_id: i64, status: ChannelStatus) {
        let mut guard = self.0.write().await;
        for channels in guard.by_model.values_mut() {
            for c in channels.iter_mut().filter(|c| c.id == channel_id) {
                c.status = status;
            }
        }
    }

    /// Models served by at least one enabled channel, sorted.
    pub async fn enabled_models(&self) -> Vec<String> {
        let guard = self.0.read().await;
        guard
            .by_model
            .iter()
            .filter(|(_, chans)| chans.iter().any(Channel::is_enabled))
            .map(|(m, _)| m.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub async fn is_populated(&self) -> bool {
        self.0.read().await.loaded
    }
}
