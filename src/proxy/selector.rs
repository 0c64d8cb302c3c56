//! Channel selection with rolling health tracking.
//!
//! The highest priority tier with an eligible channel wins; ties are broken
//! by weight. Channels that keep failing are auto-disabled and, after a
//! cooldown, given one half-open trial request. A successful trial puts the
//! channel back in rotation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::config::ChannelHealthConfig;
use crate::errors::{AppError, ChannelError};
use crate::models::channel::{Channel, ChannelStatus};
use crate::models::channel_cache::ChannelCache;
use crate::store::RelayStore;

/// Picks one channel from an already-filtered candidate list.
pub trait SelectionPolicy: Send + Sync {
    fn choose<'a>(&self, candidates: &'a [Channel]) -> Option<&'a Channel>;
}

/// Highest priority first, then weighted random among that tier. A tier whose
/// weights are all zero is picked from uniformly.
pub struct PriorityWeighted {
    rng: Mutex<StdRng>,
}

impl PriorityWeighted {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for PriorityWeighted {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for PriorityWeighted {
    fn choose<'a>(&self, candidates: &'a [Channel]) -> Option<&'a Channel> {
        let top = candidates.iter().map(|c| c.priority).max()?;
        let tier: Vec<&Channel> = candidates.iter().filter(|c| c.priority == top).collect();
        if tier.len() == 1 {
            return tier.first().copied();
        }

        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        let total: u64 = tier.iter().map(|c| c.weight as u64).sum();
        if total == 0 {
            return tier.get(rng.gen_range(0..tier.len())).copied();
        }
        let mut target = rng.gen_range(0..total);
        for &channel in &tier {
            let w = channel.weight as u64;
            if target < w {
                return Some(channel);
            }
            target -= w;
        }
        tier.last().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// The failure rate crossed the threshold.
    Trip,
}

/// Per-channel outcome tracking.
pub trait HealthPolicy: Send + Sync {
    fn record(&self, channel_id: i64, success: bool) -> HealthVerdict;
    /// Start (or restart) the recovery cooldown.
    fn mark_disabled(&self, channel_id: i64);
    /// Whether an auto-disabled channel has sat out long enough for a trial.
    fn trial_due(&self, channel_id: i64) -> bool;
    /// Clear all state after a channel is re-enabled.
    fn reset(&self, channel_id: i64);
}

#[derive(Debug, Default)]
struct ChannelHealth {
    outcomes: VecDeque<bool>,
    disabled_at: Option<Instant>,
}

/// Failure rate over the last `window` outcomes.
pub struct RollingWindow {
    window: usize,
    threshold: f64,
    cooldown: Duration,
    state: DashMap<i64, ChannelHealth>,
}

impl RollingWindow {
    pub fn new(config: &ChannelHealthConfig) -> Self {
        Self {
            window: config.window.max(1),
            threshold: config.disable_threshold,
            cooldown: Duration::from_secs(config.recovery_cooldown_secs),
            state: DashMap::new(),
        }
    }

    pub fn failure_rate(&self, channel_id: i64) -> Option<f64> {
        let entry = self.state.get(&channel_id)?;
        if entry.outcomes.is_empty() {
            return None;
        }
        let failures = entry.outcomes.iter().filter(|ok| !**ok).count();
        Some(failures as f64 / entry.outcomes.len() as f64)
    }
}

impl HealthPolicy for RollingWindow {
    fn record(&self, channel_id: i64, success: bool) -> HealthVerdict {
        let mut entry = self.state.entry(channel_id).or_default();
        entry.outcomes.push_back(success);
        while entry.outcomes.len() > self.window {
            entry.outcomes.pop_front();
        }
        if entry.outcomes.len() < self.window {
            return HealthVerdict::Healthy;
        }
        let failures = entry.outcomes.iter().filter(|ok| !**ok).count();
        if failures as f64 / self.window as f64 >= self.threshold {
            HealthVerdict::Trip
        } else {
            HealthVerdict::Healthy
        }
    }

    fn mark_disabled(&self, channel_id: i64) {
        let mut entry = self.state.entry(channel_id).or_default();
        entry.outcomes.clear();
        entry.disabled_at = Some(Instant::now());
    }

    fn trial_due(&self, channel_id: i64) -> bool {
        let mut entry = self.state.entry(channel_id).or_default();
        match entry.disabled_at {
            Some(at) => at.elapsed() >= self.cooldown,
            // Disabled before this process started: the cooldown starts now.
            None => {
                entry.disabled_at = Some(Instant::now());
                false
            }
        }
    }

    fn reset(&self, channel_id: i64) {
        self.state.remove(&channel_id);
    }
}

pub struct ChannelSelector {
    channels: ChannelCache,
    store: Arc<dyn RelayStore>,
    policy: Box<dyn SelectionPolicy>,
    health: Box<dyn HealthPolicy>,
    config: ChannelHealthConfig,
}

impl ChannelSelector {
    pub fn new(channels: ChannelCache, store: Arc<dyn RelayStore>, config: ChannelHealthConfig) -> Self {
        Self {
            channels,
            store,
            policy: Box::new(PriorityWeighted::new()),
            health: Box::new(RollingWindow::new(&config)),
            config,
        }
    }

    pub fn with_policy(mut self, policy: impl SelectionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_health(mut self, health: impl HealthPolicy + 'static) -> Self {
        self.health = Box::new(health);
        self
    }

    /// Every channel declaring `model`, whatever its status.
    pub async fn candidates(&self, model: &str) -> Result<Vec<Channel>, AppError> {
        if let Some(cached) = self.channels.candidates(model).await {
            return Ok(cached);
        }
        tracing::debug!(model, "channel cache cold, reading from store");
        Ok(self.store.channels_for_model(model).await?)
    }

    /// Pick a channel for `model`, skipping `exclude`. Auto-disabled channels
    /// whose cooldown has run out are eligible as recovery trials.
    pub async fn select(&self, model: &str, exclude: &[i64]) -> Result<Option<Channel>, AppError> {
        let eligible: Vec<Channel> = self
            .candidates(model)
            .await?
            .into_iter()
            .filter(|c| !exclude.contains(&c.id))
            .filter(|c| match c.status {
                ChannelStatus::Enabled => true,
                ChannelStatus::AutoDisabled => self.config.auto_enable && self.health.trial_due(c.id),
                ChannelStatus::ManuallyDisabled => false,
            })
            .collect();

        let Some(chosen) = self.policy.choose(&eligible).cloned() else {
            return Ok(None);
        };
        if chosen.status == ChannelStatus::AutoDisabled {
            // One trial per cooldown period.
            self.health.mark_disabled(chosen.id);
            tracing::info!(channel_id = chosen.id, model, "probing auto-disabled channel");
        }
        Ok(Some(chosen))
    }

    pub async fn report_success(&self, channel: &Channel) {
        self.health.record(channel.id, true);
        if channel.status == ChannelStatus::AutoDisabled && self.config.auto_enable {
            self.health.reset(channel.id);
            self.persist_status(channel.id, ChannelStatus::Enabled).await;
            tracing::info!(channel_id = channel.id, name = %channel.name, "channel recovered, re-enabled");
        }
    }

    /// Only retryable failures say anything about the channel itself.
    pub async fn report_failure(&self, channel: &Channel, err: &ChannelError) {
        if !err.is_retryable() {
            return;
        }
        if channel.status == ChannelStatus::AutoDisabled {
            self.health.mark_disabled(channel.id);
            tracing::debug!(channel_id = channel.id, "recovery trial failed");
            return;
        }
        if self.health.record(channel.id, false) == HealthVerdict::Trip && self.config.auto_disable {
            self.health.mark_disabled(channel.id);
            self.persist_status(channel.id, ChannelStatus::AutoDisabled).await;
            tracing::warn!(
                channel_id = channel.id,
                name = %channel.name,
                error = %err,
                "channel failure rate over threshold, auto-disabled"
            );
        }
    }

    async fn persist_status(&self, channel_id: i64, status: ChannelStatus) {
        self.channels.set_status(channel_id, status).await;
        if let Err(e) = self.store.set_channel_status(channel_id, status).await {
            tracing::error!(channel_id, "failed to persist channel status: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ChannelErrorKind;
    use crate::models::channel::{ChannelConfig, ProviderKind};
    use crate::store::memory::MemoryStore;
    use crate::store::AdminStore;

    fn channel(id: i64, priority: i64, weight: u32) -> Channel {
        Channel {
            id,
            name: format!("ch-{}", id),
            provider: ProviderKind::OpenAi,
            key: "sk-x".into(),
            base_url: String::new(),
            models: vec!["gpt-4o".into()],
            model_mapping: Default::default(),
            priority,
            weight,
            status: ChannelStatus::Enabled,
            config: ChannelConfig::default(),
        }
    }

    fn health_config() -> ChannelHealthConfig {
        ChannelHealthConfig {
            auto_disable: true,
            auto_enable: true,
            disable_threshold: 0.5,
            window: 4,
            recovery_cooldown_secs: 30,
        }
    }

    async fn selector_with(channels: Vec<Channel>) -> (ChannelSelector, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let ids = store.insert_channels(&channels).await.unwrap();
        let loaded: Vec<Channel> = channels
            .into_iter()
            .zip(ids)
            .map(|(mut c, id)| {
                c.id = id;
                c
            })
            .collect();
        let cache = ChannelCache::new();
        cache.reload(loaded).await;
        let selector = ChannelSelector::new(cache, store.clone(), health_config())
            .with_policy(PriorityWeighted::seeded(7));
        (selector, store)
    }

    fn timeout() -> ChannelError {
        ChannelError::new(ChannelErrorKind::Timeout, "slow")
    }

    #[test]
    fn test_highest_priority_always_wins() {
        let policy = PriorityWeighted::seeded(1);
        let candidates = vec![channel(1, 1, 100), channel(2, 5, 1), channel(3, 3, 100)];
        for _ in 0..50 {
            assert_eq!(policy.choose(&candidates).unwrap().id, 2);
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let candidates = vec![channel(1, 0, 1), channel(2, 0, 1), channel(3, 0, 1)];
        let a = PriorityWeighted::seeded(42);
        let b = PriorityWeighted::seeded(42);
        let seq_a: Vec<i64> = (0..20).map(|_| a.choose(&candidates).unwrap().id).collect();
        let seq_b: Vec<i64> = (0..20).map(|_| b.choose(&candidates).unwrap().id).collect();
        assert_eq!(seq_a, seq_b);
    }

    #[test]
    fn test_weight_zero_never_picked_when_others_weighted() {
        let policy = PriorityWeighted::seeded(3);
        let candidates = vec![channel(1, 0, 0), channel(2, 0, 10)];
        for _ in 0..50 {
            assert_eq!(policy.choose(&candidates).unwrap().id, 2);
        }
        assert!(policy.choose(&[]).is_none());
    }

    #[test]
    fn test_rolling_window_trips_only_when_full() {
        let health = RollingWindow::new(&health_config());
        assert_eq!(health.record(1, false), HealthVerdict::Healthy);
        assert_eq!(health.record(1, false), HealthVerdict::Healthy);
        assert_eq!(health.record(1, true), HealthVerdict::Healthy);
        // 2 of 4 failed = 0.5
        assert_eq!(health.record(1, true), HealthVerdict::Trip);
        // oldest failure slides out: 1 of 4
        assert_eq!(health.record(1, true), HealthVerdict::Healthy);
        assert_eq!(health.failure_rate(1), Some(0.25));
    }

    #[tokio::test]
    async fn test_select_skips_excluded_and_disabled() {
        let mut manual = channel(0, 9, 1);
        manual.status = ChannelStatus::ManuallyDisabled;
        let (selector, _) = selector_with(vec![manual, channel(0, 5, 1), channel(0, 1, 1)]).await;

        let first = selector.select("gpt-4o", &[]).await.unwrap().unwrap();
        assert_eq!(first.priority, 5);
        let second = selector.select("gpt-4o", &[first.id]).await.unwrap().unwrap();
        assert_eq!(second.priority, 1);
        assert!(selector.select("gpt-4o", &[first.id, second.id]).await.unwrap().is_none());
        assert!(selector.select("unknown", &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_non_retryable_errors_do_not_count() {
        let (selector, store) = selector_with(vec![channel(0, 1, 1)]).await;
        let ch = selector.select("gpt-4o", &[]).await.unwrap().unwrap();
        for _ in 0..10 {
            selector.report_failure(&ch, &ChannelError::status(400, "bad")).await;
        }
        let stored = store.channels_for_model("gpt-4o").await.unwrap();
        assert_eq!(stored[0].status, ChannelStatus::Enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_disable_then_trial_recovers() {
        let (selector, store) = selector_with(vec![channel(0, 1, 1)]).await;
        let ch = selector.select("gpt-4o", &[]).await.unwrap().unwrap();
        for _ in 0..4 {
            selector.report_failure(&ch, &timeout()).await;
        }
        let stored = store.channels_for_model("gpt-4o").await.unwrap();
        assert_eq!(stored[0].status, ChannelStatus::AutoDisabled);
        assert!(selector.select("gpt-4o", &[]).await.unwrap().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = selector.select("gpt-4o", &[]).await.unwrap().unwrap();
        assert_eq!(trial.status, ChannelStatus::AutoDisabled);
        // only one trial per cooldown
        assert!(selector.select("gpt-4o", &[]).await.unwrap().is_none());

        selector.report_success(&trial).await;
        let stored = store.channels_for_model("gpt-4o").await.unwrap();
        assert_eq!(stored[0].status, ChannelStatus::Enabled);
        let again = selector.select("gpt-4o", &[]).await.unwrap().unwrap();
        assert_eq!(again.status, ChannelStatus::Enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_cooldown() {
        let (selector, _) = selector_with(vec![channel(0, 1, 1)]).await;
        let ch = selector.select("gpt-4o", &[]).await.unwrap().unwrap();
        for _ in 0..4 {
            selector.report_failure(&ch, &timeout()).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = selector.select("gpt-4o", &[]).await.unwrap().unwrap();
        selector.report_failure(&trial, &timeout()).await;

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(selector.select("gpt-4o", &[]).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(selector.select("gpt-4o", &[]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_manual_disable_is_never_retried() {
        let mut manual = channel(0, 1, 1);
        manual.status = ChannelStatus::ManuallyDisabled;
        let (selector, _) = selector_with(vec![manual]).await;
        assert!(selector.select("gpt-4o", &[]).await.unwrap().is_none());
    }
}
