use std::time::Duration;

use serde::Deserialize;

use crate::middleware::rate_limit::RateLimitClass;

/// Admission budget for one rate-limit class.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Admissions allowed per window. 0 = disabled.
    pub count: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimits {
    pub api: RateLimitRule,
    pub web: RateLimitRule,
    pub upload: RateLimitRule,
    pub download: RateLimitRule,
    pub critical: RateLimitRule,
}

impl RateLimits {
    pub fn rule(&self, class: RateLimitClass) -> RateLimitRule {
        match class {
            RateLimitClass::Api => self.api,
            RateLimitClass::Web => self.web,
            RateLimitClass::Upload => self.upload,
            RateLimitClass::Download => self.download,
            RateLimitClass::Critical => self.critical,
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            api: RateLimitRule { count: 180, window_secs: 180 },
            web: RateLimitRule { count: 60, window_secs: 180 },
            upload: RateLimitRule { count: 10, window_secs: 60 },
            download: RateLimitRule { count: 10, window_secs: 60 },
            critical: RateLimitRule { count: 20, window_secs: 1200 },
        }
    }
}

/// Channel health knobs used by the selector.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelHealthConfig {
    pub auto_disable: bool,
    pub auto_enable: bool,
    /// Failure ratio (0.0–1.0) over the rolling window that trips auto-disable.
    pub disable_threshold: f64,
    /// Number of most recent outcomes tracked per channel.
    pub window: usize,
    /// Seconds an auto-disabled channel sits out before a recovery trial.
    pub recovery_cooldown_secs: u64,
}

impl Default for ChannelHealthConfig {
    fn default() -> Self {
        Self {
            auto_disable: true,
            auto_enable: true,
            disable_threshold: 0.5,
            window: 10,
            recovery_cooldown_secs: 60,
        }
    }
}

/// Process-wide configuration. Loaded once at startup and shared as
/// `Arc<Config>`; nothing mutates it afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Distributed cache. `None` keeps counters and caches in-process.
    pub redis_url: Option<String>,
    pub batch_update_enabled: bool,
    pub batch_update_interval_secs: u64,
    /// Extra channels tried after the first one fails.
    pub retry_times: u32,
    /// Overall budget for one relayed request, failover and stream included.
    pub relay_timeout_secs: u64,
    /// Wait for one channel's response headers before failing over.
    pub channel_timeout_secs: u64,
    pub rate_limits: RateLimits,
    pub channel_health: ChannelHealthConfig,
    pub quota_remind_threshold: i64,
    /// Reservation floor added on top of the prompt estimate.
    pub pre_consumed_quota: i64,
    /// Quota units per US dollar, used when displaying balances.
    pub quota_per_unit: i64,
    pub sync_frequency_secs: u64,
    pub notify_webhook_url: Option<String>,
    pub notify_webhook_secret: Option<String>,
}

impl Config {
    pub fn redis_enabled(&self) -> bool {
        self.redis_url.is_some()
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_secs)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_timeout_secs.max(1))
    }

    pub fn batch_update_interval(&self) -> Duration {
        Duration::from_secs(self.batch_update_interval_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            database_url: "postgres://localhost/relay".into(),
            redis_url: None,
            batch_update_enabled: false,
            batch_update_interval_secs: 5,
            retry_times: 0,
            relay_timeout_secs: 300,
            channel_timeout_secs: 60,
            rate_limits: RateLimits::default(),
            channel_health: ChannelHealthConfig::default(),
            quota_remind_threshold: 1000,
            pre_consumed_quota: 500,
            quota_per_unit: 500_000,
            sync_frequency_secs: 600,
            notify_webhook_url: None,
            notify_webhook_secret: None,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn rate_rule(class: &str, default: RateLimitRule) -> RateLimitRule {
    RateLimitRule {
        count: env_or(&format!("RELAY_{}_RATE_LIMIT", class), default.count),
        window_secs: env_or(&format!("RELAY_{}_RATE_WINDOW", class), default.window_secs),
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let defaults = Config::default();
    let rl = RateLimits::default();
    let health = ChannelHealthConfig::default();

    let disable_threshold: f64 =
        env_or("RELAY_CHANNEL_DISABLE_THRESHOLD", health.disable_threshold);
    if !(0.0..=1.0).contains(&disable_threshold) {
        anyhow::bail!(
            "RELAY_CHANNEL_DISABLE_THRESHOLD must be a ratio between 0 and 1, got {}",
            disable_threshold
        );
    }

    Ok(Config {
        port: env_or("RELAY_PORT", defaults.port),
        database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
        redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
        batch_update_enabled: env_flag("RELAY_BATCH_UPDATE_ENABLED", false),
        batch_update_interval_secs: env_or(
            "RELAY_BATCH_UPDATE_INTERVAL",
            defaults.batch_update_interval_secs,
        ),
        retry_times: env_or("RELAY_RETRY_TIMES", defaults.retry_times),
        relay_timeout_secs: env_or("RELAY_TIMEOUT", defaults.relay_timeout_secs),
        channel_timeout_secs: env_or("RELAY_CHANNEL_TIMEOUT", defaults.channel_timeout_secs),
        rate_limits: RateLimits {
            api: rate_rule("API", rl.api),
            web: rate_rule("WEB", rl.web),
            upload: rate_rule("UPLOAD", rl.upload),
            download: rate_rule("DOWNLOAD", rl.download),
            critical: rate_rule("CRITICAL", rl.critical),
        },
        channel_health: ChannelHealthConfig {
            auto_disable: env_flag("RELAY_CHANNEL_AUTO_DISABLE", health.auto_disable),
            auto_enable: env_flag("RELAY_CHANNEL_AUTO_ENABLE", health.auto_enable),
            disable_threshold,
            window: env_or("RELAY_CHANNEL_HEALTH_WINDOW", health.window).max(1),
            recovery_cooldown_secs: env_or(
                "RELAY_CHANNEL_RECOVERY_COOLDOWN",
                health.recovery_cooldown_secs,
            ),
        },
        quota_remind_threshold: env_or(
            "RELAY_QUOTA_REMIND_THRESHOLD",
            defaults.quota_remind_threshold,
        ),
        pre_consumed_quota: env_or("RELAY_PRE_CONSUMED_QUOTA", defaults.pre_consumed_quota),
        quota_per_unit: env_or("RELAY_QUOTA_PER_UNIT", defaults.quota_per_unit),
        sync_frequency_secs: env_or("RELAY_SYNC_FREQUENCY", defaults.sync_frequency_secs),
        notify_webhook_url: std::env::var("RELAY_NOTIFY_WEBHOOK_URL").ok(),
        notify_webhook_secret: std::env::var("RELAY_NOTIFY_WEBHOOK_SECRET").ok(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rate_limits_per_class() {
        let rl = RateLimits::default();
        assert_eq!(rl.rule(RateLimitClass::Api), RateLimitRule { count: 180, window_secs: 180 });
        assert_eq!(rl.rule(RateLimitClass::Critical).window_secs, 1200);
        assert_eq!(rl.rule(RateLimitClass::Upload).count, 10);
    }

    #[test]
    fn test_batch_interval_never_zero() {
        let cfg = Config {
            batch_update_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(cfg.batch_update_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_channel_timeout_is_shorter_than_relay_timeout_by_default() {
        let cfg = Config::default();
        assert!(cfg.channel_timeout() < cfg.relay_timeout());
        let zero = Config {
            channel_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(zero.channel_timeout(), Duration::from_secs(1));
    }
}
