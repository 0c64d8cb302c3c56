//! Administrative edits on top of the store traits.
//!
//! Updating a token here is the only way an expired or exhausted token
//! becomes usable again; the ledger never re-enables one on its own.

use chrono::Utc;

use crate::models::channel::{parse_models, Channel};
use crate::models::token::{Token, TokenStatus, NEVER_EXPIRES};
use crate::store::{AdminStore, ChannelQuery, Page, RelayStore};

/// Fields to change on a token. `None` leaves the field as it is.
#[derive(Debug, Clone, Default)]
pub struct TokenUpdate {
    pub name: Option<String>,
    pub remain_quota: Option<i64>,
    pub unlimited_quota: Option<bool>,
    /// Unix seconds, or [`NEVER_EXPIRES`].
    pub expired_time: Option<i64>,
    pub remind_threshold: Option<i64>,
    pub status: Option<TokenStatus>,
}

pub async fn update_token<S>(
    store: &S,
    user_id: i64,
    id: i64,
    update: TokenUpdate,
) -> anyhow::Result<Token>
where
    S: RelayStore + AdminStore + ?Sized,
{
    let mut token = match store.get_token(id).await? {
        Some(t) if t.user_id == user_id => t,
        _ => anyhow::bail!("token {} not found for user {}", id, user_id),
    };

    if let Some(name) = update.name {
        token.name = name;
    }
    if let Some(quota) = update.remain_quota {
        token.remain_quota = quota;
    }
    if let Some(unlimited) = update.unlimited_quota {
        token.unlimited_quota = unlimited;
    }
    if let Some(expired_time) = update.expired_time {
        token.expired_time = expired_time;
    }
    if let Some(threshold) = update.remind_threshold {
        token.remind_threshold = threshold;
    }

    if let Some(status) = update.status {
        if status == TokenStatus::Enabled {
            if token.is_expired(Utc::now().timestamp()) {
                anyhow::bail!("token {} has expired; extend its expiry before enabling it", id);
            }
            if token.is_exhausted() {
                anyhow::bail!("token {} has no quota left; add quota before enabling it", id);
            }
        }
        token.status = status;
    }

    if !store.update_token(&token).await? {
        anyhow::bail!("token {} disappeared during update", id);
    }
    Ok(token)
}

/// Expiry `days` from now, or never for `None`.
pub fn expiry_in_days(days: Option<i64>) -> i64 {
    match days {
        Some(d) => Utc::now().timestamp() + d * 86_400,
        None => NEVER_EXPIRES,
    }
}

/// Fields to change on a channel. Status changes go through
/// [`RelayStore::set_channel_status`] instead.
#[derive(Debug, Clone, Default)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub base_url: Option<String>,
    /// Comma separated model names.
    pub models: Option<String>,
    pub priority: Option<i64>,
    pub weight: Option<u32>,
}

pub async fn find_channel<S>(store: &S, id: i64) -> anyhow::Result<Channel>
where
    S: AdminStore + ?Sized,
{
    let query = ChannelQuery {
        keyword: Some(id.to_string()),
        status: None,
    };
    store
        .search_channels(&query, Page::default())
        .await?
        .into_iter()
        .find(|c| c.id == id)
        .ok_or_else(|| anyhow::anyhow!("channel {} not found", id))
}

pub async fn update_channel<S>(store: &S, id: i64, update: ChannelUpdate) -> anyhow::Result<Channel>
where
    S: AdminStore + ?Sized,
{
    let mut channel = find_channel(store, id).await?;
    if let Some(name) = update.name {
        channel.name = name;
    }
    if let Some(base_url) = update.base_url {
        channel.base_url = base_url;
    }
    if let Some(raw) = update.models {
        let models = parse_models(&raw);
        if models.is_empty() {
            anyhow::bail!("a channel must serve at least one model");
        }
        channel.models = models;
    }
    if let Some(priority) = update.priority {
        channel.priority = priority;
    }
    if let Some(weight) = update.weight {
        channel.weight = weight;
    }

    if !store.update_channel(&channel).await? {
        anyhow::bail!("channel {} disappeared during update", id);
    }
    Ok(channel)
}
