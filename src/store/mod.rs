//! Persistence contracts.
//!
//! [`RelayStore`] is everything the relay core touches: it reads token,
//! user and channel records and writes only quota and status fields. Every
//! quota write is a relative `col = col + delta` statement so concurrent
//! requests and gateway instances never lose updates.
//!
//! [`AdminStore`] is the record-management surface used by the CLI.

pub mod admin;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use crate::models::channel::{Channel, ChannelStatus};
use crate::models::token::{Token, TokenStatus};
use crate::models::user::User;

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn get_token_by_key(&self, key: &str) -> anyhow::Result<Option<Token>>;

    async fn get_token(&self, id: i64) -> anyhow::Result<Option<Token>>;

    async fn get_user(&self, id: i64) -> anyhow::Result<Option<User>>;

    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>>;

    /// Channels declaring `model`, whatever their status.
    async fn channels_for_model(&self, model: &str) -> anyhow::Result<Vec<Channel>>;

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> anyhow::Result<()>;

    /// Atomically take `amount` from the token if its balance covers it.
    /// Returns `false` (and changes nothing) when it does not.
    async fn reserve_token_quota(&self, id: i64, amount: i64) -> anyhow::Result<bool>;

    /// Same as [`reserve_token_quota`](Self::reserve_token_quota) for users.
    async fn reserve_user_quota(&self, id: i64, amount: i64) -> anyhow::Result<bool>;

    /// Unconditional relative adjustment. Positive charges, negative refunds.
    async fn adjust_token_quota(&self, id: i64, delta: i64) -> anyhow::Result<()>;

    async fn adjust_user_quota(&self, id: i64, delta: i64) -> anyhow::Result<()>;

    async fn set_channel_status(&self, id: i64, status: ChannelStatus) -> anyhow::Result<()>;
}

/// Zero-based pagination window.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Page {
    pub fn offset(&self) -> i64 {
        self.page as i64 * self.per_page as i64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 0, per_page: 20 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChannelQuery {
    /// Matches name (substring), exact key or exact id.
    pub keyword: Option<String>,
    pub status: Option<ChannelStatus>,
}

#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn insert_user(&self, user: &User) -> anyhow::Result<i64>;

    async fn list_users(&self, page: Page) -> anyhow::Result<Vec<User>>;

    /// Credit a user's balance. Returns `false` when the user does not exist.
    async fn top_up_user(&self, id: i64, amount: i64) -> anyhow::Result<bool>;

    async fn insert_token(&self, token: &Token) -> anyhow::Result<i64>;

    async fn update_token(&self, token: &Token) -> anyhow::Result<bool>;

    /// A user's tokens matching `keyword` by name substring or exact key.
    async fn search_tokens(
        &self,
        user_id: i64,
        keyword: &str,
        page: Page,
    ) -> anyhow::Result<Vec<Token>>;

    async fn delete_tokens(&self, user_id: i64, ids: &[i64]) -> anyhow::Result<u64>;

    async fn insert_channels(&self, channels: &[Channel]) -> anyhow::Result<Vec<i64>>;

    async fn update_channel(&self, channel: &Channel) -> anyhow::Result<bool>;

    async fn search_channels(&self, query: &ChannelQuery, page: Page)
        -> anyhow::Result<Vec<Channel>>;

    async fn delete_channels(&self, ids: &[i64]) -> anyhow::Result<u64>;

    /// Remove every manually or automatically disabled channel.
    async fn delete_disabled_channels(&self) -> anyhow::Result<u64>;
}

/// Expand a channel template whose key field holds several newline
/// separated keys into one channel per key.
pub fn expand_multi_key(template: &Channel) -> Vec<Channel> {
    template
        .key
        .lines()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| Channel {
            key: k.to_string(),
            ..template.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{ChannelConfig, ProviderKind};

    #[test]
    fn test_expand_multi_key() {
        let template = Channel {
            id: 0,
            name: "pool".into(),
            provider: ProviderKind::OpenAi,
            key: "sk-a\n\n  sk-b \nsk-c".into(),
            base_url: String::new(),
            models: vec!["gpt-4o".into()],
            model_mapping: Default::default(),
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
            config: ChannelConfig::default(),
        };
        let keys: Vec<String> = expand_multi_key(&template).into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["sk-a", "sk-b", "sk-c"]);
    }

    #[test]
    fn test_page_offset() {
        assert_eq!(Page { page: 3, per_page: 20 }.offset(), 60);
    }
}
