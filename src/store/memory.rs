//! In-process store with the same contracts as [`PgStore`](super::postgres::PgStore).
//!
//! Used for local development without a database and throughout the test
//! suite. Every method holds the lock for the whole read-modify-write, which
//! gives it the same atomicity as the single-statement SQL updates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{AdminStore, ChannelQuery, Page, RelayStore};
use crate::models::channel::{Channel, ChannelStatus};
use crate::models::token::{Token, TokenStatus};
use crate::models::user::User;

#[derive(Default)]
struct Tables {
    next_id: i64,
    users: BTreeMap<i64, User>,
    tokens: BTreeMap<i64, Token>,
    channels: BTreeMap<i64, Channel>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    /// Number of quota-writing calls; lets tests observe write coalescing.
    quota_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    pub fn quota_writes(&self) -> u64 {
        self.quota_writes.load(Ordering::Relaxed)
    }

    fn page<T: Clone>(items: impl Iterator<Item = T>, page: Page) -> Vec<T> {
        items
            .skip(page.offset() as usize)
            .take(page.per_page as usize)
            .collect()
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn get_token_by_key(&self, key: &str) -> anyhow::Result<Option<Token>> {
        Ok(self.lock()?.tokens.values().find(|t| t.key == key).cloned())
    }

    async fn get_token(&self, id: i64) -> anyhow::Result<Option<Token>> {
        Ok(self.lock()?.tokens.get(&id).cloned())
    }

    async fn get_user(&self, id: i64) -> anyhow::Result<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let mut channels: Vec<Channel> = self.lock()?.channels.values().cloned().collect();
        channels.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(channels)
    }

    async fn channels_for_model(&self, model: &str) -> anyhow::Result<Vec<Channel>> {
        let channels = self.list_channels().await?;
        Ok(channels.into_iter().filter(|c| c.supports(model)).collect())
    }

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> anyhow::Result<()> {
        if let Some(t) = self.lock()?.tokens.get_mut(&id) {
            t.status = status;
        }
        Ok(())
    }

    async fn reserve_token_quota(&self, id: i64, amount: i64) -> anyhow::Result<bool> {
        self.quota_writes.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.lock()?;
        match tables.tokens.get_mut(&id) {
            Some(t) if t.remain_quota >= amount => {
                t.remain_quota -= amount;
                t.used_quota += amount;
                t.accessed_time = Utc::now().timestamp();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reserve_user_quota(&self, id: i64, amount: i64) -> anyhow::Result<bool> {
        self.quota_writes.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.lock()?;
        match tables.users.get_mut(&id) {
            Some(u) if u.quota >= amount => {
                u.quota -= amount;
                u.used_quota += amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn adjust_token_quota(&self, id: i64, delta: i64) -> anyhow::Result<()> {
        self.quota_writes.fetch_add(1, Ordering::Relaxed);
        if let Some(t) = self.lock()?.tokens.get_mut(&id) {
            t.remain_quota -= delta;
            t.used_quota += delta;
            t.accessed_time = Utc::now().timestamp();
        }
        Ok(())
    }

    async fn adjust_user_quota(&self, id: i64, delta: i64) -> anyhow::Result<()> {
        self.quota_writes.fetch_add(1, Ordering::Relaxed);
        if let Some(u) = self.lock()?.users.get_mut(&id) {
            u.quota -= delta;
            u.used_quota += delta;
        }
        Ok(())
    }

    async fn set_channel_status(&self, id: i64, status: ChannelStatus) -> anyhow::Result<()> {
        if let Some(c) = self.lock()?.channels.get_mut(&id) {
            c.status = status;
        }
        Ok(())
    }
}

#[async_trait]
impl AdminStore for MemoryStore {
    async fn insert_user(&self, user: &User) -> anyhow::Result<i64> {
        let mut tables = self.lock()?;
        if tables.users.values().any(|u| u.username == user.username) {
            anyhow::bail!("username '{}' already exists", user.username);
        }
        let id = tables.allocate_id();
        tables.users.insert(id, User { id, ..user.clone() });
        Ok(id)
    }

    async fn list_users(&self, page: Page) -> anyhow::Result<Vec<User>> {
        let tables = self.lock()?;
        Ok(Self::page(tables.users.values().cloned(), page))
    }

    async fn top_up_user(&self, id: i64, amount: i64) -> anyhow::Result<bool> {
        match self.lock()?.users.get_mut(&id) {
            Some(u) => {
                u.quota += amount;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_token(&self, token: &Token) -> anyhow::Result<i64> {
        let mut tables = self.lock()?;
        if tables.tokens.values().any(|t| t.key == token.key) {
            anyhow::bail!("token key already exists");
        }
        let id = tables.allocate_id();
        tables.tokens.insert(id, Token { id, ..token.clone() });
        Ok(id)
    }

    async fn update_token(&self, token: &Token) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        match tables.tokens.get_mut(&token.id) {
            Some(t) => {
                t.name = token.name.clone();
                t.status = token.status;
                t.expired_time = token.expired_time;
                t.remain_quota = token.remain_quota;
                t.unlimited_quota = token.unlimited_quota;
                t.remind_threshold = token.remind_threshold;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search_tokens(
        &self,
        user_id: i64,
        keyword: &str,
        page: Page,
    ) -> anyhow::Result<Vec<Token>> {
        let tables = self.lock()?;
        let needle = keyword.to_lowercase();
        let matches = tables
            .tokens
            .values()
            .rev()
            .filter(|t| t.user_id == user_id)
            .filter(|t| {
                keyword.is_empty() || t.key == keyword || t.name.to_lowercase().contains(&needle)
            })
            .cloned();
        Ok(Self::page(matches, page))
    }

    async fn delete_tokens(&self, user_id: i64, ids: &[i64]) -> anyhow::Result<u64> {
        let mut tables = self.lock()?;
        let before = tables.tokens.len();
        tables
            .tokens
            .retain(|id, t| !(t.user_id == user_id && ids.contains(id)));
        Ok((before - tables.tokens.len()) as u64)
    }

    async fn insert_channels(&self, channels: &[Channel]) -> anyhow::Result<Vec<i64>> {
        let mut tables = self.lock()?;
        let mut ids = Vec::with_capacity(channels.len());
        for c in channels {
            let id = tables.allocate_id();
            tables.channels.insert(id, Channel { id, ..c.clone() });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn update_channel(&self, channel: &Channel) -> anyhow::Result<bool> {
        let mut tables = self.lock()?;
        match tables.channels.get_mut(&channel.id) {
            Some(c) => {
                *c = channel.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn search_channels(
        &self,
        query: &ChannelQuery,
        page: Page,
    ) -> anyhow::Result<Vec<Channel>> {
        let keyword = query.keyword.clone().unwrap_or_default();
        let needle = keyword.to_lowercase();
        let mut channels = self.list_channels().await?;
        channels.retain(|c| {
            let keyword_ok = keyword.is_empty()
                || c.name.to_lowercase().contains(&needle)
                || c.key == keyword
                || c.id.to_string() == keyword;
            let status_ok = query.status.map_or(true, |s| c.status == s);
            keyword_ok && status_ok
        });
        Ok(Self::page(channels.into_iter(), page))
    }

    async fn delete_channels(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let mut tables = self.lock()?;
        let before = tables.channels.len();
        tables.channels.retain(|id, _| !ids.contains(id));
        Ok((before - tables.channels.len()) as u64)
    }

    async fn delete_disabled_channels(&self) -> anyhow::Result<u64> {
        let mut tables = self.lock()?;
        let before = tables.channels.len();
        tables.channels.retain(|_, c| c.is_enabled());
        Ok((before - tables.channels.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{ChannelConfig, ProviderKind};

    fn channel(name: &str, status: ChannelStatus) -> Channel {
        Channel {
            id: 0,
            name: name.into(),
            provider: ProviderKind::OpenAi,
            key: format!("key-{}", name),
            base_url: String::new(),
            models: vec!["gpt-4o".into()],
            model_mapping: Default::default(),
            priority: 0,
            weight: 1,
            status,
            config: ChannelConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_conditional_reserve() {
        let store = MemoryStore::new();
        let uid = store
            .insert_user(&User {
                id: 0,
                username: "u".into(),
                email: None,
                quota: 100,
                used_quota: 0,
                remind_threshold: 0,
            })
            .await
            .unwrap();
        assert!(store.reserve_user_quota(uid, 60).await.unwrap());
        assert!(!store.reserve_user_quota(uid, 60).await.unwrap());
        let user = store.get_user(uid).await.unwrap().unwrap();
        assert_eq!(user.quota, 40);
        assert_eq!(user.used_quota, 60);
    }

    #[tokio::test]
    async fn test_channel_search_and_delete_disabled() {
        let store = MemoryStore::new();
        store
            .insert_channels(&[
                channel("alpha", ChannelStatus::Enabled),
                channel("beta", ChannelStatus::ManuallyDisabled),
                channel("gamma", ChannelStatus::AutoDisabled),
            ])
            .await
            .unwrap();

        let q = ChannelQuery { keyword: Some("ALP".into()), status: None };
        let found = store.search_channels(&q, Page::default()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "alpha");

        let q = ChannelQuery { keyword: None, status: Some(ChannelStatus::AutoDisabled) };
        assert_eq!(store.search_channels(&q, Page::default()).await.unwrap().len(), 1);

        assert_eq!(store.delete_disabled_channels().await.unwrap(), 2);
        assert_eq!(store.list_channels().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pagination() {
        let store = MemoryStore::new();
        let many: Vec<Channel> = (0..5)
            .map(|i| channel(&format!("c{}", i), ChannelStatus::Enabled))
            .collect();
        store.insert_channels(&many).await.unwrap();
        let page = Page { page: 1, per_page: 2 };
        let got = store.search_channels(&ChannelQuery::default(), page).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].name, "c2");
    }
}
