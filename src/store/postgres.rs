use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use sqlx::PgPool;

use super::{AdminStore, ChannelQuery, Page, RelayStore};
use crate::models::channel::{Channel, ChannelConfig, ChannelStatus};
use crate::models::token::{Token, TokenStatus};
use crate::models::user::User;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

// ── Rows ─────────────────────────────────────────────────────────

const TOKEN_COLUMNS: &str = "id, user_id, key, name, status, created_time, accessed_time, \
     expired_time, remain_quota, unlimited_quota, used_quota, remind_threshold";

const CHANNEL_COLUMNS: &str =
    "id, name, provider, key, base_url, models, model_mapping, priority, weight, status, config";

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    id: i64,
    user_id: i64,
    key: String,
    name: String,
    status: i16,
    created_time: i64,
    accessed_time: i64,
    expired_time: i64,
    remain_quota: i64,
    unlimited_quota: bool,
    used_quota: i64,
    remind_threshold: i64,
}

impl TryFrom<TokenRow> for Token {
    type Error = anyhow::Error;

    fn try_from(r: TokenRow) -> anyhow::Result<Self> {
        Ok(Token {
            id: r.id,
            user_id: r.user_id,
            key: r.key,
            name: r.name,
            status: TokenStatus::try_from(r.status).map_err(anyhow::Error::msg)?,
            created_time: r.created_time,
            accessed_time: r.accessed_time,
            expired_time: r.expired_time,
            remain_quota: r.remain_quota,
            unlimited_quota: r.unlimited_quota,
            used_quota: r.used_quota,
            remind_threshold: r.remind_threshold,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    email: Option<String>,
    quota: i64,
    used_quota: i64,
    remind_threshold: i64,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        User {
            id: r.id,
            username: r.username,
            email: r.email,
            quota: r.quota,
            used_quota: r.used_quota,
            remind_threshold: r.remind_threshold,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ChannelRow {
    id: i64,
    name: String,
    provider: String,
    key: String,
    base_url: String,
    models: Vec<String>,
    model_mapping: Json<HashMap<String, String>>,
    priority: i64,
    weight: i32,
    status: i16,
    config: Json<ChannelConfig>,
}

impl TryFrom<ChannelRow> for Channel {
    type Error = anyhow::Error;

    fn try_from(r: ChannelRow) -> anyhow::Result<Self> {
        Ok(Channel {
            id: r.id,
            name: r.name,
            provider: r.provider.parse().map_err(anyhow::Error::msg)?,
            key: r.key,
            base_url: r.base_url,
            models: r.models,
            model_mapping: r.model_mapping.0,
            priority: r.priority,
            weight: r.weight.max(0) as u32,
            status: ChannelStatus::try_from(r.status).map_err(anyhow::Error::msg)?,
            config: r.config.0,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> anyhow::Result<Vec<T>>
where
    T: TryFrom<R, Error = anyhow::Error>,
{
    rows.into_iter().map(T::try_from).collect()
}

// ── Relay core ───────────────────────────────────────────────────

#[async_trait]
impl RelayStore for PgStore {
    async fn get_token_by_key(&self, key: &str) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM tokens WHERE key = $1",
            TOKEN_COLUMNS
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Token::try_from).transpose()
    }

    async fn get_token(&self, id: i64) -> anyhow::Result<Option<Token>> {
        let row = sqlx::query_as::<_, TokenRow>(&format!(
            "SELECT {} FROM tokens WHERE id = $1",
            TOKEN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Token::try_from).transpose()
    }

    async fn get_user(&self, id: i64) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, email, quota, used_quota, remind_threshold FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {} FROM channels ORDER BY priority DESC, id ASC",
            CHANNEL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn channels_for_model(&self, model: &str) -> anyhow::Result<Vec<Channel>> {
        let rows = sqlx::query_as::<_, ChannelRow>(&format!(
            "SELECT {} FROM channels WHERE $1 = ANY(models) ORDER BY priority DESC, id ASC",
            CHANNEL_COLUMNS
        ))
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn set_token_status(&self, id: i64, status: TokenStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE tokens SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(i16::from(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reserve_token_quota(&self, id: i64, amount: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE tokens
               SET remain_quota = remain_quota - $2,
                   used_quota = used_quota + $2,
                   accessed_time = $3
               WHERE id = $1 AND remain_quota >= $2"#,
        )
        .bind(id)
        .bind(amount)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reserve_user_quota(&self, id: i64, amount: i64) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE users
               SET quota = quota - $2,
                   used_quota = used_quota + $2
               WHERE id = $1 AND quota >= $2"#,
        )
        .bind(id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn adjust_token_quota(&self, id: i64, delta: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"UPDATE tokens
               SET remain_quota = remain_quota - $2,
                   used_quota = used_quota + $2,
                   accessed_time = $3
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(delta)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn adjust_user_quota(&self, id: i64, delta: i64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE users SET quota = quota - $2, used_quota = used_quota + $2 WHERE id = $1",
        )
        .bind(id)
        .bind(delta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_channel_status(&self, id: i64, status: ChannelStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE channels SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(i16::from(status))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── Administration ───────────────────────────────────────────────

#[async_trait]
impl AdminStore for PgStore {
    async fn insert_user(&self, user: &User) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO users (username, email, quota, used_quota, remind_threshold)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id"#,
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.quota)
        .bind(user.used_quota)
        .bind(user.remind_threshold)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_users(&self, page: Page) -> anyhow::Result<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, username, email, quota, used_quota, remind_threshold
               FROM users ORDER BY id ASC LIMIT $1 OFFSET $2"#,
        )
        .bind(page.per_page as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(User::from).collect())
    }

    async fn top_up_user(&self, id: i64, amount: i64) -> anyhow::Result<bool> {
        let result = sqlx::query("UPDATE users SET quota = quota + $2 WHERE id = $1")
            .bind(id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_token(&self, token: &Token) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO tokens (user_id, key, name, status, created_time, accessed_time,
                                   expired_time, remain_quota, unlimited_quota, used_quota,
                                   remind_threshold)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               RETURNING id"#,
        )
        .bind(token.user_id)
        .bind(&token.key)
        .bind(&token.name)
        .bind(i16::from(token.status))
        .bind(token.created_time)
        .bind(token.accessed_time)
        .bind(token.expired_time)
        .bind(token.remain_quota)
        .bind(token.unlimited_quota)
        .bind(token.used_quota)
        .bind(token.remind_threshold)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn update_token(&self, token: &Token) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE tokens
               SET name = $2, status = $3, expired_time = $4, remain_quota = $5,
                   unlimited_quota = $6, remind_threshold = $7
               WHERE id = $1"#,
        )
        .bind(token.id)
        .bind(&token.name)
        .bind(i16::from(token.status))
        .bind(token.expired_time)
        .bind(token.remain_quota)
        .bind(token.unlimited_quota)
        .bind(token.remind_threshold)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search_tokens(
        &self,
        user_id: i64,
        keyword: &str,
        page: Page,
    ) -> anyhow::Result<Vec<Token>> {
        let rows = sqlx::query_as::<_, TokenRow>(&format!(
            r#"SELECT {} FROM tokens
               WHERE user_id = $1 AND ($2 = '' OR name ILIKE $3 OR key = $2)
               ORDER BY id DESC LIMIT $4 OFFSET $5"#,
            TOKEN_COLUMNS
        ))
        .bind(user_id)
        .bind(keyword)
        .bind(format!("%{}%", keyword))
        .bind(page.per_page as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn delete_tokens(&self, user_id: i64, ids: &[i64]) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE user_id = $1 AND id = ANY($2)")
            .bind(user_id)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_channels(&self, channels: &[Channel]) -> anyhow::Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(channels.len());
        for c in channels {
            let id = sqlx::query_scalar::<_, i64>(
                r#"INSERT INTO channels (name, provider, key, base_url, models, model_mapping,
                                         priority, weight, status, config)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                   RETURNING id"#,
            )
            .bind(&c.name)
            .bind(c.provider.as_str())
            .bind(&c.key)
            .bind(&c.base_url)
            .bind(&c.models)
            .bind(Json(&c.model_mapping))
            .bind(c.priority)
            .bind(c.weight as i32)
            .bind(i16::from(c.status))
            .bind(Json(&c.config))
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn update_channel(&self, c: &Channel) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"UPDATE channels
               SET name = $2, provider = $3, key = $4, base_url = $5, models = $6,
                   model_mapping = $7, priority = $8, weight = $9, status = $10, config = $11
               WHERE id = $1"#,
        )
        .bind(c.id)
        .bind(&c.name)
        .bind(c.provider.as_str())
        .bind(&c.key)
        .bind(&c.base_url)
        .bind(&c.models)
        .bind(Json(&c.model_mapping))
        .bind(c.priority)
        .bind(c.weight as i32)
        .bind(i16::from(c.status))
        .bind(Json(&c.config))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search_channels(
        &self,
        query: &ChannelQuery,
        page: Page,
    ) -> anyhow::Result<Vec<Channel>> {
        let keyword = query.keyword.clone().unwrap_or_default();
        let rows = sqlx::query_as::<_, ChannelRow>(&format!(
            r#"SELECT {} FROM channels
               WHERE ($1 = '' OR name ILIKE $2 OR key = $1 OR id::text = $1)
                 AND ($3::smallint IS NULL OR status = $3)
               ORDER BY priority DESC, id ASC LIMIT $4 OFFSET $5"#,
            CHANNEL_COLUMNS
        ))
        .bind(&keyword)
        .bind(format!("%{}%", keyword))
        .bind(query.status.map(i16::from))
        .bind(page.per_page as i64)
        .bind(page.offset())
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn delete_channels(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_disabled_channels(&self) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM channels WHERE status IN ($1, $2)")
            .bind(i16::from(ChannelStatus::ManuallyDisabled))
            .bind(i16::from(ChannelStatus::AutoDisabled))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
