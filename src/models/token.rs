use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a client token. Stored as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl From<TokenStatus> for i16 {
    fn from(s: TokenStatus) -> i16 {
        match s {
            TokenStatus::Enabled => 1,
            TokenStatus::Disabled => 2,
            TokenStatus::Expired => 3,
            TokenStatus::Exhausted => 4,
        }
    }
}

impl TryFrom<i16> for TokenStatus {
    type Error = String;

    fn try_from(v: i16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(TokenStatus::Enabled),
            2 => Ok(TokenStatus::Disabled),
            3 => Ok(TokenStatus::Expired),
            4 => Ok(TokenStatus::Exhausted),
            other => Err(format!("unknown token status {}", other)),
        }
    }
}

/// Expiry sentinel: the token never expires.
pub const NEVER_EXPIRES: i64 = -1;

/// A client-facing credential bound to a user, carrying its own quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub status: TokenStatus,
    /// Unix seconds.
    pub created_time: i64,
    pub accessed_time: i64,
    /// Unix seconds, or [`NEVER_EXPIRES`].
    pub expired_time: i64,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub used_quota: i64,
    pub remind_threshold: i64,
}

impl Token {
    pub fn new(user_id: i64, name: impl Into<String>, key: impl Into<String>, quota: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: 0,
            user_id,
            key: key.into(),
            name: name.into(),
            status: TokenStatus::Enabled,
            created_time: now,
            accessed_time: now,
            expired_time: NEVER_EXPIRES,
            remain_quota: quota,
            unlimited_quota: false,
            used_quota: 0,
            remind_threshold: 0,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expired_time != NEVER_EXPIRES && self.expired_time < now
    }

    pub fn is_exhausted(&self) -> bool {
        !self.unlimited_quota && self.remain_quota <= 0
    }

    /// Enabled, unexpired and not out of quota.
    pub fn is_usable(&self, now: i64) -> bool {
        self.status == TokenStatus::Enabled && !self.is_expired(now) && !self.is_exhausted()
    }
}

/// Generate a fresh `sk-` prefixed key.
pub fn generate_key() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    let tail: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();
    format!("sk-{}", tail)
}
