use serde::{Deserialize, Serialize};

/// Balance holder owning one or more tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub quota: i64,
    pub used_quota: i64,
    pub remind_threshold: i64,
}
