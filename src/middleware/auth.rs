use axum::http::HeaderMap;

use crate::cache::TieredCache;
use crate::errors::AppError;
use crate::middleware::quota::{QuotaLedger, TokenRejection};
use crate::models::token::Token;
use crate::store::RelayStore;

/// Seconds a resolved token record stays in the cache.
pub const TOKEN_CACHE_TTL_SECS: u64 = 60;

pub(crate) fn cache_key(key: &str) -> String {
    format!("token:{}", key)
}

/// Pull the `sk-` key out of `Authorization: Bearer ...`. Keys sent with a
/// `-channel` suffix (the upstream convention for pinning) are accepted and
/// the suffix ignored.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Auth("missing authorization header".into()))?;

    let key = auth
        .strip_prefix("Bearer ")
        .ok_or_else(|| AppError::Auth("authorization must be a bearer token".into()))?
        .trim();
    let key = key.split('-').take(2).collect::<Vec<_>>().join("-");
    if !key.starts_with("sk-") || key.len() <= 3 {
        return Err(AppError::Auth("malformed token key".into()));
    }
    Ok(key)
}

/// Resolve a key to its token record, cache first.
pub async fn resolve_token(
    cache: &TieredCache,
    store: &dyn RelayStore,
    key: &str,
) -> Result<Token, AppError> {
    let ck = cache_key(key);
    if let Some(token) = cache.get::<Token>(&ck).await {
        return Ok(token);
    }

    let token = store
        .get_token_by_key(key)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::Auth("invalid token".into()))?;

    if let Err(e) = cache.set(&ck, &token, TOKEN_CACHE_TTL_SECS).await {
        tracing::warn!(token_id = token.id, "failed to cache token: {}", e);
    }
    Ok(token)
}

/// A resolved token with its validation verdict. Nothing has been written
/// to the store yet.
pub struct Authenticated {
    pub token: Token,
    verdict: Result<(), TokenRejection>,
}

impl Authenticated {
    /// Hand back the token when usable. Otherwise persist any lapse found
    /// during validation and drop the cached record.
    pub async fn admit(self, cache: &TieredCache, ledger: &QuotaLedger) -> Result<Token, AppError> {
        let Authenticated { token, verdict } = self;
        match verdict {
            Ok(()) => Ok(token),
            Err(rejection) => {
                // A stale cached record must not keep rejecting after an update.
                let _ = cache.invalidate(&cache_key(&token.key)).await;
                Err(ledger.reject(&token, rejection).await)
            }
        }
    }
}

/// Authenticate a request: extract, resolve, validate. Lapsed tokens are
/// only marked by [`Authenticated::admit`].
pub async fn authenticate(
    headers: &HeaderMap,
    cache: &TieredCache,
    ledger: &QuotaLedger,
) -> Result<Authenticated, AppError> {
    let key = extract_bearer_token(headers)?;
    let token = resolve_token(cache, ledger.store().as_ref(), &key).await?;
    let verdict = ledger.validate_token(&token);
    Ok(Authenticated { token, verdict })
}
