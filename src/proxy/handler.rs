use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::AppError;
use crate::middleware::auth;
use crate::middleware::rate_limit::RateLimitClass;
use crate::models::canonical::{ChatRequest, ImageRequest};
use crate::models::token::Token;
use crate::proxy::relay::ChatReply;
use crate::AppState;

/// Authenticate, then charge the api-class rate limit to the token. Token
/// status writes only happen once the request is admitted.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Token, AppError> {
    let auth = auth::authenticate(headers, &state.cache, &state.ledger).await?;
    check_rate(state, RateLimitClass::Api, &format!("token:{}", auth.token.id)).await?;
    auth.admit(&state.cache, &state.ledger).await
}

async fn check_rate(state: &AppState, class: RateLimitClass, identity: &str) -> Result<(), AppError> {
    let result = state.rate_limiter.check(class, identity).await;
    if let Err(AppError::RateLimit { .. }) = &result {
        state.metrics.record_rate_limited(class.as_str());
    }
    result
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(|e| AppError::Protocol(format!("invalid request body: {}", e)))
}

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let token = authorize(&state, &headers).await?;
    let req: ChatRequest = parse_body(&body)?;

    match state.relay.chat(&token, req).await? {
        ChatReply::Complete(resp) => Ok(Json(resp).into_response()),
        ChatReply::Stream(body) => {
            let mut resp = Response::new(body);
            let h = resp.headers_mut();
            h.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            h.insert("x-accel-buffering", HeaderValue::from_static("no"));
            Ok(resp)
        }
    }
}

/// `POST /v1/images/generations`
pub async fn image_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let token = authorize(&state, &headers).await?;
    let req: ImageRequest = parse_body(&body)?;
    let resp = state.relay.images(&token, req).await?;
    Ok(Json(resp).into_response())
}

/// `GET /v1/models`: models served by at least one enabled channel.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state, &headers).await?;
    let data: Vec<serde_json::Value> = state
        .channels
        .enabled_models()
        .await
        .into_iter()
        .map(|id| json!({ "id": id, "object": "model", "created": 0, "owned_by": "relay" }))
        .collect();
    Ok(Json(json!({ "object": "list", "data": data })))
}

/// `GET /api/status`: public, web-class rate limited by client address.
pub async fn status(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ip = connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    check_rate(&state, RateLimitClass::Web, &format!("ip:{}", ip)).await?;

    Ok(Json(json!({
        "success": true,
        "data": {
            "version": env!("CARGO_PKG_VERSION"),
            "quota_per_unit": state.config.quota_per_unit,
            "batch_update_enabled": state.config.batch_update_enabled,
            "distributed_cache": state.cache.is_distributed(),
        }
    })))
}

/// `GET /metrics`
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

pub async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TieredCache;
    use crate::config::{Config, RateLimitRule};
    use crate::models::token::TokenStatus;
    use crate::models::user::User;
    use crate::notification::LogNotifier;
    use crate::proxy::upstream::UpstreamClient;
    use crate::store::memory::MemoryStore;
    use crate::store::{AdminStore, RelayStore};

    async fn state_with_drained_token(api: RateLimitRule) -> (AppState, Arc<MemoryStore>, i64) {
        let store = Arc::new(MemoryStore::new());
        let uid = store
            .insert_user(&User {
                id: 0,
                username: "drained".into(),
                email: None,
                quota: 1_000,
                used_quota: 0,
                remind_threshold: 0,
            })
            .await
            .unwrap();
        let tid = store
            .insert_token(&Token::new(uid, "drained", "sk-drained", 0))
            .await
            .unwrap();
        let mut config = Config::default();
        config.rate_limits.api = api;
        let state = AppState::new(
            config,
            store.clone(),
            TieredCache::in_memory(),
            Arc::new(LogNotifier),
            UpstreamClient::new().unwrap(),
        )
        .unwrap();
        (state, store, tid)
    }

    fn bearer(key: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", key)).unwrap(),
        );
        h
    }

    #[tokio::test]
    async fn test_rate_limited_request_leaves_token_status_alone() {
        let (state, store, tid) =
            state_with_drained_token(RateLimitRule { count: 1, window_secs: 60 }).await;
        state
            .rate_limiter
            .check(RateLimitClass::Api, &format!("token:{}", tid))
            .await
            .unwrap();

        let err = authorize(&state, &bearer("sk-drained")).await.unwrap_err();
        assert!(matches!(err, AppError::RateLimit { .. }));
        let token = store.get_token(tid).await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Enabled);
    }

    #[tokio::test]
    async fn test_admitted_drained_token_is_marked_exhausted() {
        let (state, store, tid) =
            state_with_drained_token(RateLimitRule { count: 5, window_secs: 60 }).await;

        let err = authorize(&state, &bearer("sk-drained")).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
        let token = store.get_token(tid).await.unwrap().unwrap();
        assert_eq!(token.status, TokenStatus::Exhausted);

        // The cached record was dropped, so the stored status is what rejects now.
        let cached: Option<Token> = state.cache.get(&auth::cache_key("sk-drained")).await;
        assert!(cached.is_none());
        let err = authorize(&state, &bearer("sk-drained")).await.unwrap_err();
        assert!(matches!(err, AppError::Auth(_)));
    }
}
