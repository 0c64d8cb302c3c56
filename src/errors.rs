use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// How an upstream call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelErrorKind {
    Timeout,
    Connect,
    /// Upstream answered with a non-2xx status.
    Status(u16),
    /// The stream broke after the upstream had accepted the call.
    Stream,
}

/// Failure attributed to a channel. Carries enough to decide on failover and
/// to surface the upstream's own diagnostics to the caller.
#[derive(Debug, Clone)]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub message: String,
    /// Verbatim upstream error body, when one was received.
    pub body: Option<String>,
    pub channel_id: Option<i64>,
    /// Channels tried before giving up. Set by the failover controller.
    pub attempts: u32,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            body: None,
            channel_id: None,
            attempts: 0,
        }
    }

    pub fn status(code: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            kind: ChannelErrorKind::Status(code),
            message: format!("upstream returned status {}", code),
            body: Some(body),
            channel_id: None,
            attempts: 0,
        }
    }

    pub fn with_channel(mut self, channel_id: i64) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Whether another channel could plausibly serve the same request.
    /// Bad requests (400, 404, 413, 422, ...) will fail identically elsewhere.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            ChannelErrorKind::Timeout | ChannelErrorKind::Connect | ChannelErrorKind::Stream => true,
            ChannelErrorKind::Status(code) => {
                code == 401 || code == 403 || code == 408 || code == 429 || code >= 500
            }
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self.kind {
            ChannelErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ChannelErrorKind::Connect | ChannelErrorKind::Stream => StatusCode::BAD_GATEWAY,
            ChannelErrorKind::Status(code) => {
                StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(id) = self.channel_id {
            write!(f, " (channel #{})", id)?;
        }
        if self.attempts > 0 {
            write!(f, " after {} channel(s)", self.attempts)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChannelError {}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("insufficient quota: {0}")]
    Quota(String),

    #[error("rate limit exceeded for {class}")]
    RateLimit { class: &'static str, retry_after_secs: u64 },

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no available channel for model {0}")]
    NoChannel(String),

    #[error("relay timed out")]
    Timeout,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Machine-readable kind, also used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "auth_error",
            AppError::Quota(_) => "quota_error",
            AppError::RateLimit { .. } => "rate_limit_error",
            AppError::Channel(_) => "channel_error",
            AppError::Protocol(_) => "protocol_error",
            AppError::NoChannel(_) => "no_channel",
            AppError::Timeout => "timeout_error",
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Auth(_) => StatusCode::UNAUTHORIZED,
            AppError::Quota(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Channel(e) => e.http_status(),
            AppError::Protocol(_) => StatusCode::BAD_REQUEST,
            AppError::NoChannel(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut upstream: Option<String> = None;
        let (status, code, msg) = match &self {
            AppError::Auth(m) => (StatusCode::UNAUTHORIZED, "invalid_token", m.clone()),
            AppError::Quota(m) => (StatusCode::PAYMENT_REQUIRED, "insufficient_quota", m.clone()),
            AppError::RateLimit { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                self.to_string(),
            ),
            AppError::Channel(e) => {
                upstream = e.body.clone();
                (e.http_status(), "upstream_failed", e.to_string())
            }
            AppError::Protocol(m) => (StatusCode::BAD_REQUEST, "invalid_request", m.clone()),
            AppError::NoChannel(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "model_not_available",
                self.to_string(),
            ),
            AppError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "relay_timeout",
                "relay timed out".to_string(),
            ),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let mut error = json!({
            "message": msg,
            "type": self.kind(),
            "code": code,
        });
        if let Some(body) = upstream {
            error["upstream"] = json!(body);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();

        if let AppError::RateLimit { retry_after_secs, .. } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", v);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_by_kind() {
        assert!(ChannelError::new(ChannelErrorKind::Timeout, "t").is_retryable());
        assert!(ChannelError::new(ChannelErrorKind::Connect, "c").is_retryable());
        assert!(ChannelError::status(429, "{}").is_retryable());
        assert!(ChannelError::status(503, "{}").is_retryable());
        assert!(ChannelError::status(401, "{}").is_retryable());
        assert!(!ChannelError::status(400, "{}").is_retryable());
        assert!(!ChannelError::status(404, "{}").is_retryable());
    }

    #[tokio::test]
    async fn test_channel_error_envelope_keeps_upstream_status_and_body() {
        let err = AppError::Channel(
            ChannelError::status(418, r#"{"error":"teapot"}"#)
                .with_channel(7)
                .with_attempts(2),
        );
        let resp = err.into_response();
        assert_eq!(resp.status().as_u16(), 418);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "channel_error");
        assert_eq!(body["error"]["upstream"], r#"{"error":"teapot"}"#);
        assert!(body["error"]["message"].as_str().unwrap().contains("after 2 channel(s)"));
    }

    #[test]
    fn test_rate_limit_sets_retry_after() {
        let resp = AppError::RateLimit { class: "api", retry_after_secs: 42 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "42");
    }
}
