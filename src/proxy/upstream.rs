//! HTTP client for forwarding requests to upstream providers.
//!
//! No retries happen here: a failed call surfaces as a [`ChannelError`] and
//! the failover controller decides whether another channel gets a turn.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;

use crate::errors::{ChannelError, ChannelErrorKind};

/// A fully built upstream call.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamRequest {
    pub fn post_json(url: String, headers: HeaderMap, body: &Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::POST,
            url,
            headers,
            body: Bytes::from(serde_json::to_vec(body)?),
        })
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Send the request and wait for response headers. `timeout` bounds only
    /// the wait for headers; streamed bodies are bounded by the relay deadline.
    pub async fn send(
        &self,
        req: UpstreamRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, ChannelError> {
        let call = self
            .client
            .request(req.method, &req.url)
            .headers(req.headers)
            .body(req.body)
            .send();

        let resp = match tokio::time::timeout(timeout, call).await {
            Err(_) => {
                return Err(ChannelError::new(
                    ChannelErrorKind::Timeout,
                    format!("no response within {}s", timeout.as_secs()),
                ))
            }
            Ok(Err(e)) => return Err(classify(&e)),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(status = status.as_u16(), "upstream returned error status");
        Err(upstream_error(status.as_u16(), body))
    }
}

fn classify(e: &reqwest::Error) -> ChannelError {
    let kind = if e.is_timeout() {
        ChannelErrorKind::Timeout
    } else {
        ChannelErrorKind::Connect
    };
    ChannelError::new(kind, format!("upstream request failed: {}", e))
}

/// Build a status error keeping the body verbatim, with the provider's own
/// message lifted into ours when the body has one of the usual shapes:
/// `{"error":{"message":..}}`, `{"error":".."}` or `{"message":..}`.
pub fn upstream_error(status: u16, body: String) -> ChannelError {
    let detail = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
        v.pointer("/error/message")
            .or_else(|| v.get("error").filter(|e| e.is_string()))
            .or_else(|| v.get("message"))
            .or_else(|| v.get("Message"))
            .and_then(Value::as_str)
            .map(String::from)
    });
    let mut err = ChannelError::status(status, body);
    if let Some(detail) = detail {
        err.message = format!("upstream returned status {}: {}", status, detail);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_error_message_shapes() {
        let e = upstream_error(429, r#"{"error":{"message":"slow down","type":"rate"}}"#.into());
        assert!(e.message.ends_with("slow down"));
        assert_eq!(e.kind, ChannelErrorKind::Status(429));

        let e = upstream_error(400, r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#.into());
        assert!(e.message.ends_with("bad"));

        let e = upstream_error(403, r#"{"message":"The security token included in the request is invalid."}"#.into());
        assert!(e.message.contains("security token"));

        let e = upstream_error(502, "<html>bad gateway</html>".into());
        assert_eq!(e.message, "upstream returned status 502");
        assert_eq!(e.body.as_deref(), Some("<html>bad gateway</html>"));
    }

    #[tokio::test]
    async fn test_non_2xx_keeps_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new().unwrap();
        let req = UpstreamRequest::post_json(
            format!("{}/v1/chat/completions", server.uri()),
            HeaderMap::new(),
            &serde_json::json!({}),
        )
        .unwrap();
        let err = client.send(req, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Status(503));
        assert_eq!(err.body.as_deref(), Some("overloaded"));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = UpstreamClient::new().unwrap();
        let req = UpstreamRequest::post_json(server.uri(), HeaderMap::new(), &serde_json::json!({}))
            .unwrap();
        let err = client.send(req, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_error() {
        let client = UpstreamClient::new().unwrap();
        let req = UpstreamRequest::post_json(
            "http://127.0.0.1:9/unreachable".into(),
            HeaderMap::new(),
            &serde_json::json!({}),
        )
        .unwrap();
        let err = client.send(req, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Connect);
    }
}
