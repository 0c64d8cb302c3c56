//! AWS Bedrock (Claude models) over the InvokeModel API.
//!
//! Bodies are Anthropic Messages JSON. Calls are SigV4-signed, and streamed
//! responses arrive as `application/vnd.amazon.eventstream` frames whose
//! `chunk` payloads wrap base64-encoded Anthropic stream events.

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use super::anthropic::{from_anthropic_response, stream_error, to_anthropic, AnthropicStreamState};
use super::{read_error, Adapter, ChunkStream};
use crate::errors::{AppError, ChannelError, ChannelErrorKind};
use crate::models::canonical::{ChatRequest, ChatResponse, Usage};
use crate::models::meta::RelayMeta;
use crate::proxy::event_stream::EventStreamDecoder;
use crate::proxy::sigv4::{self, AwsCredentials};
use crate::proxy::upstream::{UpstreamClient, UpstreamRequest};

const SERVICE: &str = "bedrock";

/// Canonical model name → Bedrock model id.
const MODEL_IDS: &[(&str, &str)] = &[
    ("claude-instant-1.2", "anthropic.claude-instant-v1"),
    ("claude-2.0", "anthropic.claude-v2"),
    ("claude-2.1", "anthropic.claude-v2:1"),
    ("claude-3-haiku-20240307", "anthropic.claude-3-haiku-20240307-v1:0"),
    ("claude-3-sonnet-20240229", "anthropic.claude-3-sonnet-20240229-v1:0"),
    ("claude-3-opus-20240229", "anthropic.claude-3-opus-20240229-v1:0"),
    ("claude-3-5-sonnet-20240620", "anthropic.claude-3-5-sonnet-20240620-v1:0"),
];

pub fn bedrock_model_id(model: &str) -> Option<&'static str> {
    MODEL_IDS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, id)| *id)
}

pub struct BedrockAdapter {
    client: UpstreamClient,
}

impl BedrockAdapter {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

/// Region precedence: channel config, then the key, then the base URL host.
fn resolve_region(meta: &RelayMeta, creds: Option<&AwsCredentials>) -> Result<String, AppError> {
    meta.config
        .region
        .clone()
        .filter(|r| !r.is_empty())
        .or_else(|| creds.and_then(|c| c.region.clone()))
        .or_else(|| sigv4::extract_region(&meta.base_url))
        .ok_or_else(|| {
            AppError::Protocol(format!("channel #{} has no AWS region configured", meta.channel_id))
        })
}

fn credentials(meta: &RelayMeta) -> Result<AwsCredentials, ChannelError> {
    AwsCredentials::parse(&meta.api_key).ok_or_else(|| {
        ChannelError::status(
            401,
            format!("channel #{} key is not a valid AWS credential pair", meta.channel_id),
        )
    })
}

#[async_trait]
impl Adapter for BedrockAdapter {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn list_models(&self) -> Vec<String> {
        MODEL_IDS.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn client(&self) -> &UpstreamClient {
        &self.client
    }

    fn init(&self, meta: &mut RelayMeta) {
        if let Some(id) = bedrock_model_id(&meta.actual_model) {
            meta.actual_model = id.to_string();
        }
    }

    fn build_upstream_url(&self, meta: &RelayMeta) -> Result<String, AppError> {
        if !meta.actual_model.starts_with("anthropic.") {
            return Err(AppError::Protocol(format!(
                "model {} is not available on bedrock",
                meta.origin_model
            )));
        }
        let base = match meta.base_url.trim_end_matches('/') {
            "" => {
                let creds = AwsCredentials::parse(&meta.api_key);
                format!(
                    "https://bedrock-runtime.{}.amazonaws.com",
                    resolve_region(meta, creds.as_ref())?
                )
            }
            base => base.to_string(),
        };
        let action = if meta.is_stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        Ok(format!(
            "{}/model/{}/{}",
            base,
            urlencoding::encode(&meta.actual_model),
            action
        ))
    }

    /// Auth headers are added by SigV4 signing in [`Adapter::forward`].
    fn build_headers(&self, _req: Option<&ChatRequest>, _meta: &RelayMeta) -> Result<HeaderMap, AppError> {
        Ok(HeaderMap::new())
    }

    fn convert_request(&self, req: Option<&ChatRequest>, meta: &RelayMeta) -> Result<Value, AppError> {
        let req = req.ok_or_else(|| AppError::Protocol("request is empty".into()))?;
        to_anthropic(req, meta, true)
    }

    async fn forward(&self, mut req: UpstreamRequest, meta: &RelayMeta) -> Result<reqwest::Response, ChannelError> {
        let creds = credentials(meta)?;
        let region = resolve_region(meta, Some(&creds))
            .map_err(|e| ChannelError::new(ChannelErrorKind::Connect, e.to_string()))?;

        req.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let accept = if meta.is_stream {
            "application/vnd.amazon.eventstream"
        } else {
            "application/json"
        };
        req.headers.insert(ACCEPT, HeaderValue::from_static(accept));

        sigv4::sign_request(
            req.method.as_str(),
            &req.url,
            &mut req.headers,
            &req.body,
            &creds,
            &region,
            SERVICE,
        )
        .map_err(|e| ChannelError::status(401, e.to_string()))?;

        self.client.send(req, meta.timeout).await
    }

    async fn convert_response(
        &self,
        resp: reqwest::Response,
        meta: &RelayMeta,
    ) -> Result<(ChatResponse, Usage), AppError> {
        let bytes = resp.bytes().await.map_err(read_error)?;
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Protocol(format!("invalid upstream response: {}", e)))?;
        from_anthropic_response(&body, meta)
    }

    fn convert_stream(&self, resp: reqwest::Response, meta: &RelayMeta) -> ChunkStream {
        let mut body = resp.bytes_stream();
        let mut state = AnthropicStreamState::new(&meta.request_id, &meta.origin_model);
        Box::pin(async_stream::try_stream! {
            let mut decoder = EventStreamDecoder::new();
            'read: while let Some(next) = body.next().await {
                let bytes = next.map_err(stream_error)?;
                decoder.push(&bytes);
                while let Some(frame) = decoder.next_frame().map_err(stream_error)? {
                    if frame.is_exception() {
                        let message = serde_json::from_slice::<Value>(&frame.payload)
                            .ok()
                            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
                            .unwrap_or_default();
                        let mut err = ChannelError::new(
                            ChannelErrorKind::Stream,
                            format!("bedrock {}: {}", frame.event_type, message),
                        );
                        err.body = Some(String::from_utf8_lossy(&frame.payload).into_owned());
                        Err::<(), AppError>(AppError::Channel(err))?;
                    }
                    if frame.event_type != "chunk" {
                        continue;
                    }
                    let event = decode_chunk(&frame.payload)?;
                    if let Some(chunk) = state.on_event(&event)? {
                        yield chunk;
                    }
                    if state.is_done() {
                        break 'read;
                    }
                }
            }
        })
    }
}

/// `{"bytes":"<base64 JSON event>"}` → the inner event.
fn decode_chunk(payload: &[u8]) -> Result<Value, AppError> {
    let wrapper: Value = serde_json::from_slice(payload).map_err(stream_error)?;
    let encoded = wrapper
        .get("bytes")
        .and_then(Value::as_str)
        .ok_or_else(|| stream_error("chunk without bytes"))?;
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(stream_error)?;
    serde_json::from_slice(&raw).map_err(stream_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::{Message, StreamChunk};
    use crate::models::channel::{Channel, ChannelConfig, ChannelStatus, ProviderKind};
    use crate::proxy::event_stream::encode_frame;
    use futures::TryStreamExt;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta(base_url: &str, key: &str, stream: bool) -> RelayMeta {
        let channel = Channel {
            id: 3,
            name: "aws".into(),
            provider: ProviderKind::Bedrock,
            key: key.into(),
            base_url: base_url.into(),
            models: vec!["claude-3-5-sonnet-20240620".into()],
            model_mapping: Default::default(),
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
            config: ChannelConfig::default(),
        };
        RelayMeta::new("req-b", &channel, "claude-3-5-sonnet-20240620", stream, 8, Duration::from_secs(5))
    }

    fn event_frame(event: Value) -> Vec<u8> {
        let wrapped = json!({
            "bytes": base64::engine::general_purpose::STANDARD.encode(event.to_string())
        });
        encode_frame(
            &[
                (":event-type", "chunk"),
                (":content-type", "application/json"),
                (":message-type", "event"),
            ],
            wrapped.to_string().as_bytes(),
        )
    }

    #[test]
    fn test_url_uses_mapped_model_and_region() {
        let adapter = BedrockAdapter::new(UpstreamClient::new().unwrap());
        let mut m = meta("", "AKID|SECRET|eu-west-1", true);
        adapter.init(&mut m);
        assert_eq!(m.actual_model, "anthropic.claude-3-5-sonnet-20240620-v1:0");
        assert_eq!(
            adapter.build_upstream_url(&m).unwrap(),
            "https://bedrock-runtime.eu-west-1.amazonaws.com/model/anthropic.claude-3-5-sonnet-20240620-v1%3A0/invoke-with-response-stream"
        );
    }

    #[test]
    fn test_missing_region_is_protocol_error() {
        let adapter = BedrockAdapter::new(UpstreamClient::new().unwrap());
        let mut m = meta("", "AKID|SECRET", false);
        adapter.init(&mut m);
        assert!(matches!(adapter.build_upstream_url(&m), Err(AppError::Protocol(_))));
    }

    #[test]
    fn test_unknown_model_is_rejected() {
        let adapter = BedrockAdapter::new(UpstreamClient::new().unwrap());
        let mut m = meta("", "AKID|SECRET|us-east-1", false);
        m.actual_model = "gpt-4o".into();
        adapter.init(&mut m);
        assert!(matches!(adapter.build_upstream_url(&m), Err(AppError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_bad_credentials_fail_over() {
        let adapter = BedrockAdapter::new(UpstreamClient::new().unwrap());
        let m = meta("http://127.0.0.1:9", "not-a-credential", false);
        let req = UpstreamRequest::post_json("http://127.0.0.1:9/x".into(), HeaderMap::new(), &json!({})).unwrap();
        let err = adapter.forward(req, &m).await.unwrap_err();
        assert_eq!(err.kind, ChannelErrorKind::Status(401));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_signed_invoke_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/model/anthropic.claude-3-5-sonnet-20240620-v1%3A0/invoke"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-date"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_b",
                "content": [{"type": "text", "text": "from bedrock"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 6, "output_tokens": 2}
            })))
            .mount(&server)
            .await;

        let adapter = BedrockAdapter::new(UpstreamClient::new().unwrap());
        let mut m = meta(&server.uri(), "AKID|SECRET|us-east-1", false);
        adapter.init(&mut m);
        let req = ChatRequest {
            model: m.origin_model.clone(),
            messages: vec![Message::text("user", "hi")],
            ..Default::default()
        };
        let upstream = UpstreamRequest::post_json(
            adapter.build_upstream_url(&m).unwrap(),
            adapter.build_headers(Some(&req), &m).unwrap(),
            &adapter.convert_request(Some(&req), &m).unwrap(),
        )
        .unwrap();
        let resp = adapter.forward(upstream, &m).await.unwrap();
        let (chat, usage) = adapter.convert_response(resp, &m).await.unwrap();
        assert_eq!(chat.choices[0].message.text_content(), "from bedrock");
        assert_eq!(usage, Usage::new(6, 2));
    }

    #[tokio::test]
    async fn test_event_stream_chunks() {
        let mut body = Vec::new();
        body.extend(event_frame(json!({"type": "message_start", "message": {"id": "msg_s", "usage": {"input_tokens": 5}}})));
        body.extend(event_frame(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "a"}})));
        body.extend(event_frame(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "b"}})));
        body.extend(event_frame(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}})));
        body.extend(event_frame(json!({"type": "message_stop"})));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/vnd.amazon.eventstream"))
            .mount(&server)
            .await;

        let adapter = BedrockAdapter::new(UpstreamClient::new().unwrap());
        let m = meta(&server.uri(), "AKID|SECRET|us-east-1", true);
        let resp = reqwest::Client::new().post(server.uri()).send().await.unwrap();
        let chunks: Vec<StreamChunk> = adapter.convert_stream(resp, &m).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[2].content(), Some("b"));
        assert_eq!(chunks[3].usage, Some(Usage::new(5, 2)));
    }

    #[tokio::test]
    async fn test_exception_frame_fails_stream() {
        let mut body = event_frame(json!({"type": "message_start", "message": {"id": "m"}}));
        body.extend(encode_frame(
            &[
                (":exception-type", "throttlingException"),
                (":message-type", "exception"),
            ],
            br#"{"message":"Too many requests"}"#,
        ));

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/vnd.amazon.eventstream"))
            .mount(&server)
            .await;

        let adapter = BedrockAdapter::new(UpstreamClient::new().unwrap());
        let m = meta(&server.uri(), "AKID|SECRET|us-east-1", true);
        let resp = reqwest::Client::new().post(server.uri()).send().await.unwrap();
        let results: Vec<Result<StreamChunk, AppError>> = adapter.convert_stream(resp, &m).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(AppError::Channel(e)) => {
                assert_eq!(e.kind, ChannelErrorKind::Stream);
                assert!(e.message.contains("Too many requests"));
            }
            other => panic!("unexpected {:?}", other.as_ref().map(|c| c.id.clone())),
        }
    }
}
