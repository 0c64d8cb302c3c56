use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use super::{read_error, usage_or_estimate, Adapter, ChunkStream};
use crate::errors::{AppError, ChannelError, ChannelErrorKind};
use crate::models::canonical::{
    ChatRequest, ChatResponse, ContentPart, ImageRequest, MessageContent, StreamChunk, Usage,
};
use crate::models::meta::RelayMeta;
use crate::proxy::sse::SseDecoder;
use crate::proxy::upstream::UpstreamClient;

const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

const MODELS: &[&str] = &[
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4-turbo",
    "gpt-4",
    "gpt-3.5-turbo",
    "dall-e-2",
    "dall-e-3",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    OpenAi,
    Azure,
}

/// OpenAI-compatible pass-through. The Azure flavour only differs in URL
/// layout and auth header.
pub struct OpenAiAdapter {
    client: UpstreamClient,
    flavor: Flavor,
}

impl OpenAiAdapter {
    pub fn new(client: UpstreamClient) -> Self {
        Self {
            client,
            flavor: Flavor::OpenAi,
        }
    }

    pub fn azure(client: UpstreamClient) -> Self {
        Self {
            client,
            flavor: Flavor::Azure,
        }
    }

    fn base_url<'a>(&self, meta: &'a RelayMeta) -> Result<&'a str, AppError> {
        let base = meta.base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(AppError::Protocol(format!(
                "channel #{} has no base url",
                meta.channel_id
            )));
        }
        Ok(base)
    }

    fn azure_url(&self, meta: &RelayMeta, operation: &str) -> Result<String, AppError> {
        let api_version = meta
            .config
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_AZURE_API_VERSION);
        Ok(format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.base_url(meta)?,
            meta.actual_model,
            operation,
            api_version
        ))
    }
}

fn reject_unsupported_parts(req: &ChatRequest) -> Result<(), AppError> {
    for msg in &req.messages {
        if let Some(MessageContent::Parts(parts)) = &msg.content {
            if parts.iter().any(|p| matches!(p, ContentPart::Unsupported)) {
                return Err(AppError::Protocol(format!(
                    "unsupported content part in {} message",
                    msg.role
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        match self.flavor {
            Flavor::OpenAi => "openai",
            Flavor::Azure => "azure",
        }
    }

    fn list_models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn client(&self) -> &UpstreamClient {
        &self.client
    }

    fn init(&self, meta: &mut RelayMeta) {
        // Azure deployment names cannot contain dots: gpt-3.5-turbo → gpt-35-turbo
        if self.flavor == Flavor::Azure {
            meta.actual_model = meta.actual_model.replace('.', "");
        }
    }

    fn build_upstream_url(&self, meta: &RelayMeta) -> Result<String, AppError> {
        match self.flavor {
            Flavor::OpenAi => Ok(format!("{}/v1/chat/completions", self.base_url(meta)?)),
            Flavor::Azure => self.azure_url(meta, "chat/completions"),
        }
    }

    fn build_image_url(&self, meta: &RelayMeta) -> Result<String, AppError> {
        match self.flavor {
            Flavor::OpenAi => Ok(format!("{}/v1/images/generations", self.base_url(meta)?)),
            Flavor::Azure => self.azure_url(meta, "images/generations"),
        }
    }

    fn build_headers(&self, _req: Option<&ChatRequest>, meta: &RelayMeta) -> Result<HeaderMap, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if meta.is_stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        let invalid = |_| AppError::Protocol(format!("channel #{} key is not a valid header", meta.channel_id));
        match self.flavor {
            Flavor::OpenAi => {
                let value = HeaderValue::from_str(&format!("Bearer {}", meta.api_key)).map_err(invalid)?;
                headers.insert(AUTHORIZATION, value);
            }
            Flavor::Azure => {
                let value = HeaderValue::from_str(&meta.api_key).map_err(invalid)?;
                headers.insert("api-key", value);
            }
        }
        Ok(headers)
    }

    fn convert_request(&self, req: Option<&ChatRequest>, meta: &RelayMeta) -> Result<Value, AppError> {
        let req = req.ok_or_else(|| AppError::Protocol("request is empty".into()))?;
        reject_unsupported_parts(req)?;

        let mut body = serde_json::to_value(req)
            .map_err(|e| AppError::Protocol(format!("failed to encode request: {}", e)))?;
        body["model"] = json!(meta.actual_model);
        if meta.is_stream {
            body["stream"] = json!(true);
            // Ask for a trailing usage chunk unless the caller already chose.
            if body.get("stream_options").is_none() {
                body["stream_options"] = json!({ "include_usage": true });
            }
        }
        Ok(body)
    }

    fn convert_image_request(&self, req: Option<&ImageRequest>, meta: &RelayMeta) -> Result<Value, AppError> {
        let req = req.ok_or_else(|| AppError::Protocol("request is empty".into()))?;
        let mut body = serde_json::to_value(req)
            .map_err(|e| AppError::Protocol(format!("failed to encode request: {}", e)))?;
        body["model"] = json!(meta.actual_model);
        Ok(body)
    }

    async fn convert_response(
        &self,
        resp: reqwest::Response,
        meta: &RelayMeta,
    ) -> Result<(ChatResponse, Usage), AppError> {
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await.map_err(read_error)?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Protocol(format!("invalid upstream response: {}", e)))?;

        if value.get("error").is_some_and(|e| !e.is_null()) {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            let code = if status >= 400 { status } else { 502 };
            return Err(crate::proxy::upstream::upstream_error(code, body).into());
        }

        let response: ChatResponse = serde_json::from_value(value)
            .map_err(|e| AppError::Protocol(format!("invalid upstream response: {}", e)))?;
        let usage = usage_or_estimate(response.usage, &response, meta);
        Ok((response, usage))
    }

    fn convert_stream(&self, resp: reqwest::Response, _meta: &RelayMeta) -> ChunkStream {
        let mut body = resp.bytes_stream();
        Box::pin(async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            'read: while let Some(next) = body.next().await {
                let bytes = next.map_err(|e| {
                    AppError::Channel(ChannelError::new(ChannelErrorKind::Stream, e.to_string()))
                })?;
                for event in decoder.push(&bytes) {
                    if event.is_done() {
                        break 'read;
                    }
                    yield parse_chunk(&event.data)?;
                }
            }
            if let Some(event) = decoder.finish() {
                if !event.is_done() {
                    yield parse_chunk(&event.data)?;
                }
            }
        })
    }
}

fn parse_chunk(data: &str) -> Result<StreamChunk, AppError> {
    let value: Value = serde_json::from_str(data).map_err(|e| {
        AppError::Channel(ChannelError::new(
            ChannelErrorKind::Stream,
            format!("malformed stream chunk: {}", e),
        ))
    })?;
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let mut e = ChannelError::new(
            ChannelErrorKind::Stream,
            err.get("message")
                .and_then(Value::as_str)
                .unwrap_or("upstream stream error")
                .to_string(),
        );
        e.body = Some(data.to_string());
        return Err(e.into());
    }
    serde_json::from_value(value).map_err(|e| {
        AppError::Channel(ChannelError::new(
            ChannelErrorKind::Stream,
            format!("malformed stream chunk: {}", e),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::Message;
    use crate::models::channel::{Channel, ChannelConfig, ChannelStatus, ProviderKind};
    use futures::TryStreamExt;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta(provider: ProviderKind, base_url: &str, stream: bool) -> RelayMeta {
        let channel = Channel {
            id: 1,
            name: "c".into(),
            provider,
            key: "sk-upstream".into(),
            base_url: base_url.into(),
            models: vec!["gpt-3.5-turbo".into()],
            model_mapping: Default::default(),
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
            config: ChannelConfig {
                region: None,
                api_version: Some("2024-06-01".into()),
            },
        };
        RelayMeta::new("req-1", &channel, "gpt-3.5-turbo", stream, 10, Duration::from_secs(5))
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "gpt-3.5-turbo".into(),
            messages: vec![Message::text("user", "hi")],
            ..Default::default()
        }
    }

    #[test]
    fn test_azure_url_and_header() {
        let adapter = OpenAiAdapter::azure(UpstreamClient::new().unwrap());
        let mut m = meta(ProviderKind::Azure, "https://res.openai.azure.com/", false);
        adapter.init(&mut m);
        assert_eq!(
            adapter.build_upstream_url(&m).unwrap(),
            "https://res.openai.azure.com/openai/deployments/gpt-35-turbo/chat/completions?api-version=2024-06-01"
        );
        let headers = adapter.build_headers(None, &m).unwrap();
        assert_eq!(headers.get("api-key").unwrap(), "sk-upstream");
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_missing_base_url_is_protocol_error() {
        let adapter = OpenAiAdapter::azure(UpstreamClient::new().unwrap());
        let m = meta(ProviderKind::Azure, "", false);
        assert!(matches!(adapter.build_upstream_url(&m), Err(AppError::Protocol(_))));
    }

    #[test]
    fn test_convert_request_rejects_absent_and_unsupported() {
        let adapter = OpenAiAdapter::new(UpstreamClient::new().unwrap());
        let m = meta(ProviderKind::OpenAi, "", true);
        assert!(matches!(adapter.convert_request(None, &m), Err(AppError::Protocol(_))));

        let mut req = request();
        req.messages[0].content = Some(MessageContent::Parts(vec![ContentPart::Unsupported]));
        assert!(matches!(adapter.convert_request(Some(&req), &m), Err(AppError::Protocol(_))));

        let body = adapter.convert_request(Some(&request()), &m).unwrap();
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[tokio::test]
    async fn test_round_trip_against_fake_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/gpt-35-turbo/chat/completions"))
            .and(query_param("api-version", "2024-06-01"))
            .and(header("api-key", "sk-upstream"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-35-turbo",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 9, "completion_tokens": 2, "total_tokens": 11}
            })))
            .mount(&server)
            .await;

        let adapter = OpenAiAdapter::azure(UpstreamClient::new().unwrap());
        let mut m = meta(ProviderKind::Azure, &server.uri(), false);
        adapter.init(&mut m);
        let body = adapter.convert_request(Some(&request()), &m).unwrap();
        let req = crate::proxy::upstream::UpstreamRequest::post_json(
            adapter.build_upstream_url(&m).unwrap(),
            adapter.build_headers(None, &m).unwrap(),
            &body,
        )
        .unwrap();
        let resp = adapter.forward(req, &m).await.unwrap();
        let (chat, usage) = adapter.convert_response(resp, &m).await.unwrap();
        assert_eq!(chat.choices[0].message.text_content(), "hello");
        assert_eq!(usage, Usage::new(9, 2));
    }

    #[tokio::test]
    async fn test_stream_parses_chunks_until_done() {
        let server = MockServer::start().await;
        let sse = concat!(
            "data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n\n",
            "data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c\",\"model\":\"m\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let resp = reqwest::Client::new().post(server.uri()).send().await.unwrap();
        let adapter = OpenAiAdapter::new(UpstreamClient::new().unwrap());
        let m = meta(ProviderKind::OpenAi, &server.uri(), true);
        let chunks: Vec<StreamChunk> = adapter.convert_stream(resp, &m).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].finish_reason(), Some("stop"));
        assert_eq!(chunks[2].usage, Some(Usage::new(3, 2)));
    }
}
