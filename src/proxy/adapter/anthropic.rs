//! Anthropic Messages API.
//!
//! The request remapper and the stream event state machine are shared with
//! the Bedrock adapter, which carries the same JSON inside AWS framing.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Map, Value};

use super::{read_error, Adapter, ChunkStream};
use crate::errors::{AppError, ChannelError, ChannelErrorKind};
use crate::models::canonical::{
    finish_reason_from_stop, ChatRequest, ChatResponse, Choice, ContentPart, Delta, FunctionCall,
    Message, MessageContent, StreamChunk, ToolCall, Usage,
};
use crate::models::meta::RelayMeta;
use crate::proxy::sse::SseDecoder;
use crate::proxy::upstream::UpstreamClient;

const DEFAULT_API_VERSION: &str = "2023-06-01";
const BEDROCK_API_VERSION: &str = "bedrock-2023-05-31";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const MODELS: &[&str] = &[
    "claude-instant-1.2",
    "claude-2.0",
    "claude-2.1",
    "claude-3-haiku-20240307",
    "claude-3-sonnet-20240229",
    "claude-3-opus-20240229",
    "claude-3-5-sonnet-20240620",
];

pub struct AnthropicAdapter {
    client: UpstreamClient,
}

impl AnthropicAdapter {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn list_models(&self) -> Vec<String> {
        MODELS.iter().map(|m| m.to_string()).collect()
    }

    fn client(&self) -> &UpstreamClient {
        &self.client
    }

    fn build_upstream_url(&self, meta: &RelayMeta) -> Result<String, AppError> {
        let base = meta.base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(AppError::Protocol(format!(
                "channel #{} has no base url",
                meta.channel_id
            )));
        }
        Ok(format!("{}/v1/messages", base))
    }

    fn build_headers(&self, _req: Option<&ChatRequest>, meta: &RelayMeta) -> Result<HeaderMap, AppError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if meta.is_stream {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        let key = HeaderValue::from_str(&meta.api_key).map_err(|_| {
            AppError::Protocol(format!("channel #{} key is not a valid header", meta.channel_id))
        })?;
        headers.insert("x-api-key", key);

        let version = meta
            .config
            .api_version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_API_VERSION);
        let version = HeaderValue::from_str(version)
            .map_err(|_| AppError::Protocol(format!("invalid anthropic-version '{}'", version)))?;
        headers.insert("anthropic-version", version);
        Ok(headers)
    }

    fn convert_request(&self, req: Option<&ChatRequest>, meta: &RelayMeta) -> Result<Value, AppError> {
        let req = req.ok_or_else(|| AppError::Protocol("request is empty".into()))?;
        to_anthropic(req, meta, false)
    }

    async fn convert_response(
        &self,
        resp: reqwest::Response,
        meta: &RelayMeta,
    ) -> Result<(ChatResponse, Usage), AppError> {
        let bytes = resp.bytes().await.map_err(read_error)?;
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Protocol(format!("invalid upstream response: {}", e)))?;
        if body.get("type").and_then(Value::as_str) == Some("error") {
            let raw = String::from_utf8_lossy(&bytes).into_owned();
            return Err(crate::proxy::upstream::upstream_error(502, raw).into());
        }
        from_anthropic_response(&body, meta)
    }

    fn convert_stream(&self, resp: reqwest::Response, meta: &RelayMeta) -> ChunkStream {
        let mut body = resp.bytes_stream();
        let mut state = AnthropicStreamState::new(&meta.request_id, &meta.origin_model);
        Box::pin(async_stream::try_stream! {
            let mut decoder = SseDecoder::new();
            'read: while let Some(next) = body.next().await {
                let bytes = next.map_err(stream_error)?;
                for event in decoder.push(&bytes) {
                    let value: Value = serde_json::from_str(&event.data).map_err(stream_error)?;
                    if let Some(chunk) = state.on_event(&value)? {
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

pub(crate) fn stream_error(e: impl std::fmt::Display) -> AppError {
    AppError::Channel(ChannelError::new(
        ChannelErrorKind::Stream,
        format!("upstream stream failed: {}", e),
    ))
}

/// Translate a canonical request into a Messages API body. The Bedrock
/// flavour carries the model in the URL and picks streaming by endpoint, so
/// neither goes in the body.
pub(crate) fn to_anthropic(req: &ChatRequest, meta: &RelayMeta, bedrock: bool) -> Result<Value, AppError> {
    let mut result = Map::new();
    if bedrock {
        result.insert("anthropic_version".into(), json!(BEDROCK_API_VERSION));
    } else {
        result.insert("model".into(), json!(meta.actual_model));
        if meta.is_stream {
            result.insert("stream".into(), json!(true));
        }
    }
    result.insert(
        "max_tokens".into(),
        json!(req.max_tokens.filter(|n| *n > 0).unwrap_or(DEFAULT_MAX_TOKENS)),
    );

    let mut system = Vec::new();
    let mut messages: Vec<(String, Vec<Value>)> = Vec::new();
    for msg in &req.messages {
        let (role, blocks) = match msg.role.as_str() {
            "system" | "developer" => {
                let text = msg.text_content();
                if !text.is_empty() {
                    system.push(text);
                }
                continue;
            }
            "tool" => ("user", vec![tool_result_block(msg)]),
            "assistant" => ("assistant", assistant_blocks(msg)?),
            _ => ("user", content_blocks(msg)?),
        };
        if blocks.is_empty() {
            continue;
        }
        // Consecutive turns of one role must be merged.
        match messages.last_mut() {
            Some((last, existing)) if last == role => existing.extend(blocks),
            _ => messages.push((role.to_string(), blocks)),
        }
    }

    if !system.is_empty() {
        result.insert("system".into(), json!(system.join("\n")));
    }
    result.insert(
        "messages".into(),
        Value::Array(
            messages
                .into_iter()
                .map(|(role, content)| json!({ "role": role, "content": content }))
                .collect(),
        ),
    );

    if let Some(t) = req.temperature {
        result.insert("temperature".into(), json!(t));
    }
    if let Some(p) = req.top_p {
        result.insert("top_p".into(), json!(p));
    }
    if let Some(stop) = req.stop.clone() {
        result.insert("stop_sequences".into(), json!(stop.into_vec()));
    }
    if let Some(top_k) = req.extra.get("top_k") {
        result.insert("top_k".into(), top_k.clone());
    }

    let tool_choice_none = req.tool_choice.as_ref().and_then(Value::as_str) == Some("none");
    if let Some(tools) = req.tools.as_ref().filter(|t| !t.is_empty() && !tool_choice_none) {
        let tools: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description.clone().unwrap_or_default(),
                    "input_schema": tool.function.parameters.clone().unwrap_or(json!({"type": "object"})),
                })
            })
            .collect();
        result.insert("tools".into(), json!(tools));

        // "auto" | "required" | {"type":"function","function":{"name":..}}
        match req.tool_choice.as_ref() {
            Some(Value::String(s)) if s == "auto" => {
                result.insert("tool_choice".into(), json!({"type": "auto"}));
            }
            Some(Value::String(s)) if s == "required" => {
                result.insert("tool_choice".into(), json!({"type": "any"}));
            }
            Some(tc @ Value::Object(_)) => {
                if let Some(name) = tc.pointer("/function/name") {
                    result.insert("tool_choice".into(), json!({"type": "tool", "name": name}));
                }
            }
            _ => {}
        }
    }

    Ok(Value::Object(result))
}

fn content_blocks(msg: &Message) -> Result<Vec<Value>, AppError> {
    match &msg.content {
        None => Ok(Vec::new()),
        Some(MessageContent::Text(s)) if s.is_empty() => Ok(Vec::new()),
        Some(MessageContent::Text(s)) => Ok(vec![json!({"type": "text", "text": s})]),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter(|p| !matches!(p, ContentPart::Text { text } if text.is_empty()))
            .map(|part| match part {
                ContentPart::Text { text } => Ok(json!({"type": "text", "text": text})),
                ContentPart::ImageUrl { image_url } => Ok(image_block(&image_url.url)),
                ContentPart::Unsupported => Err(AppError::Protocol(format!(
                    "unsupported content part in {} message",
                    msg.role
                ))),
            })
            .collect(),
    }
}

fn image_block(url: &str) -> Value {
    match url.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((header, data)) => {
            let media_type = header.split(';').next().filter(|m| !m.is_empty()).unwrap_or("image/jpeg");
            json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data}
            })
        }
        None => json!({
            "type": "image",
            "source": {"type": "url", "url": url}
        }),
    }
}

fn assistant_blocks(msg: &Message) -> Result<Vec<Value>, AppError> {
    let mut blocks = content_blocks(msg)?;
    for call in msg.tool_calls.iter().flatten() {
        let input: Value = if call.function.arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(&call.function.arguments).map_err(|e| {
                AppError::Protocol(format!("tool call {} has invalid arguments: {}", call.id, e))
            })?
        };
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.function.name,
            "input": input,
        }));
    }
    Ok(blocks)
}

fn tool_result_block(msg: &Message) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
        "content": msg.text_content(),
    })
}

fn usage_from(value: Option<&Value>) -> (u32, u32) {
    let get = |field: &str| {
        value
            .and_then(|u| u.get(field))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    };
    (get("input_tokens"), get("output_tokens"))
}

/// Translate a Messages API response body into the canonical response.
pub(crate) fn from_anthropic_response(body: &Value, meta: &RelayMeta) -> Result<(ChatResponse, Usage), AppError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| AppError::Protocol("upstream response has no content".into()))?;

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => text.push_str(block.get("text").and_then(Value::as_str).unwrap_or("")),
            Some("tool_use") => tool_calls.push(ToolCall {
                id: block.get("id").and_then(Value::as_str).unwrap_or("").to_string(),
                kind: "function".into(),
                function: FunctionCall {
                    name: block.get("name").and_then(Value::as_str).unwrap_or("").to_string(),
                    arguments: block
                        .get("input")
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "{}".into()),
                },
            }),
            _ => {}
        }
    }

    let (input, output) = usage_from(body.get("usage"));
    let usage = if input == 0 && output == 0 {
        Usage::new(meta.prompt_tokens, crate::models::cost::estimate_text_tokens(&text))
    } else {
        Usage::new(input, output)
    };

    let message = Message {
        role: "assistant".into(),
        content: Some(MessageContent::Text(text)),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        ..Default::default()
    };
    let response = ChatResponse {
        id: body
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("chatcmpl-{}", meta.request_id)),
        object: "chat.completion".into(),
        created: chrono::Utc::now().timestamp(),
        model: meta.origin_model.clone(),
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: finish_reason_from_stop(body.get("stop_reason").and_then(Value::as_str))
                .map(String::from),
        }],
        usage: Some(usage),
    };
    Ok((response, usage))
}

/// Turns Messages API stream events into canonical chunks.
pub(crate) struct AnthropicStreamState {
    id: String,
    model: String,
    prompt_tokens: u32,
    /// Anthropic content block index → OpenAI tool call index.
    tool_index: HashMap<u64, usize>,
    done: bool,
}

impl AnthropicStreamState {
    pub(crate) fn new(request_id: &str, model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", request_id),
            model: model.to_string(),
            prompt_tokens: 0,
            tool_index: HashMap::new(),
            done: false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn on_event(&mut self, event: &Value) -> Result<Option<StreamChunk>, AppError> {
        let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "message_start" => {
                let message = event.get("message");
                if let Some(id) = message.and_then(|m| m.get("id")).and_then(Value::as_str) {
                    self.id = id.to_string();
                }
                self.prompt_tokens = usage_from(message.and_then(|m| m.get("usage"))).0;
                let delta = Delta {
                    role: Some("assistant".into()),
                    content: Some(String::new()),
                    ..Default::default()
                };
                Ok(Some(StreamChunk::new(&self.id, &self.model, delta, None)))
            }
            "content_block_start" => {
                let block = event.get("content_block");
                if block.and_then(|b| b.get("type")).and_then(Value::as_str) != Some("tool_use") {
                    return Ok(None);
                }
                let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                let index = self.tool_index.len();
                self.tool_index.insert(block_index, index);
                let field = |name: &str| {
                    block
                        .and_then(|b| b.get(name))
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string()
                };
                let delta = Delta {
                    tool_calls: Some(vec![json!({
                        "index": index,
                        "id": field("id"),
                        "type": "function",
                        "function": {"name": field("name"), "arguments": ""}
                    })]),
                    ..Default::default()
                };
                Ok(Some(StreamChunk::new(&self.id, &self.model, delta, None)))
            }
            "content_block_delta" => {
                let delta = event.get("delta");
                match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.and_then(|d| d.get("text")).and_then(Value::as_str).unwrap_or("");
                        Ok(Some(StreamChunk::text(&self.id, &self.model, text)))
                    }
                    Some("input_json_delta") => {
                        let block_index = event.get("index").and_then(Value::as_u64).unwrap_or(0);
                        let Some(index) = self.tool_index.get(&block_index).copied() else {
                            return Ok(None);
                        };
                        let partial = delta
                            .and_then(|d| d.get("partial_json"))
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        let delta = Delta {
                            tool_calls: Some(vec![json!({
                                "index": index,
                                "function": {"arguments": partial}
                            })]),
                            ..Default::default()
                        };
                        Ok(Some(StreamChunk::new(&self.id, &self.model, delta, None)))
                    }
                    _ => Ok(None),
                }
            }
            "message_delta" => {
                let stop = event.pointer("/delta/stop_reason").and_then(Value::as_str);
                let reason = finish_reason_from_stop(stop).unwrap_or("stop");
                let (input, output) = usage_from(event.get("usage"));
                let prompt = if input > 0 { input } else { self.prompt_tokens };
                Ok(Some(
                    StreamChunk::finish(&self.id, &self.model, reason).with_usage(Usage::new(prompt, output)),
                ))
            }
            "message_stop" => {
                self.done = true;
                Ok(None)
            }
            "error" => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream stream error");
                let mut err = ChannelError::new(ChannelErrorKind::Stream, message);
                err.body = Some(event.to_string());
                Err(err.into())
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::{FunctionDef, ImageUrl, Stop, Tool};
    use crate::models::channel::{Channel, ChannelConfig, ChannelStatus, ProviderKind};
    use futures::TryStreamExt;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta(base_url: &str, stream: bool) -> RelayMeta {
        let channel = Channel {
            id: 7,
            name: "claude".into(),
            provider: ProviderKind::Anthropic,
            key: "sk-ant".into(),
            base_url: base_url.into(),
            models: vec!["claude-3-haiku-20240307".into()],
            model_mapping: Default::default(),
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
            config: ChannelConfig::default(),
        };
        RelayMeta::new("req-9", &channel, "claude-3-haiku-20240307", stream, 12, Duration::from_secs(5))
    }

    #[test]
    fn test_request_remapping() {
        let mut assistant = Message::text("assistant", "let me check");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "call_1".into(),
            kind: "function".into(),
            function: FunctionCall {
                name: "weather".into(),
                arguments: r#"{"city":"Paris"}"#.into(),
            },
        }]);
        let tool_reply = Message {
            role: "tool".into(),
            content: Some(MessageContent::Text("sunny".into())),
            tool_call_id: Some("call_1".into()),
            ..Default::default()
        };
        let req = ChatRequest {
            model: "claude-3-haiku-20240307".into(),
            messages: vec![
                Message::text("system", "be brief"),
                Message::text("user", "hi"),
                Message::text("user", "weather?"),
                assistant,
                tool_reply,
                Message {
                    role: "user".into(),
                    content: Some(MessageContent::Parts(vec![ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/png;base64,AAAA".into(),
                            detail: None,
                        },
                    }])),
                    ..Default::default()
                },
            ],
            stop: Some(Stop::One("END".into())),
            tools: Some(vec![Tool {
                kind: "function".into(),
                function: FunctionDef {
                    name: "weather".into(),
                    description: None,
                    parameters: None,
                },
            }]),
            tool_choice: Some(json!("required")),
            ..Default::default()
        };

        let body = to_anthropic(&req, &meta("", true), false).unwrap();
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stop_sequences"], json!(["END"]));
        assert_eq!(body["tool_choice"], json!({"type": "any"}));
        assert_eq!(body["tools"][0]["input_schema"], json!({"type": "object"}));

        let messages = body["messages"].as_array().unwrap();
        // user+user merged; tool result and image merged into one user turn
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[1]["content"][1]["type"], "tool_use");
        assert_eq!(messages[1]["content"][1]["input"]["city"], "Paris");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][1]["source"]["media_type"], "image/png");

        let bedrock = to_anthropic(&req, &meta("", true), true).unwrap();
        assert_eq!(bedrock["anthropic_version"], "bedrock-2023-05-31");
        assert!(bedrock.get("model").is_none());
        assert!(bedrock.get("stream").is_none());
    }

    #[test]
    fn test_unsupported_part_is_rejected() {
        let req = ChatRequest {
            model: "claude-3-haiku-20240307".into(),
            messages: vec![Message {
                role: "user".into(),
                content: Some(MessageContent::Parts(vec![ContentPart::Unsupported])),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(
            to_anthropic(&req, &meta("", false), false),
            Err(AppError::Protocol(_))
        ));
    }

    #[test]
    fn test_stream_events_to_chunks() {
        let mut state = AnthropicStreamState::new("r", "claude-3-haiku-20240307");
        let events = [
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 25, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hi"}}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "weather"}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"ci"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 15}}),
            json!({"type": "message_stop"}),
        ];
        let chunks: Vec<StreamChunk> = events
            .iter()
            .filter_map(|e| state.on_event(e).unwrap())
            .collect();

        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[0].id, "msg_1");
        assert_eq!(chunks[1].content(), Some("Hi"));
        let call = &chunks[2].choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call["index"], 0);
        assert_eq!(call["function"]["name"], "weather");
        assert_eq!(chunks[4].finish_reason(), Some("tool_calls"));
        assert_eq!(chunks[4].usage, Some(Usage::new(25, 15)));
        assert!(state.is_done());
    }

    #[test]
    fn test_error_event_fails_stream() {
        let mut state = AnthropicStreamState::new("r", "m");
        let err = state
            .on_event(&json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}))
            .unwrap_err();
        match err {
            AppError::Channel(e) => {
                assert_eq!(e.kind, ChannelErrorKind::Stream);
                assert_eq!(e.message, "Overloaded");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_stream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant"))
            .and(header("anthropic-version", "2023-06-01"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "Hello!"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::new(UpstreamClient::new().unwrap());
        let m = meta(&server.uri(), false);
        let req = ChatRequest {
            model: m.origin_model.clone(),
            messages: vec![Message::text("user", "hi")],
            ..Default::default()
        };
        let upstream = crate::proxy::upstream::UpstreamRequest::post_json(
            adapter.build_upstream_url(&m).unwrap(),
            adapter.build_headers(Some(&req), &m).unwrap(),
            &adapter.convert_request(Some(&req), &m).unwrap(),
        )
        .unwrap();
        let resp = adapter.forward(upstream, &m).await.unwrap();
        let (chat, usage) = adapter.convert_response(resp, &m).await.unwrap();
        assert_eq!(chat.choices[0].message.text_content(), "Hello!");
        assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(usage, Usage::new(10, 3));
    }

    #[tokio::test]
    async fn test_error_body_with_success_status_is_channel_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::new(UpstreamClient::new().unwrap());
        let m = meta(&server.uri(), false);
        let resp = reqwest::Client::new().post(server.uri()).send().await.unwrap();
        match adapter.convert_response(resp, &m).await {
            Err(AppError::Channel(e)) => {
                assert_eq!(e.kind, ChannelErrorKind::Status(502));
                assert!(e.is_retryable());
            }
            other => panic!("unexpected {:?}", other.map(|(r, _)| r.id)),
        }
    }

    #[tokio::test]
    async fn test_sse_stream() {
        let server = MockServer::start().await;
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_2\",\"usage\":{\"input_tokens\":4,\"output_tokens\":1}}}\n\n",
            "event: ping\n",
            "data: {\"type\":\"ping\"}\n\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Yo\"}}\n\n",
            "event: message_delta\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "event: message_stop\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter::new(UpstreamClient::new().unwrap());
        let m = meta(&server.uri(), true);
        let resp = reqwest::Client::new().post(server.uri()).send().await.unwrap();
        let chunks: Vec<StreamChunk> = adapter.convert_stream(resp, &m).try_collect().await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].content(), Some("Yo"));
        assert_eq!(chunks[2].usage, Some(Usage::new(4, 2)));
    }
}
