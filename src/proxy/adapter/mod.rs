//! Provider adapters.
//!
//! One [`Adapter`] implementation per provider family. Each translates the
//! canonical request into the provider's wire shape and back. The registry
//! builds the closed set once at startup; the relay looks an adapter up by
//! the channel's [`ProviderKind`] and never matches on provider itself.

pub mod anthropic;
pub mod bedrock;
pub mod openai;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::errors::{AppError, ChannelError};
use crate::models::canonical::{ChatRequest, ChatResponse, ImageRequest, StreamChunk, Usage};
use crate::models::channel::ProviderKind;
use crate::models::cost;
use crate::models::meta::RelayMeta;
use crate::proxy::upstream::{UpstreamClient, UpstreamRequest};

/// Lazy, finite, single-pass sequence of canonical chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, AppError>> + Send + 'static>>;

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Provider identifier.
    fn name(&self) -> &'static str;

    /// Models this provider family is known to serve. No network call.
    fn list_models(&self) -> Vec<String>;

    fn client(&self) -> &UpstreamClient;

    /// Adjust per-call metadata (e.g. resolve the upstream model id).
    fn init(&self, _meta: &mut RelayMeta) {}

    fn build_upstream_url(&self, meta: &RelayMeta) -> Result<String, AppError>;

    fn build_image_url(&self, _meta: &RelayMeta) -> Result<String, AppError> {
        Err(AppError::Protocol(format!(
            "{} channels do not support image generation",
            self.name()
        )))
    }

    fn build_headers(&self, req: Option<&ChatRequest>, meta: &RelayMeta) -> Result<HeaderMap, AppError>;

    fn convert_request(&self, req: Option<&ChatRequest>, meta: &RelayMeta) -> Result<Value, AppError>;

    fn convert_image_request(
        &self,
        _req: Option<&ImageRequest>,
        _meta: &RelayMeta,
    ) -> Result<Value, AppError> {
        Err(AppError::Protocol(format!(
            "{} channels do not support image generation",
            self.name()
        )))
    }

    /// Perform the network call. The body is not touched.
    async fn forward(&self, req: UpstreamRequest, meta: &RelayMeta) -> Result<reqwest::Response, ChannelError> {
        self.client().send(req, meta.timeout).await
    }

    async fn convert_response(
        &self,
        resp: reqwest::Response,
        meta: &RelayMeta,
    ) -> Result<(ChatResponse, Usage), AppError>;

    async fn convert_image_response(&self, resp: reqwest::Response, _meta: &RelayMeta) -> Result<Value, AppError> {
        let bytes = resp.bytes().await.map_err(read_error)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AppError::Protocol(format!("invalid image response: {}", e)))
    }

    fn convert_stream(&self, resp: reqwest::Response, meta: &RelayMeta) -> ChunkStream;
}

/// Body read failures after a 2xx are channel trouble, not translation bugs.
pub(crate) fn read_error(e: reqwest::Error) -> AppError {
    AppError::Channel(ChannelError::new(
        crate::errors::ChannelErrorKind::Stream,
        format!("failed to read upstream body: {}", e),
    ))
}

/// Fill in usage the provider did not report.
pub(crate) fn usage_or_estimate(reported: Option<Usage>, resp: &ChatResponse, meta: &RelayMeta) -> Usage {
    match reported {
        Some(u) if u.prompt_tokens > 0 || u.completion_tokens > 0 => u,
        _ => {
            let completion: u32 = resp
                .choices
                .iter()
                .map(|c| cost::estimate_text_tokens(&c.message.text_content()))
                .sum();
            Usage::new(meta.prompt_tokens, completion)
        }
    }
}

/// The closed set of adapters, one per provider kind.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new(client: UpstreamClient) -> Self {
        let mut adapters: HashMap<ProviderKind, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(
            ProviderKind::OpenAi,
            Arc::new(openai::OpenAiAdapter::new(client.clone())),
        );
        adapters.insert(
            ProviderKind::Azure,
            Arc::new(openai::OpenAiAdapter::azure(client.clone())),
        );
        adapters.insert(
            ProviderKind::Anthropic,
            Arc::new(anthropic::AnthropicAdapter::new(client.clone())),
        );
        adapters.insert(
            ProviderKind::Bedrock,
            Arc::new(bedrock::BedrockAdapter::new(client)),
        );
        Self { adapters }
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn Adapter>, AppError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| AppError::Protocol(format!("no adapter for provider {}", kind.as_str())))
    }
}
