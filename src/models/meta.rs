use std::time::Duration;

use crate::models::channel::{Channel, ChannelConfig, ProviderKind};

/// Per-call routing metadata handed to every adapter method.
#[derive(Debug, Clone)]
pub struct RelayMeta {
    pub request_id: String,
    pub channel_id: i64,
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key: String,
    pub config: ChannelConfig,
    /// Model the client asked for.
    pub origin_model: String,
    /// Model name sent upstream after channel mapping and adapter init.
    pub actual_model: String,
    pub is_stream: bool,
    /// Pre-call prompt token estimate.
    pub prompt_tokens: u32,
    pub timeout: Duration,
}

impl RelayMeta {
    pub fn new(
        request_id: &str,
        channel: &Channel,
        origin_model: &str,
        is_stream: bool,
        prompt_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            channel_id: channel.id,
            provider: channel.provider,
            base_url: channel.base_url().to_string(),
            api_key: channel.key.clone(),
            config: channel.config.clone(),
            origin_model: origin_model.to_string(),
            actual_model: channel.map_model(origin_model),
            is_stream,
            prompt_tokens,
            timeout,
        }
    }
}
