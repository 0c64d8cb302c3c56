use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Provider family a channel speaks. Selects the adapter variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Azure,
    Anthropic,
    Bedrock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Azure => "azure",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Bedrock => "bedrock",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com",
            ProviderKind::Azure => "",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Bedrock => "",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "azure" => Ok(ProviderKind::Azure),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "bedrock" | "aws" => Ok(ProviderKind::Bedrock),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i16", try_from = "i16")]
pub enum ChannelStatus {
    Enabled,
    /// Disabled by an operator. Never re-enabled automatically.
    ManuallyDisabled,
    /// Disabled by the health policy. Eligible for recovery trials.
    AutoDisabled,
}

impl From<ChannelStatus> for i16 {
    fn from(s: ChannelStatus) -> i16 {
        match s {
            ChannelStatus::Enabled => 1,
            ChannelStatus::ManuallyDisabled => 2,
            ChannelStatus::AutoDisabled => 3,
        }
    }
}

impl TryFrom<i16> for ChannelStatus {
    type Error = String;

    fn try_from(v: i16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(ChannelStatus::Enabled),
            2 => Ok(ChannelStatus::ManuallyDisabled),
            3 => Ok(ChannelStatus::AutoDisabled),
            other => Err(format!("unknown channel status {}", other)),
        }
    }
}

/// Provider-specific routing knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChannelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// An upstream credential/endpoint bound to one provider family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub provider: ProviderKind,
    pub key: String,
    /// Empty means the provider's default endpoint.
    pub base_url: String,
    pub models: Vec<String>,
    /// Requested model → model name sent upstream.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Higher is preferred.
    pub priority: i64,
    pub weight: u32,
    pub status: ChannelStatus,
    #[serde(default)]
    pub config: ChannelConfig,
}

impl Channel {
    pub fn supports(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn base_url(&self) -> &str {
        if self.base_url.is_empty() {
            self.provider.default_base_url()
        } else {
            self.base_url.trim_end_matches('/')
        }
    }

    /// Upstream model name for a requested model.
    pub fn map_model(&self, requested: &str) -> String {
        self.model_mapping
            .get(requested)
            .filter(|m| !m.is_empty())
            .cloned()
            .unwrap_or_else(|| requested.to_string())
    }
}

/// Parse a comma separated model list, dropping blanks.
pub fn parse_models(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel {
            id: 1,
            name: "c".into(),
            provider: ProviderKind::OpenAi,
            key: "k".into(),
            base_url: "https://example.com/".into(),
            models: vec!["gpt-4o".into()],
            model_mapping: HashMap::from([("gpt-4o".to_string(), "gpt-4o-2024-08-06".to_string())]),
            priority: 0,
            weight: 1,
            status: ChannelStatus::Enabled,
            config: ChannelConfig::default(),
        }
    }

    #[test]
    fn test_model_mapping() {
        let c = channel();
        assert_eq!(c.map_model("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(c.map_model("gpt-3.5"), "gpt-3.5");
    }

    #[test]
    fn test_base_url_trims_and_defaults() {
        let mut c = channel();
        assert_eq!(c.base_url(), "https://example.com");
        c.base_url.clear();
        assert_eq!(c.base_url(), "https://api.openai.com");
    }

    #[test]
    fn test_provider_parse_aliases() {
        assert_eq!("aws".parse::<ProviderKind>().unwrap(), ProviderKind::Bedrock);
        assert_eq!("Claude".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
        assert!("gemini".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_parse_models() {
        assert_eq!(parse_models(" a, ,b ,"), vec!["a", "b"]);
    }
}
