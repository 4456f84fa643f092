//! Anthropic connection settings and model table

use crate::config::ProviderSettings;
use crate::llm::traits::ModelInfo;
use crate::llm::ProviderKind;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Anthropic requires max_tokens; used when the caller sets none.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub api_version: String,
    pub timeout_seconds: u64,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout_seconds: 30,
        }
    }
}

impl AnthropicConfig {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let defaults = Self::default();
        Self {
            api_key: if settings.api_key.is_empty() {
                defaults.api_key
            } else {
                settings.api_key.clone()
            },
            base_url: settings
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_version: settings
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            timeout_seconds: settings.timeout_seconds.unwrap_or(30),
        }
    }
}

pub fn available_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "claude-3-opus-20240229".into(),
            display_name: "Claude 3 Opus".into(),
            provider: ProviderKind::Anthropic,
            context_window: 200_000,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: true,
            supports_embeddings: false,
            input_price_per_token: 0.000_015,
            output_price_per_token: 0.000_075,
        },
        ModelInfo {
            id: "claude-3-sonnet-20240229".into(),
            display_name: "Claude 3 Sonnet".into(),
            provider: ProviderKind::Anthropic,
            context_window: 200_000,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: true,
            supports_embeddings: false,
            input_price_per_token: 0.000_003,
            output_price_per_token: 0.000_015,
        },
        ModelInfo {
            id: "claude-3-haiku-20240307".into(),
            display_name: "Claude 3 Haiku".into(),
            provider: ProviderKind::Anthropic,
            context_window: 200_000,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: true,
            supports_embeddings: false,
            input_price_per_token: 0.000_000_25,
            output_price_per_token: 0.000_001_25,
        },
    ]
}
