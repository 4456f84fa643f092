//! Cohere connection settings and model table

use crate::config::ProviderSettings;
use crate::llm::traits::ModelInfo;
use crate::llm::ProviderKind;

pub const DEFAULT_BASE_URL: &str = "https://api.cohere.com";

#[derive(Debug, Clone)]
pub struct CohereConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl Default for CohereConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("COHERE_API_KEY").unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_seconds: 30,
        }
    }
}

impl CohereConfig {
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
            timeout_seconds: settings.timeout_seconds.unwrap_or(30),
        }
    }
}

pub fn available_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "command-r-plus".into(),
            display_name: "Command R+".into(),
            provider: ProviderKind::Cohere,
            context_window: 128_000,
            max_output_tokens: 4_000,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: false,
            supports_embeddings: false,
            input_price_per_token: 0.000_003,
            output_price_per_token: 0.000_015,
        },
        ModelInfo {
            id: "command-r".into(),
            display_name: "Command R".into(),
            provider: ProviderKind::Cohere,
            context_window: 128_000,
            max_output_tokens: 4_000,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: false,
            supports_embeddings: false,
            input_price_per_token: 0.000_000_5,
            output_price_per_token: 0.000_001_5,
        },
        ModelInfo {
            id: "embed-english-v3.0".into(),
            display_name: "Embed English v3".into(),
            provider: ProviderKind::Cohere,
            context_window: 512,
            max_output_tokens: 0,
            supports_streaming: false,
            supports_tools: false,
            supports_vision: false,
            supports_embeddings: true,
            input_price_per_token: 0.000_000_1,
            output_price_per_token: 0.0,
        },
    ]
}
