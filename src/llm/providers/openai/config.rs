//! OpenAI connection settings and model table

use crate::config::ProviderSettings;
use crate::llm::traits::ModelInfo;
use crate::llm::ProviderKind;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            timeout_seconds: 30,
        }
    }
}

impl OpenAIConfig {
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
            organization: None,
            timeout_seconds: settings.timeout_seconds.unwrap_or(30),
        }
    }
}

/// Static model table; OpenAI's listing endpoint is only used for liveness.
pub fn available_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "gpt-4-turbo".into(),
            display_name: "GPT-4 Turbo".into(),
            provider: ProviderKind::OpenAI,
            context_window: 128_000,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: true,
            supports_embeddings: false,
            input_price_per_token: 0.000_01,
            output_price_per_token: 0.000_03,
        },
        ModelInfo {
            id: "gpt-4".into(),
            display_name: "GPT-4".into(),
            provider: ProviderKind::OpenAI,
            context_window: 8_192,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: false,
            supports_embeddings: false,
            input_price_per_token: 0.000_03,
            output_price_per_token: 0.000_06,
        },
        ModelInfo {
            id: "gpt-3.5-turbo".into(),
            display_name: "GPT-3.5 Turbo".into(),
            provider: ProviderKind::OpenAI,
            context_window: 16_385,
            max_output_tokens: 4_096,
            supports_streaming: true,
            supports_tools: true,
            supports_vision: false,
            supports_embeddings: false,
            input_price_per_token: 0.000_000_5,
            output_price_per_token: 0.000_001_5,
        },
        ModelInfo {
            id: "text-embedding-3-small".into(),
            display_name: "Text Embedding 3 Small".into(),
            provider: ProviderKind::OpenAI,
            context_window: 8_191,
            max_output_tokens: 0,
            supports_streaming: false,
            supports_tools: false,
            supports_vision: false,
            supports_embeddings: true,
            input_price_per_token: 0.000_000_02,
            output_price_per_token: 0.0,
        },
    ]
}
