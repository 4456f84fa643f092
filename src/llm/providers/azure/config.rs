//! Azure OpenAI connection settings
//!
//! Azure fronts OpenAI models behind named deployments; requests address
//! `{resource}/openai/deployments/{deployment}/...` with an `api-key` header
//! and an explicit `api-version` query parameter.

use crate::config::{Deployment, ProviderSettings};
use crate::llm::traits::ModelInfo;
use crate::llm::ProviderKind;

pub const DEFAULT_API_VERSION: &str = "2024-02-01";

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub api_key: String,
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub base_url: String,
    pub api_version: String,
    pub timeout_seconds: u64,
    /// model id → deployment id. Models without a row use their own name.
    pub deployments: Vec<Deployment>,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            api_key: std::env::var("AZURE_OPENAI_API_KEY").unwrap_or_default(),
            base_url: std::env::var("AZURE_OPENAI_ENDPOINT").unwrap_or_default(),
            api_version: DEFAULT_API_VERSION.to_string(),
            timeout_seconds: 30,
            deployments: Vec::new(),
        }
    }
}

impl AzureConfig {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let defaults = Self::default();
        Self {
            api_key: if settings.api_key.is_empty() {
                defaults.api_key
            } else {
                settings.api_key.clone()
            },
            base_url: settings.api_url.clone().unwrap_or(defaults.base_url),
            api_version: settings
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            timeout_seconds: settings.timeout_seconds.unwrap_or(30),
            deployments: settings.deployments.clone(),
        }
    }

    pub fn deployment_for(&self, model_id: &str) -> String {
        self.deployments
            .iter()
            .find(|d| d.model_id == model_id)
            .map(|d| d.deployment_id.clone())
            .unwrap_or_else(|| model_id.to_string())
    }
}

/// The deployed models, described with OpenAI characteristics.
pub fn available_models(config: &AzureConfig) -> Vec<ModelInfo> {
    let base = crate::llm::providers::openai::config::available_models();
    if config.deployments.is_empty() {
        return base
            .into_iter()
            .map(|mut m| {
                m.provider = ProviderKind::AzureOpenAI;
                m
            })
            .collect();
    }
    config
        .deployments
        .iter()
        .map(|d| {
            base.iter()
                .find(|m| m.id == d.model_id)
                .cloned()
                .map(|mut m| {
                    m.provider = ProviderKind::AzureOpenAI;
                    m
                })
                .unwrap_or(ModelInfo {
                    id: d.model_id.clone(),
                    display_name: d.model_id.clone(),
                    provider: ProviderKind::AzureOpenAI,
                    context_window: 8_192,
                    max_output_tokens: 4_096,
                    supports_streaming: true,
                    supports_tools: true,
                    supports_vision: false,
                    supports_embeddings: false,
                    input_price_per_token: 0.0,
                    output_price_per_token: 0.0,
                })
        })
        .collect()
}
