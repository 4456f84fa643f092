//! Provider adapter implementations
//!
//! One submodule per upstream, each split into `client` (the adapter),
//! `config` (connection settings and the static model table) and `types`
//! (wire structs). The mock adapter lives in a single file; it backs tests
//! and dry-run deployments.

pub mod anthropic;
pub mod azure;
pub mod cohere;
pub mod mock;
pub mod openai;

use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::ProvidersConfig;
use crate::llm::traits::ProviderAdapter;
use crate::llm::LLMError;

/// Map an upstream HTTP status to the error taxonomy. Classification happens
/// here, at the adapter boundary; kinds bubble up unchanged.
pub(crate) fn classify_status(
    provider: &str,
    status: u16,
    message: String,
    retry_after: Option<Duration>,
) -> LLMError {
    match status {
        400 | 422 => LLMError::BadRequest(message),
        401 | 403 => LLMError::Auth {
            provider: provider.to_string(),
            message,
        },
        404 => LLMError::ModelNotFound(message),
        408 => LLMError::Timeout {
            provider: provider.to_string(),
            elapsed: Duration::ZERO,
        },
        429 => LLMError::RateLimited {
            provider: provider.to_string(),
            message,
            retry_after,
        },
        500..=599 => LLMError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("HTTP {status}: {message}"),
        },
        _ => LLMError::Upstream {
            provider: provider.to_string(),
            status,
            message,
        },
    }
}

/// `Retry-After` in seconds, when the upstream sent one.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a reqwest error to the taxonomy, distinguishing timeouts.
pub(crate) fn classify_transport(provider: &str, timeout: Duration, err: reqwest::Error) -> LLMError {
    if err.is_timeout() {
        LLMError::Timeout {
            provider: provider.to_string(),
            elapsed: timeout,
        }
    } else {
        LLMError::Network(err.to_string())
    }
}

/// Build every adapter the configuration enables.
pub fn build_adapters(config: &ProvidersConfig) -> Vec<Arc<dyn ProviderAdapter>> {
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::new();

    if let Some(settings) = &config.openai {
        adapters.push(Arc::new(openai::OpenAIAdapter::new(
            openai::OpenAIConfig::from_settings(settings),
        )));
        info!("openai adapter registered");
    }
    if let Some(settings) = &config.anthropic {
        adapters.push(Arc::new(anthropic::AnthropicAdapter::new(
            anthropic::AnthropicConfig::from_settings(settings),
        )));
        info!("anthropic adapter registered");
    }
    if let Some(settings) = &config.cohere {
        adapters.push(Arc::new(cohere::CohereAdapter::new(
            cohere::CohereConfig::from_settings(settings),
        )));
        info!("cohere adapter registered");
    }
    if let Some(settings) = &config.azure_openai {
        adapters.push(Arc::new(azure::AzureOpenAIAdapter::new(
            azure::AzureConfig::from_settings(settings),
        )));
        info!("azure-openai adapter registered");
    }
    if config.mock.is_some() {
        adapters.push(Arc::new(mock::MockAdapter::echo()));
        info!("mock adapter registered");
    }

    adapters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ErrorKind;

    #[test]
    fn status_classification_covers_the_taxonomy() {
        assert_eq!(
            classify_status("openai", 400, "bad".into(), None).kind(),
            ErrorKind::BadRequest
        );
        assert_eq!(
            classify_status("openai", 401, "key".into(), None).kind(),
            ErrorKind::AuthFailed
        );
        assert_eq!(
            classify_status("openai", 404, "gone".into(), None).kind(),
            ErrorKind::ModelNotFound
        );
        assert_eq!(
            classify_status("openai", 429, "slow".into(), None).kind(),
            ErrorKind::RateLimitExceeded
        );
        assert_eq!(
            classify_status("openai", 500, "boom".into(), None).kind(),
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(
            classify_status("openai", 503, "busy".into(), None).kind(),
            ErrorKind::ProviderUnavailable
        );
        assert_eq!(
            classify_status("openai", 418, "teapot".into(), None).kind(),
            ErrorKind::UpstreamError
        );
    }

    #[test]
    fn retry_after_survives_classification() {
        let err = classify_status(
            "openai",
            429,
            "slow down".into(),
            Some(Duration::from_secs(7)),
        );
        match err {
            LLMError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("expected rate limited, got {other}"),
        }
    }
}
