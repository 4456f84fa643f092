//! HTTP wire types
//!
//! Request bodies, the problem document every error surfaces as, and the
//! header names threaded end to end.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::llm::{
    ChatMessage, CompletionRequest, EmbeddingRequest, LLMError, ToolChoice, ToolDefinition,
};

pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";

/// Most requests a batch endpoint will accept in one call.
pub const MAX_BATCH_SIZE: usize = 100;

/// POST /completions body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionBody {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub ignore_user_preference: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionBody {
    /// Validate and promote to a pipeline request with a fresh id.
    pub fn into_request(self) -> Result<CompletionRequest, Problem> {
        if self.messages.is_empty() {
            return Err(Problem::bad_request("messages must not be empty"));
        }
        if self.messages.iter().any(|m| m.content.is_empty()) {
            return Err(Problem::bad_request("message content must not be empty"));
        }

        let mut request = CompletionRequest::new(self.model, self.messages);
        request.temperature = self.temperature;
        request.top_p = self.top_p;
        request.max_tokens = self.max_tokens;
        request.frequency_penalty = self.frequency_penalty;
        request.presence_penalty = self.presence_penalty;
        request.stop = self.stop;
        request.tools = self.tools;
        request.tool_choice = self.tool_choice;
        request.stream = self.stream;
        request.user = self.user;
        request.ignore_user_preference = self.ignore_user_preference;
        request.metadata = self.metadata;
        Ok(request)
    }
}

/// POST /completions/batch body.
#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub requests: Vec<CompletionBody>,
}

/// One slot of a batch response; exactly one of `response`/`error` is set,
/// at the index of the originating request.
#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<crate::llm::CompletionResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Problem>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub responses: Vec<BatchItem>,
}

/// POST /embeddings body.
#[derive(Debug, Deserialize)]
pub struct EmbeddingBody {
    pub model: String,
    pub input: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl EmbeddingBody {
    pub fn into_request(self) -> Result<EmbeddingRequest, Problem> {
        if self.input.is_empty() {
            return Err(Problem::bad_request("input must not be empty"));
        }
        let mut request = EmbeddingRequest::new(self.model, self.input);
        request.user = self.user;
        Ok(request)
    }
}

/// GET /models response row.
#[derive(Debug, Serialize)]
pub struct ModelRow {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub context_window: u32,
    pub supports_completions: bool,
    pub supports_embeddings: bool,
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_vision: bool,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelRow>,
}

impl ModelsResponse {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let models = config
            .routing
            .model_mappings
            .iter()
            .map(|m| ModelRow {
                id: m.logical_id.clone(),
                provider: m.provider.to_string(),
                display_name: if m.display_name.is_empty() {
                    m.logical_id.clone()
                } else {
                    m.display_name.clone()
                },
                context_window: m.context_window,
                supports_completions: m.capabilities.completions,
                supports_embeddings: m.capabilities.embeddings,
                supports_streaming: m.capabilities.streaming,
                supports_tools: m.capabilities.tools,
                supports_vision: m.capabilities.vision,
            })
            .collect();
        Self { models }
    }
}

/// RFC-7807-shaped error document.
#[derive(Debug, Clone, Serialize)]
pub struct Problem {
    pub title: String,
    pub detail: String,
    pub status: u16,
    pub code: String,
    pub extensions: ProblemExtensions,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProblemExtensions {
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_error_code: Option<String>,
}

impl Problem {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            title: "Bad Request".into(),
            detail: detail.into(),
            status: 400,
            code: "bad_request".into(),
            extensions: ProblemExtensions::default(),
        }
    }

    pub fn too_many_requests(detail: impl Into<String>) -> Self {
        Self {
            title: "Too Many Requests".into(),
            detail: detail.into(),
            status: 429,
            code: "rate_limit_exceeded".into(),
            extensions: ProblemExtensions::default(),
        }
    }

    pub fn from_error(error: &LLMError, correlation_id: &str) -> Self {
        let kind = error.kind();
        Self {
            title: title_for(kind.http_status()),
            detail: error.to_string(),
            status: kind.http_status(),
            code: error.public_code().to_string(),
            extensions: ProblemExtensions {
                correlation_id: correlation_id.to_string(),
                provider: error.provider().map(String::from),
                provider_error_code: match error {
                    LLMError::Upstream { status, .. } => Some(status.to_string()),
                    _ => None,
                },
            },
        }
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.extensions.correlation_id = correlation_id.to_string();
        self
    }
}

fn title_for(status: u16) -> String {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        408 | 504 => "Timeout",
        429 => "Too Many Requests",
        502 => "Bad Gateway",
        _ => "Internal Server Error",
    }
    .to_string()
}

impl IntoResponse for Problem {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Echo the inbound request id or mint one; preserve the correlation id.
pub fn request_identity(headers: &HeaderMap) -> (String, String) {
    let request_id = headers
        .get(HEADER_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let correlation_id = headers
        .get(HEADER_CORRELATION_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| request_id.clone());
    (request_id, correlation_id)
}

/// The caller's identity for rate limiting: API key, bearer token, or a
/// shared anonymous bucket.
pub fn rate_limit_key(headers: &HeaderMap) -> String {
    if let Some(key) = headers.get(HEADER_API_KEY).and_then(|v| v.to_str().ok()) {
        return key.to_string();
    }
    if let Some(auth) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Bearer ") {
            return token.to_string();
        }
    }
    "anonymous".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ErrorKind;

    #[test]
    fn empty_messages_are_rejected() {
        let body = CompletionBody {
            model: "openai.gpt-4".into(),
            messages: vec![],
            temperature: None,
            top_p: None,
            max_tokens: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            tools: None,
            tool_choice: None,
            stream: false,
            user: None,
            ignore_user_preference: false,
            metadata: HashMap::new(),
        };
        let problem = body.into_request().unwrap_err();
        assert_eq!(problem.status, 400);
        assert_eq!(problem.code, "bad_request");
    }

    #[test]
    fn problem_maps_error_kinds_to_statuses() {
        let err = LLMError::ModelNotFound("nope".into());
        let problem = Problem::from_error(&err, "corr-1");
        assert_eq!(problem.status, 404);
        assert_eq!(problem.code, "model_not_found");
        assert_eq!(problem.extensions.correlation_id, "corr-1");

        let open = LLMError::CircuitOpen {
            provider: "openai".into(),
        };
        let problem = Problem::from_error(&open, "corr-2");
        assert_eq!(problem.status, ErrorKind::ProviderUnavailable.http_status());
        assert_eq!(problem.code, "provider_unavailable");
        assert_eq!(problem.extensions.provider.as_deref(), Some("openai"));
    }

    #[test]
    fn upstream_status_lands_in_extensions() {
        let err = LLMError::Upstream {
            provider: "cohere".into(),
            status: 418,
            message: "teapot".into(),
        };
        let problem = Problem::from_error(&err, "c");
        assert_eq!(problem.extensions.provider_error_code.as_deref(), Some("418"));
    }

    #[test]
    fn identity_headers_echo_or_mint() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_REQUEST_ID, "req-9".parse().unwrap());
        headers.insert(HEADER_CORRELATION_ID, "corr-9".parse().unwrap());
        let (req, corr) = request_identity(&headers);
        assert_eq!(req, "req-9");
        assert_eq!(corr, "corr-9");

        let (minted, corr) = request_identity(&HeaderMap::new());
        assert!(!minted.is_empty());
        assert_eq!(minted, corr);
    }

    #[test]
    fn rate_limit_key_prefers_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_API_KEY, "key-1".parse().unwrap());
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer tok".parse().unwrap(),
        );
        assert_eq!(rate_limit_key(&headers), "key-1");

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer tok".parse().unwrap(),
        );
        assert_eq!(rate_limit_key(&headers), "tok");

        assert_eq!(rate_limit_key(&HeaderMap::new()), "anonymous");
    }
}
