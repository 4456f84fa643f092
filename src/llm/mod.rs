//! Core gateway domain model
//!
//! This module defines the provider-neutral request/response types that flow
//! through the pipeline, plus the closed error taxonomy every layer speaks.
//! Provider adapters translate these to and from each upstream wire format.

pub mod breaker;
pub mod cache;
pub mod cost;
pub mod filter;
pub mod metrics;
pub mod pipeline;
pub mod providers;
pub mod ratelimit;
pub mod registry;
pub mod retry;
pub mod router;
pub mod sse;
pub mod streaming;
pub mod tokenizer;
pub mod traits;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Upstream providers the gateway can route to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Cohere,
    AzureOpenAI,
    Mock,
    Custom(String),
}

impl ProviderKind {
    /// Case-insensitive parse; unrecognized names become `Custom`.
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "openai" => ProviderKind::OpenAI,
            "anthropic" => ProviderKind::Anthropic,
            "cohere" => ProviderKind::Cohere,
            "azure" | "azure-openai" | "azureopenai" => ProviderKind::AzureOpenAI,
            "mock" => ProviderKind::Mock,
            _ => ProviderKind::Custom(name.to_string()),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Cohere => write!(f, "cohere"),
            ProviderKind::AzureOpenAI => write!(f, "azure-openai"),
            ProviderKind::Mock => write!(f, "mock"),
            ProviderKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// Chat message roles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

/// Tool (function) definition passed through to providers that support tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Tool selection hint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ToolChoice {
    /// "auto" or "none".
    Mode(String),
    /// Force one specific tool.
    Tool { name: String },
}

/// A tool call emitted by a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, forwarded verbatim.
    pub arguments: String,
}

/// A completion request after API-layer validation, before routing.
///
/// `model` is the caller-visible logical id (e.g. `anthropic.claude-3-sonnet`);
/// the router resolves it to a provider-native model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub id: Uuid,
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
    /// When set, skip the user's preferred-model override for this request.
    #[serde(default)]
    pub ignore_user_preference: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            messages,
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
        }
    }

    /// Concatenated message text, used by the filter and content-based routing.
    pub fn joined_content(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Why a completion stopped.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    /// Lenient mapping from provider-native stop reasons.
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" | "stop_sequence" | "COMPLETE" => FinishReason::Stop,
            "length" | "max_tokens" | "MAX_TOKENS" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

/// Token usage reported for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn merge(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

/// The uniform completion response returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionResponse {
    pub id: String,
    pub created: u64,
    /// Logical model id the caller asked for (post alias resolution).
    pub model: String,
    pub provider: ProviderKind,
    pub choices: Vec<Choice>,
    pub usage: Usage,
    /// Non-wire annotations: clamping notes, routing strategy, cache status.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CompletionResponse {
    /// Content of the first choice, if any.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }

    pub fn has_tool_calls(&self) -> bool {
        self.choices
            .iter()
            .any(|c| c.message.tool_calls.as_ref().map_or(false, |t| !t.is_empty()))
    }
}

/// One element of the uniform streaming sequence.
///
/// The final chunk of every stream carries a `finish_reason`; on upstream
/// failure it is `FinishReason::Error` with `error` set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseChunk {
    pub id: String,
    pub model: String,
    pub provider: ProviderKind,
    pub delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseChunk {
    pub fn delta(id: &str, model: &str, provider: ProviderKind, text: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            provider,
            delta: text.into(),
            finish_reason: None,
            usage: None,
            error: None,
        }
    }

    pub fn terminal(
        id: &str,
        model: &str,
        provider: ProviderKind,
        reason: FinishReason,
        usage: Option<Usage>,
    ) -> Self {
        Self {
            id: id.to_string(),
            model: model.to_string(),
            provider,
            delta: String::new(),
            finish_reason: Some(reason),
            usage,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// An embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub id: Uuid,
    pub model: String,
    pub input: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl EmbeddingRequest {
    pub fn new(model: impl Into<String>, input: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            input,
            user: None,
        }
    }
}

/// The uniform embedding response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub id: String,
    pub model: String,
    pub provider: ProviderKind,
    pub embeddings: Vec<Vec<f32>>,
    pub usage: Usage,
}

/// How the router chose a mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    DirectMapping,
    ContentBased,
    CostOptimized,
    LatencyOptimized,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingStrategy::DirectMapping => write!(f, "direct_mapping"),
            RoutingStrategy::ContentBased => write!(f, "content_based"),
            RoutingStrategy::CostOptimized => write!(f, "cost_optimized"),
            RoutingStrategy::LatencyOptimized => write!(f, "latency_optimized"),
        }
    }
}

/// The router's answer for one request (or one fallback attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub provider: ProviderKind,
    /// Logical id after alias/preference resolution.
    pub model: String,
    /// Provider-native model identifier.
    pub provider_model_id: String,
    pub strategy: RoutingStrategy,
    pub reason: String,
    pub success: bool,
}

/// Stable error codes surfaced to callers and consulted by fallback rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelNotFound,
    ProviderNotFound,
    ProviderUnavailable,
    RateLimitExceeded,
    AuthFailed,
    BadRequest,
    Timeout,
    ContentFiltered,
    BudgetExceeded,
    CircuitOpen,
    RoutingLoop,
    NotSupported,
    UpstreamError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::ProviderNotFound => "provider_not_found",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ContentFiltered => "content_filtered",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RoutingLoop => "routing_loop",
            ErrorKind::NotSupported => "not_supported",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// HTTP status for the problem document.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::BadRequest | ErrorKind::NotSupported => 400,
            ErrorKind::AuthFailed => 401,
            ErrorKind::ContentFiltered | ErrorKind::BudgetExceeded => 403,
            ErrorKind::ModelNotFound | ErrorKind::ProviderNotFound => 404,
            ErrorKind::Timeout => 504,
            ErrorKind::RateLimitExceeded => 429,
            // An open circuit is reported to callers as an unavailable provider.
            ErrorKind::ProviderUnavailable | ErrorKind::CircuitOpen | ErrorKind::UpstreamError => {
                502
            }
            ErrorKind::RoutingLoop | ErrorKind::InternalError => 500,
        }
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model_not_found" => Ok(ErrorKind::ModelNotFound),
            "provider_not_found" => Ok(ErrorKind::ProviderNotFound),
            "provider_unavailable" => Ok(ErrorKind::ProviderUnavailable),
            "rate_limit_exceeded" => Ok(ErrorKind::RateLimitExceeded),
            "auth_failed" => Ok(ErrorKind::AuthFailed),
            "bad_request" => Ok(ErrorKind::BadRequest),
            "timeout" => Ok(ErrorKind::Timeout),
            "content_filtered" => Ok(ErrorKind::ContentFiltered),
            "budget_exceeded" => Ok(ErrorKind::BudgetExceeded),
            "circuit_open" => Ok(ErrorKind::CircuitOpen),
            "routing_loop" => Ok(ErrorKind::RoutingLoop),
            "not_supported" => Ok(ErrorKind::NotSupported),
            "upstream_error" => Ok(ErrorKind::UpstreamError),
            "internal_error" => Ok(ErrorKind::InternalError),
            _ => Err(()),
        }
    }
}

/// Content filter categories (closed set).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterCategory {
    Hate,
    Harassment,
    SelfHarm,
    Sexual,
    Violence,
    BlockedTerm,
    BlockedPattern,
    Pii,
}

/// Gateway error taxonomy. Classification happens at the adapter boundary;
/// kinds bubble unchanged through retry/fallback unless handled there.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("rate limit exceeded on {provider}: {message}")]
    RateLimited {
        provider: String,
        message: String,
        /// Upstream Retry-After, when the provider sent one.
        retry_after: Option<Duration>,
    },

    #[error("authentication failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("timeout after {elapsed:?} calling {provider}")]
    Timeout { provider: String, elapsed: Duration },

    #[error("content filtered: {reason}")]
    ContentFiltered {
        reason: String,
        categories: Vec<FilterCategory>,
    },

    #[error("budget exceeded for user {user_id}")]
    BudgetExceeded { user_id: String },

    #[error("circuit open for {provider}")]
    CircuitOpen { provider: String },

    #[error("routing loop resolving {0}")]
    RoutingLoop(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("upstream error from {provider} (status {status}): {message}")]
    Upstream {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LLMError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LLMError::ModelNotFound(_) => ErrorKind::ModelNotFound,
            LLMError::ProviderNotFound(_) => ErrorKind::ProviderNotFound,
            LLMError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            LLMError::RateLimited { .. } => ErrorKind::RateLimitExceeded,
            LLMError::Auth { .. } => ErrorKind::AuthFailed,
            LLMError::BadRequest(_) => ErrorKind::BadRequest,
            LLMError::Timeout { .. } => ErrorKind::Timeout,
            LLMError::ContentFiltered { .. } => ErrorKind::ContentFiltered,
            LLMError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            LLMError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            LLMError::RoutingLoop(_) => ErrorKind::RoutingLoop,
            LLMError::NotSupported(_) => ErrorKind::NotSupported,
            LLMError::Upstream { .. } => ErrorKind::UpstreamError,
            // Transport-level failures count as an unavailable provider.
            LLMError::Network(_) => ErrorKind::ProviderUnavailable,
            LLMError::Parse(_) => ErrorKind::UpstreamError,
            LLMError::Internal(_) => ErrorKind::InternalError,
        }
    }

    /// Code shown to callers. An open circuit reads as an unavailable
    /// provider; the internal kind stays `circuit_open` for fallback rules.
    pub fn public_code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::CircuitOpen => ErrorKind::ProviderUnavailable.as_str(),
            kind => kind.as_str(),
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            LLMError::ProviderUnavailable { provider, .. }
            | LLMError::RateLimited { provider, .. }
            | LLMError::Auth { provider, .. }
            | LLMError::Timeout { provider, .. }
            | LLMError::CircuitOpen { provider }
            | LLMError::Upstream { provider, .. } => Some(provider),
            _ => None,
        }
    }
}

/// Result alias used throughout the gateway.
pub type LLMResult<T> = Result<T, LLMError>;
