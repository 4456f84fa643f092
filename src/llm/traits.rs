//! Provider adapter contract
//!
//! Every upstream (OpenAI, Anthropic, Cohere, Azure OpenAI, the test mock)
//! implements [`ProviderAdapter`]. Adapters own wire translation and HTTP
//! error classification; cross-cutting behavior — caching, filtering,
//! retries, breakers, metrics — is applied by the pipeline, never inside an
//! adapter. Adapters hold no shared mutable state.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::llm::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, LLMResult,
    ProviderKind, ResponseChunk,
};

/// Uniform stream of response chunks produced by `complete_stream`.
pub type ChunkStream = Box<dyn Stream<Item = LLMResult<ResponseChunk>> + Send + Unpin>;

/// Per-call execution context threaded down from the pipeline.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub request_id: String,
    pub timeout: Duration,
    /// Cancelling this token must drop the upstream connection; adapters are
    /// required to be safe to cancel mid-stream.
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(request_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            request_id: request_id.into(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Static description of one provider-native model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider-native identifier.
    pub id: String,
    pub display_name: String,
    pub provider: ProviderKind,
    pub context_window: u32,
    pub max_output_tokens: u32,
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub supports_embeddings: bool,
    /// Advisory USD prices; the ledger uses configuration pricing.
    pub input_price_per_token: f64,
    pub output_price_per_token: f64,
}

/// The uniform contract over heterogeneous upstream APIs.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable lookup name, lower-case.
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Known models. May be a static table for providers without a listing
    /// endpoint.
    fn models(&self) -> Vec<ModelInfo>;

    /// One model by provider-native id; `model_not_found` otherwise.
    fn model(&self, id: &str) -> LLMResult<ModelInfo> {
        self.models()
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| crate::llm::LLMError::ModelNotFound(id.to_string()))
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> LLMResult<CompletionResponse>;

    async fn complete_stream(
        &self,
        request: CompletionRequest,
        ctx: CallContext,
    ) -> LLMResult<ChunkStream>;

    /// Embeddings; providers without the capability fail `not_supported`.
    async fn embed(
        &self,
        request: &EmbeddingRequest,
        ctx: &CallContext,
    ) -> LLMResult<EmbeddingResponse>;

    /// Cheap liveness probe for the registry's health loop and the router.
    async fn is_available(&self) -> bool;

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supports_multimodal(&self) -> bool {
        false
    }
}
