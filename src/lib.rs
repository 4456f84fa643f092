//! # llm-gateway
//!
//! A multi-provider LLM gateway: one HTTP/streaming front-end over
//! heterogeneous completion, embedding and chat APIs, with smart routing,
//! content filtering, caching, budgets, and resilient provider invocation
//! (retry, circuit breaker, fallback chains).
//!
//! ## Layout
//!
//! - [`llm`] — the domain core: request/response model, tokenizer, content
//!   filter, cache, circuit breaker, retry policy, provider adapters and
//!   registry, router, cost ledger, pipeline, and streaming fan-out.
//! - [`config`] — the hot-reloadable configuration snapshot.
//! - [`api`] — the REST/SSE/WebSocket surface under `/api/v1`.
//! - [`server`] — assembly of the object graph and the axum server.
//!
//! The pipeline composes every cross-cutting concern; adapters only
//! translate wire formats. See `DESIGN.md` for the architecture notes.

pub mod api;
pub mod config;
pub mod llm;
pub mod server;

pub use config::{ConfigHandle, GatewayConfig};
pub use llm::pipeline::Pipeline;
pub use llm::{
    ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse,
    ErrorKind, FinishReason, LLMError, LLMResult, MessageRole, ProviderKind, ResponseChunk,
    RoutingDecision, RoutingStrategy, Usage,
};
pub use server::{GatewayServer, GatewayServerBuilder};
