//! HTTP surface
//!
//! REST endpoints versioned under `/api/v1`, the WebSocket endpoint, and the
//! operational routes (`/health`, `/metrics`, `/admin/reload`).

pub mod handlers;
pub mod types;
pub mod websocket;

use axum::routing::{get, post};
use axum::Router;

use handlers::GatewayState;

/// Assemble the route table over shared state.
pub fn routes(state: GatewayState) -> Router {
    Router::new()
        .route("/api/v1/completions", post(handlers::create_completion))
        .route(
            "/api/v1/completions/stream",
            post(handlers::create_completion_stream),
        )
        .route(
            "/api/v1/completions/batch",
            post(handlers::create_completion_batch),
        )
        .route("/api/v1/embeddings", post(handlers::create_embeddings))
        .route("/api/v1/models", get(handlers::list_models))
        .route("/api/v1/ws", get(websocket::websocket))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/admin/reload", post(handlers::reload_config))
        .fallback(handlers::not_found)
        .with_state(state)
}
