//! REST handlers
//!
//! The HTTP face of the pipeline: completions (plain, streaming, batch),
//! embeddings, the model catalog, aggregate health, metrics, and config
//! reload. Transport concerns only — every decision lives in the pipeline.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::types::{
    rate_limit_key, request_identity, BatchBody, BatchItem, BatchResponse, CompletionBody,
    EmbeddingBody, ModelsResponse, Problem, HEADER_CORRELATION_ID, HEADER_REQUEST_ID,
    MAX_BATCH_SIZE,
};
use crate::config::{ConfigHandle, GatewayConfig};
use crate::llm::metrics;
use crate::llm::pipeline::Pipeline;
use crate::llm::ratelimit::RateLimiter;

/// Shared state behind every route.
#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Arc<Pipeline>,
    pub config: ConfigHandle,
    pub limiter: Arc<RateLimiter>,
    /// Where `/admin/reload` re-reads configuration from.
    pub config_path: Option<PathBuf>,
}

fn with_identity(mut response: Response, request_id: &str, correlation_id: &str) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = request_id.parse() {
        headers.insert(HEADER_REQUEST_ID, value);
    }
    if let Ok(value) = correlation_id.parse() {
        headers.insert(HEADER_CORRELATION_ID, value);
    }
    response
}

/// POST /api/v1/completions
pub async fn create_completion(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<CompletionBody>,
) -> Response {
    let (request_id, correlation_id) = request_identity(&headers);

    if !state.limiter.try_acquire(&rate_limit_key(&headers)) {
        metrics::RATE_LIMITED.inc();
        let problem =
            Problem::too_many_requests("request rate exceeded").with_correlation(&correlation_id);
        return with_identity(problem.into_response(), &request_id, &correlation_id);
    }

    let request = match body.into_request() {
        Ok(request) => request,
        Err(problem) => {
            return with_identity(
                problem.with_correlation(&correlation_id).into_response(),
                &request_id,
                &correlation_id,
            )
        }
    };

    let response = match state.pipeline.execute(request).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => Problem::from_error(&error, &correlation_id).into_response(),
    };
    with_identity(response, &request_id, &correlation_id)
}

/// POST /api/v1/completions/stream — SSE frames, `data: [DONE]` terminated.
pub async fn create_completion_stream(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<CompletionBody>,
) -> Response {
    let (request_id, correlation_id) = request_identity(&headers);

    if !state.limiter.try_acquire(&rate_limit_key(&headers)) {
        metrics::RATE_LIMITED.inc();
        let problem =
            Problem::too_many_requests("request rate exceeded").with_correlation(&correlation_id);
        return with_identity(problem.into_response(), &request_id, &correlation_id);
    }

    let request = match body.into_request() {
        Ok(request) => request,
        Err(problem) => {
            return with_identity(
                problem.with_correlation(&correlation_id).into_response(),
                &request_id,
                &correlation_id,
            )
        }
    };

    let cancel = CancellationToken::new();
    let mut stream = match state.pipeline.execute_stream(request, cancel.clone()).await {
        Ok(stream) => stream,
        Err(error) => {
            return with_identity(
                Problem::from_error(&error, &correlation_id).into_response(),
                &request_id,
                &correlation_id,
            )
        }
    };

    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let frame = match item {
                Ok(chunk) => match serde_json::to_string(&chunk) {
                    Ok(json) => format!("data: {json}\n\n"),
                    Err(_) => continue,
                },
                // The fan-out already terminated the stream; anything left
                // over is reported inline once.
                Err(error) => format!(
                    "data: {{\"error\":{}}}\n\n",
                    serde_json::Value::String(error.to_string())
                ),
            };
            if sender.send_data(frame.into()).await.is_err() {
                // Client went away: propagate cancellation upstream.
                cancel.cancel();
                return;
            }
        }
        let _ = sender.send_data("data: [DONE]\n\n".into()).await;
    });

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(axum::body::boxed(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    with_identity(response, &request_id, &correlation_id)
}

/// POST /api/v1/completions/batch — ≤100 requests, bounded concurrency,
/// responses at the index of their request.
pub async fn create_completion_batch(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<BatchBody>,
) -> Response {
    let (request_id, correlation_id) = request_identity(&headers);

    if body.requests.len() > MAX_BATCH_SIZE {
        let problem = Problem::bad_request(format!(
            "batch size {} exceeds the {MAX_BATCH_SIZE}-request limit",
            body.requests.len()
        ))
        .with_correlation(&correlation_id);
        return with_identity(problem.into_response(), &request_id, &correlation_id);
    }

    let cost = body.requests.len().max(1) as f64;
    if !state.limiter.try_acquire_n(&rate_limit_key(&headers), cost) {
        metrics::RATE_LIMITED.inc();
        let problem =
            Problem::too_many_requests("request rate exceeded").with_correlation(&correlation_id);
        return with_identity(problem.into_response(), &request_id, &correlation_id);
    }

    let concurrency = state
        .config
        .snapshot()
        .global_options
        .batch_concurrency
        .max(1);
    let correlation = correlation_id.clone();

    let mut items: Vec<BatchItem> = futures::stream::iter(
        body.requests.into_iter().enumerate(),
    )
    .map(|(index, body)| {
        let pipeline = state.pipeline.clone();
        let correlation = correlation.clone();
        async move {
            match body.into_request() {
                Err(problem) => BatchItem {
                    index,
                    response: None,
                    error: Some(problem.with_correlation(&correlation)),
                },
                Ok(request) => match pipeline.execute(request).await {
                    Ok(response) => BatchItem {
                        index,
                        response: Some(response),
                        error: None,
                    },
                    Err(error) => BatchItem {
                        index,
                        response: None,
                        error: Some(Problem::from_error(&error, &correlation)),
                    },
                },
            }
        }
    })
    .buffer_unordered(concurrency)
    .collect()
    .await;
    items.sort_by_key(|item| item.index);

    with_identity(
        Json(BatchResponse { responses: items }).into_response(),
        &request_id,
        &correlation_id,
    )
}

/// POST /api/v1/embeddings
pub async fn create_embeddings(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<EmbeddingBody>,
) -> Response {
    let (request_id, correlation_id) = request_identity(&headers);

    if !state.limiter.try_acquire(&rate_limit_key(&headers)) {
        metrics::RATE_LIMITED.inc();
        let problem =
            Problem::too_many_requests("request rate exceeded").with_correlation(&correlation_id);
        return with_identity(problem.into_response(), &request_id, &correlation_id);
    }

    let request = match body.into_request() {
        Ok(request) => request,
        Err(problem) => {
            return with_identity(
                problem.with_correlation(&correlation_id).into_response(),
                &request_id,
                &correlation_id,
            )
        }
    };

    let response = match state.pipeline.execute_embedding(request).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => Problem::from_error(&error, &correlation_id).into_response(),
    };
    with_identity(response, &request_id, &correlation_id)
}

/// GET /api/v1/models
pub async fn list_models(State(state): State<GatewayState>) -> Response {
    let config = state.config.snapshot();
    Json(ModelsResponse::from_config(&config)).into_response()
}

#[derive(Serialize)]
struct HealthProvider {
    name: String,
    available: bool,
    avg_latency_ms: f64,
    consecutive_failures: u32,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    providers: Vec<HealthProvider>,
    circuits: Vec<CircuitRow>,
}

#[derive(Serialize)]
struct CircuitRow {
    key: String,
    phase: crate::llm::breaker::CircuitPhase,
    success_rate: f64,
}

/// GET /health — unauthenticated aggregate over providers.
pub async fn health(State(state): State<GatewayState>) -> Response {
    let providers: Vec<HealthProvider> = state
        .pipeline
        .registry()
        .health_snapshot()
        .await
        .into_iter()
        .map(|(name, health)| HealthProvider {
            name,
            available: health.available,
            avg_latency_ms: health.avg_latency_ms,
            consecutive_failures: health.consecutive_failures,
        })
        .collect();

    let circuits = state
        .pipeline
        .breaker()
        .snapshot()
        .into_iter()
        .map(|(key, circuit)| CircuitRow {
            key,
            phase: circuit.phase,
            success_rate: circuit.success_rate(),
        })
        .collect();

    let status = if providers.iter().all(|p| p.available) {
        "healthy"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        providers,
        circuits,
    })
    .into_response()
}

/// GET /metrics — prometheus text exposition.
pub async fn metrics_endpoint() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
        .into_response()
}

/// POST /admin/reload — re-read the config file and swap the snapshot.
pub async fn reload_config(State(state): State<GatewayState>) -> Response {
    match GatewayConfig::load(state.config_path.as_deref()) {
        Ok(config) => {
            state.config.swap(config);
            info!("configuration reloaded");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            error!("configuration reload failed: {err}");
            Problem::bad_request(format!("reload failed: {err}")).into_response()
        }
    }
}

/// Fallback for unknown routes.
pub async fn not_found() -> Response {
    Problem {
        title: "Not Found".into(),
        detail: "no such endpoint".into(),
        status: 404,
        code: "not_found".into(),
        extensions: Default::default(),
    }
    .into_response()
}
