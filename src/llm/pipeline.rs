//! Gateway request pipeline
//!
//! One flow for every completion: prompt filter → budget gate → cache lookup
//! → routing → provider call under retry and circuit breaker → completion
//! filter → cache admission → cost record. Failures eligible per the
//! fallback rules re-route to alternate models, bounded by configuration;
//! streaming requests share the prelude and hand chunks to the fan-out.

use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigHandle, GatewayConfig, ModelMapping};
use crate::llm::breaker::{BreakerSettings, CircuitBreaker};
use crate::llm::cache::{admission_ttl, fingerprint, Flight, ResponseCache, SingleFlight};
use crate::llm::cost::{completion_cost, CostTracker, OperationType, TrackArgs};
use crate::llm::filter::{ContentFilter, ModerationClassifier, FILTERED_PLACEHOLDER};
use crate::llm::metrics;
use crate::llm::registry::ProviderRegistry;
use crate::llm::retry::RetryPolicy;
use crate::llm::router::{resolve_alias, Router};
use crate::llm::streaming::{fan_out, FanOutParams, StreamTotals};
use crate::llm::tokenizer;
use crate::llm::traits::{CallContext, ChunkStream, ProviderAdapter};
use crate::llm::{
    CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, ErrorKind,
    FinishReason, LLMError, LLMResult, RoutingDecision, Usage,
};

/// Compiled-filter cache, invalidated when the config snapshot pointer moves.
struct FilterCache {
    snapshot: Arc<GatewayConfig>,
    filter: Arc<ContentFilter>,
}

pub struct Pipeline {
    config: ConfigHandle,
    registry: Arc<ProviderRegistry>,
    router: Router,
    cache: Arc<dyn ResponseCache>,
    flights: SingleFlight,
    breaker: CircuitBreaker,
    ledger: CostTracker,
    classifier: Option<Arc<dyn ModerationClassifier>>,
    filter_cache: std::sync::RwLock<Option<FilterCache>>,
}

impl Pipeline {
    pub fn new(
        config: ConfigHandle,
        registry: Arc<ProviderRegistry>,
        cache: Arc<dyn ResponseCache>,
        ledger: CostTracker,
    ) -> Self {
        Self {
            config,
            registry,
            router: Router::new(),
            cache,
            flights: SingleFlight::new(),
            breaker: CircuitBreaker::new(BreakerSettings::default()),
            ledger,
            classifier: None,
            filter_cache: std::sync::RwLock::new(None),
        }
    }

    /// Route every routing decision into `trace`.
    pub fn with_trace(mut self, trace: mpsc::UnboundedSender<RoutingDecision>) -> Self {
        self.router = Router::with_trace(trace);
        self
    }

    pub fn with_breaker(mut self, settings: BreakerSettings) -> Self {
        self.breaker = CircuitBreaker::new(settings);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ModerationClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn ledger(&self) -> &CostTracker {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// The filter compiled for the current snapshot; rebuilt after reloads.
    fn filter_for(&self, snapshot: &Arc<GatewayConfig>) -> Arc<ContentFilter> {
        if let Ok(cache) = self.filter_cache.read() {
            if let Some(cached) = cache.as_ref() {
                if Arc::ptr_eq(&cached.snapshot, snapshot) {
                    return cached.filter.clone();
                }
            }
        }

        let filter = match ContentFilter::with_classifier(
            &snapshot.content_filtering,
            self.classifier.clone(),
        ) {
            Ok(filter) => Arc::new(filter),
            Err(error) => {
                warn!("content filter rebuild failed, passing traffic unfiltered: {error}");
                Arc::new(
                    ContentFilter::new(&crate::config::ContentFilterConfig {
                        enable: false,
                        ..Default::default()
                    })
                    .unwrap_or_else(|_| unreachable!("empty filter config always compiles")),
                )
            }
        };

        if let Ok(mut cache) = self.filter_cache.write() {
            *cache = Some(FilterCache {
                snapshot: snapshot.clone(),
                filter: filter.clone(),
            });
        }
        filter
    }

    /// Non-streaming completion under the outer wall-clock budget.
    pub async fn execute(&self, request: CompletionRequest) -> LLMResult<CompletionResponse> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    pub async fn execute_with_cancel(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LLMResult<CompletionResponse> {
        let config = self.config.snapshot();
        let outer = Duration::from_secs(config.global_options.default_timeout_seconds * 2);
        match tokio::time::timeout(outer, self.run_completion(request, &config, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(LLMError::Timeout {
                provider: "gateway".into(),
                elapsed: outer,
            }),
        }
    }

    async fn run_completion(
        &self,
        request: CompletionRequest,
        config: &Arc<GatewayConfig>,
        cancel: CancellationToken,
    ) -> LLMResult<CompletionResponse> {
        let filter = self.filter_for(config);

        // 1. Effective request: aliases (and the user's preferred model)
        //    applied up front so filtering, budgeting and cache keys all see
        //    the same logical id the router will use.
        let mut effective = request;
        effective.model = effective_model(&effective, config)?;

        // 2. Prompt filter; a block never reaches any provider.
        let verdict = filter.check_prompt(&effective.joined_content()).await;
        if !verdict.allowed {
            metrics::FILTER_BLOCKED.inc();
            return Err(LLMError::ContentFiltered {
                reason: verdict.reason.unwrap_or_else(|| "blocked".into()),
                categories: verdict.categories,
            });
        }

        // 3. Budget gate on the estimated cost.
        self.enforce_budget(&effective, config).await?;

        // 4. Cache lookup. The key is provider-scoped, so only directly
        //    mapped models are cacheable; strategy-routed ids skip the cache.
        let cache_key = self.cache_key(&effective, config);
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key).await {
                metrics::CACHE_HITS.inc();
                debug!("cache hit {key}");
                return Ok(hit);
            }
            metrics::CACHE_MISSES.inc();

            // Identical concurrent requests coalesce onto one upstream call.
            match self.flights.join(key).await {
                Flight::Follower(result) => return result,
                Flight::Leader(guard) => {
                    let result = self
                        .routed_completion(&effective, config, &filter, cache_key.as_deref(), &cancel)
                        .await;
                    guard.complete(result.clone());
                    return result;
                }
            }
        }

        self.routed_completion(&effective, config, &filter, None, &cancel)
            .await
    }

    /// Steps 5–9: route, call, filter, cache, record — with fallback.
    async fn routed_completion(
        &self,
        request: &CompletionRequest,
        config: &Arc<GatewayConfig>,
        filter: &Arc<ContentFilter>,
        cache_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> LLMResult<CompletionResponse> {
        let mut attempted: HashSet<String> = HashSet::new();
        let mut decision = self.router.route(request, config, &self.registry).await?;
        let mut fallback_budget = config.fallbacks.max_fallback_attempts;
        let mut queue: VecDeque<String> = VecDeque::new();

        loop {
            attempted.insert(decision.model.clone());
            let error = match self
                .attempt_completion(request, &decision, config, cancel)
                .await
            {
                Ok(mut response) => {
                    self.apply_completion_filter(filter, config, &mut response)
                        .await;

                    if let (Some(key), true) =
                        (cache_key, config.global_options.enable_caching)
                    {
                        if let Some(ttl) = admission_ttl(request, &response) {
                            self.cache.set(key, response.clone(), ttl).await;
                        }
                    }

                    self.record_completion(request, &decision, &response, config);
                    return Ok(response);
                }
                Err(error) => error,
            };

            warn!(
                "provider {} failed for {}: {}",
                decision.provider, decision.model, error
            );

            // 9. Fallback chain for eligible kinds, same model never twice.
            if fallback_budget == 0 {
                return Err(error);
            }
            if queue.is_empty() {
                queue = self
                    .fallback_candidates(config, &decision.model, error.kind(), &attempted)
                    .into();
            }

            let next = loop {
                match queue.pop_front() {
                    None => return Err(error),
                    Some(candidate) if attempted.contains(&candidate) => continue,
                    Some(candidate) => {
                        match self.router.route_model(&candidate, config, "fallback") {
                            Ok(next) => break next,
                            Err(route_error) => {
                                debug!("fallback candidate {candidate} unroutable: {route_error}");
                                continue;
                            }
                        }
                    }
                }
            };

            metrics::FALLBACKS.inc();
            fallback_budget -= 1;
            info!(
                "falling back {} -> {} after {}",
                decision.model, next.model, error.kind().as_str()
            );
            decision = next;
        }
    }

    /// An open circuit consults the rule under its own code, then under
    /// `provider_unavailable`; either listing triggers the fallback.
    fn fallback_candidates(
        &self,
        config: &GatewayConfig,
        model: &str,
        kind: ErrorKind,
        attempted: &HashSet<String>,
    ) -> Vec<String> {
        let chain = self.router.fallback_chain(config, model, kind, attempted);
        if chain.is_empty() && kind == ErrorKind::CircuitOpen {
            return self.router.fallback_chain(
                config,
                model,
                ErrorKind::ProviderUnavailable,
                attempted,
            );
        }
        chain
    }

    /// One provider attempt: breaker admission around the adapter call with
    /// provider-level retries inside.
    async fn attempt_completion(
        &self,
        request: &CompletionRequest,
        decision: &RoutingDecision,
        config: &GatewayConfig,
        cancel: &CancellationToken,
    ) -> LLMResult<CompletionResponse> {
        let provider_name = decision.provider.to_string();
        let adapter = self.registry.get(&provider_name)?;
        let guard = self.breaker.try_acquire(&provider_name)?;

        let (provider_request, clamped_from) =
            provider_request(request, decision, config.routing.mapping(&decision.model));
        let ctx = CallContext::new(request.id.to_string(), self.call_timeout(config, false))
            .with_cancel(cancel.clone());
        let retry = RetryPolicy::new(
            config.retry_policy.max_provider_retry_attempts,
            Duration::from_secs_f64(config.retry_policy.base_retry_interval_seconds.max(0.0)),
        );

        let started = Instant::now();
        let result = retry
            .execute(cancel, |_attempt| {
                let adapter = adapter.clone();
                let provider_request = provider_request.clone();
                let ctx = ctx.clone();
                async move { adapter.complete(&provider_request, &ctx).await }
            })
            .await;
        let elapsed = started.elapsed();

        metrics::PROVIDER_LATENCY
            .with_label_values(&[&provider_name])
            .observe(elapsed.as_secs_f64());

        match result {
            Ok(mut response) => {
                guard.record_success();
                metrics::REQUESTS
                    .with_label_values(&[&provider_name, "ok"])
                    .inc();
                self.registry.record_latency(&provider_name, elapsed).await;

                // Responses leave under the logical identity.
                response.model = decision.model.clone();
                response.provider = decision.provider.clone();
                response.metadata.insert(
                    "routing_strategy".into(),
                    serde_json::Value::String(decision.strategy.to_string()),
                );
                if let Some(original) = clamped_from {
                    response
                        .metadata
                        .insert("max_tokens_clamped_from".into(), original.into());
                }
                Ok(response)
            }
            Err(error) => {
                metrics::REQUESTS
                    .with_label_values(&[&provider_name, error.kind().as_str()])
                    .inc();
                if cancel.is_cancelled() {
                    // A cancelled call is not an outcome the breaker counts.
                    drop(guard);
                } else {
                    guard.record_failure(&error);
                }
                Err(error)
            }
        }
    }

    async fn apply_completion_filter(
        &self,
        filter: &Arc<ContentFilter>,
        config: &GatewayConfig,
        response: &mut CompletionResponse,
    ) {
        if !config.content_filtering.enable || !config.content_filtering.filter_completions {
            return;
        }
        for choice in &mut response.choices {
            let verdict = filter.check_completion(&choice.message.content).await;
            if !verdict.allowed {
                metrics::FILTER_BLOCKED.inc();
                choice.message.content = FILTERED_PLACEHOLDER.to_string();
                choice.finish_reason = Some(FinishReason::ContentFilter);
            }
        }
    }

    /// Cost records are written after the response returns; callers never
    /// block on the ledger.
    fn record_completion(
        &self,
        request: &CompletionRequest,
        decision: &RoutingDecision,
        response: &CompletionResponse,
        config: &Arc<GatewayConfig>,
    ) {
        if !config.global_options.enable_cost_tracking {
            return;
        }
        let Some(user) = request.user.clone() else {
            return;
        };
        let Some(mapping) = config.routing.mapping(&decision.model) else {
            return;
        };

        let ledger = self.ledger.clone();
        let pricing = config.effective_pricing(mapping);
        let provider = decision.provider.clone();
        let model = decision.model.clone();
        let request_id = request.id.to_string();
        let project = project_of(request);
        let usage = response.usage;

        tokio::spawn(async move {
            let result = ledger
                .track(TrackArgs {
                    user_id: &user,
                    project_id: project.as_deref(),
                    request_id: &request_id,
                    provider,
                    model_id: &model,
                    operation: OperationType::Completion,
                    usage,
                    pricing: &pricing,
                    tags: Vec::new(),
                })
                .await;
            if let Err(error) = result {
                warn!("cost record write failed: {error}");
            }
        });
    }

    /// Streaming completion: shared prelude, then the fan-out owns the rest.
    pub async fn execute_stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> LLMResult<ChunkStream> {
        let config = self.config.snapshot();
        let filter = self.filter_for(&config);

        let mut effective = request;
        effective.stream = true;
        effective.model = effective_model(&effective, &config)?;

        let verdict = filter.check_prompt(&effective.joined_content()).await;
        if !verdict.allowed {
            metrics::FILTER_BLOCKED.inc();
            return Err(LLMError::ContentFiltered {
                reason: verdict.reason.unwrap_or_else(|| "blocked".into()),
                categories: verdict.categories,
            });
        }

        self.enforce_budget(&effective, &config).await?;

        let mut attempted: HashSet<String> = HashSet::new();
        let mut decision = self.router.route(&effective, &config, &self.registry).await?;
        let mut fallback_budget = config.fallbacks.max_fallback_attempts;

        // Retry and fallback apply to obtaining the stream only; once the
        // first byte flows, a disconnect fails the whole call.
        loop {
            attempted.insert(decision.model.clone());
            match self
                .attempt_stream(&effective, &decision, &config, &cancel, &filter)
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    if fallback_budget == 0 {
                        return Err(error);
                    }
                    let candidates = self.fallback_candidates(
                        &config,
                        &decision.model,
                        error.kind(),
                        &attempted,
                    );
                    let Some(next) = candidates.into_iter().find_map(|candidate| {
                        self.router.route_model(&candidate, &config, "fallback").ok()
                    }) else {
                        return Err(error);
                    };
                    metrics::FALLBACKS.inc();
                    fallback_budget -= 1;
                    decision = next;
                }
            }
        }
    }

    async fn attempt_stream(
        &self,
        request: &CompletionRequest,
        decision: &RoutingDecision,
        config: &Arc<GatewayConfig>,
        cancel: &CancellationToken,
        filter: &Arc<ContentFilter>,
    ) -> LLMResult<ChunkStream> {
        let provider_name = decision.provider.to_string();
        let adapter = self.registry.get(&provider_name)?;
        if !adapter.supports_streaming() {
            return Err(LLMError::NotSupported(format!(
                "{provider_name} does not stream"
            )));
        }
        let guard = self.breaker.try_acquire(&provider_name)?;

        let (provider_request, _clamped) =
            provider_request(request, decision, config.routing.mapping(&decision.model));
        let ctx = CallContext::new(request.id.to_string(), self.call_timeout(config, true))
            .with_cancel(cancel.clone());
        let retry = RetryPolicy::new(
            config.retry_policy.max_provider_retry_attempts,
            Duration::from_secs_f64(config.retry_policy.base_retry_interval_seconds.max(0.0)),
        );

        let result = retry
            .execute(cancel, |_attempt| {
                let adapter = adapter.clone();
                let provider_request = provider_request.clone();
                let ctx = ctx.clone();
                async move { adapter.complete_stream(provider_request, ctx).await }
            })
            .await;

        let upstream = match result {
            Ok(stream) => {
                guard.record_success();
                metrics::REQUESTS
                    .with_label_values(&[&provider_name, "ok"])
                    .inc();
                stream
            }
            Err(error) => {
                metrics::REQUESTS
                    .with_label_values(&[&provider_name, error.kind().as_str()])
                    .inc();
                if cancel.is_cancelled() {
                    drop(guard);
                } else {
                    guard.record_failure(&error);
                }
                return Err(error);
            }
        };

        let params = FanOutParams {
            request_id: request.id.to_string(),
            logical_model: decision.model.clone(),
            provider: decision.provider.clone(),
            filter: filter.clone(),
            filter_deltas: config.content_filtering.enable
                && config.content_filtering.filter_completions,
        };

        Ok(fan_out(upstream, params, self.stream_hook(request, decision, config)))
    }

    /// Builds the hook that writes the cost record when the stream ends —
    /// `completion` on a natural finish, `completion_partial` on
    /// cancellation, with usage falling back to tokenizer estimates.
    fn stream_hook(
        &self,
        request: &CompletionRequest,
        decision: &RoutingDecision,
        config: &Arc<GatewayConfig>,
    ) -> Box<dyn FnOnce(StreamTotals) + Send + 'static> {
        let ledger = self.ledger.clone();
        let enable = config.global_options.enable_cost_tracking;
        let user = request.user.clone();
        let project = project_of(request);
        let request_id = request.id.to_string();
        let provider = decision.provider.clone();
        let model = decision.model.clone();
        let pricing = config
            .routing
            .mapping(&decision.model)
            .map(|m| config.effective_pricing(m));
        let prompt_estimate = config
            .routing
            .mapping(&decision.model)
            .map(|m| tokenizer::estimate_for_request(request, m).prompt_tokens)
            .unwrap_or(0);

        Box::new(move |totals: StreamTotals| {
            let (Some(user), Some(pricing), true) = (user, pricing, enable) else {
                return;
            };
            let usage = totals.usage.unwrap_or_else(|| {
                Usage::new(
                    prompt_estimate,
                    tokenizer::count_tokens(&totals.content, &model),
                )
            });
            let operation = if totals.completed && !totals.errored {
                OperationType::Completion
            } else {
                OperationType::CompletionPartial
            };

            tokio::spawn(async move {
                let result = ledger
                    .track(TrackArgs {
                        user_id: &user,
                        project_id: project.as_deref(),
                        request_id: &request_id,
                        provider,
                        model_id: &model,
                        operation,
                        usage,
                        pricing: &pricing,
                        tags: Vec::new(),
                    })
                    .await;
                if let Err(error) = result {
                    warn!("stream cost record write failed: {error}");
                }
            });
        })
    }

    /// Embeddings: alias resolution, direct mapping, breaker + retry, ledger.
    pub async fn execute_embedding(
        &self,
        request: EmbeddingRequest,
    ) -> LLMResult<EmbeddingResponse> {
        let config = self.config.snapshot();
        let model = resolve_alias(&config.routing, &request.model)?;
        let mapping = config
            .routing
            .mapping(&model)
            .ok_or_else(|| LLMError::ModelNotFound(model.clone()))?;
        if !mapping.capabilities.embeddings {
            return Err(LLMError::NotSupported(format!(
                "{model} has no embedding capability"
            )));
        }

        let provider_name = mapping.provider.to_string();
        let adapter = self.registry.get(&provider_name)?;
        let guard = self.breaker.try_acquire(&provider_name)?;

        let mut provider_request = request.clone();
        provider_request.model = mapping.provider_model_id.clone();
        let ctx = CallContext::new(request.id.to_string(), self.call_timeout(&config, false));
        let retry = RetryPolicy::new(
            config.retry_policy.max_provider_retry_attempts,
            Duration::from_secs_f64(config.retry_policy.base_retry_interval_seconds.max(0.0)),
        );

        let cancel = CancellationToken::new();
        let result = retry
            .execute(&cancel, |_attempt| {
                let adapter = adapter.clone();
                let provider_request = provider_request.clone();
                let ctx = ctx.clone();
                async move { adapter.embed(&provider_request, &ctx).await }
            })
            .await;

        match result {
            Ok(mut response) => {
                guard.record_success();
                response.model = model.clone();
                response.provider = mapping.provider.clone();

                if config.global_options.enable_cost_tracking {
                    if let Some(user) = request.user.clone() {
                        let ledger = self.ledger.clone();
                        let pricing = config.effective_pricing(mapping);
                        let provider = mapping.provider.clone();
                        let request_id = request.id.to_string();
                        let usage = response.usage;
                        tokio::spawn(async move {
                            let _ = ledger
                                .track(TrackArgs {
                                    user_id: &user,
                                    project_id: None,
                                    request_id: &request_id,
                                    provider,
                                    model_id: &model,
                                    operation: OperationType::Embedding,
                                    usage,
                                    pricing: &pricing,
                                    tags: Vec::new(),
                                })
                                .await;
                        });
                    }
                }
                Ok(response)
            }
            Err(error) => {
                guard.record_failure(&error);
                Err(error)
            }
        }
    }

    async fn enforce_budget(
        &self,
        request: &CompletionRequest,
        config: &GatewayConfig,
    ) -> LLMResult<()> {
        if !config.global_options.enable_budget_enforcement {
            return Ok(());
        }
        let Some(user) = &request.user else {
            return Ok(());
        };

        let estimated = config
            .routing
            .mapping(&request.model)
            .map(|mapping| {
                let estimate = tokenizer::estimate_for_request(request, mapping);
                completion_cost(
                    &Usage::new(estimate.prompt_tokens, estimate.est_completion_tokens),
                    &config.effective_pricing(mapping),
                )
            })
            .unwrap_or(Decimal::ZERO);

        let within = self
            .ledger
            .is_within_budget(user, project_of(request).as_deref(), estimated)
            .await?;
        if !within {
            metrics::BUDGET_REJECTED.inc();
            return Err(LLMError::BudgetExceeded {
                user_id: user.clone(),
            });
        }
        Ok(())
    }

    fn cache_key(&self, request: &CompletionRequest, config: &GatewayConfig) -> Option<String> {
        if !config.global_options.enable_caching || request.stream {
            return None;
        }
        let mapping = config.routing.mapping(&request.model)?;
        Some(fingerprint(&mapping.provider, request))
    }

    fn call_timeout(&self, config: &GatewayConfig, streaming: bool) -> Duration {
        if streaming {
            Duration::from_secs(config.global_options.default_stream_timeout_seconds)
        } else {
            Duration::from_secs(config.global_options.default_timeout_seconds)
        }
    }
}

/// Aliases plus the user's pinned model, applied in router order.
fn effective_model(request: &CompletionRequest, config: &GatewayConfig) -> LLMResult<String> {
    let mut model = resolve_alias(&config.routing, &request.model)?;
    if !request.ignore_user_preference {
        if let Some(user) = &request.user {
            if let Some(preferred) = config.user_preferences.preferred_model(user) {
                model = resolve_alias(&config.routing, preferred)?;
            }
        }
    }
    Ok(model)
}

fn project_of(request: &CompletionRequest) -> Option<String> {
    request
        .metadata
        .get("project_id")
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// The request an adapter sees: provider-native model id, max_tokens clamped
/// into the mapping's context window. Clamping never fails the call; the
/// original value is reported back in response metadata.
fn provider_request(
    request: &CompletionRequest,
    decision: &RoutingDecision,
    mapping: Option<&ModelMapping>,
) -> (CompletionRequest, Option<u32>) {
    let mut provider_request = request.clone();
    provider_request.model = decision.provider_model_id.clone();

    let mut clamped_from = None;
    if let (Some(mapping), Some(requested)) = (mapping, request.max_tokens) {
        let estimate = tokenizer::estimate_for_request(request, mapping);
        let remaining = mapping
            .context_window
            .saturating_sub(estimate.prompt_tokens);
        if requested > remaining {
            provider_request.max_tokens = Some(remaining);
            clamped_from = Some(requested);
        }
    }
    (provider_request, clamped_from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        ContentFilterConfig, FallbackRule, ModelCapabilities, ModelPricing, ModelTag,
    };
    use crate::llm::cache::InMemoryResponseCache;
    use crate::llm::cost::{Budget, InMemoryLedger, LedgerRepository, ResetPeriod};
    use crate::llm::providers::mock::{MockAdapter, MockOutcome};
    use crate::llm::{ChatMessage, ProviderKind};
    use chrono::Utc;
    use futures::StreamExt;
    use uuid::Uuid;

    fn mapping(logical: &str, provider: ProviderKind) -> ModelMapping {
        ModelMapping {
            logical_id: logical.to_string(),
            provider,
            provider_model_id: logical.rsplit('.').next().unwrap_or(logical).to_string(),
            display_name: String::new(),
            context_window: 16_384,
            pricing: ModelPricing {
                input_per_token: Decimal::new(1, 6),
                output_per_token: Decimal::new(2, 6),
                fine_tune_per_token: None,
            },
            capabilities: ModelCapabilities {
                completions: true,
                embeddings: true,
                streaming: true,
                tools: false,
                vision: false,
            },
            tags: vec![ModelTag::Code],
        }
    }

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.routing.enable_smart = true;
        config.routing.model_mappings = vec![
            mapping("openai.gpt-4-turbo", ProviderKind::OpenAI),
            mapping("openai.gpt-3.5-turbo", ProviderKind::OpenAI),
            mapping("anthropic.claude-3-sonnet", ProviderKind::Anthropic),
        ];
        config.retry_policy.base_retry_interval_seconds = 0.001;
        config.fallbacks.rules = vec![FallbackRule {
            model_id: "openai.gpt-4-turbo".into(),
            fallback_models: vec![
                "openai.gpt-3.5-turbo".into(),
                "anthropic.claude-3-sonnet".into(),
            ],
            error_codes: vec![ErrorKind::RateLimitExceeded],
        }];
        config
    }

    struct Harness {
        pipeline: Pipeline,
        openai: Arc<MockAdapter>,
        anthropic: Arc<MockAdapter>,
        ledger: Arc<InMemoryLedger>,
        trace: mpsc::UnboundedReceiver<RoutingDecision>,
    }

    fn harness(config: GatewayConfig) -> Harness {
        let openai = Arc::new(MockAdapter::named("openai", ProviderKind::OpenAI));
        let anthropic = Arc::new(MockAdapter::named("anthropic", ProviderKind::Anthropic));
        let registry = Arc::new(ProviderRegistry::new(vec![
            openai.clone() as Arc<dyn ProviderAdapter>,
            anthropic.clone() as Arc<dyn ProviderAdapter>,
        ]));
        let ledger = Arc::new(InMemoryLedger::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = Pipeline::new(
            ConfigHandle::new(config),
            registry,
            Arc::new(InMemoryResponseCache::new()),
            CostTracker::new(ledger.clone()),
        )
        .with_trace(tx)
        .with_breaker(BreakerSettings {
            failure_threshold: 5,
            open_timeout: Duration::from_millis(80),
        });

        Harness {
            pipeline,
            openai,
            anthropic,
            ledger,
            trace: rx,
        }
    }

    fn request(model: &str, content: &str) -> CompletionRequest {
        let mut req = CompletionRequest::new(model, vec![ChatMessage::user(content)]);
        req.user = Some("alice".into());
        req
    }

    fn rate_limited() -> LLMError {
        LLMError::RateLimited {
            provider: "openai".into(),
            message: "429".into(),
            retry_after: None,
        }
    }

    #[tokio::test]
    async fn completion_flows_end_to_end_and_records_cost() {
        let h = harness(test_config());
        let response = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "say hi"))
            .await
            .unwrap();

        assert_eq!(response.model, "openai.gpt-4-turbo");
        assert_eq!(response.provider, ProviderKind::OpenAI);
        assert_eq!(response.content(), Some("echo: say hi"));

        // The cost record is written asynchronously.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let records = h
            .ledger
            .get_cost_records(&Default::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].total_tokens,
            records[0].input_tokens + records[0].output_tokens
        );
    }

    #[tokio::test]
    async fn identical_cacheable_requests_hit_upstream_once() {
        let h = harness(test_config());
        let mut req = request("openai.gpt-4-turbo", "2+2");
        req.temperature = Some(0.0);

        let first = h.pipeline.execute(req.clone()).await.unwrap();
        let mut second_req = req.clone();
        second_req.id = Uuid::new_v4();
        let second = h.pipeline.execute(second_req).await.unwrap();

        assert_eq!(h.openai.calls(), 1, "second request served from cache");
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap(),
            "cached response is byte-equal"
        );
    }

    #[tokio::test]
    async fn hot_temperature_requests_are_not_cached() {
        let h = harness(test_config());
        let mut req = request("openai.gpt-4-turbo", "be creative");
        req.temperature = Some(0.9);

        h.pipeline.execute(req.clone()).await.unwrap();
        let mut again = req.clone();
        again.id = Uuid::new_v4();
        h.pipeline.execute(again).await.unwrap();
        assert_eq!(h.openai.calls(), 2);
    }

    #[tokio::test]
    async fn rate_limit_falls_back_per_rule() {
        let h = harness(test_config());
        // Exhaust provider-level retries (2 retries = 3 attempts), then the
        // fallback model succeeds.
        for _ in 0..3 {
            h.openai.push(MockOutcome::Fail(rate_limited()));
        }
        h.openai.push(MockOutcome::Reply("from gpt-3.5".into()));

        let response = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "hello"))
            .await
            .unwrap();

        assert_eq!(response.model, "openai.gpt-3.5-turbo");
        assert_eq!(response.content(), Some("from gpt-3.5"));
        assert_eq!(h.openai.calls(), 4, "3 rate-limited attempts + fallback");
    }

    #[tokio::test]
    async fn fallback_emits_two_routing_decisions() {
        let mut h = harness(test_config());
        for _ in 0..3 {
            h.openai.push(MockOutcome::Fail(rate_limited()));
        }
        h.openai.push(MockOutcome::Reply("ok".into()));

        h.pipeline
            .execute(request("openai.gpt-4-turbo", "hello"))
            .await
            .unwrap();

        let mut decisions = Vec::new();
        while let Ok(d) = h.trace.try_recv() {
            decisions.push(d);
        }
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].model, "openai.gpt-4-turbo");
        assert_eq!(decisions[1].model, "openai.gpt-3.5-turbo");
        assert_eq!(decisions[1].reason, "fallback");
    }

    #[tokio::test]
    async fn non_eligible_errors_do_not_fall_back() {
        let h = harness(test_config());
        h.openai.push(MockOutcome::Fail(LLMError::BadRequest(
            "malformed".into(),
        )));

        let result = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "hello"))
            .await;
        assert!(matches!(result, Err(LLMError::BadRequest(_))));
        assert_eq!(h.openai.calls(), 1);
        assert_eq!(h.anthropic.calls(), 0);
    }

    #[tokio::test]
    async fn blocked_prompt_never_reaches_a_provider() {
        let mut config = test_config();
        config.content_filtering = ContentFilterConfig {
            blocked_terms: vec!["offensive-term".into()],
            ..ContentFilterConfig::default()
        };
        let h = harness(config);

        let result = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "Tell me about offensive-term"))
            .await;

        match result {
            Err(LLMError::ContentFiltered { categories, .. }) => {
                assert_eq!(categories, vec![crate::llm::FilterCategory::BlockedTerm]);
            }
            other => panic!("expected content_filtered, got {:?}", other.map(|_| ())),
        }
        assert_eq!(h.openai.calls(), 0);
    }

    #[tokio::test]
    async fn filtered_completion_is_replaced() {
        let mut config = test_config();
        config.content_filtering = ContentFilterConfig {
            blocked_terms: vec!["secretword".into()],
            ..ContentFilterConfig::default()
        };
        let h = harness(config);
        h.openai
            .push(MockOutcome::Reply("here is secretword for you".into()));

        let response = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "innocent prompt"))
            .await
            .unwrap();
        assert_eq!(response.content(), Some(FILTERED_PLACEHOLDER));
        assert_eq!(
            response.choices[0].finish_reason,
            Some(FinishReason::ContentFilter)
        );
    }

    #[tokio::test]
    async fn exhausted_budget_rejects_before_any_call() {
        let h = harness(test_config());
        h.ledger
            .create_budget(Budget {
                id: Uuid::new_v4(),
                user_id: "alice".into(),
                project_id: None,
                amount_usd: Decimal::ZERO,
                window_start: Utc::now() - chrono::Duration::hours(1),
                window_end: None,
                reset_period: Some(ResetPeriod::Daily),
                alert_threshold_pct: 80,
                enforce: true,
            })
            .await
            .unwrap();

        let result = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "anything"))
            .await;
        assert!(matches!(result, Err(LLMError::BudgetExceeded { .. })));
        assert_eq!(h.openai.calls(), 0);
    }

    #[tokio::test]
    async fn circuit_trips_after_threshold_and_fails_fast() {
        let mut config = test_config();
        config.fallbacks.rules.clear();
        config.retry_policy.max_provider_retry_attempts = 0;
        let h = harness(config);

        for _ in 0..5 {
            h.openai.push(MockOutcome::Fail(LLMError::ProviderUnavailable {
                provider: "openai".into(),
                message: "HTTP 500".into(),
            }));
            let _ = h
                .pipeline
                .execute(request("openai.gpt-4-turbo", "x"))
                .await;
        }
        assert_eq!(h.openai.calls(), 5);

        // Sixth call fails fast without touching the adapter, surfacing as
        // provider_unavailable.
        let started = Instant::now();
        let result = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "x"))
            .await;
        assert!(started.elapsed() < Duration::from_millis(10));
        match &result {
            Err(error) => {
                assert_eq!(error.kind(), ErrorKind::CircuitOpen);
                assert_eq!(error.public_code(), "provider_unavailable");
            }
            Ok(_) => panic!("expected failure"),
        }
        assert_eq!(h.openai.calls(), 5);

        // After the open window, a single probe closes the circuit again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let response = h
            .pipeline
            .execute(request("openai.gpt-4-turbo", "recovered?"))
            .await
            .unwrap();
        assert_eq!(response.content(), Some("echo: recovered?"));
    }

    #[tokio::test]
    async fn alias_cycle_fails_without_upstream_call() {
        let mut config = test_config();
        config.routing.aliases.insert("a".into(), "b".into());
        config.routing.aliases.insert("b".into(), "a".into());
        let h = harness(config);

        let result = h.pipeline.execute(request("a", "hello")).await;
        assert!(matches!(result, Err(LLMError::RoutingLoop(_))));
        assert_eq!(h.openai.calls(), 0);
    }

    #[tokio::test]
    async fn streaming_deltas_reassemble_and_record_usage() {
        let h = harness(test_config());
        h.openai
            .push(MockOutcome::Reply("streamed words here".into()));

        let mut req = request("openai.gpt-4-turbo", "stream please");
        req.stream = true;
        let mut stream = h
            .pipeline
            .execute_stream(req, CancellationToken::new())
            .await
            .unwrap();

        let mut text = String::new();
        let mut last = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            text.push_str(&chunk.delta);
            last = Some(chunk);
        }
        assert_eq!(text, "streamed words here");
        let last = last.unwrap();
        assert_eq!(last.finish_reason, Some(FinishReason::Stop));
        assert_eq!(last.model, "openai.gpt-4-turbo");

        tokio::time::sleep(Duration::from_millis(30)).await;
        let records = h
            .ledger
            .get_cost_records(&Default::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, OperationType::Completion);
    }

    #[tokio::test]
    async fn cancelled_stream_records_partial_usage() {
        let h = harness(test_config());
        h.openai
            .push(MockOutcome::Reply("a very long streamed answer".into()));

        let mut req = request("openai.gpt-4-turbo", "stream");
        req.stream = true;
        let cancel = CancellationToken::new();
        let mut stream = h
            .pipeline
            .execute_stream(req, cancel.clone())
            .await
            .unwrap();

        // Take three chunks, then cancel and walk away.
        for _ in 0..3 {
            let _ = stream.next().await;
        }
        cancel.cancel();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let records = h
            .ledger
            .get_cost_records(&Default::default())
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, OperationType::CompletionPartial);
    }

    #[tokio::test]
    async fn embedding_requests_route_and_track() {
        let h = harness(test_config());
        let mut req = EmbeddingRequest::new("openai.gpt-3.5-turbo", vec!["hello".into()]);
        req.user = Some("alice".into());

        let response = h.pipeline.execute_embedding(req).await.unwrap();
        assert_eq!(response.provider, ProviderKind::OpenAI);
        assert_eq!(response.embeddings.len(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let records = h
            .ledger
            .get_cost_records(&Default::default())
            .await
            .unwrap();
        assert_eq!(records[0].operation, OperationType::Embedding);
    }

    #[tokio::test]
    async fn max_tokens_clamp_is_reported_not_fatal() {
        let h = harness(test_config());
        let mut req = request("openai.gpt-4-turbo", "short prompt");
        req.max_tokens = Some(1_000_000);

        let response = h.pipeline.execute(req).await.unwrap();
        assert!(response.metadata.contains_key("max_tokens_clamped_from"));
    }
}
