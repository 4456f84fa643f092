//! Smart model router
//!
//! Resolves a logical model id to a concrete (provider, provider-model-id)
//! pair. Resolution order: alias fixpoint, user preference override, direct
//! mapping, then strategy execution (content-based, cost-optimized,
//! latency-optimized). Strategies are pure functions over the configuration
//! snapshot plus registry latency samples; every decision is emitted to the
//! trace sink so the reason for each outbound call is auditable.

use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{GatewayConfig, ModelMapping, ModelTag, RoutingConfig};
use crate::llm::registry::ProviderRegistry;
use crate::llm::tokenizer;
use crate::llm::{
    CompletionRequest, ErrorKind, LLMError, LLMResult, ProviderKind, RoutingDecision,
    RoutingStrategy,
};

/// Alias chains longer than this fail with `routing_loop`.
pub const MAX_ALIAS_DEPTH: usize = 4;

/// Prompts at or above this length route to long-context models.
const LONG_PROMPT_CHARS: usize = 16 * 1024;

/// Latency assumed for unsampled providers, in milliseconds.
fn default_latency_ms(provider: &ProviderKind) -> f64 {
    match provider {
        ProviderKind::OpenAI => 800.0,
        ProviderKind::AzureOpenAI => 850.0,
        ProviderKind::Cohere => 900.0,
        ProviderKind::Anthropic => 1_000.0,
        ProviderKind::Mock => 10.0,
        ProviderKind::Custom(_) => 1_200.0,
    }
}

/// Added per estimated token, so long requests prefer fast providers harder.
const PER_TOKEN_LATENCY_MS: f64 = 0.2;

lazy_static! {
    static ref CODE_MARKERS: Regex = Regex::new(
        r"(?s)```|\b(fn|def|class|import|function|struct|impl|return|println!|console\.log)\b"
    )
    .expect("static regex");
    static ref MATH_MARKERS: Regex = Regex::new(
        r"\\(int|frac|sum|sqrt|begin\{equation\})|\$\$|\b(integral|derivative|theorem|equation)\b"
    )
    .expect("static regex");
    static ref CREATIVE_MARKERS: Regex = Regex::new(
        r"(?i)\bwrite\b.{0,40}\b(story|poem|fiction|novel|song|screenplay)\b"
    )
    .expect("static regex");
    static ref ANALYTICAL_MARKERS: Regex =
        Regex::new(r"(?i)\b(analyze|analyse|evaluate|compare|assess|critique)\b")
            .expect("static regex");
}

/// Resolve aliases to a fixpoint, depth-capped; a cycle (or over-deep chain)
/// fails with `routing_loop` before any upstream call.
pub fn resolve_alias(routing: &RoutingConfig, model: &str) -> LLMResult<String> {
    let mut current = model.to_string();
    let mut seen = HashSet::new();
    seen.insert(current.clone());

    for _ in 0..MAX_ALIAS_DEPTH {
        let Some(next) = routing.aliases.get(&current) else {
            return Ok(current);
        };
        if !seen.insert(next.clone()) {
            return Err(LLMError::RoutingLoop(model.to_string()));
        }
        current = next.clone();
    }

    if routing.aliases.contains_key(&current) {
        return Err(LLMError::RoutingLoop(model.to_string()));
    }
    Ok(current)
}

pub struct Router {
    trace: Option<mpsc::UnboundedSender<RoutingDecision>>,
}

impl Router {
    pub fn new() -> Self {
        Self { trace: None }
    }

    /// Attach a trace sink; one record per decision, success or not.
    pub fn with_trace(trace: mpsc::UnboundedSender<RoutingDecision>) -> Self {
        Self { trace: Some(trace) }
    }

    fn emit(&self, decision: &RoutingDecision) {
        if let Some(trace) = &self.trace {
            let _ = trace.send(decision.clone());
        }
        debug!(
            "routing decision model={} provider={} strategy={} reason={:?} ok={}",
            decision.model,
            decision.provider,
            decision.strategy,
            decision.reason,
            decision.success
        );
    }

    /// Route one request.
    pub async fn route(
        &self,
        request: &CompletionRequest,
        config: &GatewayConfig,
        registry: &ProviderRegistry,
    ) -> LLMResult<RoutingDecision> {
        // 1. Aliases.
        let mut model = resolve_alias(&config.routing, &request.model)?;

        // 2. User preference override, unless the request opted out.
        if !request.ignore_user_preference {
            if let Some(user) = &request.user {
                if let Some(preferred) = config.user_preferences.preferred_model(user) {
                    model = resolve_alias(&config.routing, preferred)?;
                }
            }
        }

        // 3. Direct mapping.
        if let Some(mapping) = config.routing.mapping(&model) {
            let decision = decision_from(mapping, RoutingStrategy::DirectMapping, "direct mapping");
            self.emit(&decision);
            return Ok(decision);
        }

        // 4. Strategy selection: user preference, then per-model config,
        //    then content-based as the fallthrough for unmapped ids.
        let mut strategy = request
            .user
            .as_deref()
            .and_then(|user| config.user_preferences.preferred_strategy(user))
            .or_else(|| config.routing.strategy_for_model(&model))
            .unwrap_or(RoutingStrategy::ContentBased);

        if strategy == RoutingStrategy::DirectMapping {
            // Direct mapping already failed above.
            strategy = RoutingStrategy::ContentBased;
        }
        strategy = enabled_strategy(&config.routing, strategy);

        // 5. Strategy execution.
        let result = match strategy {
            RoutingStrategy::ContentBased => choose_content_based(request, config),
            RoutingStrategy::CostOptimized => choose_cost_optimized(request, config, registry).await,
            RoutingStrategy::LatencyOptimized => {
                choose_latency_optimized(request, config, registry).await
            }
            RoutingStrategy::DirectMapping => unreachable!("rewritten above"),
        };

        match result {
            Ok(decision) => {
                self.emit(&decision);
                Ok(decision)
            }
            Err(error) => {
                self.emit(&RoutingDecision {
                    provider: ProviderKind::Custom("unresolved".into()),
                    model: model.clone(),
                    provider_model_id: String::new(),
                    strategy,
                    reason: error.to_string(),
                    success: false,
                });
                Err(error)
            }
        }
    }

    /// Route a specific logical id (fallback candidates re-enter here).
    pub fn route_model(
        &self,
        logical: &str,
        config: &GatewayConfig,
        reason: &str,
    ) -> LLMResult<RoutingDecision> {
        let model = resolve_alias(&config.routing, logical)?;
        let mapping = config
            .routing
            .mapping(&model)
            .ok_or_else(|| LLMError::ModelNotFound(model.clone()))?;
        let decision = decision_from(mapping, RoutingStrategy::DirectMapping, reason);
        self.emit(&decision);
        Ok(decision)
    }

    /// Fallback candidates for `model` after an error of `kind`, skipping
    /// models already attempted this invocation, bounded by configuration.
    pub fn fallback_chain(
        &self,
        config: &GatewayConfig,
        model: &str,
        kind: ErrorKind,
        attempted: &HashSet<String>,
    ) -> Vec<String> {
        let Some(rule) = config.fallbacks.rule_for(model, kind) else {
            return Vec::new();
        };
        rule.fallback_models
            .iter()
            .filter(|candidate| !attempted.contains(*candidate))
            .take(config.fallbacks.max_fallback_attempts as usize)
            .cloned()
            .collect()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn decision_from(
    mapping: &ModelMapping,
    strategy: RoutingStrategy,
    reason: &str,
) -> RoutingDecision {
    RoutingDecision {
        provider: mapping.provider.clone(),
        model: mapping.logical_id.clone(),
        provider_model_id: mapping.provider_model_id.clone(),
        strategy,
        reason: reason.to_string(),
        success: true,
    }
}

/// Downgrade a disabled strategy to the next enabled one.
fn enabled_strategy(routing: &RoutingConfig, strategy: RoutingStrategy) -> RoutingStrategy {
    if !routing.enable_smart {
        return RoutingStrategy::ContentBased;
    }
    match strategy {
        RoutingStrategy::CostOptimized if !routing.enable_cost_optimized => {
            RoutingStrategy::ContentBased
        }
        RoutingStrategy::LatencyOptimized if !routing.enable_latency_optimized => {
            RoutingStrategy::ContentBased
        }
        other => other,
    }
}

fn completion_pool(config: &GatewayConfig) -> Vec<&ModelMapping> {
    config
        .routing
        .model_mappings
        .iter()
        .filter(|m| m.capabilities.completions)
        .collect()
}

/// First-match-wins bucket inspection of the concatenated message text.
fn choose_content_based(
    request: &CompletionRequest,
    config: &GatewayConfig,
) -> LLMResult<RoutingDecision> {
    let content = request.joined_content();
    let pool = completion_pool(config);
    if pool.is_empty() {
        return Err(LLMError::ModelNotFound(request.model.clone()));
    }

    let bucket = if CODE_MARKERS.is_match(&content) {
        Some((ModelTag::Code, "code markers"))
    } else if MATH_MARKERS.is_match(&content) {
        Some((ModelTag::Math, "math markers"))
    } else if CREATIVE_MARKERS.is_match(&content) {
        Some((ModelTag::Creative, "creative verbs"))
    } else if ANALYTICAL_MARKERS.is_match(&content) {
        Some((ModelTag::Analytical, "analytical verbs"))
    } else if content.len() >= LONG_PROMPT_CHARS {
        Some((ModelTag::LongContext, "long prompt"))
    } else {
        None
    };

    // Ties (several mappings in one bucket) break by mapping order.
    let (mapping, reason) = match bucket {
        Some((tag, label)) => match pool.iter().find(|m| m.tags.contains(&tag)) {
            Some(mapping) => (*mapping, format!("content bucket: {label}")),
            None => (pool[0], format!("content bucket {label} unstaffed, first mapping")),
        },
        None => (pool[0], "no content bucket matched, first mapping".to_string()),
    };

    Ok(decision_from(
        mapping,
        RoutingStrategy::ContentBased,
        &reason,
    ))
}

/// Minimize estimated USD cost; ties break on the latency estimate.
async fn choose_cost_optimized(
    request: &CompletionRequest,
    config: &GatewayConfig,
    registry: &ProviderRegistry,
) -> LLMResult<RoutingDecision> {
    let pool = completion_pool(config);
    if pool.is_empty() {
        return Err(LLMError::ModelNotFound(request.model.clone()));
    }

    let mut best: Option<(&ModelMapping, Decimal, f64)> = None;
    for mapping in pool {
        let estimate = tokenizer::estimate_for_request(request, mapping);
        let pricing = config.effective_pricing(mapping);
        let cost = Decimal::from(estimate.prompt_tokens) * pricing.input_per_token
            + Decimal::from(estimate.est_completion_tokens) * pricing.output_per_token;
        let latency = latency_estimate(registry, mapping, estimate.total_tokens).await;

        let better = match &best {
            None => true,
            Some((_, best_cost, best_latency)) => {
                cost < *best_cost || (cost == *best_cost && latency < *best_latency)
            }
        };
        if better {
            best = Some((mapping, cost, latency));
        }
    }

    match best {
        Some((mapping, cost, _)) => Ok(decision_from(
            mapping,
            RoutingStrategy::CostOptimized,
            &format!("estimated cost {cost} USD"),
        )),
        None => Err(LLMError::ModelNotFound(request.model.clone())),
    }
}

/// Minimize recent average response time, falling back to the default table
/// for unsampled providers.
async fn choose_latency_optimized(
    request: &CompletionRequest,
    config: &GatewayConfig,
    registry: &ProviderRegistry,
) -> LLMResult<RoutingDecision> {
    let pool = completion_pool(config);
    if pool.is_empty() {
        return Err(LLMError::ModelNotFound(request.model.clone()));
    }

    let mut best: Option<(&ModelMapping, f64)> = None;
    for mapping in pool {
        let estimate = tokenizer::estimate_for_request(request, mapping);
        let latency = latency_estimate(registry, mapping, estimate.total_tokens).await;
        if best.map_or(true, |(_, b)| latency < b) {
            best = Some((mapping, latency));
        }
    }

    match best {
        Some((mapping, latency)) => Ok(decision_from(
            mapping,
            RoutingStrategy::LatencyOptimized,
            &format!("estimated latency {latency:.0} ms"),
        )),
        None => Err(LLMError::ModelNotFound(request.model.clone())),
    }
}

async fn latency_estimate(
    registry: &ProviderRegistry,
    mapping: &ModelMapping,
    total_tokens: u32,
) -> f64 {
    let base = registry
        .average_latency_ms(&mapping.provider.to_string())
        .await
        .unwrap_or_else(|| default_latency_ms(&mapping.provider));
    base + total_tokens as f64 * PER_TOKEN_LATENCY_MS
}
