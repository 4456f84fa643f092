//! Gateway configuration
//!
//! Everything the gateway can be told at startup lives here: model mappings,
//! aliases, routing strategies, fallback rules, filtering, retry and rate
//! limit policy, provider credentials, and pricing overrides. A loaded
//! configuration is immutable; hot reload swaps the `Arc` snapshot held by
//! [`ConfigHandle`] so in-flight requests keep the snapshot they started with.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::llm::{ErrorKind, ProviderKind, RoutingStrategy};

/// Process-wide toggles and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalOptions {
    pub enable_caching: bool,
    pub cache_expiration_minutes: u64,
    pub track_token_usage: bool,
    pub enable_cost_tracking: bool,
    pub enable_budget_enforcement: bool,
    pub default_timeout_seconds: u64,
    pub default_stream_timeout_seconds: u64,
    /// Batch endpoint concurrency.
    pub batch_concurrency: usize,
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            enable_caching: true,
            cache_expiration_minutes: 60,
            track_token_usage: true,
            enable_cost_tracking: true,
            enable_budget_enforcement: true,
            default_timeout_seconds: 30,
            default_stream_timeout_seconds: 120,
            batch_concurrency: 5,
        }
    }
}

/// Per-token pricing for a mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub input_per_token: Decimal,
    pub output_per_token: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fine_tune_per_token: Option<Decimal>,
}

/// What a mapped model can do.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelCapabilities {
    pub completions: bool,
    pub embeddings: bool,
    pub streaming: bool,
    pub tools: bool,
    pub vision: bool,
}

impl Default for ModelCapabilities {
    fn default() -> Self {
        Self {
            completions: true,
            embeddings: false,
            streaming: true,
            tools: false,
            vision: false,
        }
    }
}

/// Content-affinity tags backing the content-based routing buckets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelTag {
    Code,
    Math,
    Creative,
    Analytical,
    LongContext,
}

/// One row resolving a logical model id to a concrete provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub logical_id: String,
    pub provider: ProviderKind,
    pub provider_model_id: String,
    #[serde(default)]
    pub display_name: String,
    pub context_window: u32,
    #[serde(default)]
    pub pricing: ModelPricing,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub tags: Vec<ModelTag>,
}

/// Per-model strategy override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoutingStrategy {
    pub model_id: String,
    pub strategy: RoutingStrategy,
}

/// Routing tables and toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub enable_smart: bool,
    pub enable_content_based: bool,
    pub enable_cost_optimized: bool,
    pub enable_latency_optimized: bool,
    pub experimental_sampling_rate: f64,
    pub model_mappings: Vec<ModelMapping>,
    pub model_routing_strategies: Vec<ModelRoutingStrategy>,
    /// Logical-id aliases, non-cyclic, resolution depth capped at 4.
    pub aliases: HashMap<String, String>,
}

impl RoutingConfig {
    pub fn mapping(&self, logical_id: &str) -> Option<&ModelMapping> {
        self.model_mappings
            .iter()
            .find(|m| m.logical_id == logical_id)
    }

    pub fn strategy_for_model(&self, model_id: &str) -> Option<RoutingStrategy> {
        self.model_routing_strategies
            .iter()
            .find(|s| s.model_id == model_id)
            .map(|s| s.strategy)
    }
}

/// A user's pinned model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserModelPreference {
    pub user_id: String,
    pub model_id: String,
}

/// A user's pinned routing strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRoutingPreference {
    pub user_id: String,
    pub strategy: RoutingStrategy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPreferences {
    pub user_model_preferences: Vec<UserModelPreference>,
    pub user_routing_preferences: Vec<UserRoutingPreference>,
}

impl UserPreferences {
    pub fn preferred_model(&self, user_id: &str) -> Option<&str> {
        self.user_model_preferences
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.model_id.as_str())
    }

    pub fn preferred_strategy(&self, user_id: &str) -> Option<RoutingStrategy> {
        self.user_routing_preferences
            .iter()
            .find(|p| p.user_id == user_id)
            .map(|p| p.strategy)
    }
}

/// Ordered alternates consulted when a model's provider fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackRule {
    pub model_id: String,
    pub fallback_models: Vec<String>,
    /// Error codes that make this rule apply.
    pub error_codes: Vec<ErrorKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub enable_fallbacks: bool,
    pub max_fallback_attempts: u32,
    pub rules: Vec<FallbackRule>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enable_fallbacks: true,
            max_fallback_attempts: 3,
            rules: Vec::new(),
        }
    }
}

impl FallbackConfig {
    /// The rule for `model_id` whose `error_codes` contains `kind`, if any.
    pub fn rule_for(&self, model_id: &str, kind: ErrorKind) -> Option<&FallbackRule> {
        if !self.enable_fallbacks {
            return None;
        }
        self.rules
            .iter()
            .find(|r| r.model_id == model_id && r.error_codes.contains(&kind))
    }
}

/// Token-bucket request limiting, keyed per API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub token_limit: u32,
    pub tokens_per_period: u32,
    pub replenishment_period_seconds: u64,
    pub queue_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            token_limit: 100,
            tokens_per_period: 20,
            replenishment_period_seconds: 10,
            queue_limit: 50,
        }
    }
}

/// Heuristic category thresholds in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterThresholds {
    pub hate: f64,
    pub harassment: f64,
    pub self_harm: f64,
    pub sexual: f64,
    pub violence: f64,
}

impl Default for FilterThresholds {
    fn default() -> Self {
        Self {
            hate: 0.8,
            harassment: 0.8,
            self_harm: 0.6,
            sexual: 0.8,
            violence: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFilterConfig {
    pub enable: bool,
    pub filter_prompts: bool,
    pub filter_completions: bool,
    pub use_ml_filtering: bool,
    /// When the ML classifier errors: true lets traffic through, false blocks
    /// with reason `moderation_unavailable`.
    pub fail_open_on_moderation_error: bool,
    pub thresholds: FilterThresholds,
    pub blocked_terms: Vec<String>,
    pub blocked_patterns: Vec<String>,
}

impl Default for ContentFilterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            filter_prompts: true,
            filter_completions: true,
            use_ml_filtering: false,
            fail_open_on_moderation_error: true,
            thresholds: FilterThresholds::default(),
            blocked_terms: Vec::new(),
            blocked_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_retry_attempts: u32,
    /// Retries performed inside one provider attempt, before fallback.
    pub max_provider_retry_attempts: u32,
    pub base_retry_interval_seconds: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            max_provider_retry_attempts: 2,
            base_retry_interval_seconds: 1.0,
        }
    }
}

/// Azure deployment binding: a deployment id fronting one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub deployment_id: String,
    pub model_id: String,
}

/// Connection settings for one upstream provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: String,
    pub api_url: Option<String>,
    pub api_version: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub deployments: Vec<Deployment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai: Option<ProviderSettings>,
    pub anthropic: Option<ProviderSettings>,
    pub cohere: Option<ProviderSettings>,
    pub azure_openai: Option<ProviderSettings>,
    /// Registers the scriptable mock adapter; test and dry-run deployments.
    pub mock: Option<ProviderSettings>,
}

/// Pricing override row in the cost-management table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPrice {
    pub input_price_per_token: Decimal,
    pub output_price_per_token: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CostManagementConfig {
    /// provider name → model id → price override.
    pub pricing: HashMap<String, HashMap<String, ModelPrice>>,
    /// provider name → per-token fine-tuning rate.
    pub fine_tuning_pricing: HashMap<String, Decimal>,
}

impl CostManagementConfig {
    pub fn price_override(&self, provider: &ProviderKind, model_id: &str) -> Option<&ModelPrice> {
        self.pricing
            .get(&provider.to_string())
            .and_then(|models| models.get(model_id))
    }

    pub fn fine_tune_rate(&self, provider: &ProviderKind) -> Option<Decimal> {
        self.fine_tuning_pricing.get(&provider.to_string()).copied()
    }
}

/// The whole gateway configuration. One immutable snapshot per version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub global_options: GlobalOptions,
    pub routing: RoutingConfig,
    pub user_preferences: UserPreferences,
    pub fallbacks: FallbackConfig,
    pub rate_limit: RateLimitConfig,
    pub content_filtering: ContentFilterConfig,
    pub retry_policy: RetryPolicyConfig,
    pub providers: ProvidersConfig,
    pub cost_management: CostManagementConfig,
}

impl GatewayConfig {
    /// Load from an optional TOML file layered under `GATEWAY_`-prefixed
    /// environment variables (`GATEWAY_GLOBAL_OPTIONS__ENABLE_CACHING=false`).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(
                config::Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Effective pricing for a mapping: the cost-management override wins,
    /// then the mapping's own pricing.
    pub fn effective_pricing(&self, mapping: &ModelMapping) -> ModelPricing {
        if let Some(price) = self
            .cost_management
            .price_override(&mapping.provider, &mapping.logical_id)
        {
            return ModelPricing {
                input_per_token: price.input_price_per_token,
                output_per_token: price.output_price_per_token,
                fine_tune_per_token: mapping.pricing.fine_tune_per_token,
            };
        }
        mapping.pricing.clone()
    }
}

/// Shared pointer to the current configuration snapshot.
///
/// Readers grab an `Arc` once at pipeline entry and never observe a reload
/// mid-request.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<std::sync::RwLock<Arc<GatewayConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(std::sync::RwLock::new(Arc::new(config))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Atomically replace the snapshot. In-flight requests are unaffected.
    pub fn swap(&self, config: GatewayConfig) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(logical: &str, provider: ProviderKind) -> ModelMapping {
        ModelMapping {
            logical_id: logical.to_string(),
            provider,
            provider_model_id: logical.rsplit('.').next().unwrap_or(logical).to_string(),
            display_name: String::new(),
            context_window: 8192,
            pricing: ModelPricing::default(),
            capabilities: ModelCapabilities::default(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn defaults_are_sensible() {
        let config = GatewayConfig::default();
        assert!(config.global_options.enable_caching);
        assert_eq!(config.retry_policy.max_retry_attempts, 3);
        assert_eq!(config.retry_policy.max_provider_retry_attempts, 2);
        assert_eq!(config.fallbacks.max_fallback_attempts, 3);
        assert_eq!(config.global_options.default_timeout_seconds, 30);
    }

    #[test]
    fn fallback_rule_lookup_matches_code() {
        let config = FallbackConfig {
            enable_fallbacks: true,
            max_fallback_attempts: 3,
            rules: vec![FallbackRule {
                model_id: "openai.gpt-4-turbo".into(),
                fallback_models: vec!["openai.gpt-3.5-turbo".into()],
                error_codes: vec![ErrorKind::RateLimitExceeded],
            }],
        };

        assert!(config
            .rule_for("openai.gpt-4-turbo", ErrorKind::RateLimitExceeded)
            .is_some());
        assert!(config
            .rule_for("openai.gpt-4-turbo", ErrorKind::Timeout)
            .is_none());
        assert!(config
            .rule_for("anthropic.claude-3-opus", ErrorKind::RateLimitExceeded)
            .is_none());
    }

    #[test]
    fn disabled_fallbacks_never_match() {
        let config = FallbackConfig {
            enable_fallbacks: false,
            max_fallback_attempts: 3,
            rules: vec![FallbackRule {
                model_id: "m".into(),
                fallback_models: vec!["n".into()],
                error_codes: vec![ErrorKind::UpstreamError],
            }],
        };
        assert!(config.rule_for("m", ErrorKind::UpstreamError).is_none());
    }

    #[test]
    fn pricing_override_beats_mapping() {
        let mut config = GatewayConfig::default();
        let m = mapping("openai.gpt-4", ProviderKind::OpenAI);
        config.cost_management.pricing.insert(
            "openai".to_string(),
            HashMap::from([(
                "openai.gpt-4".to_string(),
                ModelPrice {
                    input_price_per_token: Decimal::new(5, 5),
                    output_price_per_token: Decimal::new(1, 4),
                },
            )]),
        );

        let effective = config.effective_pricing(&m);
        assert_eq!(effective.input_per_token, Decimal::new(5, 5));
        assert_eq!(effective.output_per_token, Decimal::new(1, 4));
    }

    #[test]
    fn config_handle_swaps_atomically() {
        let handle = ConfigHandle::new(GatewayConfig::default());
        let before = handle.snapshot();
        assert!(before.global_options.enable_caching);

        let mut next = GatewayConfig::default();
        next.global_options.enable_caching = false;
        handle.swap(next);

        // The old snapshot is untouched; fresh reads see the new one.
        assert!(before.global_options.enable_caching);
        assert!(!handle.snapshot().global_options.enable_caching);
    }
}
