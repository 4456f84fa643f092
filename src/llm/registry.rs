//! Provider registry
//!
//! The startup-built name→adapter table, plus the health loop that samples
//! `is_available` latency across providers. Latency observations recorded by
//! the pipeline also land here; the router's latency-optimized strategy reads
//! them back.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::llm::traits::ProviderAdapter;
use crate::llm::{LLMError, LLMResult};

/// Sampled health of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub available: bool,
    pub last_check: DateTime<Utc>,
    /// Exponentially-weighted average request latency in milliseconds.
    pub avg_latency_ms: f64,
    pub latency_samples: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            available: true,
            last_check: Utc::now(),
            avg_latency_ms: 0.0,
            latency_samples: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// Weight of each new latency sample in the running average.
const EWMA_ALPHA: f64 = 0.3;

/// Name→adapter table with stable iteration order.
pub struct ProviderRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    by_name: HashMap<String, usize>,
    health: RwLock<HashMap<String, ProviderHealth>>,
}

impl ProviderRegistry {
    pub fn new(adapters: Vec<Arc<dyn ProviderAdapter>>) -> Self {
        let mut by_name = HashMap::new();
        let mut health = HashMap::new();
        for (index, adapter) in adapters.iter().enumerate() {
            by_name.insert(adapter.name().to_ascii_lowercase(), index);
            health.insert(adapter.name().to_string(), ProviderHealth::default());
        }
        Self {
            adapters,
            by_name,
            health: RwLock::new(health),
        }
    }

    /// Case-insensitive lookup; `provider_not_found` otherwise.
    pub fn get(&self, name: &str) -> LLMResult<Arc<dyn ProviderAdapter>> {
        self.by_name
            .get(&name.to_ascii_lowercase())
            .map(|&index| self.adapters[index].clone())
            .ok_or_else(|| LLMError::ProviderNotFound(name.to_string()))
    }

    /// All adapters in registration order.
    pub fn all(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.adapters.clone()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Record one observed call latency for `name`.
    pub async fn record_latency(&self, name: &str, latency: Duration) {
        let mut health = self.health.write().await;
        let entry = health.entry(name.to_string()).or_default();
        let millis = latency.as_secs_f64() * 1000.0;
        entry.avg_latency_ms = if entry.latency_samples == 0 {
            millis
        } else {
            EWMA_ALPHA * millis + (1.0 - EWMA_ALPHA) * entry.avg_latency_ms
        };
        entry.latency_samples += 1;
    }

    /// Average latency in milliseconds, `None` when unsampled.
    pub async fn average_latency_ms(&self, name: &str) -> Option<f64> {
        let health = self.health.read().await;
        health
            .get(name)
            .filter(|h| h.latency_samples > 0)
            .map(|h| h.avg_latency_ms)
    }

    pub async fn health_snapshot(&self) -> Vec<(String, ProviderHealth)> {
        let health = self.health.read().await;
        let mut entries: Vec<_> = self
            .adapters
            .iter()
            .map(|a| {
                (
                    a.name().to_string(),
                    health.get(a.name()).cloned().unwrap_or_default(),
                )
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Probe every adapter once, folding results into the health table.
    pub async fn run_health_checks(&self) {
        for adapter in &self.adapters {
            let started = Instant::now();
            let available = adapter.is_available().await;
            let elapsed = started.elapsed();

            let mut health = self.health.write().await;
            let entry = health.entry(adapter.name().to_string()).or_default();
            entry.available = available;
            entry.last_check = Utc::now();
            if available {
                entry.consecutive_failures = 0;
                entry.last_error = None;
                let millis = elapsed.as_secs_f64() * 1000.0;
                entry.avg_latency_ms = if entry.latency_samples == 0 {
                    millis
                } else {
                    EWMA_ALPHA * millis + (1.0 - EWMA_ALPHA) * entry.avg_latency_ms
                };
                entry.latency_samples += 1;
                debug!("health probe ok provider={} {:?}", adapter.name(), elapsed);
            } else {
                entry.consecutive_failures += 1;
                entry.last_error = Some("liveness probe failed".into());
                warn!(
                    "health probe failed provider={} ({} consecutive)",
                    adapter.name(),
                    entry.consecutive_failures
                );
            }
        }
    }

    /// Background probe loop; default cadence is five minutes.
    pub fn spawn_health_loop(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.run_health_checks().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::providers::mock::MockAdapter;
    use crate::llm::ProviderKind;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(vec![
            Arc::new(MockAdapter::named("openai", ProviderKind::OpenAI)),
            Arc::new(MockAdapter::named("anthropic", ProviderKind::Anthropic)),
        ])
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = registry();
        assert!(registry.get("OpenAI").is_ok());
        assert!(registry.get("ANTHROPIC").is_ok());
        assert!(matches!(
            registry.get("cohere"),
            Err(LLMError::ProviderNotFound(_))
        ));
    }

    #[test]
    fn all_preserves_registration_order() {
        let registry = registry();
        let names: Vec<_> = registry.all().iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["openai", "anthropic"]);
    }

    #[tokio::test]
    async fn latency_samples_feed_the_average() {
        let registry = registry();
        assert_eq!(registry.average_latency_ms("openai").await, None);

        registry
            .record_latency("openai", Duration::from_millis(100))
            .await;
        assert_eq!(registry.average_latency_ms("openai").await, Some(100.0));

        registry
            .record_latency("openai", Duration::from_millis(200))
            .await;
        let avg = registry.average_latency_ms("openai").await.unwrap();
        assert!(avg > 100.0 && avg < 200.0, "ewma between samples, got {avg}");
    }

    #[tokio::test]
    async fn health_checks_mark_unavailable_adapters() {
        let down = Arc::new(MockAdapter::named("openai", ProviderKind::OpenAI));
        down.set_available(false);
        let registry = ProviderRegistry::new(vec![down]);

        registry.run_health_checks().await;
        let snapshot = registry.health_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(!snapshot[0].1.available);
        assert_eq!(snapshot[0].1.consecutive_failures, 1);
    }
}
