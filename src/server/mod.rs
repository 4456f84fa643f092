//! Server assembly
//!
//! Wires configuration, adapters, registry, ledger and pipeline into a
//! running axum server. The builder is the single place where the object
//! graph is put together; everything downstream receives its dependencies
//! explicitly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::handlers::GatewayState;
use crate::config::{ConfigHandle, GatewayConfig};
use crate::llm::cache::InMemoryResponseCache;
use crate::llm::cost::{CostTracker, InMemoryLedger, LedgerRepository};
use crate::llm::pipeline::Pipeline;
use crate::llm::providers::build_adapters;
use crate::llm::ratelimit::RateLimiter;
use crate::llm::registry::ProviderRegistry;
use crate::llm::traits::ProviderAdapter;

/// Cadence of the background provider health loop.
const HEALTH_INTERVAL: Duration = Duration::from_secs(300);
/// Cadence of the cache expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct GatewayServerBuilder {
    config: GatewayConfig,
    config_path: Option<PathBuf>,
    ledger: Option<Arc<dyn LedgerRepository>>,
    extra_adapters: Vec<Arc<dyn ProviderAdapter>>,
    host: String,
    port: u16,
}

impl GatewayServerBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            config_path: None,
            ledger: None,
            extra_adapters: Vec::new(),
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }

    pub fn bind(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Source file for `/admin/reload`.
    pub fn config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    /// Durable ledger backing; defaults to in-memory.
    pub fn ledger(mut self, ledger: Arc<dyn LedgerRepository>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Register an adapter beyond the configured ones (tests, custom
    /// upstreams).
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.extra_adapters.push(adapter);
        self
    }

    pub fn build(self) -> GatewayServer {
        let mut adapters = build_adapters(&self.config.providers);
        adapters.extend(self.extra_adapters);
        info!("{} provider adapters registered", adapters.len());

        let registry = Arc::new(ProviderRegistry::new(adapters));
        let handle = ConfigHandle::new(self.config);

        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new()));
        let cache = Arc::new(InMemoryResponseCache::new());
        let limiter = Arc::new(RateLimiter::new(&handle.snapshot().rate_limit));

        let pipeline = Arc::new(Pipeline::new(
            handle.clone(),
            registry.clone(),
            cache.clone(),
            CostTracker::new(ledger),
        ));

        let state = GatewayState {
            pipeline,
            config: handle,
            limiter,
            config_path: self.config_path,
        };

        GatewayServer {
            state,
            registry,
            cache,
            host: self.host,
            port: self.port,
        }
    }
}

pub struct GatewayServer {
    state: GatewayState,
    registry: Arc<ProviderRegistry>,
    cache: Arc<InMemoryResponseCache>,
    host: String,
    port: u16,
}

impl GatewayServer {
    pub fn state(&self) -> GatewayState {
        self.state.clone()
    }

    /// Serve until the process is stopped.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;

        // Background chores: provider health sampling, cache expiry sweep.
        let _health = self.registry.spawn_health_loop(HEALTH_INTERVAL);
        let cache = self.cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                cache.purge_expired();
            }
        });

        let app = crate::api::routes(self.state).layer(CorsLayer::permissive());

        info!("gateway listening on {addr}");
        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .await?;
        Ok(())
    }
}
