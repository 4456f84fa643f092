// Gateway server binary
// Run with: cargo run --bin server

use clap::Parser;
use dotenv::dotenv;
use llm_gateway::config::GatewayConfig;
use llm_gateway::server::GatewayServerBuilder;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llm-gateway", about = "Multi-provider LLM gateway")]
struct Args {
    /// Bind address.
    #[arg(long, env = "GATEWAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Bind port.
    #[arg(long, env = "GATEWAY_PORT", default_value_t = 8080)]
    port: u16,

    /// Configuration file (TOML); environment variables override it.
    #[arg(long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; production sets real environment variables.
    if dotenv().is_err() {
        eprintln!("no .env file found, using process environment");
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    info!("🚀 starting llm-gateway");
    let config = GatewayConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("configuration load failed: {e}"))?;

    if config.routing.model_mappings.is_empty() {
        warn!("no model mappings configured; only directly named provider models will resolve");
    }
    info!(
        "{} model mappings, {} aliases, {} fallback rules",
        config.routing.model_mappings.len(),
        config.routing.aliases.len(),
        config.fallbacks.rules.len()
    );

    let server = GatewayServerBuilder::new(config)
        .bind(args.host, args.port)
        .config_path(args.config)
        .build();

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("server exited: {e}"))
}
