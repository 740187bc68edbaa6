//! arbwatch — detection core entry point.
//!
//! Loads the TOML config, binds one alloy transport per configured
//! endpoint, assembles a coordinator per enabled chain under the
//! cross-chain router, and runs until SIGINT/SIGTERM. Execution transport
//! is external: in detection mode (the default) opportunities are logged
//! as their wire envelope instead of being sent anywhere.

use anyhow::{Context, Result};
use arbwatch::config::{AppConfig, ExecutionMode};
use arbwatch::coordinator::ChainCoordinator;
use arbwatch::dispatch::Executor;
use arbwatch::router::CrossChainRouter;
use arbwatch::rpc::{AlloyTransport, ChainClient, Endpoint, RpcPool};
use arbwatch::types::{ExecutionResult, ExecutionStatus, Opportunity};
use clap::Parser;
use futures::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arbwatch", about = "Multi-chain DEX arbitrage detection core")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(short, long, env = "ARBWATCH_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    /// Validate the config and print a summary, then exit.
    #[arg(long)]
    check: bool,
}

/// Detection-mode executor: logs the opportunity envelope and reports it
/// as simulated. Real execution transports implement `Executor` outside
/// this binary.
struct EnvelopeLogger;

#[async_trait::async_trait]
impl Executor for EnvelopeLogger {
    async fn execute(&self, opportunity: Opportunity) -> ExecutionResult {
        match serde_json::to_string(&opportunity) {
            Ok(envelope) => info!(target: "arbwatch::envelope", %envelope, "opportunity"),
            Err(err) => warn!(%err, "envelope serialization failed"),
        }
        ExecutionResult {
            status: ExecutionStatus::Simulated,
            tx_hash: None,
            actual_profit_usd: None,
            gas_used: None,
        }
    }
}

async fn build_coordinator(
    app: &AppConfig,
    chain: arbwatch::config::ChainConfig,
) -> Result<Arc<ChainCoordinator>> {
    let mut endpoints = Vec::new();
    for endpoint_cfg in &chain.endpoints {
        match AlloyTransport::connect(endpoint_cfg).await {
            Ok(transport) => {
                endpoints.push(Endpoint::new(
                    endpoint_cfg.url.clone(),
                    endpoint_cfg.kind,
                    endpoint_cfg.weight,
                    Arc::new(transport) as Arc<dyn ChainClient>,
                ));
            }
            Err(err) => {
                warn!(chain = %chain.name, url = %endpoint_cfg.url, %err, "endpoint connect failed");
            }
        }
    }
    if endpoints.is_empty() {
        anyhow::bail!("chain {}: no endpoint could be connected", chain.name);
    }

    let rpc = Arc::new(RpcPool::new(chain.id, endpoints));
    let lending_pools = chain.lending_pools.clone();
    let coordinator = ChainCoordinator::new(
        chain,
        app,
        rpc,
        Arc::new(EnvelopeLogger) as Arc<dyn Executor>,
        None,
        lending_pools,
    )?;
    Ok(coordinator)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let app = AppConfig::from_toml_path(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let enabled: Vec<_> = app.enabled_chains().cloned().collect();
    info!(
        chains = enabled.len(),
        mode = ?app.execution.mode,
        "configuration loaded"
    );
    for chain in &enabled {
        info!(
            chain = %chain.name,
            id = chain.id,
            endpoints = chain.endpoints.len(),
            venues = chain.venues.len(),
            pools = chain.pools.len(),
            "chain configured"
        );
    }
    if cli.check {
        return Ok(());
    }
    if app.execution.mode != ExecutionMode::Detection {
        warn!(
            mode = ?app.execution.mode,
            "no execution transport is wired into this binary; opportunities will be logged only"
        );
    }

    let mut coordinators = Vec::new();
    for chain in enabled {
        let name = chain.name.clone();
        match build_coordinator(&app, chain).await {
            Ok(coordinator) => coordinators.push(coordinator),
            Err(err) => error!(chain = %name, %err, "chain skipped"),
        }
    }
    if coordinators.is_empty() {
        anyhow::bail!("no chain could be started");
    }

    let router = CrossChainRouter::new(coordinators);
    router.start_all();
    info!(chains = ?router.chain_ids(), "arbwatch running");

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("installing signal handlers")?;
    let handle = signals.handle();
    if let Some(signal) = signals.next().await {
        info!(signal, "shutdown signal received");
    }
    handle.close();

    router.stop_all().await;
    for status in router.status_all() {
        info!(
            chain = %status.name,
            last_block = status.last_block,
            opportunities = status.opportunities_found,
            executed = status.executed,
            "final status"
        );
    }
    info!("arbwatch stopped");
    Ok(())
}
