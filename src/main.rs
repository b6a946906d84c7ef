//! # Blog Gateway - Main Entry Point
//!
//! Startup sequence:
//! 1. locate and load the configuration file (`GATEWAY_CONFIG_PATH` or a default path)
//! 2. install logging and the Prometheus recorder
//! 3. wire the pipeline components explicitly; there are no global singletons
//! 4. watch the configuration file for route changes
//! 5. serve the public and admin ports until SIGINT/SIGTERM

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use blog_gateway::gateway::spawn_route_reloader;
use blog_gateway::observability::{init_logging, install_prometheus};
use blog_gateway::{ConfigManager, GatewayConfig, GatewayServer, GatewayService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = GatewayConfig::resolve_path().context("no configuration file found")?;
    let config = GatewayConfig::load_from_file(&path)
        .await
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    init_logging(&config.observability.logging).context("failed to initialize logging")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        routes = config.routes.len(),
        "Starting blog gateway"
    );

    let metrics = install_prometheus().context("failed to install metrics recorder")?;
    let service = GatewayService::from_config(&config).context("failed to build gateway service")?;

    // Route changes are picked up live; a watcher failure only disables that
    let config_manager = match ConfigManager::watch(&path) {
        Ok(manager) => Some(manager),
        Err(e) => {
            warn!(error = %e, "Configuration watcher unavailable, routes will not hot reload");
            None
        }
    };
    let reloader = config_manager
        .as_ref()
        .map(|manager| spawn_route_reloader(Arc::clone(service.routes()), manager.subscribe()));

    GatewayServer::new(config, service)
        .with_metrics(metrics)
        .start()
        .await
        .context("gateway server failed")?;

    if let Some(reloader) = reloader {
        reloader.abort();
    }
    drop(config_manager);

    info!("Blog gateway shutdown complete");
    Ok(())
}
