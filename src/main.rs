//! Cluster gateway binary.
//!
//! Loads a TOML config, starts the gateway and runs until Ctrl-C.

use std::path::PathBuf;

use clap::Parser;

use cluster_gateway::config::load_config;
use cluster_gateway::observability::{logging, metrics};
use cluster_gateway::Gateway;

#[derive(Debug, Parser)]
#[command(name = "cluster-gateway", version, about = "Client-facing protocol gateway")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Override `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = load_config(&args.config)?;
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cluster-gateway starting");

    tracing::info!(
        config = %args.config.display(),
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        targets = config.targets.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let gateway = Gateway::bind(config).await?;
    tracing::info!(address = %gateway.local_addr(), "Listening for connections");

    gateway.run(shutdown_signal()).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    tracing::info!("Shutdown signal received");
}
