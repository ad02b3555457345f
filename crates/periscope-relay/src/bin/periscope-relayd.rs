//! Relay server daemon.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use periscope_relay::RelayServer;
use periscope_types::RelayConfig;

#[derive(Parser)]
#[command(name = "periscope-relayd", about = "Periscope relay server")]
struct Args {
    /// Path to the relay configuration file.
    #[arg(long, default_value = "periscope.toml")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    let mut config: RelayConfig =
        toml::from_str(&raw).with_context(|| format!("invalid config {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    config.validate()?;
    info!(users = config.users.len(), addr = %config.listen_addr, "configuration loaded");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    RelayServer::new(config).serve(shutdown_rx).await
}
