//! Local agent daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use periscope_agent::{
    AgentClient, CapturePipeline, CommandExecutor, ExecController, ScreenAssistant,
    ScreenController,
};
use periscope_types::AgentConfig;

/// Out-of-band events buffered between the executor and the link.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Parser)]
#[command(name = "periscope-agentd", about = "Periscope local agent")]
struct Args {
    /// Path to the agent configuration file.
    #[arg(long, default_value = "agent.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    let config: AgentConfig =
        toml::from_str(&raw).with_context(|| format!("invalid config {}", args.config.display()))?;
    config.validate()?;
    info!(user = %config.user_id, server = %config.server_url, "configuration loaded");

    let controller: Arc<dyn ScreenController> = Arc::new(ExecController::new(
        config.capture_command.clone(),
        config.tts_command.clone(),
    ));
    let assistant = Arc::new(ScreenAssistant::new(Arc::clone(&controller)));
    let pipeline = CapturePipeline::new(Arc::clone(&controller));
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let executor = Arc::new(CommandExecutor::new(
        controller,
        assistant,
        pipeline,
        events_tx,
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    AgentClient::new(config, executor, events_rx)
        .run(shutdown_rx)
        .await
}
