mod adapter;
mod client;
mod config;
mod control_loop;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use adapter::{Adapter, ProcessAdapter};
use client::ControllerClient;
use config::{NodeCliArgs, NodeConfig};

#[derive(Parser)]
#[command(name = "fleet-node", about = "Node manager for a fleet worker host")]
struct Cli {
    /// This node's id (overrides FLEET_NODE_ID env var)
    #[arg(long)]
    node_id: Option<String>,

    /// Label in key=value form, may be repeated
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Maximum number of runs this node will execute concurrently
    #[arg(long)]
    max_concurrent: Option<i32>,

    /// Base URL of the controller (overrides FLEET_CONTROLLER_URL env var)
    #[arg(long)]
    controller_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = NodeConfig::resolve(NodeCliArgs {
        node_id: cli.node_id,
        labels: cli.labels,
        max_concurrent: cli.max_concurrent,
        controller_url: cli.controller_url,
    })?;

    tracing::info!(
        node_id = %config.node_id,
        controller_url = %config.controller_url,
        max_concurrent = config.max_concurrent,
        "starting node manager"
    );

    let client = ControllerClient::new(config.controller_url.clone());
    let adapter: Arc<dyn Adapter> = Arc::new(ProcessAdapter::new());

    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let loop_handle = tokio::spawn(control_loop::run(config, client, adapter, loop_cancel));

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl_c");
    tracing::info!("shutdown signal received");
    cancel.cancel();

    let _ = tokio::time::timeout(std::time::Duration::from_secs(30), loop_handle).await;

    Ok(())
}
