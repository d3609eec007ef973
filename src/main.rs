use anyhow::{Context, Result};
use tokio::signal;
use tracing::info;

mod config;
mod engine;
mod models;
mod probe;
mod render;
mod utils;

use crate::config::MonitorConfig;
use crate::engine::Monitor;

#[tokio::main]
async fn main() -> Result<()> {
    utils::setup_console();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_ansi(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .context("usage: multiping <config.yaml>")?;
    let config = MonitorConfig::load(&config_path)?;

    let (monitor, snapshots) = Monitor::new(config)?;
    tokio::spawn(render::run(snapshots));
    tokio::spawn(async move {
        if let Err(e) = monitor.run().await {
            tracing::error!("monitor engine failed: {e}");
        }
    });

    signal::ctrl_c().await?;
    info!("shutdown signal received, exiting");
    Ok(())
}
