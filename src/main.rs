use anyhow::Result;
use argus::{Config, TrackingService};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config =
        Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    let service = TrackingService::new(config)
        .map_err(|e| anyhow::anyhow!("Failed to create tracking service: {}", e))?;
    let service = Arc::new(service);

    service.start().await;
    info!("Argus fleet tracking service starting up");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    service.shutdown().await;
    Ok(())
}
