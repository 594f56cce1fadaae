// Central server entry point.
mod observability;

use anyhow::Result;
use central::{CentralConfig, CentralServer};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_observability();
    let config = CentralConfig::from_env_or_yaml()?;
    tracing::info!(
        agencies = config.agencies,
        agency_ids = ?config.agency_ids,
        winning_number = config.winning_number,
        max_frame_bytes = config.max_frame_bytes,
        "central server starting"
    );
    let server = CentralServer::bind(config).await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }
    server.run(shutdown).await
}
