//! Runs the hub until interrupted.

use meshrelay_hub::{HubConfig, RelayHub};

/// Binds the hub and serves until Ctrl-C or a fatal server error.
pub async fn run(config: HubConfig) -> anyhow::Result<()> {
    let (hub, mut server) = RelayHub::start(config).await?;

    tokio::select! {
        result = &mut server => {
            result??;
            tracing::warn!("relay hub stopped on its own");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    hub.shutdown();
    server.await??;
    Ok(())
}
