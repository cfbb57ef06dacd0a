//! Mesh relay hub entry point.

mod app;
mod config;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = config::Args::parse();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "starting mesh relay hub"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(args.hub_config()))?;

    tracing::info!("hub shut down cleanly");
    Ok(())
}
