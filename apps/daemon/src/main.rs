//! localbase daemon entry point.
//!
//! Opens the configured partition, runs the sync coordinator in the
//! background and closes the engine cleanly on Ctrl-C.

mod config;
mod context;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::context::ServiceContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let context = ServiceContext::build(config).context("failed to open the local database")?;
    tracing::info!(
        partition = %context.database.partition_name(),
        tier = %context.database.tier(),
        sync = context.sync.is_some(),
        "localbase daemon ready"
    );
    if let Some(data_dir) = &context.config.engine.data_dir {
        tracing::debug!(data_dir = %data_dir.display(), "sandbox directory configured");
    }

    context.start_background().await;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    if let Some(sync) = &context.sync {
        let status = sync.status();
        tracing::info!(
            state = ?status.state,
            failures = status.consecutive_failures,
            "sync status at shutdown"
        );
    }

    context
        .shutdown()
        .await
        .context("failed to close the local database")?;
    tracing::info!("localbase daemon stopped");
    Ok(())
}
