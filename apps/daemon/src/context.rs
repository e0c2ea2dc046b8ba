use std::sync::Arc;

use log::{info, warn};

use localbase_core::errors::{Error, Result};
use localbase_storage_sqlite::{
    select_and_init, Database, EngineDeps, SqliteBlobStore, SyncStateRepository,
};
use localbase_sync::{StaticCredential, SyncClient, SyncCoordinator};

use crate::config::DaemonConfig;

/// Services owned by the daemon for the lifetime of the process.
pub struct ServiceContext {
    pub config: DaemonConfig,
    pub database: Database,
    pub sync: Option<SyncCoordinator>,
}

impl ServiceContext {
    /// Opens the engine and wires the sync coordinator when configured.
    pub fn build(config: DaemonConfig) -> Result<Arc<Self>> {
        let mut deps = EngineDeps::new();
        if let Some(path) = &config.snapshot_store {
            match SqliteBlobStore::open(path) {
                Ok(store) => deps = deps.with_adapter(Arc::new(store)),
                Err(err) => warn!(
                    "[Localbase] Snapshot store {} unavailable: {}",
                    path.display(),
                    err
                ),
            }
        }

        let database = select_and_init(&config.engine, deps)?;
        info!(
            "[Localbase] Partition '{}' opened on tier {} (persistence {})",
            database.partition_name(),
            database.tier(),
            if database.persistence_enabled() { "on" } else { "off" }
        );

        let sync = match &config.sync {
            Some(settings) => {
                let client = SyncClient::new(&settings.config.api_url, settings.config.request_timeout)
                    .map_err(Error::from)?;
                if settings.token.is_none() {
                    warn!("[Sync] LOCALBASE_SYNC_TOKEN is not set; cycles will fail authentication");
                }
                Some(SyncCoordinator::new(
                    SyncStateRepository::new(database.clone()),
                    Arc::new(client),
                    Arc::new(StaticCredential::new(settings.token.clone())),
                    settings.config.clone(),
                ))
            }
            None => {
                info!("[Sync] LOCALBASE_SYNC_URL is not set; running without sync");
                None
            }
        };

        Ok(Arc::new(Self {
            config,
            database,
            sync,
        }))
    }

    pub async fn start_background(&self) {
        if let Some(sync) = &self.sync {
            sync.start().await;
        }
    }

    /// Stops sync, then writes the final snapshot and releases the engine.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(sync) = &self.sync {
            sync.stop().await;
        }
        let database = self.database.clone();
        tokio::task::spawn_blocking(move || database.close())
            .await
            .map_err(|e| Error::internal(format!("Shutdown task failed: {}", e)))?
    }
}
