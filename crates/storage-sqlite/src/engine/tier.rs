//! Durability tier selection.
//!
//! Tiers are probed in priority order and the first usable one is kept for the
//! whole session:
//!
//! 1. [`DurabilityTier::SandboxedFile`]: `<data_dir>/<partition>.sqlite3`
//!    under an exclusive lock.
//! 2. [`DurabilityTier::KeyBlob`]: in-memory engine snapshotted into a
//!    [`PersistenceAdapter`].
//! 3. [`DurabilityTier::Memory`]: volatile.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use localbase_core::config::EngineConfig;
use localbase_core::errors::{Error, Result};

use super::autosave::{LoggingSnapshotObserver, SnapshotObserver};
use super::database::Database;
use super::snapshot;
use crate::persistence::PersistenceAdapter;

const PROBE_FILE_NAME: &str = ".localbase-probe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityTier {
    SandboxedFile,
    KeyBlob,
    Memory,
}

impl DurabilityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SandboxedFile => "sandboxed_file",
            Self::KeyBlob => "key_blob",
            Self::Memory => "memory",
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl fmt::Display for DurabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reports whether the execution context can host the sandboxed-file tier.
pub trait CapabilityProbe: Send + Sync {
    fn supports_sandboxed_file(&self, data_dir: &Path) -> bool;
}

/// Checks that `data_dir` can be created and written to.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxProbe;

impl CapabilityProbe for SandboxProbe {
    fn supports_sandboxed_file(&self, data_dir: &Path) -> bool {
        if let Err(err) = std::fs::create_dir_all(data_dir) {
            debug!(
                "[Localbase] Data directory {} is not creatable: {}",
                data_dir.display(),
                err
            );
            return false;
        }
        let probe = data_dir.join(PROBE_FILE_NAME);
        match std::fs::write(&probe, b"probe") {
            Ok(()) => {
                if let Err(err) = std::fs::remove_file(&probe) {
                    debug!(
                        "[Localbase] Could not remove {}: {}",
                        probe.display(),
                        err
                    );
                }
                true
            }
            Err(err) => {
                debug!(
                    "[Localbase] Data directory {} is not writable: {}",
                    data_dir.display(),
                    err
                );
                false
            }
        }
    }
}

/// Probe for hosts without file access.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFileAccess;

impl CapabilityProbe for NoFileAccess {
    fn supports_sandboxed_file(&self, _data_dir: &Path) -> bool {
        false
    }
}

/// Collaborators handed to [`select_and_init`].
#[derive(Clone)]
pub struct EngineDeps {
    pub adapter: Option<Arc<dyn PersistenceAdapter>>,
    pub probe: Arc<dyn CapabilityProbe>,
    pub observer: Arc<dyn SnapshotObserver>,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            adapter: None,
            probe: Arc::new(SandboxProbe),
            observer: Arc::new(LoggingSnapshotObserver),
        }
    }
}

impl fmt::Debug for EngineDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineDeps")
            .field("adapter", &self.adapter.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineDeps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn PersistenceAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SnapshotObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Engine handle produced by tier selection, before schema bootstrap.
pub(crate) struct OpenedEngine {
    pub conn: Connection,
    pub tier: DurabilityTier,
    pub file_path: Option<PathBuf>,
}

/// Picks a durability tier, bootstraps the schema and returns the facade.
pub fn select_and_init(config: &EngineConfig, deps: EngineDeps) -> Result<Database> {
    config.validate()?;
    let opened = open_engine(config, &deps)?;
    info!(
        "[Localbase] Partition '{}' using {} tier",
        config.partition_name, opened.tier
    );
    Database::assemble(config, deps, opened)
}

fn open_engine(config: &EngineConfig, deps: &EngineDeps) -> Result<OpenedEngine> {
    if config.persistence_enabled {
        if let Some(opened) = try_sandboxed_file(config, deps) {
            return Ok(opened);
        }
        if let Some(opened) = try_key_blob(config, deps) {
            return Ok(opened);
        }
        warn!(
            "[Localbase] No durable tier available for '{}'; data will not survive this session",
            config.partition_name
        );
    }

    let conn = Connection::open_in_memory()
        .map_err(|e| Error::initialization(format!("Failed to create in-memory engine: {}", e)))?;
    Ok(OpenedEngine {
        conn,
        tier: DurabilityTier::Memory,
        file_path: None,
    })
}

fn try_sandboxed_file(config: &EngineConfig, deps: &EngineDeps) -> Option<OpenedEngine> {
    let Some(data_dir) = config.data_dir.as_deref() else {
        debug!("[Localbase] No data directory configured; skipping sandboxed file tier");
        return None;
    };
    if !deps.probe.supports_sandboxed_file(data_dir) {
        info!(
            "[Localbase] Sandboxed file tier unavailable in {}; falling back",
            data_dir.display()
        );
        return None;
    }

    let path = data_dir.join(format!("{}.sqlite3", config.partition_name));
    match open_exclusive_file(&path) {
        Ok(conn) => Some(OpenedEngine {
            conn,
            tier: DurabilityTier::SandboxedFile,
            file_path: Some(path),
        }),
        Err(err) => {
            warn!(
                "[Localbase] Could not open {} exclusively, falling back: {}",
                path.display(),
                err
            );
            None
        }
    }
}

/// Opens `path` and takes SQLite's exclusive lock for the lifetime of the handle.
pub(crate) fn open_exclusive_file(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::ZERO)?;
    let _mode: String = conn.query_row("PRAGMA locking_mode = EXCLUSIVE", [], |row| row.get(0))?;
    // The lock is only taken on the first write; take it now so a second
    // session fails here instead of mid-statement.
    conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")?;
    Ok(conn)
}

fn try_key_blob(config: &EngineConfig, deps: &EngineDeps) -> Option<OpenedEngine> {
    let Some(adapter) = deps.adapter.as_ref() else {
        debug!("[Localbase] No persistence adapter configured; skipping key-blob tier");
        return None;
    };
    let partition = config.partition_name.as_str();

    let fresh = || match Connection::open_in_memory() {
        Ok(conn) => Some(OpenedEngine {
            conn,
            tier: DurabilityTier::KeyBlob,
            file_path: None,
        }),
        Err(err) => {
            warn!("[Localbase] Failed to create in-memory engine: {}", err);
            None
        }
    };

    match adapter.load(partition) {
        Ok(None) => {
            debug!("[Localbase] No snapshot stored for '{}'; starting empty", partition);
            fresh()
        }
        Ok(Some(bytes)) => match snapshot::load_image(&bytes) {
            Ok(conn) => {
                info!(
                    "[Localbase] Restored '{}' from snapshot ({} bytes)",
                    partition,
                    bytes.len()
                );
                Some(OpenedEngine {
                    conn,
                    tier: DurabilityTier::KeyBlob,
                    file_path: None,
                })
            }
            Err(err) => {
                discard_corrupt_snapshot(adapter.as_ref(), partition, &err);
                fresh()
            }
        },
        Err(err @ Error::Serialization(_)) => {
            discard_corrupt_snapshot(adapter.as_ref(), partition, &err);
            fresh()
        }
        Err(err) => {
            warn!(
                "[Localbase] Persistence adapter unreachable for '{}', skipping key-blob tier: {}",
                partition, err
            );
            None
        }
    }
}

fn discard_corrupt_snapshot(adapter: &dyn PersistenceAdapter, partition: &str, err: &Error) {
    warn!(
        "[Localbase] Stored snapshot for '{}' is unusable and will be discarded: {}",
        partition, err
    );
    if let Err(delete_err) = adapter.delete(partition) {
        warn!(
            "[Localbase] Failed to delete corrupt snapshot for '{}': {}",
            partition, delete_err
        );
    }
}
