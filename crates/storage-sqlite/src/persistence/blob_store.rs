use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use localbase_core::errors::{Error, Result};

use super::{sha256_checksum, PersistenceAdapter};
use crate::errors::StorageError;

const BLOB_STORE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS snapshots (
    partition TEXT PRIMARY KEY NOT NULL,
    data BLOB NOT NULL,
    size_bytes INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

/// Key/blob store kept in its own SQLite file, one row per partition.
#[derive(Debug)]
pub struct SqliteBlobStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteBlobStore {
    /// Opens (creating if needed) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(StorageError::from)?;
        }
        let conn = Connection::open(&path).map_err(|e| {
            Error::persistence(format!(
                "Failed to open blob store at {}: {}",
                path.display(),
                e
            ))
        })?;
        conn.execute_batch(BLOB_STORE_SCHEMA)
            .map_err(|e| Error::persistence(format!("Failed to prepare blob store: {}", e)))?;
        debug!("[Localbase] Blob store opened at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| Error::persistence("Blob store connection lock is poisoned"))?;
        f(&conn).map_err(|e| Error::persistence(e.to_string()))
    }
}

impl PersistenceAdapter for SqliteBlobStore {
    fn load(&self, partition: &str) -> Result<Option<Vec<u8>>> {
        let row = self.with_conn(|conn| {
            conn.query_row(
                "SELECT data, checksum FROM snapshots WHERE partition = ?1",
                params![partition],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
        })?;

        let Some((data, checksum)) = row else {
            return Ok(None);
        };
        let actual = sha256_checksum(&data);
        if actual != checksum {
            return Err(Error::serialization(format!(
                "Snapshot checksum mismatch for partition '{}': stored {}, computed {}",
                partition, checksum, actual
            )));
        }
        Ok(Some(data))
    }

    fn save(&self, partition: &str, bytes: &[u8]) -> Result<()> {
        let checksum = sha256_checksum(bytes);
        let size = i64::try_from(bytes.len()).unwrap_or(i64::MAX);
        let now = Utc::now().to_rfc3339();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO snapshots (partition, data, size_bytes, checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(partition) DO UPDATE SET
                    data = excluded.data,
                    size_bytes = excluded.size_bytes,
                    checksum = excluded.checksum,
                    updated_at = excluded.updated_at",
                params![partition, bytes, size, checksum, now],
            )
        })?;
        Ok(())
    }

    fn delete(&self, partition: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM snapshots WHERE partition = ?1",
                params![partition],
            )
        })?;
        Ok(())
    }
}
