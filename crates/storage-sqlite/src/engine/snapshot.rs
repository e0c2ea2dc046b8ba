//! Snapshot serialization through SQLite's online backup API.
//!
//! Images are staged through a temporary file: export backs the live database
//! up into it and reads the bytes back, import writes the bytes out and restores
//! from it.

use std::io::Write;

use log::debug;
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};

use localbase_core::errors::{Error, Result};

use crate::errors::{is_not_a_database, StorageError};

const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

/// Whether `bytes` begins with the SQLite database header.
pub fn is_sqlite_image(bytes: &[u8]) -> bool {
    bytes.starts_with(SQLITE_HEADER)
}

fn staging_file() -> Result<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix("localbase-image-")
        .suffix(".sqlite3")
        .tempfile()
        .map_err(|e| Error::serialization(format!("Failed to create staging file: {}", e)))
}

fn serialization_error(context: &str, err: rusqlite::Error) -> Error {
    if is_not_a_database(&err) {
        return Error::serialization(format!("{}: not a database image ({})", context, err));
    }
    Error::serialization(format!("{}: {}", context, err))
}

/// Produces a full image of the main database.
pub(crate) fn export_image(conn: &Connection) -> Result<Vec<u8>> {
    let staging = staging_file()?;
    conn.backup(DatabaseName::Main, staging.path(), None)
        .map_err(|e| serialization_error("Export failed", e))?;
    let bytes = std::fs::read(staging.path()).map_err(StorageError::from)?;
    if !is_sqlite_image(&bytes) {
        return Err(Error::serialization(
            "Export produced an image without a SQLite header",
        ));
    }
    debug!("[Localbase] Exported database image ({} bytes)", bytes.len());
    Ok(bytes)
}

/// Replaces the contents of `conn` with the image in `bytes`.
///
/// The image is integrity-checked after restore; a failed check leaves `conn`
/// holding unusable data, so callers must discard it on error.
pub(crate) fn restore_image(conn: &mut Connection, bytes: &[u8]) -> Result<()> {
    if !is_sqlite_image(bytes) {
        return Err(Error::serialization(
            "Snapshot does not start with a SQLite header",
        ));
    }

    let mut staging = staging_file()?;
    staging.write_all(bytes).map_err(StorageError::from)?;
    staging.flush().map_err(StorageError::from)?;

    conn.restore(DatabaseName::Main, staging.path(), None::<fn(Progress)>)
        .map_err(|e| serialization_error("Import failed", e))?;

    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| serialization_error("Integrity check failed", e))?;
    if check != "ok" {
        return Err(Error::serialization(format!(
            "Imported image failed integrity check: {}",
            check
        )));
    }
    Ok(())
}

/// Loads `bytes` into a fresh in-memory engine.
pub(crate) fn load_image(bytes: &[u8]) -> Result<Connection> {
    let mut conn = Connection::open_in_memory()
        .map_err(|e| Error::serialization(format!("Failed to create engine: {}", e)))?;
    restore_image(&mut conn, bytes)?;
    Ok(conn)
}
