//! Storage error type and its mapping onto the core taxonomy.

use localbase_core::errors::Error;
use thiserror::Error;

/// Low-level failures raised while talking to SQLite or the filesystem.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Sqlite(inner) => Error::Statement(inner.to_string()),
            StorageError::Io(inner) => Error::Persistence(inner.to_string()),
        }
    }
}

/// Whether a SQLite error means the bytes were not a database image.
pub(crate) fn is_not_a_database(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::NotADatabase) | Some(rusqlite::ErrorCode::DatabaseCorrupt)
    )
}
