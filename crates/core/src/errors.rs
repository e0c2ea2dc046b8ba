//! Error taxonomy shared by the storage and sync crates.

use thiserror::Error;

/// Result type alias for localbase operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the local data engine.
#[derive(Debug, Error)]
pub enum Error {
    /// No durability tier produced a usable engine, or schema statements failed.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The engine was used before init or after close.
    #[error("Database is not initialized")]
    NotInitialized,

    /// Malformed SQL or constraint violation during execute/query/transaction.
    #[error("Statement error: {0}")]
    Statement(String),

    /// Snapshot bytes could not be produced or understood.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The persistence adapter failed to read or write a snapshot.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Transient network failure talking to the remote store.
    #[error("Sync network error: {0}")]
    SyncNetwork(String),

    /// The remote store rejected our credentials.
    #[error("Sync authentication error: {0}")]
    SyncAuth(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invariant violation inside the engine wrapper (poisoned lock, lost task).
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether retrying the same operation later can succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SyncNetwork(_) | Self::Persistence(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_transient_but_auth_errors_are_not() {
        assert!(Error::SyncNetwork("connection reset".to_string()).is_transient());
        assert!(!Error::SyncAuth("expired".to_string()).is_transient());
        assert!(!Error::statement("no such table: t").is_transient());
    }

    #[test]
    fn display_includes_category() {
        let err = Error::initialization("schema failed");
        assert_eq!(err.to_string(), "Initialization failed: schema failed");
        assert_eq!(Error::NotInitialized.to_string(), "Database is not initialized");
    }
}
