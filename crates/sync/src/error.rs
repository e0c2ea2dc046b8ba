//! Error types for the sync crate.

use std::time::Duration;

use localbase_core::errors::Error;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// What a failed request means for the sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRetryClass {
    /// Try again on the next cycle.
    Retryable,
    /// The same request will keep failing.
    Permanent,
    /// The credential was missing or refused; surfaces as `Error::SyncAuth`.
    ReauthRequired,
}

impl SyncRetryClass {
    /// Remote store responses: auth refusals, throttling and lock or
    /// conflict statuses, server errors, then everything else.
    pub fn for_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::ReauthRequired,
            408 | 409 | 423 | 425 | 429 | 500..=599 => Self::Retryable,
            _ => Self::Permanent,
        }
    }
}

/// Errors that can occur while talking to the remote store.
#[derive(Debug, Error)]
pub enum SyncError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from the remote store
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Missing or rejected credential
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote store confirmed fewer records than were pushed.
    #[error("Remote accepted {accepted} of {sent} records")]
    PartiallyAccepted { accepted: usize, sent: usize },

    /// The network went offline while the request was in flight.
    #[error("Request cancelled: network offline")]
    Cancelled,

    /// Local engine failure while preparing or applying sync data
    #[error("Storage error: {0}")]
    Storage(#[from] Error),
}

impl SyncError {
    /// Create an API error from status and message
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => SyncRetryClass::for_status(*status),
            Self::Http(_) | Self::Timeout(_) | Self::Cancelled | Self::PartiallyAccepted { .. } => {
                SyncRetryClass::Retryable
            }
            Self::Json(_) => SyncRetryClass::Permanent,
            Self::Auth(_) => SyncRetryClass::ReauthRequired,
            Self::Storage(err) if err.is_transient() => SyncRetryClass::Retryable,
            Self::Storage(_) => SyncRetryClass::Permanent,
        }
    }

    pub fn is_auth(&self) -> bool {
        self.retry_class() == SyncRetryClass::ReauthRequired
    }
}

impl From<SyncError> for Error {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Storage(inner) => inner,
            SyncError::Json(inner) => Error::Json(inner),
            other if other.is_auth() => Error::SyncAuth(other.to_string()),
            other => Error::SyncNetwork(other.to_string()),
        }
    }
}
