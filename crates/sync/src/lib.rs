//! Sync between the local engine and the canonical remote store.

pub mod client;
pub mod coordinator;
pub mod error;
pub mod ports;
pub mod types;

pub use client::SyncClient;
pub use coordinator::SyncCoordinator;
pub use error::{Result, SyncError, SyncRetryClass};
pub use ports::{CredentialProvider, StaticCredential, SyncTransport};
pub use types::{ApiErrorResponse, PullResponse, PushRequest, PushResponse};
