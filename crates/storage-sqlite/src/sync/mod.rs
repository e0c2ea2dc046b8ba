//! Sync state kept inside the database image.

mod repository;

pub use repository::{RemoteApplyReport, SyncStateRepository};
