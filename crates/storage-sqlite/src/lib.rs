//! SQLite-backed local data engine: tiered persistence, the SQL facade,
//! debounced autosave and the sync bookkeeping stored in the image.

pub mod engine;
pub mod errors;
pub mod persistence;
pub mod rows;
pub mod sync;
pub mod value;

pub use engine::{
    select_and_init, AutosaveStats, CapabilityProbe, Database, DurabilityTier, EngineDeps,
    ExecResult, LoggingSnapshotObserver, NoFileAccess, QueryResult, SandboxProbe,
    SnapshotObserver, SnapshotTrigger, SqlStatement,
};
pub use errors::StorageError;
pub use persistence::{MemoryBlobStore, PersistenceAdapter, SqliteBlobStore};
pub use rows::{FromRow, RowView};
pub use sync::{RemoteApplyReport, SyncStateRepository};
pub use value::{FromSqlValue, SqlValue};
