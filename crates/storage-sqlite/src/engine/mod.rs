//! Engine lifecycle: tier selection, the SQL facade, autosave and tracking.

mod autosave;
mod database;
mod snapshot;
mod tier;
pub(crate) mod tracker;

pub use autosave::{
    AutosaveScheduler, AutosaveStats, LoggingSnapshotObserver, SnapshotObserver, SnapshotTrigger,
    SnapshotWriter,
};
pub use database::{Database, ExecResult, QueryResult, SqlStatement};
pub use snapshot::is_sqlite_image;
pub use tier::{
    select_and_init, CapabilityProbe, DurabilityTier, EngineDeps, NoFileAccess, SandboxProbe,
};
