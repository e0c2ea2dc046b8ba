//! Sync domain models shared by the storage layer and the coordinator.

use serde::{Deserialize, Serialize};

/// Prefix reserved for the engine's own bookkeeping tables.
pub const INTERNAL_TABLE_PREFIX: &str = "_localbase_";

/// Field carrying the local rowid in pushed/pulled records.
pub const ROWID_FIELD: &str = "_rowid";

/// Field marking a pushed/pulled record as a deletion.
pub const DELETED_FIELD: &str = "_deleted";

/// Column consulted by [`ConflictPolicy::LastWriteWins`].
pub const UPDATED_AT_COLUMN: &str = "updated_at";

/// Whether a table is engine bookkeeping (never tracked, pushed or pulled into).
pub fn is_internal_table(table_name: &str) -> bool {
    table_name.starts_with(INTERNAL_TABLE_PREFIX) || table_name.starts_with("sqlite_")
}

/// Coordinator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    InitialSync,
    Syncing,
    Suspended,
}

/// Trigger source for sync cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleTrigger {
    Startup,
    Periodic,
    NetworkOnline,
    Manual,
}

/// Outcome class of one sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleStatus {
    /// Every dirty table pushed and the pull applied.
    Ok,
    /// At least one table push or the pull failed; the rest went through.
    Partial,
    /// Credentials were rejected; the remainder of the cycle was skipped.
    AuthError,
    /// The network went offline before the cycle finished.
    Suspended,
    /// Local storage failed while preparing or applying sync data.
    StorageError,
}

impl SyncCycleStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// How pulled rows are reconciled against local rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Compare `updated_at`; the newer row wins and ties go to the remote row.
    /// Rows without timestamps fall back to remote-wins.
    #[default]
    LastWriteWins,
    /// The pulled row always overwrites (last-pulled-wins).
    RemoteWins,
}

/// Row-level operation captured by the change tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOperation {
    Insert,
    Update,
    Delete,
}

impl PendingOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Per-table dirty state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDirtyState {
    pub table_name: String,
    pub pending_changes: i64,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
}

/// Rows collected for one table push, plus what to acknowledge afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTableBatch {
    pub table_name: String,
    pub records: Vec<serde_json::Value>,
    /// Highest pending-row sequence included in `records`.
    pub through_seq: i64,
    /// `pending_changes` observed when the batch was collected.
    pub observed_changes: i64,
}

/// Result of one sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleResult {
    pub cycle_id: String,
    pub status: SyncCycleStatus,
    pub trigger: SyncCycleTrigger,
    pub pushed_tables: Vec<String>,
    pub failed_tables: Vec<String>,
    pub pushed_records: usize,
    pub pulled_records: usize,
    pub purged_rows: usize,
    pub duration_ms: i64,
    pub message: Option<String>,
}

/// Lightweight coordinator status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEngineStatus {
    pub state: SyncState,
    pub online: bool,
    pub consecutive_failures: i32,
    pub last_error: Option<String>,
    pub last_cycle: Option<SyncCycleResult>,
}

/// Answer to a manual sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualSyncReport {
    pub success: bool,
    pub message: String,
    pub result: Option<SyncCycleResult>,
}

/// Determines whether an incoming row should overwrite the local one.
///
/// Rule:
/// 1. missing remote timestamp: remote wins
/// 2. missing local timestamp: remote wins
/// 3. otherwise the newer timestamp wins, ties go to the remote row
pub fn should_apply_remote(local_updated_at: Option<&str>, remote_updated_at: Option<&str>) -> bool {
    let (Some(local), Some(remote)) = (local_updated_at, remote_updated_at) else {
        return true;
    };

    let local_parsed = parse_timestamp_millis(local);
    let remote_parsed = parse_timestamp_millis(remote);
    if let (Some(local_ts), Some(remote_ts)) = (local_parsed, remote_parsed) {
        return remote_ts >= local_ts;
    }

    // Fallback to lexical ordering when one/both timestamps are not parseable.
    remote >= local
}

fn parse_timestamp_millis(value: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}
