//! SQL execution facade: the single read/write path into the live engine.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, info, warn};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use localbase_core::config::EngineConfig;
use localbase_core::errors::{Error, Result};
use localbase_core::sync::{is_internal_table, PendingOperation, TableDirtyState};

use super::autosave::{AutosaveScheduler, AutosaveStats, SnapshotTrigger, SnapshotWriter};
use super::snapshot::{self, is_sqlite_image};
use super::tier::{DurabilityTier, EngineDeps, OpenedEngine};
use super::tracker::{self, ChangeTracker, RowChange};
use crate::errors::StorageError;
use crate::persistence::PersistenceAdapter;
use crate::rows::{decode_rows, FromRow, RowView};
use crate::value::SqlValue;

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub rows_affected: usize,
    /// Rowid of the last inserted row, when the call inserted one.
    pub inserted_id: Option<i64>,
}

/// Rows returned by a query. `columns` is populated even when `rows` is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        self.rows
            .get(index)
            .map(|values| RowView::new(&self.columns, values))
    }

    pub fn iter(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows
            .iter()
            .map(|values| RowView::new(&self.columns, values))
    }

    pub fn decode<T: FromRow>(&self) -> Result<Vec<T>> {
        decode_rows(&self.columns, &self.rows)
    }
}

/// One statement of a [`Database::transaction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlStatement {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlValue>,
}

impl SqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

impl From<&str> for SqlStatement {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

/// Handle to an initialized engine. Clones share the same engine.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("partition", &self.inner.partition)
            .field("tier", &self.inner.tier)
            .field("persistence_enabled", &self.inner.persistence_enabled)
            .finish_non_exhaustive()
    }
}

struct DatabaseInner {
    partition: String,
    tier: DurabilityTier,
    persistence_enabled: bool,
    file_path: Option<PathBuf>,
    adapter: Option<Arc<dyn PersistenceAdapter>>,
    /// `None` once closed.
    slot: Mutex<Option<Connection>>,
    tracker: ChangeTracker,
    autosave: Option<AutosaveScheduler>,
    /// Serializes snapshot writers so an older image never overwrites a newer
    /// one. Lock order: `save_lock`, then `slot`.
    save_lock: Mutex<()>,
}

impl DatabaseInner {
    fn lock_slot(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.slot
            .lock()
            .map_err(|_| Error::internal("Database lock is poisoned"))
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut slot = self.lock_slot()?;
        let conn = slot.as_mut().ok_or(Error::NotInitialized)?;
        f(conn)
    }

    fn notify_mutation(&self) {
        if let Some(autosave) = &self.autosave {
            autosave.notify();
        }
    }
}

impl SnapshotWriter for DatabaseInner {
    fn write_snapshot(&self) -> Result<usize> {
        let Some(adapter) = &self.adapter else {
            return Ok(0);
        };
        let _save = self
            .save_lock
            .lock()
            .map_err(|_| Error::internal("Snapshot lock is poisoned"))?;
        let bytes = self.with_conn(|conn| snapshot::export_image(conn))?;
        adapter.save(&self.partition, &bytes)?;
        Ok(bytes.len())
    }
}

fn run_statement(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<usize> {
    if params.is_empty() {
        conn.execute_batch(sql)?;
        return Ok(usize::try_from(conn.changes()).unwrap_or(usize::MAX));
    }
    let mut stmt = conn.prepare(sql)?;
    stmt.execute(params_from_iter(params.iter()))
}

fn run_query(conn: &Connection, sql: &str, params: &[SqlValue]) -> rusqlite::Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let columns = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
    let width = columns.len();

    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            values.push(SqlValue::from(row.get_ref(index)?));
        }
        out.push(values);
    }
    Ok(QueryResult { columns, rows: out })
}

fn exec_result(
    conn: &Connection,
    rows_affected: usize,
    rowid_before: i64,
    changes: &[RowChange],
) -> ExecResult {
    let rowid_after = conn.last_insert_rowid();
    let inserted = rowid_after != rowid_before
        || changes
            .iter()
            .any(|change| change.op == PendingOperation::Insert);
    ExecResult {
        rows_affected,
        inserted_id: inserted.then_some(rowid_after),
    }
}

impl Database {
    /// Same as [`super::tier::select_and_init`].
    pub fn open(config: &EngineConfig, deps: EngineDeps) -> Result<Self> {
        super::tier::select_and_init(config, deps)
    }

    /// Bootstraps internal and user schema on a freshly opened engine.
    pub(crate) fn assemble(
        config: &EngineConfig,
        deps: EngineDeps,
        opened: OpenedEngine,
    ) -> Result<Self> {
        let OpenedEngine {
            conn,
            tier,
            file_path,
        } = opened;

        tracker::ensure_internal_schema(&conn)
            .map_err(|e| Error::initialization(format!("Internal bootstrap failed: {}", e)))?;
        for (index, statement) in config.schema_statements.iter().enumerate() {
            conn.execute_batch(statement).map_err(|e| {
                Error::initialization(format!("Schema statement {} failed: {}", index + 1, e))
            })?;
        }
        tracker::prune_orphaned_state(&conn)
            .map_err(|e| Error::initialization(format!("Internal bootstrap failed: {}", e)))?;

        let tracker = ChangeTracker::default();
        tracker.install(&conn);

        let persistence_enabled = tier.is_persistent();
        let adapter = match tier {
            DurabilityTier::KeyBlob => deps.adapter,
            _ => None,
        };
        let partition = config.partition_name.clone();
        let debounce = config.autosave_debounce;
        let observer = deps.observer;

        let inner = Arc::new_cyclic(|weak: &Weak<DatabaseInner>| {
            let autosave = (tier == DurabilityTier::KeyBlob).then(|| {
                let writer: Weak<dyn SnapshotWriter> = weak.clone();
                AutosaveScheduler::new(partition.clone(), debounce, writer, observer)
            });
            DatabaseInner {
                partition,
                tier,
                persistence_enabled,
                file_path,
                adapter,
                slot: Mutex::new(Some(conn)),
                tracker,
                autosave,
                save_lock: Mutex::new(()),
            }
        });
        debug!(
            "[Localbase] Partition '{}' initialized ({} schema statements)",
            inner.partition,
            config.schema_statements.len()
        );
        Ok(Self { inner })
    }

    /// Runs one statement (or a parameterless script) and records change tracking.
    pub fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult> {
        let inner = &self.inner;
        let result = inner.with_conn(|conn| {
            inner.tracker.clear();
            let rowid_before = conn.last_insert_rowid();
            let outcome = run_statement(conn, sql, params);
            let changes = inner.tracker.take();
            let rows_affected = outcome.map_err(StorageError::from)?;
            let result = exec_result(conn, rows_affected, rowid_before, &changes);
            tracker::record_changes(conn, &[changes])?;
            Ok(result)
        })?;
        inner.notify_mutation();
        Ok(result)
    }

    /// Runs a query. Column names come from the prepared statement, so they are
    /// present even for empty results.
    pub fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult> {
        let inner = &self.inner;
        let (result, mutated) = inner.with_conn(|conn| {
            inner.tracker.clear();
            let outcome = run_query(conn, sql, params);
            let changes = inner.tracker.take();
            let result = outcome.map_err(StorageError::from)?;
            let mutated = !changes.is_empty();
            tracker::record_changes(conn, &[changes])?;
            Ok((result, mutated))
        })?;
        // `INSERT ... RETURNING` goes through here too.
        if mutated {
            inner.notify_mutation();
        }
        Ok(result)
    }

    pub fn query_as<T: FromRow>(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<T>> {
        self.query(sql, params)?.decode()
    }

    /// Runs all statements in one transaction. The first failure rolls back
    /// every statement and is returned.
    pub fn transaction(&self, statements: &[SqlStatement]) -> Result<Vec<ExecResult>> {
        let inner = &self.inner;
        let results = inner.with_conn(|conn| {
            inner.tracker.clear();
            let tx = conn.transaction().map_err(StorageError::from)?;
            let mut results = Vec::with_capacity(statements.len());
            let mut changes = Vec::with_capacity(statements.len());

            for (index, statement) in statements.iter().enumerate() {
                let rowid_before = tx.last_insert_rowid();
                match run_statement(&tx, &statement.sql, &statement.params) {
                    Ok(rows_affected) => {
                        let statement_changes = inner.tracker.take();
                        results.push(exec_result(
                            &tx,
                            rows_affected,
                            rowid_before,
                            &statement_changes,
                        ));
                        changes.push(statement_changes);
                    }
                    Err(err) => {
                        inner.tracker.clear();
                        if let Err(rollback_err) = tx.rollback() {
                            warn!(
                                "[Localbase] Rollback after failed statement reported: {}",
                                rollback_err
                            );
                        }
                        return Err(Error::statement(format!(
                            "Transaction statement {} failed: {}",
                            index + 1,
                            err
                        )));
                    }
                }
            }

            tracker::record_changes(&tx, &changes)?;
            tx.commit().map_err(StorageError::from)?;
            Ok(results)
        })?;
        if !statements.is_empty() {
            inner.notify_mutation();
        }
        Ok(results)
    }

    /// Full snapshot image of the current database.
    pub fn export(&self) -> Result<Vec<u8>> {
        self.inner.with_conn(|conn| snapshot::export_image(conn))
    }

    /// Replaces the whole database with `bytes`. The previous state is kept
    /// when the image is rejected.
    pub fn import(&self, bytes: &[u8]) -> Result<()> {
        if !is_sqlite_image(bytes) {
            return Err(Error::serialization(
                "Import rejected: bytes are not a SQLite image",
            ));
        }
        let inner = &self.inner;
        let scratch = snapshot::load_image(bytes)?;

        {
            let mut slot = inner.lock_slot()?;
            let current = slot.as_mut().ok_or(Error::NotInitialized)?;
            match inner.tier {
                DurabilityTier::SandboxedFile => {
                    // The file handle keeps its exclusive lock; restore in place.
                    drop(scratch);
                    snapshot::restore_image(current, bytes)?;
                }
                DurabilityTier::KeyBlob | DurabilityTier::Memory => {
                    *current = scratch;
                }
            }
            tracker::ensure_internal_schema(current)?;
            inner.tracker.install(current);
            inner.tracker.clear();
        }
        info!(
            "[Localbase] Imported {} bytes into '{}'",
            bytes.len(),
            inner.partition
        );

        if let Some(autosave) = &inner.autosave {
            // The import already succeeded; the observer sees the failed write.
            if let Err(err) = autosave.flush_now(SnapshotTrigger::Import) {
                debug!(
                    "[Localbase] Snapshot after import of '{}' failed: {}",
                    inner.partition, err
                );
            }
        }
        Ok(())
    }

    /// Cancels pending autosave, writes a final snapshot when persistence is
    /// enabled and releases the engine. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if let Some(autosave) = &inner.autosave {
            autosave.cancel();
        }
        let _save = inner
            .save_lock
            .lock()
            .map_err(|_| Error::internal("Snapshot lock is poisoned"))?;

        let conn = inner.lock_slot()?.take();
        let Some(conn) = conn else {
            return Ok(());
        };

        let image = match (&inner.adapter, &inner.autosave) {
            (Some(_), Some(_)) => Some(snapshot::export_image(&conn)),
            _ => None,
        };
        if let Err((_conn, err)) = conn.close() {
            warn!(
                "[Localbase] Engine for '{}' did not close cleanly: {}",
                inner.partition, err
            );
        }

        let outcome = match (image, &inner.adapter) {
            (Some(Ok(bytes)), Some(adapter)) => adapter
                .save(&inner.partition, &bytes)
                .map(|_| bytes.len()),
            (Some(Err(err)), _) => Err(err),
            _ => {
                info!("[Localbase] Closed '{}'", inner.partition);
                return Ok(());
            }
        };
        if let Some(autosave) = &inner.autosave {
            autosave.report(SnapshotTrigger::Close, &outcome);
        }
        info!("[Localbase] Closed '{}'", inner.partition);
        outcome.map(|_| ())
    }

    pub fn tier(&self) -> DurabilityTier {
        self.inner.tier
    }

    pub fn persistence_enabled(&self) -> bool {
        self.inner.persistence_enabled
    }

    pub fn partition_name(&self) -> &str {
        &self.inner.partition
    }

    /// Database file of the sandboxed-file tier.
    pub fn file_path(&self) -> Option<&Path> {
        self.inner.file_path.as_deref()
    }

    pub fn is_initialized(&self) -> bool {
        self.inner
            .slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    /// User tables, sorted by name.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.inner.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .map_err(StorageError::from)?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StorageError::from)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(StorageError::from)?;
            Ok(names
                .into_iter()
                .filter(|name| !is_internal_table(name))
                .collect())
        })
    }

    /// Tables with unpushed local changes.
    pub fn dirty_tables(&self) -> Result<Vec<TableDirtyState>> {
        self.inner
            .with_conn(|conn| tracker::list_dirty_states(conn, true))
    }

    /// Every table that has sync state, dirty or not.
    pub fn table_states(&self) -> Result<Vec<TableDirtyState>> {
        self.inner
            .with_conn(|conn| tracker::list_dirty_states(conn, false))
    }

    pub fn table_dirty_state(&self, table: &str) -> Result<Option<TableDirtyState>> {
        self.inner
            .with_conn(|conn| tracker::load_dirty_state(conn, table))
    }

    /// Autosave counters; `None` unless the key-blob tier is active.
    pub fn autosave_stats(&self) -> Option<AutosaveStats> {
        self.inner.autosave.as_ref().map(AutosaveScheduler::stats)
    }

    /// Runs `f` against the engine without change tracking. Used by sync to
    /// apply remote rows and bookkeeping.
    pub(crate) fn with_untracked<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let inner = &self.inner;
        inner.with_conn(|conn| inner.tracker.untracked(|| f(conn)))
    }

    /// Schedules an autosave for writes made through [`Self::with_untracked`].
    /// Must be called after the engine lock is released.
    pub(crate) fn mark_mutated(&self) {
        self.inner.notify_mutation();
    }
}
