//! Change tracking: row-level update hook plus the per-table dirty state.
//!
//! The hook only buffers `(table, rowid, op)` triples; the facade drains the
//! buffer after a statement succeeds and persists it with [`record_changes`].
//! `WITHOUT ROWID` tables and deletes done through SQLite's truncate
//! optimization (`DELETE FROM t` with no WHERE clause) do not fire the hook.
//!
//! The hook fires after a delete, when the row can no longer be read, so the
//! primary-key values of every tracked row are kept in `_localbase_row_keys`
//! while it exists. A pending delete takes its key from there.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, warn};
use rusqlite::hooks::Action;
use rusqlite::{params, Connection, OptionalExtension};

use localbase_core::errors::Result;
use localbase_core::sync::{is_internal_table, PendingOperation, TableDirtyState};

use crate::errors::StorageError;
use crate::value::SqlValue;

pub(crate) const INTERNAL_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS _localbase_table_state (
    table_name TEXT PRIMARY KEY NOT NULL,
    pending_changes INTEGER NOT NULL DEFAULT 0,
    last_sync_at TEXT,
    last_error TEXT
);
CREATE TABLE IF NOT EXISTS _localbase_pending_rows (
    table_name TEXT NOT NULL,
    row_id INTEGER NOT NULL,
    op TEXT NOT NULL,
    seq INTEGER NOT NULL,
    changed_at TEXT NOT NULL,
    row_key TEXT,
    PRIMARY KEY (table_name, row_id)
);
CREATE INDEX IF NOT EXISTS _localbase_pending_rows_seq
    ON _localbase_pending_rows (table_name, seq);
CREATE TABLE IF NOT EXISTS _localbase_row_keys (
    table_name TEXT NOT NULL,
    row_id INTEGER NOT NULL,
    row_key TEXT NOT NULL,
    PRIMARY KEY (table_name, row_id)
);
CREATE TABLE IF NOT EXISTS _localbase_sync_meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT
);
";

/// One row touched by a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RowChange {
    pub table: String,
    pub row_id: i64,
    pub op: PendingOperation,
}

/// Buffers row changes reported by SQLite's update hook.
#[derive(Debug, Clone)]
pub(crate) struct ChangeTracker {
    buffer: Arc<Mutex<Vec<RowChange>>>,
    enabled: Arc<AtomicBool>,
}

impl Default for ChangeTracker {
    fn default() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl ChangeTracker {
    /// Registers the hook on `conn`. Must be called again for every new handle.
    pub fn install(&self, conn: &Connection) {
        let buffer = Arc::clone(&self.buffer);
        let enabled = Arc::clone(&self.enabled);
        conn.update_hook(Some(
            move |action: Action, _db: &str, table: &str, row_id: i64| {
                if !enabled.load(Ordering::Acquire) || is_internal_table(table) {
                    return;
                }
                let op = match action {
                    Action::SQLITE_INSERT => PendingOperation::Insert,
                    Action::SQLITE_UPDATE => PendingOperation::Update,
                    Action::SQLITE_DELETE => PendingOperation::Delete,
                    _ => return,
                };
                if let Ok(mut changes) = buffer.lock() {
                    changes.push(RowChange {
                        table: table.to_string(),
                        row_id,
                        op,
                    });
                }
            },
        ));
    }

    pub fn clear(&self) {
        if let Ok(mut changes) = self.buffer.lock() {
            changes.clear();
        }
    }

    pub fn take(&self) -> Vec<RowChange> {
        self.buffer
            .lock()
            .map(|mut changes| std::mem::take(&mut *changes))
            .unwrap_or_default()
    }

    /// Runs `f` with tracking switched off (remote applies, cache purges, schema).
    pub fn untracked<T>(&self, f: impl FnOnce() -> T) -> T {
        let previous = self.enabled.swap(false, Ordering::AcqRel);
        let result = f();
        self.enabled.store(previous, Ordering::Release);
        self.clear();
        result
    }
}

pub(crate) fn ensure_internal_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(INTERNAL_SCHEMA)
        .map_err(StorageError::from)?;
    // Images written before deletes carried their key.
    let has_row_key: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('_localbase_pending_rows')
             WHERE name = 'row_key'",
            [],
            |row| row.get(0),
        )
        .map_err(StorageError::from)?;
    if !has_row_key {
        conn.execute_batch("ALTER TABLE _localbase_pending_rows ADD COLUMN row_key TEXT")
            .map_err(StorageError::from)?;
    }
    Ok(())
}

fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

/// Primary-key column names of `table`, in key order. Empty for tables
/// keyed only by rowid.
pub(crate) fn primary_key_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")
        .map_err(StorageError::from)?;
    let columns = stmt
        .query_map(params![table], |row| row.get::<_, String>(0))
        .map_err(StorageError::from)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StorageError::from)?;
    Ok(columns)
}

/// JSON object text `{column: value, ...}` naming one row by primary key.
pub(crate) fn row_key_json(columns: &[String], values: &[SqlValue]) -> String {
    let object = columns
        .iter()
        .zip(values)
        .map(|(column, value)| (column.clone(), value.to_json()))
        .collect::<serde_json::Map<_, _>>();
    serde_json::Value::Object(object).to_string()
}

pub(crate) fn store_row_key(conn: &Connection, table: &str, row_id: i64, row_key: &str) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO _localbase_row_keys (table_name, row_id, row_key) VALUES (?1, ?2, ?3)
         ON CONFLICT(table_name, row_id) DO UPDATE SET row_key = excluded.row_key",
    )
    .and_then(|mut stmt| stmt.execute(params![table, row_id, row_key]))
    .map_err(StorageError::from)?;
    Ok(())
}

/// Removes and returns the stored key of a deleted row.
pub(crate) fn take_row_key(conn: &Connection, table: &str, row_id: i64) -> Result<Option<String>> {
    let key = conn
        .query_row(
            "DELETE FROM _localbase_row_keys WHERE table_name = ?1 AND row_id = ?2
             RETURNING row_key",
            params![table, row_id],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(StorageError::from)?;
    Ok(key)
}

/// Drops stored keys of `table` whose rows are gone.
pub(crate) fn prune_row_keys(conn: &Connection, table: &str) -> Result<usize> {
    let sql = format!(
        "DELETE FROM _localbase_row_keys WHERE table_name = ?1
         AND row_id NOT IN (SELECT rowid FROM {})",
        quote_identifier(table)
    );
    let removed = conn
        .execute(&sql, params![table])
        .map_err(StorageError::from)?;
    Ok(removed)
}

/// Current key of a live row, read by rowid.
fn read_row_key(conn: &Connection, table: &str, columns: &[String], row_id: i64) -> Result<Option<String>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE rowid = ?1",
        columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", "),
        quote_identifier(table)
    );
    let values = conn
        .prepare_cached(&sql)
        .and_then(|mut stmt| {
            stmt.query_row(params![row_id], |row| {
                (0..columns.len())
                    .map(|index| row.get_ref(index).map(SqlValue::from))
                    .collect::<rusqlite::Result<Vec<_>>>()
            })
            .optional()
        })
        .map_err(StorageError::from)?;
    Ok(values.map(|values| row_key_json(columns, &values)))
}

/// Resolves the key to store with a pending change and keeps the key index
/// in step: live rows refresh their entry, deleted rows hand theirs over.
fn key_for_change(conn: &Connection, change: &RowChange, columns: &[String]) -> Result<Option<String>> {
    if columns.is_empty() {
        return Ok(None);
    }
    if change.op != PendingOperation::Delete {
        if let Some(key) = read_row_key(conn, &change.table, columns, change.row_id)? {
            store_row_key(conn, &change.table, change.row_id, &key)?;
            return Ok(Some(key));
        }
    }
    // Deleted, or gone again later in the same transaction.
    let key = take_row_key(conn, &change.table, change.row_id)?;
    if key.is_none() && change.op == PendingOperation::Delete {
        debug!(
            "[Localbase] No stored key for deleted row {} of '{}'",
            change.row_id, change.table
        );
    }
    Ok(key)
}

/// Persists the changes of one or more mutating statements.
///
/// Each inner slice is one statement: every table it touched gets its
/// `pending_changes` bumped by exactly one, however many rows changed.
pub(crate) fn record_changes(conn: &Connection, statements: &[Vec<RowChange>]) -> Result<()> {
    if statements.iter().all(|changes| changes.is_empty()) {
        return Ok(());
    }
    let now = Utc::now().to_rfc3339();

    let mut next_seq: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM _localbase_pending_rows",
            [],
            |row| row.get(0),
        )
        .map_err(StorageError::from)?;

    let mut upsert_row = conn
        .prepare_cached(
            "INSERT INTO _localbase_pending_rows (table_name, row_id, op, seq, changed_at, row_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(table_name, row_id) DO UPDATE SET
                op = excluded.op,
                seq = excluded.seq,
                changed_at = excluded.changed_at,
                row_key = COALESCE(excluded.row_key, row_key)",
        )
        .map_err(StorageError::from)?;
    let mut bump_table = conn
        .prepare_cached(
            "INSERT INTO _localbase_table_state (table_name, pending_changes)
             VALUES (?1, 1)
             ON CONFLICT(table_name) DO UPDATE SET pending_changes = pending_changes + 1",
        )
        .map_err(StorageError::from)?;

    let mut key_columns: HashMap<&str, Vec<String>> = HashMap::new();
    for changes in statements {
        let mut touched = BTreeSet::new();
        for change in changes {
            if !key_columns.contains_key(change.table.as_str()) {
                let columns = primary_key_columns(conn, &change.table)?;
                key_columns.insert(change.table.as_str(), columns);
            }
            let columns = key_columns
                .get(change.table.as_str())
                .map(Vec::as_slice)
                .unwrap_or_default();
            let row_key = key_for_change(conn, change, columns)?;

            next_seq += 1;
            upsert_row
                .execute(params![
                    change.table,
                    change.row_id,
                    change.op.as_str(),
                    next_seq,
                    now,
                    row_key
                ])
                .map_err(StorageError::from)?;
            touched.insert(change.table.as_str());
        }
        for table in touched {
            bump_table
                .execute(params![table])
                .map_err(StorageError::from)?;
        }
    }
    Ok(())
}

fn map_dirty_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<TableDirtyState> {
    Ok(TableDirtyState {
        table_name: row.get(0)?,
        pending_changes: row.get(1)?,
        last_sync_at: row.get(2)?,
        last_error: row.get(3)?,
    })
}

pub(crate) fn load_dirty_state(conn: &Connection, table: &str) -> Result<Option<TableDirtyState>> {
    let state = conn
        .query_row(
            "SELECT table_name, pending_changes, last_sync_at, last_error
             FROM _localbase_table_state WHERE table_name = ?1",
            params![table],
            map_dirty_state,
        )
        .optional()
        .map_err(StorageError::from)?;
    Ok(state)
}

pub(crate) fn list_dirty_states(conn: &Connection, only_pending: bool) -> Result<Vec<TableDirtyState>> {
    let sql = if only_pending {
        "SELECT table_name, pending_changes, last_sync_at, last_error
         FROM _localbase_table_state WHERE pending_changes > 0 ORDER BY table_name"
    } else {
        "SELECT table_name, pending_changes, last_sync_at, last_error
         FROM _localbase_table_state ORDER BY table_name"
    };
    let mut stmt = conn.prepare(sql).map_err(StorageError::from)?;
    let states = stmt
        .query_map([], map_dirty_state)
        .map_err(StorageError::from)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StorageError::from)?;
    Ok(states)
}

pub(crate) fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM _localbase_sync_meta WHERE key = ?1",
            params![key],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .map_err(StorageError::from)?;
    Ok(value.flatten())
}

pub(crate) fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO _localbase_sync_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )
    .map_err(StorageError::from)?;
    Ok(())
}

/// Drops tracking rows left behind by tables that no longer exist.
pub(crate) fn prune_orphaned_state(conn: &Connection) -> Result<usize> {
    let removed = conn
        .execute(
            "DELETE FROM _localbase_pending_rows WHERE table_name NOT IN
                (SELECT name FROM sqlite_master WHERE type = 'table')",
            [],
        )
        .map_err(StorageError::from)?;
    conn.execute(
        "DELETE FROM _localbase_row_keys WHERE table_name NOT IN
            (SELECT name FROM sqlite_master WHERE type = 'table')",
        [],
    )
    .map_err(StorageError::from)?;
    if removed > 0 {
        warn!(
            "[Localbase] Pruned {} pending rows for tables that no longer exist",
            removed
        );
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_engine() -> (Connection, ChangeTracker) {
        let conn = Connection::open_in_memory().expect("open");
        ensure_internal_schema(&conn).expect("internal schema");
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")
            .expect("schema");
        let tracker = ChangeTracker::default();
        tracker.install(&conn);
        (conn, tracker)
    }

    #[test]
    fn hook_captures_row_operations() {
        let (conn, tracker) = tracked_engine();
        conn.execute("INSERT INTO notes (body) VALUES ('a')", [])
            .expect("insert");
        conn.execute("UPDATE notes SET body = 'b' WHERE id = 1", [])
            .expect("update");
        conn.execute("DELETE FROM notes WHERE id = 1", [])
            .expect("delete");

        let ops = tracker
            .take()
            .into_iter()
            .map(|change| change.op)
            .collect::<Vec<_>>();
        assert_eq!(
            ops,
            vec![
                PendingOperation::Insert,
                PendingOperation::Update,
                PendingOperation::Delete
            ]
        );
    }

    #[test]
    fn internal_tables_and_untracked_blocks_are_ignored() {
        let (conn, tracker) = tracked_engine();
        write_meta(&conn, "k", "v").expect("meta");
        tracker.untracked(|| {
            conn.execute("INSERT INTO notes (body) VALUES ('remote')", [])
                .expect("insert");
        });
        assert!(tracker.take().is_empty());
    }

    #[test]
    fn one_statement_bumps_each_table_once() {
        let (conn, tracker) = tracked_engine();
        conn.execute_batch("INSERT INTO notes (body) VALUES ('a'), ('b'), ('c')")
            .expect("insert");
        let first = tracker.take();
        assert_eq!(first.len(), 3);
        conn.execute("UPDATE notes SET body = 'z' WHERE id = 2", [])
            .expect("update");
        let second = tracker.take();

        record_changes(&conn, &[first, second]).expect("record");

        let state = load_dirty_state(&conn, "notes")
            .expect("load")
            .expect("state exists");
        assert_eq!(state.pending_changes, 2);
        let pending_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM _localbase_pending_rows", [], |row| {
                row.get(0)
            })
            .expect("count");
        assert_eq!(pending_rows, 3);
    }

    #[test]
    fn deletes_remember_the_primary_key_of_the_removed_row() {
        let (conn, tracker) = tracked_engine();
        conn.execute_batch("CREATE TABLE docs (slug TEXT PRIMARY KEY, body TEXT)")
            .expect("schema");
        conn.execute("INSERT INTO docs (slug, body) VALUES ('intro', 'hello')", [])
            .expect("insert");
        record_changes(&conn, &[tracker.take()]).expect("record insert");
        // Pushed and acknowledged: the pending row is gone, the key is not.
        conn.execute("DELETE FROM _localbase_pending_rows", [])
            .expect("ack");

        conn.execute("DELETE FROM docs WHERE slug = 'intro'", [])
            .expect("delete");
        record_changes(&conn, &[tracker.take()]).expect("record delete");

        let (op, row_key): (String, Option<String>) = conn
            .query_row(
                "SELECT op, row_key FROM _localbase_pending_rows WHERE table_name = 'docs'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("pending row");
        assert_eq!(op, PendingOperation::Delete.as_str());
        let key: serde_json::Value =
            serde_json::from_str(row_key.as_deref().expect("key kept")).expect("json");
        assert_eq!(key, serde_json::json!({ "slug": "intro" }));

        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM _localbase_row_keys", [], |row| row.get(0))
            .expect("count");
        assert_eq!(stored, 0);
    }

    #[test]
    fn updated_rows_refresh_their_stored_key() {
        let (conn, tracker) = tracked_engine();
        conn.execute_batch("CREATE TABLE docs (slug TEXT PRIMARY KEY, body TEXT)")
            .expect("schema");
        conn.execute("INSERT INTO docs (slug, body) VALUES ('draft', 'x')", [])
            .expect("insert");
        record_changes(&conn, &[tracker.take()]).expect("record");
        conn.execute("UPDATE docs SET slug = 'final' WHERE slug = 'draft'", [])
            .expect("rename");
        record_changes(&conn, &[tracker.take()]).expect("record");

        let stored: String = conn
            .query_row(
                "SELECT row_key FROM _localbase_row_keys WHERE table_name = 'docs'",
                [],
                |row| row.get(0),
            )
            .expect("stored key");
        assert_eq!(stored, r#"{"slug":"final"}"#);
    }

    #[test]
    fn rowid_tables_store_no_key() {
        let (conn, tracker) = tracked_engine();
        conn.execute_batch("CREATE TABLE tags (label TEXT)")
            .expect("schema");
        conn.execute("INSERT INTO tags (label) VALUES ('red')", [])
            .expect("insert");
        record_changes(&conn, &[tracker.take()]).expect("record");
        let stored: i64 = conn
            .query_row("SELECT COUNT(*) FROM _localbase_row_keys", [], |row| row.get(0))
            .expect("count");
        assert_eq!(stored, 0);
    }

    #[test]
    fn without_rowid_tables_are_not_recorded() {
        let (conn, tracker) = tracked_engine();
        conn.execute_batch(
            "CREATE TABLE pairs (k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID;
             INSERT INTO pairs (k, v) VALUES ('a', '1');",
        )
        .expect("schema");
        record_changes(&conn, &[tracker.take()]).expect("record");
        assert!(load_dirty_state(&conn, "pairs").expect("load").is_none());
    }

    #[test]
    fn older_pending_rows_table_gains_the_key_column() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE _localbase_pending_rows (
                table_name TEXT NOT NULL,
                row_id INTEGER NOT NULL,
                op TEXT NOT NULL,
                seq INTEGER NOT NULL,
                changed_at TEXT NOT NULL,
                PRIMARY KEY (table_name, row_id)
            );",
        )
        .expect("old layout");
        ensure_internal_schema(&conn).expect("upgrade");
        ensure_internal_schema(&conn).expect("idempotent");
        conn.execute(
            "INSERT INTO _localbase_pending_rows VALUES ('t', 1, 'delete', 1, 'now', '{}')",
            [],
        )
        .expect("six columns");
    }

    #[test]
    fn meta_values_upsert() {
        let (conn, _tracker) = tracked_engine();
        assert_eq!(read_meta(&conn, "last_pull_at").expect("read"), None);
        write_meta(&conn, "last_pull_at", "2026-01-01T00:00:00Z").expect("write");
        write_meta(&conn, "last_pull_at", "2026-01-02T00:00:00Z").expect("overwrite");
        assert_eq!(
            read_meta(&conn, "last_pull_at").expect("read"),
            Some("2026-01-02T00:00:00Z".to_string())
        );
    }
}
