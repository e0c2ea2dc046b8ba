//! Sync bookkeeping on top of the engine: pending batches, acknowledgements,
//! remote applies and cache purges.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use log::{debug, warn};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;

use localbase_core::config::CacheTableConfig;
use localbase_core::errors::{Error, Result};
use localbase_core::sync::{
    is_internal_table, should_apply_remote, ConflictPolicy, PendingOperation, PendingTableBatch,
    DELETED_FIELD, ROWID_FIELD, UPDATED_AT_COLUMN,
};

use crate::engine::tracker;
use crate::engine::Database;
use crate::errors::StorageError;
use crate::value::SqlValue;

const LAST_PULL_AT_KEY: &str = "last_pull_at";

fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    /// 1-based position in the primary key, 0 when not part of it.
    pk: i64,
}

fn load_table_columns(conn: &Connection, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let sql = format!(
        "PRAGMA main.table_info('{}')",
        escape_sqlite_str(table_name)
    );
    let mut stmt = conn.prepare(&sql).map_err(StorageError::from)?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                pk: row.get(5)?,
            })
        })
        .map_err(StorageError::from)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StorageError::from)?;
    Ok(columns)
}

fn primary_key_columns(columns: &[ColumnInfo]) -> Vec<String> {
    let mut pk = columns
        .iter()
        .filter(|column| column.pk > 0)
        .cloned()
        .collect::<Vec<_>>();
    pk.sort_by_key(|column| column.pk);
    pk.into_iter().map(|column| column.name).collect()
}

fn row_to_json(columns: &[String], row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let mut object = serde_json::Map::with_capacity(columns.len());
    for (index, name) in columns.iter().enumerate() {
        let value = SqlValue::from(row.get_ref(index)?);
        object.insert(name.clone(), value.to_json());
    }
    Ok(serde_json::Value::Object(object))
}

/// Delete record for `row_id`. `row_key` is the JSON object of primary-key
/// values captured when the row was deleted; its fields are copied in so
/// other devices can locate the row.
fn tombstone(row_id: i64, row_key: Option<&str>) -> serde_json::Value {
    let mut object = match row_key.map(serde_json::from_str::<serde_json::Value>) {
        Some(Ok(serde_json::Value::Object(key))) => key,
        Some(Ok(_)) | None => serde_json::Map::with_capacity(2),
        Some(Err(err)) => {
            warn!("[Sync] Ignoring unreadable key for deleted row {}: {}", row_id, err);
            serde_json::Map::with_capacity(2)
        }
    };
    object.insert(ROWID_FIELD.to_string(), serde_json::Value::from(row_id));
    object.insert(DELETED_FIELD.to_string(), serde_json::Value::Bool(true));
    serde_json::Value::Object(object)
}

/// Outcome of applying a pull response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteApplyReport {
    pub applied_rows: usize,
    /// Rows left alone because the local copy was newer.
    pub skipped_rows: usize,
    /// Tables rejected as a whole, with the reason.
    pub rejected_tables: Vec<(String, String)>,
}

/// Repository for the internal sync tables of one database.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    db: Database,
}

impl SyncStateRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Collects up to `limit` pending rows for every dirty table.
    ///
    /// A batch that does not drain its table reports `observed_changes = 0`,
    /// so the table stays dirty until the remaining rows are pushed.
    pub fn collect_pending_batches(&self, limit: i64) -> Result<Vec<PendingTableBatch>> {
        self.db.with_untracked(|conn| {
            let dirty = tracker::list_dirty_states(conn, true)?;
            let mut batches = Vec::with_capacity(dirty.len());
            for state in dirty {
                if load_table_columns(conn, &state.table_name)?.is_empty() {
                    warn!(
                        "[Sync] Table '{}' has pending changes but no longer exists; skipping",
                        state.table_name
                    );
                    continue;
                }
                batches.push(collect_table_batch(
                    conn,
                    &state.table_name,
                    state.pending_changes,
                    limit,
                )?);
            }
            Ok(batches)
        })
    }

    /// Marks a pushed batch as acknowledged by the remote store.
    pub fn acknowledge_push(&self, batch: &PendingTableBatch) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.db.with_untracked(|conn| {
            let tx = conn.transaction().map_err(StorageError::from)?;
            tx.execute(
                "DELETE FROM _localbase_pending_rows WHERE table_name = ?1 AND seq <= ?2",
                params![batch.table_name, batch.through_seq],
            )
            .map_err(StorageError::from)?;
            tx.execute(
                "UPDATE _localbase_table_state
                 SET pending_changes = MAX(pending_changes - ?2, 0),
                     last_sync_at = ?3,
                     last_error = NULL
                 WHERE table_name = ?1",
                params![batch.table_name, batch.observed_changes, now],
            )
            .map_err(StorageError::from)?;
            tx.commit().map_err(StorageError::from)?;
            Ok(())
        })?;
        self.db.mark_mutated();
        debug!(
            "[Sync] Acknowledged {} records for '{}'",
            batch.records.len(),
            batch.table_name
        );
        Ok(())
    }

    /// Stores the last push failure for `table`, leaving its counter untouched.
    pub fn record_push_error(&self, table: &str, message: &str) -> Result<()> {
        self.db.with_untracked(|conn| {
            conn.execute(
                "UPDATE _localbase_table_state SET last_error = ?2 WHERE table_name = ?1",
                params![table, message],
            )
            .map_err(StorageError::from)?;
            Ok(())
        })?;
        self.db.mark_mutated();
        Ok(())
    }

    pub fn last_pull_at(&self) -> Result<Option<String>> {
        self.db
            .with_untracked(|conn| tracker::read_meta(conn, LAST_PULL_AT_KEY))
    }

    pub fn set_last_pull_at(&self, timestamp: &str) -> Result<()> {
        self.db
            .with_untracked(|conn| tracker::write_meta(conn, LAST_PULL_AT_KEY, timestamp))?;
        self.db.mark_mutated();
        Ok(())
    }

    /// Applies pulled rows in one untracked transaction. Tables that fail
    /// validation or apply are rolled back individually and reported.
    pub fn apply_remote_changes(
        &self,
        changes: &BTreeMap<String, Vec<serde_json::Value>>,
        policy: ConflictPolicy,
    ) -> Result<RemoteApplyReport> {
        if changes.is_empty() {
            return Ok(RemoteApplyReport::default());
        }
        let report = self.db.with_untracked(|conn| {
            let mut report = RemoteApplyReport::default();
            let mut tx = conn.transaction().map_err(StorageError::from)?;
            for (table, rows) in changes {
                let savepoint = tx.savepoint().map_err(StorageError::from)?;
                match apply_table_rows(&savepoint, table, rows, policy) {
                    Ok((applied, skipped)) => {
                        savepoint.commit().map_err(StorageError::from)?;
                        report.applied_rows += applied;
                        report.skipped_rows += skipped;
                    }
                    Err(err) => {
                        drop(savepoint);
                        warn!("[Sync] Rejected pulled rows for '{}': {}", table, err);
                        report.rejected_tables.push((table.clone(), err.to_string()));
                    }
                }
            }
            tx.commit().map_err(StorageError::from)?;
            Ok(report)
        })?;
        if report.applied_rows > 0 {
            self.db.mark_mutated();
        }
        Ok(report)
    }

    /// Deletes cache rows whose expiry has passed. Missing tables or columns
    /// are skipped.
    pub fn purge_expired(&self, caches: &[CacheTableConfig]) -> Result<usize> {
        if caches.is_empty() {
            return Ok(0);
        }
        let purged = self.db.with_untracked(|conn| {
            let mut purged = 0;
            for cache in caches {
                if is_internal_table(&cache.table) {
                    warn!("[Sync] Refusing to purge internal table '{}'", cache.table);
                    continue;
                }
                let columns = load_table_columns(conn, &cache.table)?;
                if !columns
                    .iter()
                    .any(|column| column.name == cache.expires_at_column)
                {
                    warn!(
                        "[Sync] Cache table '{}' has no column '{}'; skipping purge",
                        cache.table, cache.expires_at_column
                    );
                    continue;
                }
                let column = quote_identifier(&cache.expires_at_column);
                let sql = format!(
                    "DELETE FROM {} WHERE {column} IS NOT NULL AND julianday({column}) <= julianday('now')",
                    quote_identifier(&cache.table)
                );
                let removed = conn.execute(&sql, []).map_err(StorageError::from)?;
                if removed > 0 {
                    tracker::prune_row_keys(conn, &cache.table)?;
                }
                purged += removed;
            }
            Ok(purged)
        })?;
        if purged > 0 {
            debug!("[Sync] Purged {} expired cache rows", purged);
            self.db.mark_mutated();
        }
        Ok(purged)
    }
}

fn collect_table_batch(
    conn: &Connection,
    table: &str,
    pending_changes: i64,
    limit: i64,
) -> Result<PendingTableBatch> {
    let mut pending_stmt = conn
        .prepare(
            "SELECT row_id, op, seq, row_key FROM _localbase_pending_rows
             WHERE table_name = ?1 ORDER BY seq LIMIT ?2",
        )
        .map_err(StorageError::from)?;
    let pending = pending_stmt
        .query_map(params![table, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })
        .map_err(StorageError::from)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(StorageError::from)?;

    let remaining: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM _localbase_pending_rows WHERE table_name = ?1",
            params![table],
            |row| row.get(0),
        )
        .map_err(StorageError::from)?;
    let drained = remaining <= pending.len() as i64;

    let row_sql = format!(
        "SELECT rowid AS {}, * FROM {} WHERE rowid = ?1",
        quote_identifier(ROWID_FIELD),
        quote_identifier(table)
    );
    let mut row_stmt = conn.prepare(&row_sql).map_err(StorageError::from)?;
    let columns = row_stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();

    let mut records = Vec::with_capacity(pending.len());
    let mut through_seq = 0;
    for (row_id, op, seq, row_key) in pending {
        through_seq = through_seq.max(seq);
        let record = match PendingOperation::parse(&op) {
            Some(PendingOperation::Delete) => None,
            _ => row_stmt
                .query_row(params![row_id], |row| row_to_json(&columns, row))
                .optional()
                .map_err(StorageError::from)?,
        };
        records.push(record.unwrap_or_else(|| tombstone(row_id, row_key.as_deref())));
    }

    Ok(PendingTableBatch {
        table_name: table.to_string(),
        records,
        through_seq,
        observed_changes: if drained { pending_changes } else { 0 },
    })
}

/// Upserts or deletes `rows` into `table`. Returns `(applied, skipped)`.
fn apply_table_rows(
    conn: &Connection,
    table: &str,
    rows: &[serde_json::Value],
    policy: ConflictPolicy,
) -> Result<(usize, usize)> {
    if is_internal_table(table) {
        return Err(Error::statement(format!(
            "Table '{}' is internal and cannot be synced",
            table
        )));
    }
    let columns = load_table_columns(conn, table)?;
    if columns.is_empty() {
        return Err(Error::statement(format!("Unknown table '{}'", table)));
    }
    let known = columns
        .iter()
        .map(|column| column.name.as_str())
        .collect::<HashSet<_>>();
    let key_columns = primary_key_columns(&columns);
    let compare_timestamps =
        policy == ConflictPolicy::LastWriteWins && known.contains(UPDATED_AT_COLUMN);

    let mut applied = 0;
    let mut skipped = 0;
    for row in rows {
        let object = row.as_object().ok_or_else(|| {
            Error::statement(format!("Pulled row for '{}' is not a JSON object", table))
        })?;
        let deleted = object
            .get(DELETED_FIELD)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        if deleted
            && !key_columns.is_empty()
            && key_columns.iter().any(|column| !object.contains_key(column))
        {
            warn!(
                "[Sync] Skipping tombstone for '{}' without its key columns",
                table
            );
            skipped += 1;
            continue;
        }
        let key = RowKey::from_payload(table, &key_columns, object)?;

        if deleted {
            if let Some(row_id) = key.local_rowid(conn, table)? {
                tracker::take_row_key(conn, table, row_id)?;
            }
            let sql = format!("DELETE FROM {} WHERE {}", quote_identifier(table), key.predicate());
            conn.execute(&sql, params_from_iter(key.values.iter()))
                .map_err(StorageError::from)?;
            applied += 1;
            continue;
        }

        let fields = object
            .iter()
            .filter(|(name, _)| name.as_str() != ROWID_FIELD && name.as_str() != DELETED_FIELD)
            .collect::<Vec<_>>();
        if let Some((unknown, _)) = fields.iter().find(|(name, _)| !known.contains(name.as_str())) {
            return Err(Error::statement(format!(
                "Column '{}' is not valid for table '{}'",
                unknown, table
            )));
        }

        if compare_timestamps {
            let sql = format!(
                "SELECT {} FROM {} WHERE {}",
                quote_identifier(UPDATED_AT_COLUMN),
                quote_identifier(table),
                key.predicate()
            );
            let local = conn
                .query_row(&sql, params_from_iter(key.values.iter()), |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()
                .map_err(StorageError::from)?;
            if let Some(local) = local {
                let remote = object.get(UPDATED_AT_COLUMN).and_then(serde_json::Value::as_str);
                if !should_apply_remote(local.as_deref(), remote) {
                    skipped += 1;
                    continue;
                }
            }
        }

        upsert_row(conn, table, &key, &fields)?;
        if let Some(row_id) = key.local_rowid(conn, table)? {
            tracker::store_row_key(
                conn,
                table,
                row_id,
                &tracker::row_key_json(&key.columns, &key.values),
            )?;
        }
        applied += 1;
    }
    Ok((applied, skipped))
}

/// How a pulled row is matched against local rows.
struct RowKey {
    columns: Vec<String>,
    values: Vec<SqlValue>,
    by_rowid: bool,
}

impl RowKey {
    fn from_payload(
        table: &str,
        key_columns: &[String],
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        if key_columns.is_empty() {
            let row_id = object
                .get(ROWID_FIELD)
                .and_then(serde_json::Value::as_i64)
                .ok_or_else(|| {
                    Error::statement(format!(
                        "Pulled row for '{}' has no '{}'",
                        table, ROWID_FIELD
                    ))
                })?;
            return Ok(Self {
                columns: vec!["rowid".to_string()],
                values: vec![SqlValue::Integer(row_id)],
                by_rowid: true,
            });
        }

        let mut values = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            let value = object.get(column).ok_or_else(|| {
                Error::statement(format!(
                    "Pulled row for '{}' is missing key column '{}'",
                    table, column
                ))
            })?;
            values.push(SqlValue::from_json(value));
        }
        Ok(Self {
            columns: key_columns.to_vec(),
            values,
            by_rowid: false,
        })
    }

    /// Rowid of the local row this key names. Always `None` for rowid keys,
    /// which have no stored key to maintain.
    fn local_rowid(&self, conn: &Connection, table: &str) -> Result<Option<i64>> {
        if self.by_rowid {
            return Ok(None);
        }
        let sql = format!(
            "SELECT rowid FROM {} WHERE {}",
            quote_identifier(table),
            self.predicate()
        );
        let row_id = conn
            .query_row(&sql, params_from_iter(self.values.iter()), |row| row.get(0))
            .optional()
            .map_err(StorageError::from)?;
        Ok(row_id)
    }

    fn predicate(&self) -> String {
        self.columns
            .iter()
            .enumerate()
            .map(|(index, column)| {
                let column = if self.by_rowid {
                    column.clone()
                } else {
                    quote_identifier(column)
                };
                format!("{} = ?{}", column, index + 1)
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

fn upsert_row(
    conn: &Connection,
    table: &str,
    key: &RowKey,
    fields: &[(&String, &serde_json::Value)],
) -> Result<()> {
    let mut names = Vec::with_capacity(fields.len() + 1);
    let mut values = Vec::with_capacity(fields.len() + 1);
    if key.by_rowid {
        names.push("rowid".to_string());
        values.push(key.values[0].clone());
    }
    for (name, value) in fields {
        names.push(quote_identifier(name));
        values.push(SqlValue::from_json(value));
    }
    let placeholders = (1..=values.len())
        .map(|index| format!("?{}", index))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = if key.by_rowid {
        format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({placeholders})",
            quote_identifier(table),
            names.join(", ")
        )
    } else {
        let key_columns = key
            .columns
            .iter()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>();
        let upserts = fields
            .iter()
            .filter(|(name, _)| !key.columns.contains(name))
            .map(|(name, _)| {
                let quoted = quote_identifier(name);
                format!("{quoted}=excluded.{quoted}")
            })
            .collect::<Vec<_>>();
        let action = if upserts.is_empty() {
            "NOTHING".to_string()
        } else {
            format!("UPDATE SET {}", upserts.join(", "))
        };
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT({}) DO {action}",
            quote_identifier(table),
            names.join(", "),
            key_columns.join(", ")
        )
    };
    conn.execute(&sql, params_from_iter(values.iter()))
        .map_err(StorageError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineDeps, SqlStatement};
    use localbase_core::config::EngineConfig;
    use serde_json::json;

    fn setup() -> SyncStateRepository {
        let config = EngineConfig::new("sync-test")
            .with_persistence(false)
            .with_schema(vec![
                "CREATE TABLE IF NOT EXISTS notes (
                    id TEXT PRIMARY KEY,
                    body TEXT,
                    updated_at TEXT
                )",
                "CREATE TABLE IF NOT EXISTS tags (label TEXT)",
                "CREATE TABLE IF NOT EXISTS quotes (
                    symbol TEXT PRIMARY KEY,
                    price REAL,
                    expires_at TEXT
                )",
            ]);
        let db = Database::open(&config, EngineDeps::new()).expect("open");
        SyncStateRepository::new(db)
    }

    fn pending(repo: &SyncStateRepository, table: &str) -> i64 {
        repo.database()
            .table_dirty_state(table)
            .expect("state")
            .map(|state| state.pending_changes)
            .unwrap_or(0)
    }

    #[test]
    fn collects_current_rows_and_tombstones() {
        let repo = setup();
        let db = repo.database();
        db.execute(
            "INSERT INTO notes (id, body) VALUES ('n1', 'hello'), ('n2', 'bye')",
            &[],
        )
        .expect("insert");
        db.execute("UPDATE notes SET body = 'hello again' WHERE id = 'n1'", &[])
            .expect("update");
        db.execute("DELETE FROM notes WHERE id = 'n2'", &[])
            .expect("delete");

        let batches = repo.collect_pending_batches(100).expect("collect");
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.table_name, "notes");
        assert_eq!(batch.observed_changes, 3);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[0]["id"], json!("n1"));
        assert_eq!(batch.records[0]["body"], json!("hello again"));
        assert_eq!(batch.records[0][ROWID_FIELD], json!(1));
        assert_eq!(
            batch.records[1],
            json!({ "id": "n2", "_rowid": 2, "_deleted": true })
        );
    }

    #[test]
    fn deletes_from_one_device_apply_on_another() {
        let origin = setup();
        let replica = setup();
        for repo in [&origin, &replica] {
            repo.database()
                .execute(
                    "INSERT INTO notes (id, body) VALUES ('n1', 'x'), ('n2', 'y')",
                    &[],
                )
                .expect("seed");
        }
        let seeded = origin
            .collect_pending_batches(100)
            .expect("collect")
            .remove(0);
        origin.acknowledge_push(&seeded).expect("ack");
        origin
            .database()
            .execute("DELETE FROM notes WHERE id = 'n1'", &[])
            .expect("delete");

        let mut records = origin
            .collect_pending_batches(100)
            .expect("collect")
            .remove(0)
            .records;
        assert_eq!(
            records,
            vec![json!({ "id": "n1", "_rowid": 1, "_deleted": true })]
        );
        records.push(json!({ "id": "n2", "body": "y2" }));
        let mut changes = BTreeMap::new();
        changes.insert("notes".to_string(), records);

        let report = replica
            .apply_remote_changes(&changes, ConflictPolicy::RemoteWins)
            .expect("apply");
        assert!(report.rejected_tables.is_empty(), "{:?}", report.rejected_tables);
        assert_eq!(report.applied_rows, 2);
        let rows = replica
            .database()
            .query("SELECT id, body FROM notes ORDER BY id", &[])
            .expect("rows");
        assert_eq!(
            rows.rows,
            vec![vec![SqlValue::from("n2"), SqlValue::from("y2")]]
        );
    }

    #[test]
    fn acknowledge_resets_counter_and_clears_error() {
        let repo = setup();
        let db = repo.database();
        db.execute("INSERT INTO tags (label) VALUES ('a')", &[])
            .expect("insert");
        db.execute("INSERT INTO tags (label) VALUES ('b')", &[])
            .expect("insert");
        repo.record_push_error("tags", "HTTP 500").expect("error");

        let batch = repo
            .collect_pending_batches(100)
            .expect("collect")
            .remove(0);
        assert_eq!(pending(&repo, "tags"), 2);
        repo.acknowledge_push(&batch).expect("ack");

        let state = db
            .table_dirty_state("tags")
            .expect("state")
            .expect("tracked");
        assert_eq!(state.pending_changes, 0);
        assert!(state.last_sync_at.is_some());
        assert_eq!(state.last_error, None);
        assert!(repo.collect_pending_batches(100).expect("collect").is_empty());
    }

    #[test]
    fn mutations_racing_a_push_stay_pending() {
        let repo = setup();
        let db = repo.database();
        db.execute("INSERT INTO tags (label) VALUES ('a')", &[])
            .expect("insert");
        let batch = repo
            .collect_pending_batches(100)
            .expect("collect")
            .remove(0);

        db.execute("UPDATE tags SET label = 'a2'", &[]).expect("racing update");
        repo.acknowledge_push(&batch).expect("ack");

        assert_eq!(pending(&repo, "tags"), 1);
        let next = repo.collect_pending_batches(100).expect("collect");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].records[0]["label"], json!("a2"));
    }

    #[test]
    fn partial_batches_keep_the_table_dirty() {
        let repo = setup();
        let db = repo.database();
        db.execute("INSERT INTO tags (label) VALUES ('a'), ('b'), ('c')", &[])
            .expect("insert");
        let batch = repo.collect_pending_batches(2).expect("collect").remove(0);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.observed_changes, 0);
        repo.acknowledge_push(&batch).expect("ack");
        assert_eq!(pending(&repo, "tags"), 1);

        let rest = repo.collect_pending_batches(2).expect("collect").remove(0);
        assert_eq!(rest.records.len(), 1);
        repo.acknowledge_push(&rest).expect("ack");
        assert_eq!(pending(&repo, "tags"), 0);
    }

    #[test]
    fn remote_rows_upsert_without_tracking() {
        let repo = setup();
        let mut changes = BTreeMap::new();
        changes.insert(
            "notes".to_string(),
            vec![
                json!({"id": "r1", "body": "remote", "updated_at": "2026-01-01T00:00:00Z"}),
                json!({"id": "r2", "body": "other"}),
            ],
        );
        changes.insert(
            "tags".to_string(),
            vec![json!({"_rowid": 10, "label": "pulled"})],
        );

        let report = repo
            .apply_remote_changes(&changes, ConflictPolicy::LastWriteWins)
            .expect("apply");
        assert_eq!(report.applied_rows, 3);
        assert!(report.rejected_tables.is_empty());
        assert_eq!(pending(&repo, "notes"), 0);
        assert!(repo.database().dirty_tables().expect("dirty").is_empty());

        let tag = repo
            .database()
            .query("SELECT rowid, label FROM tags", &[])
            .expect("query");
        assert_eq!(
            tag.rows,
            vec![vec![
                SqlValue::Integer(10),
                SqlValue::Text("pulled".to_string())
            ]]
        );
    }

    #[test]
    fn last_write_wins_keeps_newer_local_rows() {
        let repo = setup();
        repo.database()
            .execute(
                "INSERT INTO notes (id, body, updated_at) VALUES ('n1', 'local', '2026-05-01T00:00:00Z')",
                &[],
            )
            .expect("insert");
        let mut changes = BTreeMap::new();
        changes.insert(
            "notes".to_string(),
            vec![json!({"id": "n1", "body": "stale", "updated_at": "2026-04-01T00:00:00Z"})],
        );

        let report = repo
            .apply_remote_changes(&changes, ConflictPolicy::LastWriteWins)
            .expect("apply");
        assert_eq!((report.applied_rows, report.skipped_rows), (0, 1));
        let body = repo
            .database()
            .query("SELECT body FROM notes WHERE id = 'n1'", &[])
            .expect("query");
        assert_eq!(body.rows[0][0], SqlValue::Text("local".to_string()));

        repo.apply_remote_changes(&changes, ConflictPolicy::RemoteWins)
            .expect("apply remote wins");
        let body = repo
            .database()
            .query("SELECT body FROM notes WHERE id = 'n1'", &[])
            .expect("query");
        assert_eq!(body.rows[0][0], SqlValue::Text("stale".to_string()));
    }

    #[test]
    fn unknown_tables_and_columns_are_rejected_per_table() {
        let repo = setup();
        let mut changes = BTreeMap::new();
        changes.insert("missing".to_string(), vec![json!({"_rowid": 1})]);
        changes.insert(
            "notes".to_string(),
            vec![
                json!({"id": "ok", "body": "fine"}),
                json!({"id": "bad", "surprise": 1}),
            ],
        );
        changes.insert(
            "tags".to_string(),
            vec![json!({"_rowid": 1, "label": "kept"})],
        );

        let report = repo
            .apply_remote_changes(&changes, ConflictPolicy::RemoteWins)
            .expect("apply");
        let rejected = report
            .rejected_tables
            .iter()
            .map(|(table, _)| table.as_str())
            .collect::<Vec<_>>();
        assert_eq!(rejected, vec!["missing", "notes"]);
        assert_eq!(report.applied_rows, 1);

        let notes = repo
            .database()
            .query("SELECT COUNT(*) FROM notes", &[])
            .expect("count");
        assert_eq!(notes.rows[0][0], SqlValue::Integer(0));
    }

    #[test]
    fn pulled_rows_deleted_locally_push_their_key() {
        let repo = setup();
        let mut changes = BTreeMap::new();
        changes.insert(
            "notes".to_string(),
            vec![json!({"id": "remote-1", "body": "from server"})],
        );
        repo.apply_remote_changes(&changes, ConflictPolicy::RemoteWins)
            .expect("apply");
        repo.database()
            .execute("DELETE FROM notes WHERE id = 'remote-1'", &[])
            .expect("delete");

        let batch = repo
            .collect_pending_batches(100)
            .expect("collect")
            .remove(0);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0]["id"], json!("remote-1"));
        assert_eq!(batch.records[0][DELETED_FIELD], json!(true));
    }

    #[test]
    fn tombstones_without_key_columns_are_skipped() {
        let repo = setup();
        let mut changes = BTreeMap::new();
        changes.insert(
            "notes".to_string(),
            vec![
                json!({"_rowid": 3, "_deleted": true}),
                json!({"id": "n1", "body": "kept"}),
            ],
        );
        let report = repo
            .apply_remote_changes(&changes, ConflictPolicy::RemoteWins)
            .expect("apply");
        assert!(report.rejected_tables.is_empty());
        assert_eq!(report.applied_rows, 1);
        assert_eq!(report.skipped_rows, 1);
    }

    #[test]
    fn tombstones_delete_local_rows() {
        let repo = setup();
        repo.database()
            .transaction(&[
                SqlStatement::new("INSERT INTO notes (id, body) VALUES ('n1', 'x')"),
                SqlStatement::new("INSERT INTO tags (label) VALUES ('t')"),
            ])
            .expect("seed");
        let mut changes = BTreeMap::new();
        changes.insert("notes".to_string(), vec![json!({"id": "n1", "_deleted": true})]);
        changes.insert("tags".to_string(), vec![json!({"_rowid": 1, "_deleted": true})]);

        repo.apply_remote_changes(&changes, ConflictPolicy::RemoteWins)
            .expect("apply");
        let remaining = repo
            .database()
            .query(
                "SELECT (SELECT COUNT(*) FROM notes) + (SELECT COUNT(*) FROM tags)",
                &[],
            )
            .expect("count");
        assert_eq!(remaining.rows[0][0], SqlValue::Integer(0));
    }

    #[test]
    fn purge_removes_only_expired_rows() {
        let repo = setup();
        repo.database()
            .execute(
                "INSERT INTO quotes (symbol, price, expires_at) VALUES
                    ('OLD', 1.0, '2000-01-01T00:00:00Z'),
                    ('NEW', 2.0, '2999-01-01T00:00:00Z'),
                    ('KEEP', 3.0, NULL)",
                &[],
            )
            .expect("seed");
        let before = pending(&repo, "quotes");

        let purged = repo
            .purge_expired(&[
                CacheTableConfig::new("quotes", "expires_at"),
                CacheTableConfig::new("quotes", "no_such_column"),
            ])
            .expect("purge");
        assert_eq!(purged, 1);
        assert_eq!(pending(&repo, "quotes"), before);
    }

    #[test]
    fn last_pull_timestamp_round_trips() {
        let repo = setup();
        assert_eq!(repo.last_pull_at().expect("read"), None);
        repo.set_last_pull_at("2026-10-18T00:00:00+00:00")
            .expect("write");
        assert_eq!(
            repo.last_pull_at().expect("read").as_deref(),
            Some("2026-10-18T00:00:00+00:00")
        );
    }
}
