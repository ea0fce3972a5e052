//! Per-table CRDT tracking on top of the embedded database.
//!
//! [`CrdtStore`] turns declared tables into replicated register-maps. Every
//! local write is captured by SQL triggers into per-column clock rows
//! (`crdt_clock`) carrying a column version, a monotone db version, the
//! originating replica id, and the row's causal length. Remote batches are
//! folded in with [`CrdtStore::apply_changes`], which resolves concurrent
//! writes per column: the greater `(cl, col_version, site_id)` tuple wins,
//! ties lose, so applying a batch twice is a no-op.
//!
//! Deletes are tombstones: the row's causal length becomes even, its column
//! clocks are dropped, and a sentinel clock row with `cid = "-1"` carries the
//! deletion to other replicas. A later re-insert raises the causal length to
//! the next odd value, which beats the tombstone everywhere.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Transaction};

use scrapyard_shared::constants::DELETE_SENTINEL;
use scrapyard_shared::protocol::ChangeRecord;
use scrapyard_shared::types::NodeId;

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Opaque handle returned by [`CrdtStore::subscribe`].
pub type SubscriptionId = u64;

/// Result of a generic query: column names plus rows of JSON primitives.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone)]
struct TrackedTable {
    pk_col: String,
    cols: Vec<String>,
}

type UpdateFn = Box<dyn FnMut(&str, i64) + Send>;

#[derive(Default)]
struct Subscribers {
    next_id: SubscriptionId,
    subs: Vec<(SubscriptionId, UpdateFn)>,
}

/// Embedded SQL store with per-table CRDT tracking.
pub struct CrdtStore {
    db: Database,
    node_id: NodeId,
    tracked: HashMap<String, TrackedTable>,
    subscribers: Arc<Mutex<Subscribers>>,
}

impl CrdtStore {
    /// Open (or create) the named database in the platform data directory.
    pub fn open(db_name: &str) -> Result<Self> {
        Self::from_database(Database::new(db_name)?)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        Self::from_database(Database::open_at(path)?)
    }

    fn from_database(db: Database) -> Result<Self> {
        let site_id: Vec<u8> =
            db.conn()
                .query_row("SELECT site_id FROM crdt_node WHERE id = 0", [], |row| {
                    row.get(0)
                })?;
        let mut arr = [0u8; 16];
        if site_id.len() != arr.len() {
            return Err(StoreError::Migration(format!(
                "replica id has {} bytes, expected 16",
                site_id.len()
            )));
        }
        arr.copy_from_slice(&site_id);
        let node_id = NodeId(arr);

        tracing::info!(node = %node_id.short(), "opened CRDT store");

        let subscribers: Arc<Mutex<Subscribers>> = Arc::default();
        let hook_subs = subscribers.clone();
        db.conn().update_hook(Some(
            move |_action, _db: &str, table: &str, rowid: i64| {
                if table.starts_with("crdt_") || table.starts_with("sqlite_") {
                    return;
                }
                let mut guard = hook_subs.lock().expect("subscriber lock");
                for (_, f) in guard.subs.iter_mut() {
                    f(table, rowid);
                }
            },
        ));

        let mut store = Self {
            db,
            node_id,
            tracked: HashMap::new(),
            subscribers,
        };
        store.reload_tracked()?;
        Ok(store)
    }

    /// Re-register the in-memory view of previously tracked tables.
    fn reload_tracked(&mut self) -> Result<()> {
        let tables: Vec<String> = {
            let mut stmt = self.db.conn().prepare("SELECT tbl FROM crdt_tracked")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for table in tables {
            let info = self.introspect(&table)?;
            self.tracked.insert(table, info);
        }
        Ok(())
    }

    /// The replica's stable identifier.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Monotone per-replica version, advancing on every tracked write.
    pub fn version(&self) -> Result<i64> {
        Ok(self
            .db
            .conn()
            .query_row("SELECT version FROM crdt_version WHERE id = 0", [], |row| {
                row.get(0)
            })?)
    }

    /// Access to the underlying connection for typed queries.
    pub fn conn(&self) -> &rusqlite::Connection {
        self.db.conn()
    }

    /// Execute a statement with JSON-primitive params, returning the number
    /// of affected rows.
    pub fn exec(&self, sql: &str, params: &[serde_json::Value]) -> Result<usize> {
        let bound = params
            .iter()
            .map(json_to_sql)
            .collect::<Result<Vec<_>>>()?;
        Ok(self.db.conn().execute(sql, params_from_iter(bound))?)
    }

    /// Run a query with JSON-primitive params, returning columns and rows.
    pub fn query(&self, sql: &str, params: &[serde_json::Value]) -> Result<QueryResult> {
        let bound = params
            .iter()
            .map(json_to_sql)
            .collect::<Result<Vec<_>>>()?;
        let mut stmt = self.db.conn().prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let n = columns.len();
        let mut rows = stmt.query(params_from_iter(bound))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut vals = Vec::with_capacity(n);
            for i in 0..n {
                vals.push(sql_to_json(row.get::<_, SqlValue>(i)?));
            }
            out.push(vals);
        }
        Ok(QueryResult { columns, rows: out })
    }

    /// Declare `table` as a replicated register-map. Idempotent. After this
    /// call every write to the table is tracked.
    ///
    /// The table must already exist and have a single-column primary key.
    pub fn enable_crdt(&mut self, table: &str) -> Result<()> {
        if self.tracked.contains_key(table) {
            return Ok(());
        }

        let info = self.introspect(table)?;
        self.install_triggers(table, &info)?;
        self.db.conn().execute(
            "INSERT OR IGNORE INTO crdt_tracked (tbl, pk_col) VALUES (?1, ?2)",
            params![table, info.pk_col],
        )?;

        tracing::debug!(table, pk = %info.pk_col, "enabled CRDT tracking");
        self.tracked.insert(table.to_string(), info);
        Ok(())
    }

    fn introspect(&self, table: &str) -> Result<TrackedTable> {
        let mut stmt = self
            .db
            .conn()
            .prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
        let mut pk_cols = Vec::new();
        let mut cols = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get("name")?;
            let pk: i64 = row.get("pk")?;
            if pk > 0 {
                pk_cols.push(name);
            } else {
                cols.push(name);
            }
        }
        if pk_cols.is_empty() && cols.is_empty() {
            return Err(StoreError::UnsupportedSchema {
                table: table.to_string(),
                reason: "no such table".into(),
            });
        }
        if pk_cols.len() != 1 {
            return Err(StoreError::UnsupportedSchema {
                table: table.to_string(),
                reason: format!("need exactly one primary-key column, found {}", pk_cols.len()),
            });
        }
        Ok(TrackedTable {
            pk_col: pk_cols.remove(0),
            cols,
        })
    }

    fn install_triggers(&self, table: &str, info: &TrackedTable) -> Result<()> {
        let pk_new = format!("CAST(NEW.\"{}\" AS BLOB)", info.pk_col);
        let pk_old = format!("CAST(OLD.\"{}\" AS BLOB)", info.pk_col);
        let guard = "(SELECT applying FROM crdt_guard WHERE id = 0) = 0";

        // Insert: flip the causal length back to odd if the pk was deleted
        // before, drop any tombstone, then version every column.
        let mut body = String::new();
        body.push_str(&format!(
            "INSERT OR IGNORE INTO crdt_row (tbl, pk, cl) VALUES ('{table}', {pk_new}, 1);\n\
             UPDATE crdt_row SET cl = cl + 1 WHERE tbl = '{table}' AND pk = {pk_new} AND cl % 2 = 0;\n\
             DELETE FROM crdt_clock WHERE tbl = '{table}' AND pk = {pk_new} AND cid = '{DELETE_SENTINEL}';\n\
             UPDATE crdt_version SET version = version + 1 WHERE id = 0;\n"
        ));
        for col in &info.cols {
            body.push_str(&clock_stamp_sql(table, &pk_new, col));
        }
        self.db.conn().execute_batch(&format!(
            "CREATE TRIGGER IF NOT EXISTS \"{table}__crdt_ins\" AFTER INSERT ON \"{table}\"\n\
             WHEN {guard}\nBEGIN\n{body}END;"
        ))?;

        // Update: one trigger per column, firing only on real value changes.
        for col in &info.cols {
            let stamp = clock_stamp_sql(table, &pk_new, col);
            self.db.conn().execute_batch(&format!(
                "CREATE TRIGGER IF NOT EXISTS \"{table}__crdt_upd_{col}\"\n\
                 AFTER UPDATE OF \"{col}\" ON \"{table}\"\n\
                 WHEN {guard} AND NEW.\"{col}\" IS NOT OLD.\"{col}\"\n\
                 BEGIN\n\
                 INSERT OR IGNORE INTO crdt_row (tbl, pk, cl) VALUES ('{table}', {pk_new}, 1);\n\
                 UPDATE crdt_version SET version = version + 1 WHERE id = 0;\n\
                 {stamp}END;"
            ))?;
        }

        // Delete: flip the causal length to even, drop the column clocks,
        // and leave a sentinel clock row as the tombstone.
        self.db.conn().execute_batch(&format!(
            "CREATE TRIGGER IF NOT EXISTS \"{table}__crdt_del\" AFTER DELETE ON \"{table}\"\n\
             WHEN {guard}\nBEGIN\n\
             INSERT OR IGNORE INTO crdt_row (tbl, pk, cl) VALUES ('{table}', {pk_old}, 1);\n\
             UPDATE crdt_row SET cl = cl + 1 WHERE tbl = '{table}' AND pk = {pk_old} AND cl % 2 = 1;\n\
             DELETE FROM crdt_clock WHERE tbl = '{table}' AND pk = {pk_old} AND cid <> '{DELETE_SENTINEL}';\n\
             UPDATE crdt_version SET version = version + 1 WHERE id = 0;\n\
             {}END;",
            clock_stamp_sql(table, &pk_old, DELETE_SENTINEL)
        ))?;

        Ok(())
    }

    /// The ordered set of change records with `db_version > since`.
    ///
    /// Primary keys and replica ids are surfaced base64-encoded; values are
    /// the current cell contents (null for tombstones).
    pub fn changes_since(&self, since: i64) -> Result<Vec<ChangeRecord>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT tbl, pk, cid, col_version, db_version, site_id, cl, seq
             FROM crdt_clock WHERE db_version > ?1 ORDER BY db_version, seq",
        )?;
        let raw: Vec<(String, Vec<u8>, String, i64, i64, Vec<u8>, i64, i64)> = stmt
            .query_map(params![since], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut out = Vec::with_capacity(raw.len());
        for (tbl, pk, cid, col_version, db_version, site_id, cl, seq) in raw {
            let val = if cid == DELETE_SENTINEL {
                serde_json::Value::Null
            } else {
                self.read_cell(&tbl, &pk, &cid)?
            };
            out.push(ChangeRecord {
                table: tbl,
                pk: BASE64.encode(&pk),
                cid,
                val,
                col_version,
                db_version,
                site_id: BASE64.encode(&site_id),
                cl,
                seq,
            });
        }
        Ok(out)
    }

    fn read_cell(&self, table: &str, pk: &[u8], cid: &str) -> Result<serde_json::Value> {
        let info = self
            .tracked
            .get(table)
            .ok_or_else(|| StoreError::Untracked(table.to_string()))?;
        if !info.cols.iter().any(|c| c == cid) {
            return Err(StoreError::BadChange(format!(
                "unknown column '{cid}' on table '{table}'"
            )));
        }
        let sql = format!(
            "SELECT \"{cid}\" FROM \"{table}\" WHERE \"{}\" = ?1",
            info.pk_col
        );
        let cell = self
            .db
            .conn()
            .query_row(&sql, params![pk_to_sql(pk)], |row| {
                row.get::<_, SqlValue>(0)
            })
            .optional()?;
        Ok(cell.map(sql_to_json).unwrap_or(serde_json::Value::Null))
    }

    /// Idempotently fold a batch of change records from another replica.
    ///
    /// The batch is applied in one transaction: any malformed or untracked
    /// record aborts the whole batch and leaves the store unchanged. Returns
    /// the number of records that won their merge and mutated state.
    pub fn apply_changes(&mut self, records: &[ChangeRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tracked = &self.tracked;
        let tx = self.db.conn_mut().transaction()?;
        tx.execute("UPDATE crdt_guard SET applying = 1 WHERE id = 0", [])?;

        let mut applied = 0;
        for rec in records {
            let info = tracked
                .get(&rec.table)
                .ok_or_else(|| StoreError::Untracked(rec.table.clone()))?;
            if apply_one(&tx, &rec.table, info, rec)? {
                applied += 1;
            }
        }

        tx.execute("UPDATE crdt_guard SET applying = 0 WHERE id = 0", [])?;
        tx.commit()?;

        tracing::debug!(total = records.len(), applied, "applied change batch");
        Ok(applied)
    }

    /// Install a hook invoked once per row mutation of a tracked (non
    /// bookkeeping) table. The hook also fires for rows materialized by
    /// [`apply_changes`], which is what keeps change gossip transitive.
    ///
    /// Hooks run inside the write path and must not call back into the store.
    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: FnMut(&str, i64) + Send + 'static,
    {
        let mut guard = self.subscribers.lock().expect("subscriber lock");
        guard.next_id += 1;
        let id = guard.next_id;
        guard.subs.push((id, Box::new(f)));
        id
    }

    /// Remove a previously installed hook. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut guard = self.subscribers.lock().expect("subscriber lock");
        guard.subs.retain(|(sid, _)| *sid != id);
    }
}

/// Trigger fragment stamping one clock row for `cid`, creating it on first
/// sight. `col_version` starts at 0 and the update makes the first write 1.
fn clock_stamp_sql(table: &str, pk_expr: &str, cid: &str) -> String {
    format!(
        "UPDATE crdt_version SET seq = seq + 1 WHERE id = 0;\n\
         INSERT OR IGNORE INTO crdt_clock (tbl, pk, cid, col_version, db_version, site_id, cl, seq)\n\
         VALUES ('{table}', {pk_expr}, '{cid}', 0, 0, X'', 0, 0);\n\
         UPDATE crdt_clock SET\n\
             col_version = col_version + 1,\n\
             db_version  = (SELECT version FROM crdt_version WHERE id = 0),\n\
             site_id     = (SELECT site_id FROM crdt_node WHERE id = 0),\n\
             cl          = (SELECT cl FROM crdt_row WHERE tbl = '{table}' AND pk = {pk_expr}),\n\
             seq         = (SELECT seq FROM crdt_version WHERE id = 0)\n\
         WHERE tbl = '{table}' AND pk = {pk_expr} AND cid = '{cid}';\n"
    )
}

fn apply_one(
    tx: &Transaction<'_>,
    table: &str,
    info: &TrackedTable,
    rec: &ChangeRecord,
) -> Result<bool> {
    let pk = BASE64
        .decode(&rec.pk)
        .map_err(|e| StoreError::BadChange(format!("pk is not base64: {e}")))?;
    let site = BASE64
        .decode(&rec.site_id)
        .map_err(|e| StoreError::BadChange(format!("site_id is not base64: {e}")))?;

    let local_cl: Option<i64> = tx
        .query_row(
            "SELECT cl FROM crdt_row WHERE tbl = ?1 AND pk = ?2",
            params![table, pk],
            |row| row.get(0),
        )
        .optional()?;
    let local_cl = local_cl.unwrap_or(0);

    if rec.cid == DELETE_SENTINEL {
        if rec.cl <= local_cl {
            return Ok(false);
        }
        tx.execute(
            &format!("DELETE FROM \"{table}\" WHERE \"{}\" = ?1", info.pk_col),
            params![pk_to_sql(&pk)],
        )?;
        tx.execute(
            "DELETE FROM crdt_clock WHERE tbl = ?1 AND pk = ?2",
            params![table, pk],
        )?;
        set_row_cl(tx, table, &pk, rec.cl)?;
        stamp_applied_clock(tx, table, &pk, DELETE_SENTINEL, rec, &site)?;
        return Ok(true);
    }

    if !info.cols.iter().any(|c| c == &rec.cid) {
        return Err(StoreError::BadChange(format!(
            "unknown column '{}' on table '{table}'",
            rec.cid
        )));
    }
    if rec.cl % 2 == 0 {
        return Err(StoreError::BadChange(format!(
            "column write for '{}' carries an even causal length",
            rec.cid
        )));
    }

    if rec.cl < local_cl {
        return Ok(false);
    }

    let wins = if rec.cl > local_cl {
        // A newer causal era beats whatever the previous era recorded.
        true
    } else {
        let local: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT col_version, site_id FROM crdt_clock
                 WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
                params![table, pk, rec.cid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match local {
            None => true,
            Some((lv, lsite)) => (rec.col_version, site.as_slice()) > (lv, lsite.as_slice()),
        }
    };
    if !wins {
        return Ok(false);
    }

    if rec.cl > local_cl {
        set_row_cl(tx, table, &pk, rec.cl)?;
        tx.execute(
            "DELETE FROM crdt_clock WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
            params![table, pk, DELETE_SENTINEL],
        )?;
    }

    tx.execute(
        &format!(
            "INSERT OR IGNORE INTO \"{table}\" (\"{}\") VALUES (?1)",
            info.pk_col
        ),
        params![pk_to_sql(&pk)],
    )?;
    tx.execute(
        &format!(
            "UPDATE \"{table}\" SET \"{}\" = ?1 WHERE \"{}\" = ?2",
            rec.cid, info.pk_col
        ),
        params![json_to_sql(&rec.val)?, pk_to_sql(&pk)],
    )?;
    stamp_applied_clock(tx, table, &pk, &rec.cid, rec, &site)?;
    Ok(true)
}

fn set_row_cl(tx: &Transaction<'_>, table: &str, pk: &[u8], cl: i64) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO crdt_row (tbl, pk, cl) VALUES (?1, ?2, ?3)",
        params![table, pk, cl],
    )?;
    tx.execute(
        "UPDATE crdt_row SET cl = ?3 WHERE tbl = ?1 AND pk = ?2 AND cl < ?3",
        params![table, pk, cl],
    )?;
    Ok(())
}

/// Record an applied remote change under a fresh local db version so it
/// keeps flowing onward to other peers, preserving its origin fields.
fn stamp_applied_clock(
    tx: &Transaction<'_>,
    table: &str,
    pk: &[u8],
    cid: &str,
    rec: &ChangeRecord,
    site: &[u8],
) -> Result<()> {
    tx.execute(
        "UPDATE crdt_version SET version = version + 1, seq = seq + 1 WHERE id = 0",
        [],
    )?;
    let (db_version, seq): (i64, i64) = tx.query_row(
        "SELECT version, seq FROM crdt_version WHERE id = 0",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    tx.execute(
        "INSERT OR REPLACE INTO crdt_clock (tbl, pk, cid, col_version, db_version, site_id, cl, seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![table, pk, cid, rec.col_version, db_version, site, rec.cl, seq],
    )?;
    Ok(())
}

fn pk_to_sql(pk: &[u8]) -> SqlValue {
    match std::str::from_utf8(pk) {
        Ok(s) => SqlValue::Text(s.to_string()),
        Err(_) => SqlValue::Blob(pk.to_vec()),
    }
}

fn sql_to_json(v: SqlValue) -> serde_json::Value {
    match v {
        SqlValue::Null => serde_json::Value::Null,
        SqlValue::Integer(i) => serde_json::Value::from(i),
        SqlValue::Real(f) => serde_json::Value::from(f),
        SqlValue::Text(s) => serde_json::Value::from(s),
        SqlValue::Blob(b) => serde_json::Value::from(BASE64.encode(b)),
    }
}

fn json_to_sql(v: &serde_json::Value) -> Result<SqlValue> {
    match v {
        serde_json::Value::Null => Ok(SqlValue::Null),
        serde_json::Value::Bool(b) => Ok(SqlValue::Integer(*b as i64)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(StoreError::BadChange(format!("unrepresentable number {n}")))
            }
        }
        serde_json::Value::String(s) => Ok(SqlValue::Text(s.clone())),
        other => Err(StoreError::BadChange(format!(
            "value must be a JSON primitive, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_store() -> (CrdtStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CrdtStore::open_at(&dir.path().join("catalog.db")).unwrap();
        store.enable_crdt("sites").unwrap();
        (store, dir)
    }

    fn insert_site(store: &CrdtStore, id: &str, name: &str) {
        store
            .exec(
                "INSERT INTO sites (id, name, added_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                &[json!(id), json!(name), json!("2026-01-01T00:00:00Z")],
            )
            .unwrap();
    }

    fn site_names(store: &CrdtStore) -> Vec<(String, String)> {
        let res = store
            .query("SELECT id, name FROM sites ORDER BY id", &[])
            .unwrap();
        res.rows
            .into_iter()
            .map(|r| {
                (
                    r[0].as_str().unwrap().to_string(),
                    r[1].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    fn sync_into(from: &CrdtStore, to: &mut CrdtStore) -> usize {
        let changes = from.changes_since(0).unwrap();
        to.apply_changes(&changes).unwrap()
    }

    #[test]
    fn insert_versions_every_column() {
        let (store, _dir) = test_store();
        insert_site(&store, "site-a", "Alpha");

        let changes = store.changes_since(0).unwrap();
        // One clock row per non-pk column of `sites`.
        assert_eq!(changes.len(), 10);
        assert!(changes.iter().all(|c| c.table == "sites"));
        assert!(changes.iter().all(|c| c.cl == 1));
        let name = changes.iter().find(|c| c.cid == "name").unwrap();
        assert_eq!(name.val, json!("Alpha"));
        assert_eq!(name.col_version, 1);
    }

    #[test]
    fn two_replicas_converge() {
        let (mut a, _da) = test_store();
        let (mut b, _db) = test_store();

        insert_site(&a, "site-a", "Alpha");
        insert_site(&b, "site-b", "Beta");

        sync_into(&a, &mut b);
        sync_into(&b, &mut a);
        // Second round carries the re-stamped merged records back; it must
        // not disturb either side.
        sync_into(&a, &mut b);

        assert_eq!(site_names(&a), site_names(&b));
        assert_eq!(site_names(&a).len(), 2);
    }

    #[test]
    fn concurrent_column_writes_resolve_deterministically() {
        let (mut a, _da) = test_store();
        let (mut b, _db) = test_store();

        insert_site(&a, "site-a", "Alpha");
        sync_into(&a, &mut b);

        a.exec(
            "UPDATE sites SET name = ?1 WHERE id = ?2",
            &[json!("FromA"), json!("site-a")],
        )
        .unwrap();
        b.exec(
            "UPDATE sites SET name = ?1 WHERE id = ?2",
            &[json!("FromB"), json!("site-a")],
        )
        .unwrap();

        sync_into(&a, &mut b);
        sync_into(&b, &mut a);
        sync_into(&a, &mut b);

        let winner = site_names(&a)[0].1.clone();
        assert!(winner == "FromA" || winner == "FromB");
        assert_eq!(site_names(&a), site_names(&b));
    }

    #[test]
    fn apply_is_idempotent() {
        let (a, _da) = test_store();
        let (mut b, _db) = test_store();

        insert_site(&a, "site-a", "Alpha");
        let changes = a.changes_since(0).unwrap();

        let first = b.apply_changes(&changes).unwrap();
        assert!(first > 0);
        let before = site_names(&b);
        let v_before = b.version().unwrap();

        let second = b.apply_changes(&changes).unwrap();
        assert_eq!(second, 0);
        assert_eq!(site_names(&b), before);
        assert_eq!(b.version().unwrap(), v_before);
    }

    #[test]
    fn delete_tombstones_propagate() {
        let (mut a, _da) = test_store();
        let (mut b, _db) = test_store();

        insert_site(&a, "site-a", "Alpha");
        sync_into(&a, &mut b);
        assert_eq!(site_names(&b).len(), 1);

        a.exec("DELETE FROM sites WHERE id = ?1", &[json!("site-a")])
            .unwrap();
        sync_into(&a, &mut b);

        assert!(site_names(&b).is_empty());
        // The tombstone survives as a sentinel change record.
        assert!(b
            .changes_since(0)
            .unwrap()
            .iter()
            .any(|c| c.cid == DELETE_SENTINEL));
    }

    #[test]
    fn delete_beats_concurrent_update_at_same_causal_length() {
        let (mut a, _da) = test_store();
        let (mut b, _db) = test_store();

        insert_site(&a, "site-a", "Alpha");
        sync_into(&a, &mut b);

        a.exec("DELETE FROM sites WHERE id = ?1", &[json!("site-a")])
            .unwrap();
        b.exec(
            "UPDATE sites SET name = ?1 WHERE id = ?2",
            &[json!("Renamed"), json!("site-a")],
        )
        .unwrap();

        sync_into(&a, &mut b);
        sync_into(&b, &mut a);

        assert!(site_names(&a).is_empty());
        assert!(site_names(&b).is_empty());
    }

    #[test]
    fn reinsert_after_delete_resurrects_everywhere() {
        let (mut a, _da) = test_store();
        let (mut b, _db) = test_store();

        insert_site(&a, "site-a", "Alpha");
        sync_into(&a, &mut b);

        a.exec("DELETE FROM sites WHERE id = ?1", &[json!("site-a")])
            .unwrap();
        insert_site(&a, "site-a", "AlphaAgain");
        sync_into(&a, &mut b);

        assert_eq!(site_names(&b), vec![("site-a".into(), "AlphaAgain".into())]);
    }

    #[test]
    fn version_is_monotone() {
        let (mut store, _dir) = test_store();
        let v0 = store.version().unwrap();
        insert_site(&store, "site-a", "Alpha");
        let v1 = store.version().unwrap();
        store
            .exec(
                "UPDATE sites SET name = ?1 WHERE id = ?2",
                &[json!("Alpha2"), json!("site-a")],
            )
            .unwrap();
        let v2 = store.version().unwrap();
        store
            .apply_changes(&[])
            .unwrap();
        let v3 = store.version().unwrap();

        assert!(v0 < v1 && v1 < v2 && v2 <= v3);
    }

    #[test]
    fn changes_since_filters_and_orders() {
        let (store, _dir) = test_store();
        insert_site(&store, "site-a", "Alpha");
        let mid = store.version().unwrap();
        insert_site(&store, "site-b", "Beta");

        let later = store.changes_since(mid).unwrap();
        assert!(!later.is_empty());
        assert!(later.iter().all(|c| c.db_version > mid));
        let seqs: Vec<i64> = later.iter().map(|c| c.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn untracked_table_aborts_whole_batch() {
        let (a, _da) = test_store();
        let (mut b, _db) = test_store();
        insert_site(&a, "site-a", "Alpha");

        let mut changes = a.changes_since(0).unwrap();
        changes.push(ChangeRecord {
            table: "nonsense".into(),
            ..changes[0].clone()
        });

        assert!(b.apply_changes(&changes).is_err());
        assert!(site_names(&b).is_empty());
    }

    #[test]
    fn update_hook_fires_for_data_tables_only() {
        let (mut store, _dir) = test_store();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        store.subscribe(move |table, _rowid| {
            assert_eq!(table, "sites");
            h.fetch_add(1, Ordering::SeqCst);
        });

        insert_site(&store, "site-a", "Alpha");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        store
            .exec(
                "UPDATE sites SET name = ?1 WHERE id = ?2",
                &[json!("Alpha2"), json!("site-a")],
            )
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        // Merged rows fire the hook as well.
        let (other, _od) = test_store();
        insert_site(&other, "site-b", "Beta");
        store.apply_changes(&other.changes_since(0).unwrap()).unwrap();
        assert!(hits.load(Ordering::SeqCst) > 2);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let (store, _dir) = test_store();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let token = store.subscribe(move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        store.unsubscribe(token);

        insert_site(&store, "site-a", "Alpha");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn node_id_is_stable_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let first = CrdtStore::open_at(&path).unwrap().node_id().clone();
        let second = CrdtStore::open_at(&path).unwrap().node_id().clone();
        assert_eq!(first, second);
    }
}
