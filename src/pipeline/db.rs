//! Idempotent storage layer over SQLite
//!
//! Primitives used by every other component:
//! - `upsert` - INSERT ... ON CONFLICT(key) DO UPDATE (refresh in place)
//! - `insert_if_absent` - INSERT OR IGNORE (append-only history)
//! - `bulk_upsert` / `bulk_insert_if_absent` - chunked, one transaction per chunk
//! - `delete_where` / `vacuum` - table-scoped deletes and storage reclaim
//!
//! Association read-modify-write lives in `associations` and is only ever
//! executed by the association writer thread.
//!
//! Connection policy: every call opens its own connection and closes it when
//! the statement or batch completes. Nothing holds a connection or a
//! transaction across a run.

use super::error::ScanError;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One record ready for storage: column name -> SQLite value
pub type Row = BTreeMap<String, Value>;

/// How long a writer waits on a locked database before failing the call
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run schema migrations from SQL files
///
/// Reads every `.sql` file in `schema_dir`, sorted by filename, and executes it.
/// All files use `IF NOT EXISTS`, so re-running is a no-op.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), ScanError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(ScanError::Config(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();

        log::debug!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
    }

    log::info!("✅ All schema migrations completed successfully");

    Ok(())
}

/// Quote an identifier for interpolation into SQL
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("?{}", i)).collect::<Vec<_>>().join(", ")
}

/// Build `INSERT ... ON CONFLICT(keys) DO UPDATE SET non_key = excluded.non_key`
fn upsert_sql(table: &str, key_columns: &[&str], columns: &[String]) -> String {
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !key_columns.contains(&c.as_str()))
        .map(|c| format!("{col} = excluded.{col}", col = quote_ident(c)))
        .collect();

    let conflict_action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    let keys = key_columns
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        quote_ident(table),
        column_list(columns),
        placeholders(columns.len()),
        keys,
        conflict_action
    )
}

fn insert_or_ignore_sql(table: &str, columns: &[String]) -> String {
    format!(
        "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list(columns),
        placeholders(columns.len())
    )
}

/// Handle to the relational store
///
/// Cheap to clone; holds only the path and batching parameters.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    chunk_size: usize,
}

impl Store {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            chunk_size: 100,
        };
        drop(store.connect()?);
        Ok(store)
    }

    /// Rows committed per bulk transaction
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Open a short-lived connection
    pub fn connect(&self) -> Result<Connection, ScanError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Run `f` on a fresh connection that is closed when `f` returns
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, ScanError>,
    ) -> Result<T, ScanError> {
        let mut conn = self.connect()?;
        f(&mut conn)
    }

    pub fn migrate(&self, schema_dir: &str) -> Result<(), ScanError> {
        self.with_connection(|conn| run_schema_migrations(conn, schema_dir))
    }

    /// Insert or refresh one row keyed by `key_columns`
    pub fn upsert(&self, table: &str, key_columns: &[&str], row: &Row) -> Result<(), ScanError> {
        if row.is_empty() {
            return Ok(());
        }
        let columns: Vec<String> = row.keys().cloned().collect();
        let sql = upsert_sql(table, key_columns, &columns);

        self.with_connection(|conn| {
            conn.execute(&sql, params_from_iter(row.values()))?;
            Ok(())
        })
    }

    /// Insert one row unless its key already exists
    ///
    /// Returns true when a row was written.
    pub fn insert_if_absent(&self, table: &str, row: &Row) -> Result<bool, ScanError> {
        if row.is_empty() {
            return Ok(false);
        }
        let columns: Vec<String> = row.keys().cloned().collect();
        let sql = insert_or_ignore_sql(table, &columns);

        self.with_connection(|conn| {
            let changed = conn.execute(&sql, params_from_iter(row.values()))?;
            Ok(changed > 0)
        })
    }

    /// Upsert many rows, committing every `chunk_size` rows
    ///
    /// Each row writes exactly the columns it carries, so rows with different
    /// column sets can share a batch. A column a row lacks is left untouched
    /// on an existing record. Returns the number of rows written.
    pub fn bulk_upsert(
        &self,
        table: &str,
        key_columns: &[&str],
        rows: &[Row],
    ) -> Result<usize, ScanError> {
        self.write_chunked(rows, |columns| upsert_sql(table, key_columns, columns))
    }

    /// INSERT OR IGNORE many rows; returns how many were new
    pub fn bulk_insert_if_absent(&self, table: &str, rows: &[Row]) -> Result<usize, ScanError> {
        self.write_chunked(rows, |columns| insert_or_ignore_sql(table, columns))
    }

    fn write_chunked(
        &self,
        rows: &[Row],
        build_sql: impl Fn(&[String]) -> String,
    ) -> Result<usize, ScanError> {
        if rows.iter().all(|row| row.is_empty()) {
            return Ok(0);
        }

        let mut conn = self.connect()?;
        let mut statements: HashMap<Vec<String>, String> = HashMap::new();
        let mut written = 0;

        for chunk in rows.chunks(self.chunk_size) {
            let tx = conn.transaction()?;
            for row in chunk.iter().filter(|row| !row.is_empty()) {
                let columns: Vec<String> = row.keys().cloned().collect();
                let sql = statements
                    .entry(columns)
                    .or_insert_with_key(|columns| build_sql(columns.as_slice()));
                let mut stmt = tx.prepare_cached(sql.as_str())?;
                written += stmt.execute(params_from_iter(row.values()))?;
            }
            tx.commit()?;
            log::debug!("   ├─ Committed chunk of {} rows", chunk.len());
        }

        Ok(written)
    }

    /// Delete rows matching `where_clause` from one table
    pub fn delete_where(
        &self,
        table: &str,
        where_clause: &str,
        params: &[Value],
    ) -> Result<usize, ScanError> {
        let sql = format!("DELETE FROM {} WHERE {}", quote_ident(table), where_clause);
        self.with_connection(|conn| Ok(conn.execute(&sql, params_from_iter(params.iter()))?))
    }

    /// Reclaim free pages after large deletes
    pub fn vacuum(&self) -> Result<(), ScanError> {
        self.with_connection(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
    }

    pub fn count(&self, table: &str) -> Result<i64, ScanError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        self.with_connection(|conn| Ok(conn.query_row(&sql, [], |row| row.get(0))?))
    }

    /// Run a query whose first column is text and collect it
    pub fn query_strings(&self, sql: &str, params: &[Value]) -> Result<Vec<String>, ScanError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let values = stmt
                .query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(values)
        })
    }
}

/// Build a row from `(column, value)` pairs
pub fn row_from<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::create_test_store;

    fn event_row(id: &str, title: &str, volume: f64) -> Row {
        row_from([
            ("id", Value::Text(id.to_string())),
            ("title", Value::Text(title.to_string())),
            ("volume", Value::Real(volume)),
            ("active", Value::Integer(1)),
            ("closed", Value::Integer(0)),
        ])
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let (_tmp, store) = create_test_store();
        // Second run must not fail on existing tables
        store
            .migrate(concat!(env!("CARGO_MANIFEST_DIR"), "/sql"))
            .unwrap();
        assert_eq!(store.count("events").unwrap(), 0);
    }

    #[test]
    fn test_missing_schema_dir() {
        let (_tmp, store) = create_test_store();
        let result = store.migrate("/nonexistent/schema");
        assert!(matches!(result, Err(ScanError::Config(_))));
    }

    #[test]
    fn test_upsert_twice_is_idempotent() {
        let (_tmp, store) = create_test_store();
        let row = event_row("e1", "Election", 1_000.0);

        store.upsert("events", &["id"], &row).unwrap();
        store.upsert("events", &["id"], &row).unwrap();

        assert_eq!(store.count("events").unwrap(), 1);
    }

    #[test]
    fn test_upsert_refreshes_in_place() {
        let (_tmp, store) = create_test_store();
        store
            .upsert("events", &["id"], &event_row("e1", "Old title", 10.0))
            .unwrap();
        store
            .upsert("events", &["id"], &event_row("e1", "New title", 20.0))
            .unwrap();

        let (title, volume): (String, f64) = store
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT title, volume FROM events WHERE id = 'e1'", [], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?)
            })
            .unwrap();

        assert_eq!(title, "New title");
        assert_eq!(volume, 20.0);
        assert_eq!(store.count("events").unwrap(), 1);
    }

    #[test]
    fn test_insert_if_absent_never_overwrites() {
        let (_tmp, store) = create_test_store();
        let first = row_from([
            ("transaction_hash", Value::Text("0xabc".to_string())),
            ("size", Value::Real(10.0)),
        ]);
        let second = row_from([
            ("transaction_hash", Value::Text("0xabc".to_string())),
            ("size", Value::Real(99.0)),
        ]);

        assert!(store.insert_if_absent("user_trades", &first).unwrap());
        assert!(!store.insert_if_absent("user_trades", &second).unwrap());

        let size: f64 = store
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT size FROM user_trades", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(size, 10.0);
    }

    #[test]
    fn test_bulk_upsert_heterogeneous_rows() {
        let (_tmp, store) = create_test_store();
        let mut rows = vec![event_row("e1", "One", 1.0)];
        // Each row writes its own columns, wherever it sits in the batch
        rows.push(row_from([
            ("id", Value::Text("e2".to_string())),
            ("title", Value::Text("Two".to_string())),
            ("ticker", Value::Text("TWO".to_string())),
        ]));

        let written = store.bulk_upsert("events", &["id"], &rows).unwrap();
        assert_eq!(written, 2);

        let (volume, ticker): (Option<f64>, Option<String>) = store
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT volume, ticker FROM events WHERE id = 'e2'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(volume, None);
        assert_eq!(ticker.as_deref(), Some("TWO"));
    }

    #[test]
    fn test_bulk_upsert_missing_column_left_untouched() {
        let (_tmp, store) = create_test_store();
        store.upsert("events", &["id"], &event_row("e1", "Kept", 5.0)).unwrap();

        let rows = vec![
            row_from([
                ("id", Value::Text("e1".to_string())),
                ("ticker", Value::Text("ONE".to_string())),
            ]),
            event_row("e2", "Two", 2.0),
        ];
        assert_eq!(store.bulk_upsert("events", &["id"], &rows).unwrap(), 2);

        let (title, ticker): (String, String) = store
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT title, ticker FROM events WHERE id = 'e1'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(title, "Kept");
        assert_eq!(ticker, "ONE");
    }

    #[test]
    fn test_bulk_upsert_commits_in_chunks() {
        let (_tmp, store) = create_test_store();
        let store = store.with_chunk_size(7);

        let rows: Vec<Row> = (0..25)
            .map(|i| event_row(&format!("e{}", i), "Chunked", i as f64))
            .collect();

        assert_eq!(store.bulk_upsert("events", &["id"], &rows).unwrap(), 25);
        assert_eq!(store.bulk_upsert("events", &["id"], &rows).unwrap(), 25);
        assert_eq!(store.count("events").unwrap(), 25);
    }

    #[test]
    fn test_bulk_insert_if_absent_counts_new_rows() {
        let (_tmp, store) = create_test_store();
        let rows: Vec<Row> = ["0x1", "0x2", "0x1"]
            .iter()
            .map(|h| row_from([("transaction_hash", Value::Text(h.to_string()))]))
            .collect();

        assert_eq!(store.bulk_insert_if_absent("user_activity", &rows).unwrap(), 2);
        assert_eq!(store.bulk_insert_if_absent("user_activity", &rows).unwrap(), 0);
    }

    #[test]
    fn test_delete_where_and_vacuum() {
        let (_tmp, store) = create_test_store();
        store.upsert("events", &["id"], &event_row("e1", "a", 1.0)).unwrap();
        store.upsert("events", &["id"], &event_row("e2", "b", 2.0)).unwrap();

        let removed = store
            .delete_where("events", "id = ?1", &[Value::Text("e1".to_string())])
            .unwrap();
        assert_eq!(removed, 1);
        store.vacuum().unwrap();
        assert_eq!(
            store.query_strings("SELECT id FROM events", &[]).unwrap(),
            vec!["e2".to_string()]
        );
    }

    #[test]
    fn test_upsert_sql_all_key_columns() {
        let sql = upsert_sql("market_tags", &["market_id", "tag_id"], &[
            "market_id".to_string(),
            "tag_id".to_string(),
        ]);
        assert!(sql.ends_with("DO NOTHING"));
    }
}
