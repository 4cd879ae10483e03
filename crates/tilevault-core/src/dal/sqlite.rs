//! File-based single-writer engine backed by SQLite.
//!
//! SQLite calls are synchronous, so every operation runs on the blocking
//! thread pool via `tokio::task::spawn_blocking`. A single connection behind
//! a mutex gives the single-writer guarantee; transactions are opened with
//! `BEGIN IMMEDIATE` so a read-check-write sequence cannot interleave with
//! another writer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};

use super::{
    CommandResult, DalCommand, DalCommandKind, DalConnection, DalEngine, DalQuery, DalRow,
    DalSession, DalValue, TransactionWork,
};
use crate::error::{Error, Result};

/// Busy timeout applied to file-backed connections.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// SQLite-backed [`DalConnection`].
#[derive(Clone)]
pub struct SqliteDal {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteDal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDal").field("path", &self.path).finish()
    }
}

impl SqliteDal {
    /// Opens (creating if needed) a database file.
    ///
    /// Enables WAL journaling and `synchronous=FULL` so a committed
    /// transaction survives a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or configured.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .map_err(|e| Error::database_with_source(format!("open {}", path.display()), e))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        tracing::debug!(path = %path.display(), "opened sqlite database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Returns the database file path (`None` for in-memory databases).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| Error::internal("lock poisoned"))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| Error::internal(format!("sqlite task failed: {e}")))?
    }
}

struct SqliteSession<'a> {
    conn: &'a Connection,
}

fn to_sql(value: &DalValue) -> Value {
    match value {
        DalValue::Null => Value::Null,
        DalValue::Integer(v) => Value::Integer(*v),
        DalValue::Real(v) => Value::Real(*v),
        DalValue::Text(v) => Value::Text(v.clone()),
        DalValue::Blob(v) => Value::Blob(v.clone()),
    }
}

fn from_sql(value: Value) -> DalValue {
    match value {
        Value::Null => DalValue::Null,
        Value::Integer(v) => DalValue::Integer(v),
        Value::Real(v) => DalValue::Real(v),
        Value::Text(v) => DalValue::Text(v),
        Value::Blob(v) => DalValue::Blob(v),
    }
}

impl DalSession for SqliteSession<'_> {
    fn execute_command(&mut self, command: &DalCommand) -> Result<CommandResult> {
        let params = params_from_iter(command.parameters.iter().map(to_sql));
        let rows_affected = self.conn.execute(&command.text, params)?;
        let last_insert_id =
            (command.kind == DalCommandKind::Insert).then(|| self.conn.last_insert_rowid());
        Ok(CommandResult {
            rows_affected: rows_affected as u64,
            last_insert_id,
        })
    }

    fn execute_query(&mut self, query: &DalQuery) -> Result<Vec<DalRow>> {
        let mut stmt = self.conn.prepare(&query.text)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(params_from_iter(query.parameters.iter().map(to_sql)))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut pairs = Vec::with_capacity(columns.len());
            for (idx, name) in columns.iter().enumerate() {
                let value: Value = row.get(idx)?;
                pairs.push((name.clone(), from_sql(value)));
            }
            out.push(DalRow::from_pairs(pairs));
        }
        Ok(out)
    }
}

#[async_trait]
impl DalConnection for SqliteDal {
    fn engine(&self) -> DalEngine {
        DalEngine::Sqlite
    }

    async fn execute_command(&self, command: DalCommand) -> Result<CommandResult> {
        self.with_connection(move |conn| SqliteSession { conn }.execute_command(&command))
            .await
    }

    async fn execute_query(&self, query: DalQuery) -> Result<Vec<DalRow>> {
        self.with_connection(move |conn| SqliteSession { conn }.execute_query(&query))
            .await
    }

    async fn transaction(&self, work: TransactionWork) -> Result<()> {
        self.with_connection(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut session = SqliteSession { conn: &tx };
            // Dropping `tx` without commit rolls back.
            work(&mut session)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dal::DalConnectionExt;

    async fn table(dal: &SqliteDal) {
        dal.execute_command(DalCommand::new(
            DalCommandKind::Ddl,
            "CREATE TABLE items (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn insert_reports_row_id_and_query_returns_named_columns() {
        let dal = SqliteDal::open_in_memory().unwrap();
        table(&dal).await;

        let first = dal
            .execute_command(
                DalCommand::new(DalCommandKind::Insert, "INSERT INTO items (name) VALUES (?1)")
                    .bind("a"),
            )
            .await
            .unwrap();
        assert_eq!(first.rows_affected, 1);
        assert_eq!(first.last_insert_id, Some(1));

        let rows = dal
            .execute_query(DalQuery::new("SELECT id, name FROM items WHERE name = ?1").bind("a"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].integer("id").unwrap(), 1);
        assert_eq!(rows[0].text("name").unwrap(), "a");
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back() {
        let dal = SqliteDal::open_in_memory().unwrap();
        table(&dal).await;

        let result: Result<()> = dal
            .run_in_transaction(|session| {
                session.execute_command(
                    &DalCommand::new(DalCommandKind::Insert, "INSERT INTO items (name) VALUES (?1)")
                        .bind("doomed"),
                )?;
                Err(Error::internal("abort"))
            })
            .await;
        assert!(result.is_err());

        let rows = dal
            .execute_query(DalQuery::new("SELECT id FROM items"))
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn file_database_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.db");
        {
            let dal = SqliteDal::open(&path).unwrap();
            table(&dal).await;
            dal.execute_command(
                DalCommand::new(DalCommandKind::Insert, "INSERT INTO items (name) VALUES (?1)")
                    .bind("kept"),
            )
            .await
            .unwrap();
        }

        let reopened = SqliteDal::open(&path).unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        let rows = reopened
            .execute_query(DalQuery::new("SELECT name FROM items"))
            .await
            .unwrap();
        assert_eq!(rows[0].text("name").unwrap(), "kept");
    }
}
