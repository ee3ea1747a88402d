//! SQLite backend implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::dialect::{Dialect, SqliteDialect};
use crate::error::{Result, TributaryError};
use crate::executor::KillSwitch;

use super::{BackendConnection, ColumnSchema, RowSet, TableSchema};

const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// SQLite connection implementing the unified backend trait. Connections
/// are checked out of a small pool and opened on demand; queries run on
/// the blocking thread pool with an interrupt handle registered for
/// cooperative cancellation.
#[derive(Clone)]
pub struct SqliteConnection {
    database_path: PathBuf,
    dialect: SqliteDialect,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<rusqlite::Connection>>>,
}

impl SqliteConnection {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(TributaryError::Config(format!(
                "SQLite database does not exist: {}",
                path.display()
            )));
        }
        tracing::info!(path = %path.display(), "creating SQLite connection pool");
        Ok(Self {
            database_path: path,
            dialect: SqliteDialect,
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
            pool: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Configure maximum concurrent executions.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all SQLite slots in use, waiting for permit");
        }
        self.limiter
            .acquire()
            .await
            .map_err(|e| TributaryError::Execution(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<rusqlite::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            let pool_size = guard.len();
            drop(guard);
            tracing::trace!(pool_remaining = pool_size, "reusing pooled SQLite connection");
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.database_path.display(), "opening new SQLite connection");
        rusqlite::Connection::open(&self.database_path)
            .map_err(|e| TributaryError::Execution(format!("open sqlite: {e}")))
    }
}

#[async_trait]
impl BackendConnection for SqliteConnection {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema> {
        let table = table.to_string();
        let conn = self.checkout_connection().await?;
        let pool = self.pool.clone();

        let (conn, schema) =
            tokio::task::spawn_blocking(move || -> (rusqlite::Connection, Result<TableSchema>) {
                let start = Instant::now();
                let result = read_schema(&conn, &table);
                tracing::debug!(
                    table = table.as_str(),
                    ms = start.elapsed().as_millis(),
                    "sqlite fetch_schema"
                );
                (conn, result)
            })
            .await
            .map_err(|e| TributaryError::Execution(format!("task join error: {e}")))?;

        pool.lock().await.push(conn);
        schema
    }

    async fn execute_sql(&self, sql: &str, kill: &KillSwitch) -> Result<RowSet> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let pool = self.pool.clone();

        let interrupt = conn.get_interrupt_handle();
        let registration = kill.register(Box::new(move || interrupt.interrupt()));

        let joined =
            tokio::task::spawn_blocking(move || -> (rusqlite::Connection, Result<RowSet>) {
                let start = Instant::now();
                let result = read_rows(&conn, &sql);
                if let Ok(rowset) = &result {
                    tracing::debug!(
                        rows = rowset.rows.len(),
                        columns = rowset.columns.len(),
                        ms = start.elapsed().as_millis(),
                        "sqlite execute_sql"
                    );
                }
                (conn, result)
            })
            .await;

        kill.unregister(registration);

        let (conn, result) =
            joined.map_err(|e| TributaryError::Execution(format!("task join error: {e}")))?;
        pool.lock().await.push(conn);

        result.map_err(|e| {
            if kill.is_killed() {
                TributaryError::ExecutionKilled
            } else {
                e
            }
        })
    }
}

fn read_schema(conn: &rusqlite::Connection, table: &str) -> Result<TableSchema> {
    let pragma = format!("PRAGMA table_info('{}')", table.replace('\'', "''"));
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get("name")?;
        let data_type: String = row.get("type")?;
        let pk_position: i64 = row.get("pk")?;
        columns.push(ColumnSchema {
            name,
            data_type,
            primary_key: pk_position > 0,
        });
    }
    Ok(TableSchema { columns })
}

fn read_rows(conn: &rusqlite::Connection, sql: &str) -> Result<RowSet> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = (0..stmt.column_count())
        .map(|idx| stmt.column_name(idx).map(str::to_string))
        .collect::<std::result::Result<_, _>>()?;

    let mut rows_iter = stmt.query([])?;
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            values.push(sqlite_value_to_json(row.get_ref(idx)?));
        }
        rows.push(values);
    }
    Ok(RowSet { columns, rows })
}

fn sqlite_value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
