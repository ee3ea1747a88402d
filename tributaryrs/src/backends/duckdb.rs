//! DuckDB backend implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::dialect::{Dialect, DuckDbDialect};
use crate::error::{Result, TributaryError};
use crate::executor::KillSwitch;

use super::{BackendConnection, ColumnSchema, RowSet, TableSchema};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// DuckDB connection implementing the unified backend trait. DuckDB has no
/// connection-level cancel, so kill/timeout handling is best-effort: the
/// query runs to completion on the blocking pool and its result is
/// discarded.
#[derive(Clone)]
pub struct DuckDbConnection {
    database_path: PathBuf,
    dialect: DuckDbDialect,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbConnection {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        tracing::info!(path = %path.display(), "creating DuckDB connection pool");
        Self {
            database_path: path,
            dialect: DuckDbDialect,
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
            pool: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        self.limiter
            .acquire()
            .await
            .map_err(|e| TributaryError::Execution(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.database_path.display(), "opening new DuckDB connection");
        duckdb::Connection::open(&self.database_path)
            .map_err(|e| TributaryError::Execution(format!("open duckdb: {e}")))
    }
}

#[async_trait]
impl BackendConnection for DuckDbConnection {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema> {
        let table = table.to_string();
        let conn = self.checkout_connection().await?;
        let pool = self.pool.clone();

        let (conn, schema) =
            tokio::task::spawn_blocking(move || -> (duckdb::Connection, Result<TableSchema>) {
                let result = read_schema(&conn, &table);
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

        let joined = tokio::task::spawn_blocking(move || -> (duckdb::Connection, Result<RowSet>) {
            let start = Instant::now();
            let result = read_rows(&conn, &sql);
            if let Ok(rowset) = &result {
                tracing::debug!(
                    rows = rowset.rows.len(),
                    ms = start.elapsed().as_millis(),
                    "duckdb execute_sql"
                );
            }
            (conn, result)
        })
        .await;

        let (conn, result) =
            joined.map_err(|e| TributaryError::Execution(format!("task join error: {e}")))?;
        pool.lock().await.push(conn);

        if kill.is_killed() {
            return Err(TributaryError::ExecutionKilled);
        }
        result
    }
}

fn read_schema(conn: &duckdb::Connection, table: &str) -> Result<TableSchema> {
    let pragma = format!("PRAGMA table_info('{}')", table.replace('\'', "''"));
    let mut stmt = conn
        .prepare(&pragma)
        .map_err(|e| TributaryError::Execution(format!("prepare pragma: {e}")))?;
    let mut rows = stmt
        .query([])
        .map_err(|e| TributaryError::Execution(format!("query pragma: {e}")))?;
    let mut columns = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| TributaryError::Execution(format!("read pragma row: {e}")))?
    {
        let name: String = row
            .get("name")
            .map_err(|e| TributaryError::Execution(format!("pragma name: {e}")))?;
        let data_type: String = row
            .get("type")
            .map_err(|e| TributaryError::Execution(format!("pragma type: {e}")))?;
        let primary_key: bool = row
            .get("pk")
            .map_err(|e| TributaryError::Execution(format!("pragma pk: {e}")))?;
        columns.push(ColumnSchema {
            name,
            data_type,
            primary_key,
        });
    }
    Ok(TableSchema { columns })
}

fn read_rows(conn: &duckdb::Connection, sql: &str) -> Result<RowSet> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| TributaryError::Execution(format!("prepare: {e}")))?;
    let mut rows_iter = stmt
        .query([])
        .map_err(|e| TributaryError::Execution(format!("query: {e}")))?;

    let stmt_ref = rows_iter
        .as_ref()
        .ok_or_else(|| TributaryError::Execution("statement missing".to_string()))?;
    let columns: Vec<String> = stmt_ref.column_names();

    let mut rows = Vec::new();
    while let Some(row) = rows_iter
        .next()
        .map_err(|e| TributaryError::Execution(format!("read row: {e}")))?
    {
        let mut values = Vec::with_capacity(columns.len());
        for idx in 0..columns.len() {
            let value = row
                .get_ref(idx)
                .map_err(|e| TributaryError::Execution(format!("read value: {e}")))?;
            values.push(duck_value_to_json(value));
        }
        rows.push(values);
    }
    Ok(RowSet { columns, rows })
}

fn duck_value_to_json(value: duckdb::types::ValueRef<'_>) -> Value {
    use duckdb::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Boolean(b) => Value::Bool(b),
        ValueRef::TinyInt(i) => Value::from(i),
        ValueRef::SmallInt(i) => Value::from(i),
        ValueRef::Int(i) => Value::from(i),
        ValueRef::BigInt(i) => Value::from(i),
        ValueRef::UTinyInt(i) => Value::from(i),
        ValueRef::USmallInt(i) => Value::from(i),
        ValueRef::UInt(i) => Value::from(i),
        ValueRef::UBigInt(i) => Value::from(i),
        ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Double(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        other => Value::String(format!("{other:?}")),
    }
}
