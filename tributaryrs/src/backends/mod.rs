//! Database backend implementations.
//!
//! Each backend owns a connection pool for one datasource and is shared
//! across concurrent reports. Optional backends are gated behind feature
//! flags; SQLite is always available because the combined-result store
//! rides on the same driver.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{Result, TributaryError};
use crate::executor::KillSwitch;

/// A positional rowset. The merge into the combined table hashes the
/// leading dimension columns, so column order is significant.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Introspected table schema.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub columns: Vec<ColumnSchema>,
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: String,
    pub primary_key: bool,
}

/// Unified interface for all database backends.
#[async_trait]
pub trait BackendConnection: Send + Sync {
    fn dialect(&self) -> &dyn Dialect;

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema>;

    /// Execute SQL, registering a native cancel handle on the kill switch
    /// for the duration of the query where the backend supports one.
    async fn execute_sql(&self, sql: &str, kill: &KillSwitch) -> Result<RowSet>;
}

/// Build a backend from a connection string.
///
/// Supported schemes: `sqlite:///path` (or a bare filesystem path),
/// `postgresql://...` with the `postgres` feature, `duckdb:///path` with
/// the `duckdb` feature.
pub fn connect(url: &str) -> Result<Arc<dyn BackendConnection>> {
    if let Some(path) = url.strip_prefix("sqlite://") {
        return Ok(Arc::new(sqlite::SqliteConnection::new(path)?));
    }

    if url.starts_with("postgresql://") || url.starts_with("postgres://") {
        #[cfg(feature = "postgres")]
        {
            return Ok(Arc::new(postgres::PostgresConnection::new(url, "public")?));
        }
        #[cfg(not(feature = "postgres"))]
        {
            return Err(TributaryError::Config(format!(
                "connection string {url:?} requires the postgres feature"
            )));
        }
    }

    if let Some(_path) = url.strip_prefix("duckdb://") {
        #[cfg(feature = "duckdb")]
        {
            return Ok(Arc::new(duckdb::DuckDbConnection::new(_path)));
        }
        #[cfg(not(feature = "duckdb"))]
        {
            return Err(TributaryError::Config(format!(
                "connection string {url:?} requires the duckdb feature"
            )));
        }
    }

    if url.contains("://") {
        return Err(TributaryError::Config(format!(
            "unsupported connection string: {url}"
        )));
    }

    // A bare path is a SQLite database file.
    Ok(Arc::new(sqlite::SqliteConnection::new(url)?))
}

mod sqlite;
pub use sqlite::SqliteConnection;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresConnection;

#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbConnection;
