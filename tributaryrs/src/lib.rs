//! Federated analytical reporting engine.
//!
//! A [`Warehouse`] federates declarative report requests over annotated
//! SQL datasources: the planner decomposes a request into per-datasource
//! queries over each source's join graph, the executor fans them out with
//! timeout and cooperative kill, and the combined-result engine merges
//! the rowsets by dimension key before post-aggregation (formulas,
//! rollups, technicals, pivot).

pub mod backends;
pub mod config;
pub mod datasource;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod field;
pub mod frame;
pub mod graph;
pub mod model;
pub mod report;
mod result;
pub mod sql;
pub mod technical;
pub mod types;
pub mod warehouse;

use std::path::Path;

pub use backends::{BackendConnection, RowSet, SqliteConnection};
#[cfg(feature = "duckdb")]
pub use backends::DuckDbConnection;
#[cfg(feature = "postgres")]
pub use backends::PostgresConnection;
pub use config::{
    ColumnConfig, DataSourceConfig, DimensionConfig, EngineConfig, MetricConfig, TableConfig,
    TableType, WarehouseConfig,
};
pub use datasource::{AdHocDataSource, AdHocDataTable, DataSource, TableSet};
pub use dialect::{Dialect, DuckDbDialect, PostgresDialect, SqliteDialect};
pub use error::{Result, TributaryError};
pub use executor::{KillSwitch, QueryMode};
pub use field::{Aggregation, Dimension, Field, FieldManager, Metric};
pub use frame::{ReportFrame, RowFilterOp, SortDirection, ROLLUP_PRETTY_LABEL, ROLLUP_SENTINEL};
pub use model::MetadataStore;
pub use report::{
    AdHocMetricSpec, Criterion, MetricSpec, OrderBy, Report, ReportRequest, ReportResult,
    RowFilter, Rollup,
};
pub use sql::CriteriaOp;
pub use technical::{Technical, TechnicalMode, TechnicalType};
pub use types::SqlType;
pub use warehouse::Warehouse;

/// Load a warehouse config from disk and build it with the given engine
/// settings.
pub async fn load_warehouse<P: AsRef<Path>>(
    config_path: P,
    engine: EngineConfig,
) -> Result<Warehouse> {
    Warehouse::from_config_path(config_path, engine).await
}
