use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TributaryError>;

#[derive(Debug, Error)]
pub enum TributaryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("unsupported grain: {0}")]
    UnsupportedGrain(String),
    #[error("max formula depth exceeded: {0}")]
    MaxFormulaDepth(String),
    #[error("datasource query timeout after {0:?}")]
    QueryTimeout(Duration),
    #[error("execution killed")]
    ExecutionKilled,
    #[error("disallowed sql: {0}")]
    DisallowedSql(String),
    #[error("warehouse integrity check(s) failed:\n{0}")]
    WarehouseIntegrity(String),
    #[error("report error: {0}")]
    Report(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
