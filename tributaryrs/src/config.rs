//! Configuration structures.
//!
//! Warehouse and datasource metadata arrive as serde-deserialized YAML or
//! JSON (see `WarehouseConfig`); engine behavior (query mode, timeout,
//! worker count) is a TOML-loadable `EngineConfig` threaded through as an
//! explicit value. There is no process-wide mutable configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, TributaryError};
use crate::executor::QueryMode;
use crate::field::Aggregation;
use crate::types::SqlType;

/// Tables are either metric tables (facts) or dimension tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Metric,
    Dimension,
}

/// Top-level warehouse config: global field definitions plus datasources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarehouseConfig {
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub datasources: BTreeMap<String, DataSourceConfig>,
    /// Ordered datasource names establishing query priority. Defaults to
    /// the datasource iteration order.
    #[serde(default)]
    pub ds_priority: Option<Vec<String>>,
}

impl WarehouseConfig {
    /// Load from a YAML or JSON file, chosen by extension.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(serde_json::from_str(&raw)?),
            _ => Ok(serde_yaml::from_str(&raw)?),
        }
    }
}

/// One datasource: a connection string plus field and table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSourceConfig {
    /// Connection string, e.g. `sqlite:///path/to.db` or
    /// `postgresql://user@host/db`.
    pub connect: String,
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
    #[serde(default)]
    pub dimensions: Vec<DimensionConfig>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableConfig>,
}

/// Per-table annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    #[serde(rename = "type")]
    pub table_type: TableType,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Field names forming the table's primary key. All must be dimensions
    /// present on the table.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Full name of an ancestor table within the same datasource.
    #[serde(default)]
    pub parent: Option<String>,
    /// Infer fields from unannotated columns.
    #[serde(default)]
    pub create_fields: bool,
    /// Name inferred fields `table_column` instead of `column`.
    #[serde(default)]
    pub use_full_column_names: bool,
    /// Dimensions on this table that must not be used as join keys.
    #[serde(default)]
    pub incomplete_dimensions: Vec<String>,
    #[serde(default)]
    pub columns: BTreeMap<String, ColumnConfig>,
}

/// Per-column annotations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    /// Fields this column provides, each optionally bound to a dialect
    /// formula fragment.
    #[serde(default)]
    pub fields: Vec<ColumnFieldConfig>,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Add dialect date-conversion fields (year, month, ...) for this
    /// column.
    #[serde(default)]
    pub allow_type_conversions: bool,
    /// Prefix for generated conversion field names, e.g. `campaign_`.
    #[serde(default)]
    pub type_conversion_prefix: Option<String>,
    /// Dimensions that must be present in any report using this column.
    #[serde(default)]
    pub required_grain: Vec<String>,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            active: true,
            allow_type_conversions: false,
            type_conversion_prefix: None,
            required_grain: Vec::new(),
        }
    }
}

/// A column-to-field binding: either a bare field name or a name plus a
/// `ds_formula` evaluated in the datasource's dialect. `{}` in the formula
/// is replaced with the qualified column reference.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnFieldConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ds_formula: Option<String>,
}

impl<'de> Deserialize<'de> for ColumnFieldConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(name) => Ok(ColumnFieldConfig {
                name,
                ds_formula: None,
            }),
            other => {
                #[derive(Deserialize)]
                #[serde(deny_unknown_fields)]
                struct Full {
                    name: String,
                    #[serde(default)]
                    ds_formula: Option<String>,
                }
                let full = Full::deserialize(other).map_err(de::Error::custom)?;
                Ok(ColumnFieldConfig {
                    name: full.name,
                    ds_formula: full.ds_formula,
                })
            }
        }
    }
}

/// Metric definition. Plain metrics bind a type and aggregation; formula
/// metrics reference other fields with `{name}` templates and carry no
/// direct column binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub sa_type: Option<SqlType>,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default)]
    pub rounding: Option<u32>,
    #[serde(default)]
    pub weighting_metric: Option<String>,
    /// Technical string, e.g. `mean(5,1):group`.
    #[serde(default)]
    pub technical: Option<String>,
    #[serde(default)]
    pub formula: Option<String>,
    #[serde(default)]
    pub required_grain: Vec<String>,
}

/// Dimension definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimensionConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub sa_type: SqlType,
    /// Post-merge formula for combined-layer dimensions.
    #[serde(default)]
    pub formula: Option<String>,
}

/// Engine settings, independent of warehouse metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub query_mode: QueryMode,
    /// Global deadline for a report's datasource fan-out, in milliseconds.
    /// `None` disables the deadline.
    pub query_timeout_ms: Option<u64>,
    /// Bounded worker count for parallel mode.
    pub query_workers: usize,
    /// Rows per batch when loading the combined-result table.
    pub load_chunk_size: usize,
    /// Fallback value substituted for NULL dimension values.
    pub ifnull_value: String,
    /// Maximum join-path length explored by the graph search.
    pub max_join_path_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            query_mode: QueryMode::Sequential,
            query_timeout_ms: None,
            query_workers: 4,
            load_chunk_size: 5000,
            ifnull_value: "--".to_string(),
            max_join_path_length: 10,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.query_workers == 0 {
            return Err(TributaryError::Config(
                "query_workers must be at least 1".to_string(),
            ));
        }
        if self.load_chunk_size == 0 {
            return Err(TributaryError::Config(
                "load_chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
