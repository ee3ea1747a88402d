//! Semantic SQL types for fields and combined-result columns.
//!
//! Field configs declare types as strings ("integer", "string(32)",
//! "decimal(10,2)"); backend schema introspection reports declared column
//! types in whatever spelling the database uses. Both funnel into
//! [`SqlType`], which drives numeric/date classification and the column
//! definitions of the combined-result table.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TributaryError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlType {
    SmallInt,
    Integer,
    BigInt,
    Float,
    Double,
    Decimal {
        precision: Option<u32>,
        scale: Option<u32>,
    },
    Boolean,
    VarChar(Option<u32>),
    Text,
    Date,
    DateTime,
    Time,
}

impl SqlType {
    /// Parse a type string from a field config or a backend's declared
    /// column type. Unknown spellings fall back to `Text`, matching how
    /// loosely typed backends report affinities.
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (name, args) = match trimmed.split_once('(') {
            Some((name, rest)) => {
                let inner = rest.trim_end_matches(')');
                let args: Vec<Option<u32>> = inner
                    .split(',')
                    .map(|a| a.trim().parse::<u32>().ok())
                    .collect();
                (name.trim(), args)
            }
            None => (trimmed, Vec::new()),
        };

        let ty = match name.to_ascii_lowercase().as_str() {
            "smallint" | "tinyint" => SqlType::SmallInt,
            "int" | "integer" | "mediumint" => SqlType::Integer,
            "bigint" => SqlType::BigInt,
            "float" | "real" => SqlType::Float,
            "double" | "double precision" => SqlType::Double,
            "decimal" | "numeric" | "money" => SqlType::Decimal {
                precision: args.first().copied().flatten(),
                scale: args.get(1).copied().flatten(),
            },
            "bool" | "boolean" => SqlType::Boolean,
            "string" | "varchar" | "char" | "character" | "character varying" | "nvarchar" => {
                SqlType::VarChar(args.first().copied().flatten())
            }
            "text" | "clob" | "blob" => SqlType::Text,
            "date" => SqlType::Date,
            "datetime" | "timestamp" | "timestamptz" | "timestamp with time zone"
            | "timestamp without time zone" => SqlType::DateTime,
            "time" => SqlType::Time,
            "" => {
                return Err(TributaryError::Config(format!(
                    "empty type string: {s:?}"
                )))
            }
            _ => SqlType::Text,
        };
        Ok(ty)
    }

    /// Render as a SQLite column type for the combined-result table.
    pub fn to_sqlite(&self) -> String {
        match self {
            SqlType::SmallInt => "SMALLINT".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Float => "FLOAT".to_string(),
            SqlType::Double => "DOUBLE".to_string(),
            SqlType::Decimal { precision, scale } => match (precision, scale) {
                (Some(p), Some(s)) => format!("DECIMAL({p}, {s})"),
                (Some(p), None) => format!("DECIMAL({p})"),
                _ => "NUMERIC".to_string(),
            },
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::VarChar(Some(n)) => format!("VARCHAR({n})"),
            SqlType::VarChar(None) => "VARCHAR".to_string(),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::DateTime => "DATETIME".to_string(),
            SqlType::Time => "TIME".to_string(),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, SqlType::SmallInt | SqlType::Integer | SqlType::BigInt)
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integer()
            || matches!(
                self,
                SqlType::Float | SqlType::Double | SqlType::Decimal { .. }
            )
    }

    /// Date or datetime column, eligible for conversion fields.
    pub fn is_datelike(&self) -> bool {
        matches!(self, SqlType::Date | SqlType::DateTime)
    }

    /// Carries a time component, eligible for hour/minute conversions.
    pub fn is_datetime(&self) -> bool {
        matches!(self, SqlType::DateTime)
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlType::SmallInt => write!(f, "smallint"),
            SqlType::Integer => write!(f, "integer"),
            SqlType::BigInt => write!(f, "bigint"),
            SqlType::Float => write!(f, "float"),
            SqlType::Double => write!(f, "double"),
            SqlType::Decimal { precision, scale } => match (precision, scale) {
                (Some(p), Some(s)) => write!(f, "decimal({p},{s})"),
                (Some(p), None) => write!(f, "decimal({p})"),
                _ => write!(f, "decimal"),
            },
            SqlType::Boolean => write!(f, "boolean"),
            SqlType::VarChar(Some(n)) => write!(f, "string({n})"),
            SqlType::VarChar(None) => write!(f, "string"),
            SqlType::Text => write!(f, "text"),
            SqlType::Date => write!(f, "date"),
            SqlType::DateTime => write!(f, "datetime"),
            SqlType::Time => write!(f, "time"),
        }
    }
}

impl Serialize for SqlType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SqlType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SqlType::parse(&s).map_err(de::Error::custom)
    }
}
