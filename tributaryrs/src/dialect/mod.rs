//! SQL dialect abstractions and date-conversion registries.
//!
//! A dialect renders identifiers, literals, and aggregate wrappers, and
//! exposes a registry of conversion fields: derived dimensions (year,
//! month, ...) projected from date columns via dialect-specific formula
//! templates. Criteria against the range-convertible conversion fields are
//! rewritten into SARGable predicates on the underlying column, with
//! boundary literals computed here rather than in SQL.

use chrono::{Duration, Months, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::error::{Result, TributaryError};
use crate::field::Aggregation;
use crate::sql::CriteriaOp;
use crate::types::SqlType;

mod duckdb;
mod postgres;
mod sqlite;

pub use duckdb::DuckDbDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Dialects render identifiers and primitive expression pieces. Expression
/// tree walking lives in the SQL renderer; the dialect only maps logical
/// constructs to SQL fragments.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            Value::Object(_) => format!("'{}'", value.to_string().replace('\'', "''")),
        }
    }

    fn render_ifnull(&self, expr: &str, fallback: &str) -> String {
        format!("IFNULL({expr}, {fallback})")
    }

    fn render_aggregation(&self, agg: Aggregation, expr: &str) -> String {
        match agg {
            Aggregation::Sum => format!("SUM({expr})"),
            Aggregation::Mean => format!("AVG({expr})"),
            Aggregation::Count => format!("COUNT({expr})"),
            Aggregation::CountDistinct => format!("COUNT(DISTINCT {expr})"),
            Aggregation::Min => format!("MIN({expr})"),
            Aggregation::Max => format!("MAX({expr})"),
        }
    }

    /// The conversion fields this dialect can derive from date columns.
    fn conversions(&self) -> &'static [Conversion];
}

/// Units with criteria range rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionUnit {
    Year,
    Month,
    Date,
    Hour,
    Minute,
    Datetime,
}

/// One derivable conversion field.
pub struct Conversion {
    pub name: &'static str,
    pub sa_type: SqlType,
    /// Projection template; `{}` marks the column reference.
    pub template: &'static str,
    /// Requires a time component on the source column.
    pub datetime_only: bool,
    /// Set when criteria against this field rewrite to column ranges.
    pub unit: Option<ConversionUnit>,
}

impl Conversion {
    pub fn render(&self, column_ref: &str) -> String {
        self.template.replace("{}", column_ref)
    }
}

/// Rewrite a criterion against a conversion field into predicates on the
/// underlying column. Returns `None` when the operation has no rewrite, in
/// which case the caller applies the criterion to the projection instead.
pub fn criteria_conversion(
    unit: ConversionUnit,
    op: CriteriaOp,
    values: &[Value],
) -> Result<Option<Vec<(CriteriaOp, Vec<Value>)>>> {
    if values.iter().any(Value::is_null) {
        return Ok(None);
    }

    if unit == ConversionUnit::Datetime {
        // Already column-shaped; pass range-style ops through untouched.
        return Ok(match op {
            CriteriaOp::Eq
            | CriteriaOp::Neq
            | CriteriaOp::Gt
            | CriteriaOp::Gte
            | CriteriaOp::Lt
            | CriteriaOp::Lte
            | CriteriaOp::Between
            | CriteriaOp::NotBetween => Some(vec![(op, values.to_vec())]),
            _ => None,
        });
    }

    let clauses = match op {
        CriteriaOp::Eq => {
            let b = period_bounds(unit, single_value(op, values)?)?;
            vec![
                (CriteriaOp::Gte, vec![Value::String(b.start)]),
                (CriteriaOp::Lt, vec![Value::String(b.next)]),
            ]
        }
        CriteriaOp::Neq => {
            let b = period_bounds(unit, single_value(op, values)?)?;
            vec![(
                CriteriaOp::NotBetween,
                vec![Value::String(b.start), Value::String(b.end)],
            )]
        }
        CriteriaOp::Gt => {
            let b = period_bounds(unit, single_value(op, values)?)?;
            vec![(CriteriaOp::Gte, vec![Value::String(b.next)])]
        }
        CriteriaOp::Gte => {
            let b = period_bounds(unit, single_value(op, values)?)?;
            vec![(CriteriaOp::Gte, vec![Value::String(b.start)])]
        }
        CriteriaOp::Lt => {
            let b = period_bounds(unit, single_value(op, values)?)?;
            vec![(CriteriaOp::Lt, vec![Value::String(b.start)])]
        }
        CriteriaOp::Lte => {
            let b = period_bounds(unit, single_value(op, values)?)?;
            vec![(CriteriaOp::Lt, vec![Value::String(b.next)])]
        }
        CriteriaOp::Between => {
            let (low, high) = pair_values(op, values)?;
            let low = period_bounds(unit, low)?;
            let high = period_bounds(unit, high)?;
            vec![
                (CriteriaOp::Gte, vec![Value::String(low.start)]),
                (CriteriaOp::Lt, vec![Value::String(high.next)]),
            ]
        }
        CriteriaOp::NotBetween => {
            let (low, high) = pair_values(op, values)?;
            let low = period_bounds(unit, low)?;
            let high = period_bounds(unit, high)?;
            vec![(
                CriteriaOp::NotBetween,
                vec![Value::String(low.start), Value::String(high.end)],
            )]
        }
        _ => return Ok(None),
    };
    Ok(Some(clauses))
}

struct PeriodBounds {
    /// Inclusive start of the period.
    start: String,
    /// Exclusive start of the following period.
    next: String,
    /// Inclusive end, for NOT BETWEEN.
    end: String,
}

fn single_value<'v>(op: CriteriaOp, values: &'v [Value]) -> Result<&'v Value> {
    match values {
        [v] => Ok(v),
        _ => Err(TributaryError::Report(format!(
            "converted criterion {op:?} requires a single value"
        ))),
    }
}

fn pair_values<'v>(op: CriteriaOp, values: &'v [Value]) -> Result<(&'v Value, &'v Value)> {
    let items: &[Value] = match values {
        [Value::Array(pair)] => pair,
        other => other,
    };
    match items {
        [low, high] => Ok((low, high)),
        _ => Err(TributaryError::Report(format!(
            "converted criterion {op:?} requires exactly 2 values"
        ))),
    }
}

fn period_bounds(unit: ConversionUnit, value: &Value) -> Result<PeriodBounds> {
    match unit {
        ConversionUnit::Year => {
            let year = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(|| bad_value("year", value))?;
            Ok(PeriodBounds {
                start: format!("{year:04}-01-01"),
                next: format!("{:04}-01-01", year + 1),
                end: format!("{year:04}-12-31 23:59:59"),
            })
        }
        ConversionUnit::Month => {
            let raw = value_str(value).ok_or_else(|| bad_value("month", value))?;
            let start = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d")
                .map_err(|_| bad_value("month", value))?;
            let next = start
                .checked_add_months(Months::new(1))
                .ok_or_else(|| bad_value("month", value))?;
            Ok(PeriodBounds {
                start: start.format("%Y-%m-%d").to_string(),
                next: next.format("%Y-%m-%d").to_string(),
                end: period_end(next),
            })
        }
        ConversionUnit::Date => {
            let raw = value_str(value).ok_or_else(|| bad_value("date", value))?;
            let start = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| bad_value("date", value))?;
            let next = start + Duration::days(1);
            Ok(PeriodBounds {
                start: start.format("%Y-%m-%d").to_string(),
                next: next.format("%Y-%m-%d").to_string(),
                end: period_end(next),
            })
        }
        ConversionUnit::Hour | ConversionUnit::Minute => {
            let raw = value_str(value).ok_or_else(|| bad_value("datetime", value))?;
            let start = parse_datetime(raw).ok_or_else(|| bad_value("datetime", value))?;
            let step = if unit == ConversionUnit::Hour {
                Duration::hours(1)
            } else {
                Duration::minutes(1)
            };
            let next = start + step;
            Ok(PeriodBounds {
                start: start.format("%Y-%m-%d %H:%M:%S").to_string(),
                next: next.format("%Y-%m-%d %H:%M:%S").to_string(),
                end: (next - Duration::seconds(1))
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
            })
        }
        ConversionUnit::Datetime => unreachable!("datetime criteria pass through"),
    }
}

/// Last second of the day preceding `next_start`.
fn period_end(next_start: NaiveDate) -> String {
    let end = next_start
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        - Duration::seconds(1);
    end.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn value_str(value: &Value) -> Option<&str> {
    value.as_str()
}

fn bad_value(kind: &str, value: &Value) -> TributaryError {
    TributaryError::Report(format!("invalid {kind} criterion value: {value}"))
}
