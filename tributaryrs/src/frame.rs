//! The dimension-indexed tabular result.
//!
//! A [`ReportFrame`] is an ordered collection of rows keyed by a tuple of
//! dimension values, with one value column per metric. Post-processing
//! (row filters, technicals, rollup, rounding, ordering, pivot) operates
//! on this structure after the combined-result select.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TributaryError};

/// Highest code point; sorts after any legal dimension value so rollup
/// rows land under their group. The presentation layer may substitute
/// [`ROLLUP_PRETTY_LABEL`].
pub const ROLLUP_SENTINEL: &str = "\u{10FFFF}";
pub const ROLLUP_PRETTY_LABEL: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowFilterOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
}

#[derive(Debug, Clone, Default)]
pub struct FrameRow {
    pub index: Vec<Value>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ReportFrame {
    pub index_names: Vec<String>,
    pub columns: Vec<String>,
    pub rows: Vec<FrameRow>,
}

impl ReportFrame {
    pub fn new(index_names: Vec<String>, columns: Vec<String>) -> Self {
        Self {
            index_names,
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push_row(&mut self, index: Vec<Value>, values: Vec<Value>) {
        debug_assert_eq!(index.len(), self.index_names.len());
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(FrameRow { index, values });
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn index_position(&self, name: &str) -> Option<usize> {
        self.index_names.iter().position(|c| c == name)
    }

    /// Look up a cell by full index tuple and column name.
    pub fn value(&self, index: &[Value], column: &str) -> Option<&Value> {
        let col = self.column_position(column)?;
        self.rows
            .iter()
            .find(|row| row.index == index)
            .map(|row| &row.values[col])
    }

    /// Convenience lookup with string index labels.
    pub fn value_at(&self, labels: &[&str], column: &str) -> Option<&Value> {
        let index: Vec<Value> = labels.iter().map(|l| Value::String(l.to_string())).collect();
        self.value(&index, column)
    }

    pub fn column_f64(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let col = self.column_position(name)?;
        Some(self.rows.iter().map(|row| value_f64(&row.values[col])).collect())
    }

    pub fn set_column_f64(&mut self, name: &str, values: &[Option<f64>]) -> Result<()> {
        let col = self
            .column_position(name)
            .ok_or_else(|| TributaryError::Report(format!("unknown column: {name}")))?;
        if values.len() != self.rows.len() {
            return Err(TributaryError::Report(format!(
                "column {name} length mismatch"
            )));
        }
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.values[col] = f64_value(*value);
        }
        Ok(())
    }

    /// Insert a new column directly after an existing one.
    pub fn insert_column_after(
        &mut self,
        after: &str,
        name: &str,
        values: &[Option<f64>],
    ) -> Result<()> {
        let position = self
            .column_position(after)
            .ok_or_else(|| TributaryError::Report(format!("unknown column: {after}")))?
            + 1;
        self.columns.insert(position, name.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.values.insert(position, f64_value(*value));
        }
        Ok(())
    }

    pub fn drop_column(&mut self, name: &str) {
        if let Some(position) = self.column_position(name) {
            self.columns.remove(position);
            for row in &mut self.rows {
                row.values.remove(position);
            }
        }
    }

    pub fn round_column(&mut self, name: &str, digits: u32) {
        let Some(col) = self.column_position(name) else {
            return;
        };
        let factor = 10f64.powi(digits as i32);
        for row in &mut self.rows {
            if let Some(x) = value_f64(&row.values[col]) {
                row.values[col] = f64_value(Some((x * factor).round() / factor));
            }
        }
    }

    /// Apply row filters; each filter must name a known column or index
    /// level.
    pub fn apply_row_filters(&mut self, filters: &[(String, RowFilterOp, Value)]) -> Result<()> {
        for (field, op, value) in filters {
            let column = self.column_position(field);
            let index = self.index_position(field);
            if column.is_none() && index.is_none() {
                return Err(TributaryError::Report(format!(
                    "row filter field {field} is not in the result table"
                )));
            }
            self.rows.retain(|row| {
                let cell = match column {
                    Some(c) => &row.values[c],
                    None => &row.index[index.expect("index checked above")],
                };
                row_filter_matches(cell, *op, value)
            });
        }
        Ok(())
    }

    /// Sort rows by their index tuple ascending. The rollup sentinel
    /// sorts after any legal value.
    pub fn sort_by_index(&mut self) {
        self.rows
            .sort_by(|a, b| index_cmp(&a.index, &b.index));
    }

    /// Sort by explicit (field, direction) pairs naming columns or index
    /// levels.
    pub fn sort_by(&mut self, order: &[(String, SortDirection)]) -> Result<()> {
        let mut keys = Vec::new();
        for (field, direction) in order {
            if let Some(col) = self.column_position(field) {
                keys.push((false, col, *direction));
            } else if let Some(idx) = self.index_position(field) {
                keys.push((true, idx, *direction));
            } else {
                return Err(TributaryError::Report(format!(
                    "order_by field {field} is not in the result table"
                )));
            }
        }
        self.rows.sort_by(|a, b| {
            for (is_index, position, direction) in &keys {
                let (left, right) = if *is_index {
                    (&a.index[*position], &b.index[*position])
                } else {
                    (&a.values[*position], &b.values[*position])
                };
                let mut ordering = value_cmp(left, right);
                if *direction == SortDirection::Desc {
                    ordering = ordering.reverse();
                }
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
        Ok(())
    }

    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    pub fn is_rollup_row(row: &FrameRow) -> bool {
        row.index
            .iter()
            .any(|v| matches!(v, Value::String(s) if s == ROLLUP_SENTINEL))
    }

    pub fn rollup_rows(&self) -> ReportFrame {
        self.filtered(Self::is_rollup_row)
    }

    pub fn non_rollup_rows(&self) -> ReportFrame {
        self.filtered(|row| !Self::is_rollup_row(row))
    }

    fn filtered(&self, keep: impl Fn(&FrameRow) -> bool) -> ReportFrame {
        ReportFrame {
            index_names: self.index_names.clone(),
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }

    /// A copy with rollup sentinels replaced by the pretty label.
    pub fn display(&self) -> ReportFrame {
        let mut frame = self.clone();
        for row in &mut frame.rows {
            for value in &mut row.index {
                if matches!(value, Value::String(s) if s == ROLLUP_SENTINEL) {
                    *value = Value::String(ROLLUP_PRETTY_LABEL.to_string());
                }
            }
        }
        frame
    }

    /// Unstack the given index levels into columns. Each metric column
    /// fans out into one column per distinct pivot tuple, labeled
    /// `metric:pivot-value`.
    pub fn pivot(&self, levels: &[String]) -> Result<ReportFrame> {
        let mut pivot_positions = Vec::new();
        for level in levels {
            let position = self.index_position(level).ok_or_else(|| {
                TributaryError::Report(format!("pivot level {level} is not an index level"))
            })?;
            pivot_positions.push(position);
        }
        let kept_positions: Vec<usize> = (0..self.index_names.len())
            .filter(|i| !pivot_positions.contains(i))
            .collect();

        // Distinct pivot tuples in first-appearance order.
        let mut pivot_tuples: Vec<Vec<Value>> = Vec::new();
        for row in &self.rows {
            let tuple: Vec<Value> = pivot_positions.iter().map(|&i| row.index[i].clone()).collect();
            if !pivot_tuples.contains(&tuple) {
                pivot_tuples.push(tuple);
            }
        }

        let mut columns = Vec::new();
        for metric in &self.columns {
            for tuple in &pivot_tuples {
                let label: Vec<String> = tuple.iter().map(value_label).collect();
                columns.push(format!("{metric}:{}", label.join(",")));
            }
        }

        let index_names: Vec<String> = kept_positions
            .iter()
            .map(|&i| self.index_names[i].clone())
            .collect();
        let mut out = ReportFrame::new(index_names, columns);

        // Group rows by the kept index tuple, preserving order.
        let mut groups: Vec<(Vec<Value>, BTreeMap<usize, &FrameRow>)> = Vec::new();
        for row in &self.rows {
            let key: Vec<Value> = kept_positions.iter().map(|&i| row.index[i].clone()).collect();
            let tuple: Vec<Value> = pivot_positions.iter().map(|&i| row.index[i].clone()).collect();
            let tuple_idx = pivot_tuples
                .iter()
                .position(|t| *t == tuple)
                .expect("tuple recorded above");
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, cells)) => {
                    cells.insert(tuple_idx, row);
                }
                None => {
                    let mut cells = BTreeMap::new();
                    cells.insert(tuple_idx, row);
                    groups.push((key, cells));
                }
            }
        }

        for (key, cells) in groups {
            let mut values = Vec::new();
            for (metric_idx, _) in self.columns.iter().enumerate() {
                for tuple_idx in 0..pivot_tuples.len() {
                    let cell = cells
                        .get(&tuple_idx)
                        .map(|row| row.values[metric_idx].clone())
                        .unwrap_or(Value::Null);
                    values.push(cell);
                }
            }
            out.push_row(key, values);
        }
        Ok(out)
    }
}

fn row_filter_matches(cell: &Value, op: RowFilterOp, value: &Value) -> bool {
    match op {
        RowFilterOp::Eq => value_cmp(cell, value) == Ordering::Equal,
        RowFilterOp::Neq => value_cmp(cell, value) != Ordering::Equal,
        RowFilterOp::Gt => !cell.is_null() && value_cmp(cell, value) == Ordering::Greater,
        RowFilterOp::Gte => !cell.is_null() && value_cmp(cell, value) != Ordering::Less,
        RowFilterOp::Lt => !cell.is_null() && value_cmp(cell, value) == Ordering::Less,
        RowFilterOp::Lte => !cell.is_null() && value_cmp(cell, value) != Ordering::Greater,
        RowFilterOp::In => match value {
            Value::Array(items) => items.iter().any(|v| value_cmp(cell, v) == Ordering::Equal),
            single => value_cmp(cell, single) == Ordering::Equal,
        },
        RowFilterOp::NotIn => match value {
            Value::Array(items) => items.iter().all(|v| value_cmp(cell, v) != Ordering::Equal),
            single => value_cmp(cell, single) != Ordering::Equal,
        },
    }
}

/// Total order over cell values: null < bool < number < string. Numbers
/// compare numerically across int/float representations.
pub fn value_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Bool(_), _) => Ordering::Less,
        (_, Value::Bool(_)) => Ordering::Greater,
        (Value::Number(_), Value::Number(_)) => {
            let x = value_f64(a).unwrap_or(f64::NAN);
            let y = value_f64(b).unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::String(_), _) => Ordering::Less,
        (_, Value::String(_)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

pub fn index_cmp(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ordering = value_cmp(x, y);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.len().cmp(&b.len())
}

pub fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(*b as u8 as f64),
        _ => None,
    }
}

pub fn f64_value(value: Option<f64>) -> Value {
    match value {
        Some(x) => {
            if x.fract() == 0.0 && x.is_finite() && x.abs() < (i64::MAX as f64) {
                Value::from(x as i64)
            } else {
                serde_json::Number::from_f64(x)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        None => Value::Null,
    }
}

fn value_label(value: &Value) -> String {
    match value {
        Value::String(s) if s == ROLLUP_SENTINEL => ROLLUP_PRETTY_LABEL.to_string(),
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
