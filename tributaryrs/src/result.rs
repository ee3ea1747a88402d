//! The combined result: an in-memory SQLite merge table plus the
//! post-aggregation pipeline.
//!
//! Per-datasource rowsets merge by a hash of the primary dimension tuple
//! via `INSERT ... ON CONFLICT(hash) DO UPDATE SET`, so rowsets sharing a
//! dimension key populate the union of metric columns regardless of load
//! order. The final select projects formula fields over the merged
//! columns; everything after that (row filters, technicals, rollup,
//! rounding, ordering, pivot) runs on the in-memory frame.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::backends::RowSet;
use crate::datasource::json_to_sqlite_value;
use crate::error::{Result, TributaryError};
use crate::field::{expand_formula, Aggregation, Dimension, FieldManager, Metric};
use crate::frame::{value_f64, FrameRow, ReportFrame, ROLLUP_SENTINEL};
use crate::report::{OrderBy, RowFilter, Rollup};
use crate::technical::{Technical, TechnicalMode, TechnicalOutput};

static TABLE_COUNTER: AtomicU64 = AtomicU64::new(0);

pub(crate) struct CombinedResult {
    conn: rusqlite::Connection,
    table_name: String,
    primary_dimensions: Vec<String>,
    chunk_size: usize,
}

impl CombinedResult {
    /// Create the uniquely named merge table: `hash` primary key, one
    /// NOT NULL column per dimension, one NULL-default column per metric,
    /// and a secondary index on the primary dimensions.
    pub fn create(
        dimensions: Vec<(String, Arc<Dimension>)>,
        metrics: Vec<(String, Arc<Metric>)>,
        primary_dimensions: Vec<String>,
        chunk_size: usize,
    ) -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let table_name = format!(
            "tributary_{nanos}_{}",
            TABLE_COUNTER.fetch_add(1, Ordering::SeqCst)
        );

        let mut column_clauses = vec!["hash BIGINT NOT NULL PRIMARY KEY".to_string()];
        for (name, dim) in &dimensions {
            column_clauses.push(format!(
                "{} {} NOT NULL",
                quote(name),
                dim.sa_type.to_sqlite()
            ));
        }
        for (name, metric) in &metrics {
            let sa_type = metric
                .sa_type
                .as_ref()
                .map(|t| t.to_sqlite())
                .unwrap_or_else(|| "NUMERIC".to_string());
            column_clauses.push(format!("{} {} DEFAULT NULL", quote(name), sa_type));
        }

        let create_sql = format!(
            "CREATE TEMP TABLE {table_name} ({}) WITHOUT ROWID",
            column_clauses.join(", ")
        );
        tracing::debug!(sql = %create_sql, "creating combined-result table");
        conn.execute_batch(&create_sql)?;

        if !primary_dimensions.is_empty() {
            let index_sql = format!(
                "CREATE INDEX idx_dims ON {table_name} ({})",
                primary_dimensions
                    .iter()
                    .map(|d| quote(d))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            conn.execute_batch(&index_sql)?;
        }

        Ok(Self {
            conn,
            table_name,
            primary_dimensions,
            chunk_size: chunk_size.max(1),
        })
    }

    /// Merge each rowset into the table. Rows hash over the primary
    /// dimension values; conflicting hashes update the non-key columns,
    /// which is how metric columns from different datasources land in one
    /// row.
    pub fn load<'a>(&self, rowsets: impl Iterator<Item = &'a RowSet>) -> Result<()> {
        for rowset in rowsets {
            if rowset.rows.is_empty() {
                continue;
            }
            let key_positions: Vec<usize> = self
                .primary_dimensions
                .iter()
                .map(|dim| {
                    rowset.columns.iter().position(|c| c == dim).ok_or_else(|| {
                        TributaryError::Execution(format!(
                            "rowset missing primary dimension column {dim}"
                        ))
                    })
                })
                .collect::<Result<_>>()?;

            let column_list: Vec<String> = rowset.columns.iter().map(|c| quote(c)).collect();
            let placeholders: Vec<String> =
                (0..=rowset.columns.len()).map(|_| "?".to_string()).collect();
            let update_clauses: Vec<String> = rowset
                .columns
                .iter()
                .filter(|c| !self.primary_dimensions.contains(*c))
                .map(|c| format!("{} = excluded.{}", quote(c), quote(c)))
                .collect();
            let conflict_clause = if update_clauses.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", update_clauses.join(", "))
            };
            let insert_sql = format!(
                "INSERT INTO {} (hash, {}) VALUES ({}) ON CONFLICT(hash) {}",
                self.table_name,
                column_list.join(", "),
                placeholders.join(", "),
                conflict_clause
            );

            for chunk in rowset.rows.chunks(self.chunk_size) {
                let tx = self.conn.unchecked_transaction()?;
                {
                    let mut stmt = tx.prepare_cached(&insert_sql)?;
                    for row in chunk {
                        let mut params = Vec::with_capacity(row.len() + 1);
                        params.push(rusqlite::types::Value::Integer(row_hash(
                            row,
                            &key_positions,
                        )));
                        params.extend(row.iter().map(json_to_sqlite_value));
                        stmt.execute(rusqlite::params_from_iter(params))?;
                    }
                }
                tx.commit()?;
            }
            tracing::debug!(
                rows = rowset.rows.len(),
                table = %self.table_name,
                "rowset merged into combined table"
            );
        }
        Ok(())
    }

    /// Run the final select: dimensions (through post-merge formulas where
    /// declared), requested metrics with formula expansion, plus hidden
    /// weighting-metric columns needed by rollup. Grouping by hash is a
    /// logical no-op preserving the per-row grain; ordering is by the
    /// dimension columns ascending.
    pub fn final_frame(
        &self,
        scope: &dyn FieldManager,
        display_dimensions: &[String],
        display_metrics: &[String],
    ) -> Result<ReportFrame> {
        let mut projections: Vec<String> = Vec::new();
        let mut dimension_aliases: Vec<String> = Vec::new();

        for name in display_dimensions {
            let dim = scope.get_dimension(name)?;
            let expr = match &dim.formula {
                Some(formula) => self.expand_to_columns(scope, name, formula)?,
                None => quote(name),
            };
            projections.push(format!("{expr} AS {}", quote(name)));
            dimension_aliases.push(name.clone());
        }

        let mut value_columns: Vec<String> = Vec::new();
        for name in display_metrics {
            let metric = scope.get_metric(name)?;
            let expr = match &metric.formula {
                Some(formula) => self.expand_to_columns(scope, name, formula)?,
                None => quote(name),
            };
            projections.push(format!("{expr} AS {}", quote(name)));
            value_columns.push(name.clone());
        }

        // Weighting metrics ride along for rollup recomputation and are
        // dropped before the frame is returned to the caller.
        for name in display_metrics {
            let metric = scope.get_metric(name)?;
            if let Some(weighting) = &metric.weighting_metric {
                if !value_columns.iter().any(|c| c == weighting) {
                    projections.push(format!("{} AS {}", quote(weighting), quote(weighting)));
                    value_columns.push(weighting.clone());
                }
            }
        }

        let order_clause = if dimension_aliases.is_empty() {
            "1".to_string()
        } else {
            dimension_aliases
                .iter()
                .map(|d| format!("{} ASC", quote(d)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sql = format!(
            "SELECT {} FROM {} GROUP BY hash ORDER BY {}",
            projections.join(", "),
            self.table_name,
            order_clause
        );
        tracing::debug!(sql = %sql, "combined-result final select");

        let mut stmt = self.conn.prepare(&sql)?;
        let column_count = dimension_aliases.len() + value_columns.len();
        let mut rows_iter = stmt.query([])?;
        let mut frame = ReportFrame::new(dimension_aliases.clone(), value_columns);
        while let Some(row) = rows_iter.next()? {
            let mut cells = Vec::with_capacity(column_count);
            for idx in 0..column_count {
                cells.push(sqlite_cell(row.get_ref(idx)?));
            }
            let values = cells.split_off(dimension_aliases.len());
            frame.push_row(cells, values);
        }
        Ok(frame)
    }

    /// Expand a formula field into a SQL expression over sibling columns
    /// of the combined table.
    fn expand_to_columns(
        &self,
        scope: &dyn FieldManager,
        name: &str,
        formula: &str,
    ) -> Result<String> {
        let (leaves, expanded) = expand_formula(scope, name, formula)?;
        let mut rendered = expanded;
        for leaf in leaves {
            rendered = rendered.replace(&format!("{{{leaf}}}"), &quote(&leaf));
        }
        Ok(format!("({rendered})"))
    }

    #[cfg(test)]
    fn table_exists(&self) -> bool {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE type = 'table' AND name = ?",
                [&self.table_name],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .unwrap_or(false)
    }
}

impl Drop for CombinedResult {
    fn drop(&mut self) {
        let drop_sql = format!("DROP TABLE IF EXISTS {}", self.table_name);
        if let Err(e) = self.conn.execute_batch(&drop_sql) {
            tracing::warn!(error = %e, table = %self.table_name, "failed to drop combined table");
        }
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Hash the primary dimension values of one row. Whole floats hash like
/// their integer value so keys merge across backends that disagree about
/// numeric affinity.
fn row_hash(row: &[Value], key_positions: &[usize]) -> i64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for &position in key_positions {
        match &row[position] {
            Value::Null => 0u8.hash(&mut hasher),
            Value::Bool(b) => (1u8, b).hash(&mut hasher),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    (2u8, i).hash(&mut hasher);
                } else {
                    let f = n.as_f64().unwrap_or(0.0);
                    if f.fract() == 0.0 && f.is_finite() && f.abs() < (i64::MAX as f64) {
                        (2u8, f as i64).hash(&mut hasher);
                    } else {
                        (3u8, f.to_bits()).hash(&mut hasher);
                    }
                }
            }
            Value::String(s) => (4u8, s).hash(&mut hasher),
            other => (5u8, other.to_string()).hash(&mut hasher),
        }
    }
    hasher.finish() as i64
}

fn sqlite_cell(value: rusqlite::types::ValueRef<'_>) -> Value {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        // Whole reals normalize to integers so values merge and compare
        // consistently across backends with different numeric affinities.
        ValueRef::Real(f) => crate::frame::f64_value(Some(f)),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

pub(crate) struct FinalizeParams<'a> {
    pub metric_names: &'a [String],
    pub row_filters: &'a [RowFilter],
    pub rollup: Option<Rollup>,
    pub pivot: &'a [String],
    pub order_by: &'a [OrderBy],
    pub limit: Option<usize>,
    pub limit_first: bool,
}

/// The post-processing pipeline: row filters, technicals, rollup,
/// rounding, ordering, limit, pivot.
pub(crate) fn finalize_frame(
    mut frame: ReportFrame,
    scope: &dyn FieldManager,
    params: FinalizeParams<'_>,
) -> Result<ReportFrame> {
    if !params.row_filters.is_empty() {
        let filters: Vec<(String, crate::frame::RowFilterOp, Value)> = params
            .row_filters
            .iter()
            .map(|f| (f.field.clone(), f.op, f.value.clone()))
            .collect();
        frame.apply_row_filters(&filters)?;
    }

    for name in params.metric_names {
        let metric = scope.get_metric(name)?;
        if let Some(technical) = &metric.technical {
            apply_technical(&mut frame, name, technical, metric.rounding)?;
        }
    }

    if params.limit_first {
        if let Some(limit) = params.limit {
            frame.truncate(limit);
        }
    }

    if let Some(rollup) = params.rollup {
        apply_rollup(&mut frame, rollup, scope)?;
    }

    // Hidden weighting columns have served rollup; drop everything the
    // request did not ask for (bollinger bands stay with their metric).
    let keep: Vec<String> = frame
        .columns
        .iter()
        .filter(|col| {
            params.metric_names.contains(col)
                || base_metric_name(col)
                    .map(|base| params.metric_names.iter().any(|m| m == base))
                    .unwrap_or(false)
        })
        .cloned()
        .collect();
    for col in frame.columns.clone() {
        if !keep.contains(&col) {
            frame.drop_column(&col);
        }
    }

    for col in frame.columns.clone() {
        let lookup = base_metric_name(&col).unwrap_or(col.as_str());
        if let Ok(metric) = scope.get_metric(lookup) {
            if let Some(rounding) = metric.rounding {
                frame.round_column(&col, rounding);
            }
        }
    }

    if !params.order_by.is_empty() {
        let order: Vec<(String, crate::frame::SortDirection)> = params
            .order_by
            .iter()
            .map(|o| (o.field.clone(), o.direction))
            .collect();
        frame.sort_by(&order)?;
    }

    if !params.limit_first {
        if let Some(limit) = params.limit {
            frame.truncate(limit);
        }
    }

    if !params.pivot.is_empty() {
        frame = frame.pivot(params.pivot)?;
    }

    Ok(frame)
}

/// `revenue_lower` / `revenue_upper` -> `revenue`.
fn base_metric_name(column: &str) -> Option<&str> {
    column
        .strip_suffix("_lower")
        .or_else(|| column.strip_suffix("_upper"))
}

/// Apply a technical to one metric column. In group mode with a
/// multi-level index the computation runs independently per value of the
/// second-to-last index level.
fn apply_technical(
    frame: &mut ReportFrame,
    column: &str,
    technical: &Technical,
    rounding: Option<u32>,
) -> Result<()> {
    let values = frame.column_f64(column).ok_or_else(|| {
        TributaryError::Report(format!("technical target column {column} missing"))
    })?;
    if values.is_empty() {
        return Ok(());
    }

    let groups: Vec<Vec<usize>> =
        if technical.mode == TechnicalMode::Group && frame.index_names.len() >= 2 {
            let level = frame.index_names.len() - 2;
            let mut order: Vec<Value> = Vec::new();
            let mut grouped: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, row) in frame.rows.iter().enumerate() {
                let key = row.index[level].to_string();
                if !grouped.contains_key(&key) {
                    order.push(row.index[level].clone());
                }
                grouped.entry(key).or_default().push(i);
            }
            order
                .into_iter()
                .map(|v| grouped.remove(&v.to_string()).unwrap_or_default())
                .collect()
        } else {
            vec![(0..frame.rows.len()).collect()]
        };

    let mut base = values.clone();
    let mut lower: Option<Vec<Option<f64>>> = None;
    let mut upper: Option<Vec<Option<f64>>> = None;

    for group in &groups {
        let slice: Vec<Option<f64>> = group.iter().map(|&i| values[i]).collect();
        match technical.compute(&slice) {
            TechnicalOutput::Single(out) => {
                for (&i, v) in group.iter().zip(out) {
                    base[i] = v;
                }
            }
            TechnicalOutput::Bollinger {
                mid,
                lower: lo,
                upper: up,
            } => {
                let lower = lower.get_or_insert_with(|| vec![None; values.len()]);
                let upper = upper.get_or_insert_with(|| vec![None; values.len()]);
                for (offset, &i) in group.iter().enumerate() {
                    base[i] = mid[offset];
                    lower[i] = lo[offset];
                    upper[i] = up[offset];
                }
            }
        }
    }

    frame.set_column_f64(column, &base)?;
    if let (Some(mut lower), Some(mut upper)) = (lower, upper) {
        if let Some(digits) = rounding {
            round_values(&mut lower, digits);
            round_values(&mut upper, digits);
        }
        let lower_name = format!("{column}_lower");
        let upper_name = format!("{column}_upper");
        frame.insert_column_after(column, &lower_name, &lower)?;
        frame.insert_column_after(&lower_name, &upper_name, &upper)?;
    }
    Ok(())
}

fn round_values(values: &mut [Option<f64>], digits: u32) {
    let factor = 10f64.powi(digits as i32);
    for value in values.iter_mut() {
        if let Some(x) = value {
            *value = Some((*x * factor).round() / factor);
        }
    }
}

/// Append rollup rows: subtotals on index prefixes with deeper slots
/// filled by the sentinel, and a grand-total row for `totals`, `all`,
/// or full-depth rollups.
fn apply_rollup(frame: &mut ReportFrame, rollup: Rollup, scope: &dyn FieldManager) -> Result<()> {
    let ndims = frame.index_names.len();
    if ndims == 0 {
        return Err(TributaryError::Report(
            "cannot rollup without dimensions".to_string(),
        ));
    }

    let mut defs: BTreeMap<String, Arc<Metric>> = BTreeMap::new();
    for col in &frame.columns {
        if let Ok(metric) = scope.get_metric(col) {
            defs.insert(col.clone(), metric);
        }
    }

    let base_rows: Vec<usize> = (0..frame.rows.len()).collect();
    let mut synthetic: Vec<FrameRow> = Vec::new();

    let depth = match rollup {
        Rollup::Totals => 0,
        Rollup::All => ndims,
        Rollup::Levels(n) => n,
    };

    for level in 1..=depth.min(ndims.saturating_sub(1)) {
        // Rows arrive sorted by index, so prefix groups are contiguous.
        let mut groups: Vec<(Vec<Value>, Vec<usize>)> = Vec::new();
        for &i in &base_rows {
            let prefix: Vec<Value> = frame.rows[i].index[..level].to_vec();
            match groups.last_mut() {
                Some((key, members)) if *key == prefix => members.push(i),
                _ => groups.push((prefix, vec![i])),
            }
        }
        for (prefix, members) in groups {
            let mut index = prefix;
            index.resize(ndims, Value::String(ROLLUP_SENTINEL.to_string()));
            let values = aggregate_rows(frame, &members, &defs);
            synthetic.push(FrameRow { index, values });
        }
    }

    let wants_totals = matches!(rollup, Rollup::Totals | Rollup::All)
        || matches!(rollup, Rollup::Levels(n) if n == ndims);
    if wants_totals {
        let values = aggregate_rows(frame, &base_rows, &defs);
        synthetic.push(FrameRow {
            index: vec![Value::String(ROLLUP_SENTINEL.to_string()); ndims],
            values,
        });
    }

    frame.rows.extend(synthetic);
    frame.sort_by_index();
    Ok(())
}

/// Aggregate a set of rows per metric: `mean` stays a mean, counts sum
/// over the post-query rowset, weighted means recompute from the
/// weighting column with an unweighted fallback when the weights sum to
/// zero.
fn aggregate_rows(
    frame: &ReportFrame,
    rows: &[usize],
    defs: &BTreeMap<String, Arc<Metric>>,
) -> Vec<Value> {
    frame
        .columns
        .iter()
        .enumerate()
        .map(|(c, col)| {
            let Some(metric) = defs.get(col) else {
                return Value::Null;
            };
            let values: Vec<f64> = rows
                .iter()
                .filter_map(|&i| value_f64(&frame.rows[i].values[c]))
                .collect();
            if values.is_empty() {
                return Value::Null;
            }

            if metric.aggregation == Aggregation::Mean {
                if let Some(weighting) = &metric.weighting_metric {
                    if let Some(w_pos) = frame.column_position(weighting) {
                        let mut sum_xw = 0.0;
                        let mut sum_w = 0.0;
                        for &i in rows {
                            let x = value_f64(&frame.rows[i].values[c]);
                            let w = value_f64(&frame.rows[i].values[w_pos]);
                            if let (Some(x), Some(w)) = (x, w) {
                                sum_xw += x * w;
                                sum_w += w;
                            }
                        }
                        if sum_w != 0.0 {
                            return crate::frame::f64_value(Some(sum_xw / sum_w));
                        }
                        // No weights: fall back to the unweighted mean.
                    }
                }
                let mean = values.iter().sum::<f64>() / values.len() as f64;
                return crate::frame::f64_value(Some(mean));
            }

            let out = match metric.aggregation {
                Aggregation::Sum | Aggregation::Count | Aggregation::CountDistinct => {
                    values.iter().sum::<f64>()
                }
                Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                Aggregation::Mean => unreachable!("handled above"),
            };
            crate::frame::f64_value(Some(out))
        })
        .collect()
}
