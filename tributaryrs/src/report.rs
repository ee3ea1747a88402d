//! Report requests, planning, and execution.
//!
//! A [`Report`] resolves its requested fields against the warehouse,
//! expands formulas to datasource leaves, computes the grain, groups leaf
//! metrics into per-datasource queries, runs them through the executor,
//! and assembles the combined result.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::EngineConfig;
use crate::datasource::{ColumnRef, DataSource, FieldMapping, TableSet};
use crate::dialect::criteria_conversion;
use crate::error::{Result, TributaryError};
use crate::executor::{execute_all, KillSwitch, PlannedQuery};
use crate::field::{
    self, expand_formula, is_valid_field_name, Aggregation, Dimension, FieldManager, Metric,
};
use crate::frame::{ReportFrame, RowFilterOp, SortDirection};
use crate::result::{finalize_frame, CombinedResult, FinalizeParams};
use crate::sql::{
    check_allowed_sql, contains_aggregation, criterion_sql, criterion_values, CriteriaOp,
    SelectItem, SelectQuery, SqlExpr, SqlRenderer,
};
use crate::technical::Technical;
use crate::warehouse::Warehouse;

/// A metric reference in a request: an existing name or an ad-hoc formula
/// metric scoped to this request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricSpec {
    Name(String),
    AdHoc(AdHocMetricSpec),
}

impl From<&str> for MetricSpec {
    fn from(name: &str) -> Self {
        MetricSpec::Name(name.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdHocMetricSpec {
    pub name: String,
    pub formula: String,
    #[serde(default)]
    pub technical: Option<String>,
    #[serde(default)]
    pub rounding: Option<u32>,
    #[serde(default)]
    pub required_grain: Vec<String>,
}

/// One criterion triple `(field, op, value)`. Values may be scalars,
/// lists (for `in`/multi-value ops), or 2-item lists for `between`.
#[derive(Debug, Clone)]
pub struct Criterion {
    pub field: String,
    pub op: CriteriaOp,
    pub value: Value,
}

impl Criterion {
    pub fn new(field: &str, op: CriteriaOp, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op,
            value,
        }
    }
}

impl Serialize for Criterion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.field)?;
        seq.serialize_element(&self.op)?;
        seq.serialize_element(&self.value)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Criterion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (field, op, value) = <(String, CriteriaOp, Value)>::deserialize(deserializer)?;
        Ok(Criterion { field, op, value })
    }
}

/// A post-aggregation row filter triple.
#[derive(Debug, Clone)]
pub struct RowFilter {
    pub field: String,
    pub op: RowFilterOp,
    pub value: Value,
}

impl RowFilter {
    pub fn new(field: &str, op: RowFilterOp, value: Value) -> Self {
        Self {
            field: field.to_string(),
            op,
            value,
        }
    }
}

impl Serialize for RowFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.field)?;
        seq.serialize_element(&self.op)?;
        seq.serialize_element(&self.value)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for RowFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (field, op, value) = <(String, RowFilterOp, Value)>::deserialize(deserializer)?;
        Ok(RowFilter { field, op, value })
    }
}

/// Rollup behavior: grand totals only, subtotals down to a depth, or all
/// levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollup {
    Totals,
    All,
    Levels(usize),
}

impl Serialize for Rollup {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Rollup::Totals => serializer.serialize_str("totals"),
            Rollup::All => serializer.serialize_str("all"),
            Rollup::Levels(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Rollup {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) if s == "totals" => Ok(Rollup::Totals),
            Value::String(s) if s == "all" => Ok(Rollup::All),
            Value::Number(n) => n
                .as_u64()
                .map(|n| Rollup::Levels(n as usize))
                .ok_or_else(|| de::Error::custom("rollup depth must be a positive integer")),
            other => Err(de::Error::custom(format!("invalid rollup value: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl Serialize for OrderBy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(&self.field)?;
        seq.serialize_element(&self.direction)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for OrderBy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (field, direction) = <(String, SortDirection)>::deserialize(deserializer)?;
        Ok(OrderBy { field, direction })
    }
}

/// The immutable report request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportRequest {
    pub metrics: Vec<MetricSpec>,
    pub dimensions: Vec<String>,
    pub criteria: Vec<Criterion>,
    pub row_filters: Vec<RowFilter>,
    pub rollup: Option<Rollup>,
    pub pivot: Vec<String>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<usize>,
    pub limit_first: bool,
}

/// Field lookup for one request: ad-hoc metrics take precedence, then the
/// warehouse, then any ad-hoc datasources.
pub(crate) struct FieldScope<'a> {
    warehouse: &'a Warehouse,
    adhoc_datasources: &'a [Arc<DataSource>],
    adhoc_metrics: &'a BTreeMap<String, Arc<Metric>>,
}

impl FieldManager for FieldScope<'_> {
    fn metric_map(&self) -> &BTreeMap<String, Arc<Metric>> {
        self.adhoc_metrics
    }

    fn dimension_map(&self) -> &BTreeMap<String, Arc<Dimension>> {
        field::empty_dimension_map()
    }

    fn child_managers(&self) -> Vec<&dyn FieldManager> {
        let mut children: Vec<&dyn FieldManager> = vec![self.warehouse];
        children.extend(
            self.adhoc_datasources
                .iter()
                .map(|ds| ds.as_ref() as &dyn FieldManager),
        );
        children
    }
}

/// A planned, re-executable report bound to a warehouse.
pub struct Report<'w> {
    warehouse: &'w Warehouse,
    request: ReportRequest,
    adhoc_datasources: Vec<Arc<DataSource>>,
    adhoc_metrics: BTreeMap<String, Arc<Metric>>,
    metric_names: Vec<String>,
    ds_metrics: Vec<String>,
    ds_dimensions: Vec<String>,
    queries: Vec<DataSourceQuery>,
    kill: Arc<KillSwitch>,
}

impl<'w> Report<'w> {
    pub fn new(
        warehouse: &'w Warehouse,
        request: ReportRequest,
        adhoc_datasources: Vec<Arc<DataSource>>,
    ) -> Result<Self> {
        let start = Instant::now();
        if request.metrics.is_empty() && request.dimensions.is_empty() {
            return Err(TributaryError::Report(
                "one of metrics or dimensions must be specified".to_string(),
            ));
        }

        for ds in &adhoc_datasources {
            if warehouse.datasource(ds.name()).is_some() {
                return Err(TributaryError::Report(format!(
                    "ad-hoc datasource {} conflicts with an existing datasource",
                    ds.name()
                )));
            }
        }

        if let Some(rollup) = request.rollup {
            if request.dimensions.is_empty() {
                return Err(TributaryError::Report(
                    "rollup requires dimensions".to_string(),
                ));
            }
            if let Rollup::Levels(n) = rollup {
                if n == 0 || n > request.dimensions.len() {
                    return Err(TributaryError::Report(format!(
                        "invalid rollup depth: {n}"
                    )));
                }
            }
        }

        for pivot_dim in &request.pivot {
            if !request.dimensions.contains(pivot_dim) {
                return Err(TributaryError::Report(format!(
                    "pivot dimension {pivot_dim} must be a requested dimension"
                )));
            }
        }

        let adhoc_metrics = build_adhoc_metrics(warehouse, &adhoc_datasources, &request)?;
        let scope = FieldScope {
            warehouse,
            adhoc_datasources: &adhoc_datasources,
            adhoc_metrics: &adhoc_metrics,
        };

        // Validate ad-hoc formulas now that the full scope exists.
        for metric in adhoc_metrics.values() {
            let formula = metric.formula.as_deref().expect("ad-hoc metrics are formulas");
            expand_formula(&scope, &metric.name, formula)?;
        }

        let metric_names: Vec<String> = request
            .metrics
            .iter()
            .map(|spec| match spec {
                MetricSpec::Name(name) => name.clone(),
                MetricSpec::AdHoc(adhoc) => adhoc.name.clone(),
            })
            .collect();

        let dimension_grain: BTreeSet<String> =
            request.dimensions.iter().cloned().collect();

        let mut ds_metrics: Vec<String> = Vec::new();
        let mut ds_dimensions: Vec<String> = Vec::new();

        for name in &request.dimensions {
            let dim = scope.get_dimension(name)?;
            match &dim.formula {
                Some(formula) => {
                    let (leaves, _) = expand_formula(&scope, name, formula)?;
                    for leaf in leaves {
                        if !scope.has_dimension(&leaf) {
                            return Err(TributaryError::Report(format!(
                                "formula dimension {name} references non-dimension {leaf}"
                            )));
                        }
                        push_unique(&mut ds_dimensions, &leaf);
                    }
                }
                None => push_unique(&mut ds_dimensions, name),
            }
        }

        for name in &metric_names {
            let metric = scope.get_metric(name)?;
            check_required_grain(name, &metric.required_grain, &dimension_grain)?;

            if let Some(weighting) = &metric.weighting_metric {
                if !scope.has_metric(weighting) {
                    return Err(TributaryError::Report(format!(
                        "could not find weighting metric {weighting} for {name}"
                    )));
                }
                push_unique(&mut ds_metrics, weighting);
            }

            match &metric.formula {
                Some(formula) => {
                    let (leaves, _) = expand_formula(&scope, name, formula)?;
                    for leaf in leaves {
                        if scope.has_dimension(&leaf) {
                            return Err(TributaryError::Report(format!(
                                "formula metric {name} depends on dimension {leaf} and \
                                 cannot be evaluated at the combined layer"
                            )));
                        }
                        let leaf_metric = scope.get_metric(&leaf)?;
                        check_required_grain(&leaf, &leaf_metric.required_grain, &dimension_grain)?;
                        if let Some(weighting) = &leaf_metric.weighting_metric {
                            push_unique(&mut ds_metrics, weighting);
                        }
                        push_unique(&mut ds_metrics, &leaf);
                    }
                }
                None => push_unique(&mut ds_metrics, name),
            }
        }

        // Criteria fields must resolve to a single underlying column.
        for criterion in &request.criteria {
            let criterion_field = scope.get_field(&criterion.field)?;
            if criterion_field.formula().is_some() {
                return Err(TributaryError::Report(format!(
                    "criteria on formula field {} are not supported",
                    criterion.field
                )));
            }
        }

        let mut grain_ordered = ds_dimensions.clone();
        for criterion in &request.criteria {
            push_unique(&mut grain_ordered, &criterion.field);
        }
        let grain: BTreeSet<String> = grain_ordered.iter().cloned().collect();

        let queries = build_ds_queries(
            warehouse,
            &scope,
            &request,
            &ds_metrics,
            &ds_dimensions,
            &grain_ordered,
            &grain,
            &dimension_grain,
            &adhoc_datasources,
        )?;

        tracing::debug!(
            metrics = ds_metrics.len(),
            dimensions = ds_dimensions.len(),
            queries = queries.len(),
            ms = start.elapsed().as_millis(),
            "report planned"
        );

        Ok(Report {
            warehouse,
            request,
            adhoc_datasources,
            adhoc_metrics,
            metric_names,
            ds_metrics,
            ds_dimensions,
            queries,
            kill: KillSwitch::new(),
        })
    }

    fn scope(&self) -> FieldScope<'_> {
        FieldScope {
            warehouse: self.warehouse,
            adhoc_datasources: &self.adhoc_datasources,
            adhoc_metrics: &self.adhoc_metrics,
        }
    }

    pub fn request(&self) -> &ReportRequest {
        &self.request
    }

    pub fn queries(&self) -> &[DataSourceQuery] {
        &self.queries
    }

    /// Request cancellation of an in-flight execution. May be called
    /// concurrently from another task or thread; a second kill is a
    /// no-op. The report stays re-executable.
    pub fn kill(&self) {
        self.kill.kill();
    }

    /// A shareable handle for killing this report from another task.
    pub fn kill_handle(&self) -> Arc<KillSwitch> {
        self.kill.clone()
    }

    /// Execute the planned queries and assemble the final result. Any
    /// exit path releases the combined-result table and pooled
    /// connections.
    pub async fn execute(&self) -> Result<ReportResult> {
        let start = Instant::now();
        self.kill.reset();
        let engine = self.warehouse.engine();

        let planned: Vec<PlannedQuery> = self
            .queries
            .iter()
            .enumerate()
            .map(|(index, query)| PlannedQuery {
                index,
                datasource: query.datasource.name().to_string(),
                backend: query.datasource.backend().clone(),
                sql: query.sql(),
            })
            .collect();

        let executed = execute_all(
            planned,
            engine.query_mode,
            engine.query_timeout(),
            engine.query_workers,
            self.kill.clone(),
        )
        .await?;

        let mut summaries = Vec::with_capacity(executed.len());
        let mut rowsets = Vec::with_capacity(executed.len());
        for result in executed {
            let query = &self.queries[result.index];
            summaries.push(DataSourceQuerySummary {
                datasource: query.datasource.name().to_string(),
                sql: query.sql(),
                metrics: query.metrics.clone(),
                dimensions: query.dimensions.clone(),
                rowcount: result.rowset.rows.len(),
                duration: result.duration,
            });
            rowsets.push((result.index, result.rowset));
        }
        rowsets.sort_by_key(|(index, _)| *index);

        let scope = self.scope();
        let mut combined_dimensions: Vec<(String, Arc<Dimension>)> = Vec::new();
        let mut combined_metrics: Vec<(String, Arc<Metric>)> = Vec::new();
        for query in &self.queries {
            for dim_name in &query.dimensions {
                if !combined_dimensions.iter().any(|(name, _)| name == dim_name) {
                    combined_dimensions.push((dim_name.clone(), scope.get_dimension(dim_name)?));
                }
            }
            for metric_name in &query.metrics {
                if !combined_metrics.iter().any(|(name, _)| name == metric_name) {
                    combined_metrics.push((metric_name.clone(), scope.get_metric(metric_name)?));
                }
            }
        }

        let combined = CombinedResult::create(
            combined_dimensions,
            combined_metrics,
            self.ds_dimensions.clone(),
            engine.load_chunk_size,
        )?;
        combined.load(rowsets.iter().map(|(_, rowset)| rowset))?;

        let frame = combined.final_frame(&scope, &self.request.dimensions, &self.metric_names)?;
        let frame = finalize_frame(
            frame,
            &scope,
            FinalizeParams {
                metric_names: &self.metric_names,
                row_filters: &self.request.row_filters,
                rollup: self.request.rollup,
                pivot: &self.request.pivot,
                order_by: &self.request.order_by,
                limit: self.request.limit,
                limit_first: self.request.limit_first,
            },
        )?;

        let rowcount = frame.len();
        let result = ReportResult {
            df: frame,
            duration: start.elapsed(),
            query_summaries: summaries,
            rowcount,
        };
        tracing::info!(
            rows = result.rowcount,
            ms = result.duration.as_millis(),
            queries = result.query_summaries.len(),
            "report completed"
        );
        Ok(result)
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

fn check_required_grain(
    field: &str,
    required_grain: &[String],
    dimension_grain: &BTreeSet<String>,
) -> Result<()> {
    let missing: Vec<&String> = required_grain
        .iter()
        .filter(|d| !dimension_grain.contains(*d))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(TributaryError::UnsupportedGrain(format!(
        "field {field} requires dimensions not in report grain: {missing:?}"
    )))
}

fn build_adhoc_metrics(
    warehouse: &Warehouse,
    adhoc_datasources: &[Arc<DataSource>],
    request: &ReportRequest,
) -> Result<BTreeMap<String, Arc<Metric>>> {
    let mut adhoc_metrics = BTreeMap::new();
    let empty = BTreeMap::new();
    let base_scope = FieldScope {
        warehouse,
        adhoc_datasources,
        adhoc_metrics: &empty,
    };

    for spec in &request.metrics {
        let MetricSpec::AdHoc(adhoc) = spec else {
            continue;
        };
        is_valid_field_name(&adhoc.name)?;
        if base_scope.has_field(&adhoc.name) {
            return Err(TributaryError::InvalidField(format!(
                "ad-hoc metric cannot use the name of an existing field: {}",
                adhoc.name
            )));
        }
        check_allowed_sql(&adhoc.formula)?;
        let technical = adhoc
            .technical
            .as_deref()
            .map(Technical::parse)
            .transpose()?;
        adhoc_metrics.insert(
            adhoc.name.clone(),
            Arc::new(Metric {
                name: adhoc.name.clone(),
                sa_type: None,
                aggregation: Aggregation::Sum,
                rounding: adhoc.rounding,
                weighting_metric: None,
                technical,
                required_grain: adhoc.required_grain.clone(),
                formula: Some(adhoc.formula.clone()),
            }),
        );
    }
    Ok(adhoc_metrics)
}

#[allow(clippy::too_many_arguments)]
fn build_ds_queries(
    warehouse: &Warehouse,
    scope: &FieldScope<'_>,
    request: &ReportRequest,
    ds_metrics: &[String],
    ds_dimensions: &[String],
    grain_ordered: &[String],
    grain: &BTreeSet<String>,
    dimension_grain: &BTreeSet<String>,
    adhoc_datasources: &[Arc<DataSource>],
) -> Result<Vec<DataSourceQuery>> {
    let engine = warehouse.engine();
    let mut queries: Vec<DataSourceQuery> = Vec::new();
    let mut grain_errors: Vec<String> = Vec::new();

    for metric in ds_metrics {
        if let Some(query) = queries.iter_mut().find(|q| q.covers_metric(metric)) {
            tracing::debug!(metric, "metric covered by existing query");
            query.add_metric(scope, metric)?;
            continue;
        }

        let table_set =
            match warehouse.get_metric_table_set(metric, grain, dimension_grain, adhoc_datasources)
            {
                Ok(table_set) => table_set,
                Err(TributaryError::UnsupportedGrain(msg)) => {
                    grain_errors.push(msg);
                    continue;
                }
                Err(e) => return Err(e),
            };
        let datasource = warehouse
            .resolve_datasource(&table_set.datasource, adhoc_datasources)
            .ok_or_else(|| {
                TributaryError::Execution(format!(
                    "datasource {} disappeared during planning",
                    table_set.datasource
                ))
            })?;
        let query = DataSourceQuery::build(
            scope,
            engine,
            datasource,
            vec![metric.clone()],
            ds_dimensions.to_vec(),
            request.criteria.clone(),
            table_set,
        )?;
        queries.push(query);
    }

    if !grain_errors.is_empty() {
        return Err(TributaryError::UnsupportedGrain(grain_errors.join("\n")));
    }

    if ds_metrics.is_empty() {
        tracing::debug!("no metrics requested, planning dimension table set");
        let table_set = warehouse.get_dimension_table_set(
            grain_ordered,
            grain,
            dimension_grain,
            adhoc_datasources,
        )?;
        let datasource = warehouse
            .resolve_datasource(&table_set.datasource, adhoc_datasources)
            .ok_or_else(|| {
                TributaryError::Execution(format!(
                    "datasource {} disappeared during planning",
                    table_set.datasource
                ))
            })?;
        queries.push(DataSourceQuery::build(
            scope,
            engine,
            datasource,
            Vec::new(),
            ds_dimensions.to_vec(),
            request.criteria.clone(),
            table_set,
        )?);
    }

    Ok(queries)
}

/// One SELECT against one datasource, materialized from a table set.
pub struct DataSourceQuery {
    datasource: Arc<DataSource>,
    metrics: Vec<String>,
    dimensions: Vec<String>,
    criteria: Vec<Criterion>,
    table_set: TableSet,
    select: SelectQuery,
}

impl DataSourceQuery {
    fn build(
        scope: &dyn FieldManager,
        engine: &EngineConfig,
        datasource: Arc<DataSource>,
        metrics: Vec<String>,
        dimensions: Vec<String>,
        criteria: Vec<Criterion>,
        table_set: TableSet,
    ) -> Result<Self> {
        let mut query = DataSourceQuery {
            datasource,
            metrics: Vec::new(),
            dimensions,
            criteria,
            table_set,
            select: SelectQuery::default(),
        };
        query.select = query.build_select(engine)?;
        for metric in metrics {
            query.add_metric(scope, &metric)?;
        }
        Ok(query)
    }

    pub fn datasource_name(&self) -> &str {
        self.datasource.name()
    }

    pub fn sql(&self) -> String {
        SqlRenderer::new(self.datasource.dialect()).render_select(&self.select)
    }

    fn build_select(&self, engine: &EngineConfig) -> Result<SelectQuery> {
        let mut select = SelectQuery {
            from: self.table_set.ds_table.clone(),
            ..SelectQuery::default()
        };

        // FROM/JOIN: outer-join along the join parts, skipping tables
        // already in the chain (merged joins share prefixes).
        if let Some(join) = &self.table_set.join {
            let mut joined: BTreeSet<&str> = BTreeSet::new();
            joined.insert(self.table_set.ds_table.as_str());
            for part in &join.join_parts {
                if part.table_names.len() < 2 {
                    continue;
                }
                let (left, right) = (&part.table_names[0], &part.table_names[1]);
                if joined.contains(right.as_str()) {
                    continue;
                }
                let mut on = Vec::new();
                for join_field in &part.join_fields {
                    let left_column = self.column_in_table(left, join_field)?;
                    let right_column = self.column_in_table(right, join_field)?;
                    on.push((
                        SqlExpr::Column {
                            table: left.clone(),
                            name: left_column,
                        },
                        SqlExpr::Column {
                            table: right.clone(),
                            name: right_column,
                        },
                    ));
                }
                select.joins.push(crate::sql::JoinClause {
                    table: right.clone(),
                    on,
                });
                joined.insert(right.as_str());
            }
        }

        for dimension in &self.dimensions {
            select.select.push(self.dimension_item(engine, dimension)?);
        }

        for criterion in &self.criteria {
            select.filters.push(self.criterion_fragment(criterion)?);
        }

        select.group_by_positions = if self.dimensions.is_empty() {
            0
        } else {
            self.dimensions.len()
        };

        Ok(select)
    }

    fn column_in_table(&self, table: &str, field: &str) -> Result<String> {
        self.datasource
            .get_table(table)
            .and_then(|t| t.column_for_field(field))
            .map(|c| c.name.clone())
            .ok_or_else(|| {
                TributaryError::Report(format!(
                    "could not determine column for field {field} in table {table}"
                ))
            })
    }

    /// Resolve a field to its column and mapping inside this table set:
    /// the join's field map first, then the anchor, then any join table.
    fn resolve_field(&self, field: &str) -> Result<(ColumnRef, FieldMapping)> {
        if let Some(join) = &self.table_set.join {
            if let Some(column_ref) = join.field_map.get(field) {
                let mapping = self
                    .datasource
                    .get_table(&column_ref.table)
                    .and_then(|t| t.columns.get(&column_ref.column))
                    .and_then(|c| c.mapping(field))
                    .cloned();
                if let Some(mapping) = mapping {
                    return Ok((column_ref.clone(), mapping));
                }
            }
        }

        let mut tables = vec![self.table_set.ds_table.clone()];
        if let Some(join) = &self.table_set.join {
            tables.extend(join.table_names.iter().cloned());
        }
        for table_name in tables {
            if let Some(table) = self.datasource.get_table(&table_name) {
                if let Some(column) = table.column_for_field(field) {
                    let mapping = column.mapping(field).cloned().expect("mapping exists");
                    return Ok((
                        ColumnRef {
                            table: table_name,
                            column: column.name.clone(),
                        },
                        mapping,
                    ));
                }
            }
        }
        Err(TributaryError::Report(format!(
            "could not determine column for field {field}"
        )))
    }

    fn dimension_item(&self, engine: &EngineConfig, dimension: &str) -> Result<SelectItem> {
        let (column_ref, mapping) = self.resolve_field(dimension)?;
        let base = match &mapping.ds_formula {
            Some(fragment) => SqlExpr::Raw(fragment.clone()),
            None => SqlExpr::Column {
                table: column_ref.table,
                name: column_ref.column,
            },
        };
        Ok(SelectItem {
            expr: SqlExpr::IfNull {
                expr: Box::new(base),
                fallback: Box::new(SqlExpr::Literal(Value::String(
                    engine.ifnull_value.clone(),
                ))),
            },
            alias: dimension.to_string(),
        })
    }

    fn metric_item(&self, scope: &dyn FieldManager, metric_name: &str) -> Result<SelectItem> {
        let metric = scope.get_metric(metric_name)?;
        let (column_ref, mapping) = self.resolve_field(metric_name)?;

        let base = match &mapping.ds_formula {
            Some(fragment) => SqlExpr::Raw(fragment.clone()),
            None => SqlExpr::Column {
                table: column_ref.table.clone(),
                name: column_ref.column.clone(),
            },
        };

        // A datasource formula that already aggregates replaces the
        // default aggregation logic entirely.
        if let Some(fragment) = &mapping.ds_formula {
            if contains_aggregation(fragment) {
                tracing::debug!(
                    metric = metric_name,
                    "datasource formula contains aggregation, skipping default wrap"
                );
                return Ok(SelectItem {
                    expr: base,
                    alias: metric_name.to_string(),
                });
            }
        }

        let expr = match (&metric.aggregation, &metric.weighting_metric) {
            (Aggregation::Count | Aggregation::CountDistinct, _) => {
                if metric.rounding.is_some() {
                    tracing::warn!(metric = metric_name, "ignoring rounding for count metric");
                }
                SqlExpr::Aggregate {
                    agg: metric.aggregation,
                    expr: Box::new(base),
                }
            }
            (Aggregation::Mean, Some(weighting)) => {
                // The weighting column must live on the same table as the
                // metric column.
                let weight_column = self.column_in_table(&column_ref.table, weighting)?;
                SqlExpr::WeightedMean {
                    value: Box::new(base),
                    weight: Box::new(SqlExpr::Column {
                        table: column_ref.table.clone(),
                        name: weight_column,
                    }),
                }
            }
            _ => SqlExpr::Aggregate {
                agg: metric.aggregation,
                expr: Box::new(base),
            },
        };

        Ok(SelectItem {
            expr,
            alias: metric_name.to_string(),
        })
    }

    fn criterion_fragment(&self, criterion: &Criterion) -> Result<String> {
        let dialect = self.datasource.dialect();
        let (column_ref, mapping) = self.resolve_field(&criterion.field)?;
        let values = criterion_values(&criterion.value);

        // Converted dimensions rewrite into range predicates against the
        // raw column so they stay SARGable.
        if let Some(unit) = mapping.conversion {
            if let Some(clauses) = criteria_conversion(unit, criterion.op, &values)? {
                let renderer = SqlRenderer::new(dialect);
                let target = renderer.render_expr(&SqlExpr::Column {
                    table: column_ref.table.clone(),
                    name: column_ref.column.clone(),
                });
                let rendered: Vec<String> = clauses
                    .into_iter()
                    .map(|(op, vals)| criterion_sql(&target, op, &vals, dialect))
                    .collect::<Result<_>>()?;
                return Ok(if rendered.len() == 1 {
                    rendered.into_iter().next().expect("nonempty")
                } else {
                    format!("({})", rendered.join(" AND "))
                });
            }
        }

        let renderer = SqlRenderer::new(dialect);
        let target = match &mapping.ds_formula {
            Some(fragment) => fragment.clone(),
            None => renderer.render_expr(&SqlExpr::Column {
                table: column_ref.table,
                name: column_ref.column,
            }),
        };
        criterion_sql(&target, criterion.op, &values, dialect)
    }

    /// Whether the anchor table can also provide this metric, allowing it
    /// to piggyback on this query.
    fn covers_metric(&self, metric: &str) -> bool {
        self.table_set
            .covered_fields(&self.datasource)
            .contains(metric)
    }

    fn add_metric(&mut self, scope: &dyn FieldManager, metric: &str) -> Result<()> {
        if self.metrics.iter().any(|m| m == metric) {
            return Ok(());
        }
        let item = self.metric_item(scope, metric)?;
        self.select.select.push(item);
        self.metrics.push(metric.to_string());
        self.table_set.target_fields.insert(metric.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DataSourceQuerySummary {
    pub datasource: String,
    pub sql: String,
    pub metrics: Vec<String>,
    pub dimensions: Vec<String>,
    pub rowcount: usize,
    pub duration: Duration,
}

impl DataSourceQuerySummary {
    pub fn format(&self) -> String {
        format!(
            "{} rows in {:.4}s\nDatasource: {}\nMetrics: {:?}\nDimensions: {:?}\n\n{}",
            self.rowcount,
            self.duration.as_secs_f64(),
            self.datasource,
            self.metrics,
            self.dimensions,
            self.sql
        )
    }
}

/// The final result of a report execution.
#[derive(Debug, Clone)]
pub struct ReportResult {
    pub df: ReportFrame,
    pub duration: Duration,
    pub query_summaries: Vec<DataSourceQuerySummary>,
    pub rowcount: usize,
}

impl ReportResult {
    /// Synthetic subtotal/total rows.
    pub fn rollup_rows(&self) -> ReportFrame {
        self.df.rollup_rows()
    }

    pub fn non_rollup_rows(&self) -> ReportFrame {
        self.df.non_rollup_rows()
    }

    /// The frame with rollup markers replaced by a display label.
    pub fn df_display(&self) -> ReportFrame {
        self.df.display()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn criteria_round_trip_as_triples() {
        let criterion: Criterion =
            serde_json::from_value(json!(["campaign_name", "!=", "Campaign 2B"])).unwrap();
        assert_eq!(criterion.field, "campaign_name");
        assert_eq!(criterion.op, CriteriaOp::Neq);
        assert_eq!(criterion.value, json!("Campaign 2B"));

        let back = serde_json::to_value(&criterion).unwrap();
        assert_eq!(back, json!(["campaign_name", "!=", "Campaign 2B"]));
    }

    #[test]
    fn rollup_accepts_strings_and_depths() {
        let request: ReportRequest = serde_json::from_value(json!({
            "metrics": ["revenue"],
            "dimensions": ["partner_name"],
            "rollup": "totals"
        }))
        .unwrap();
        assert_eq!(request.rollup, Some(Rollup::Totals));

        let request: ReportRequest = serde_json::from_value(json!({
            "dimensions": ["partner_name"],
            "rollup": 1
        }))
        .unwrap();
        assert_eq!(request.rollup, Some(Rollup::Levels(1)));

        let request: ReportRequest =
            serde_json::from_value(json!({"dimensions": ["d"], "rollup": "all"})).unwrap();
        assert_eq!(request.rollup, Some(Rollup::All));
    }

    #[test]
    fn metric_specs_accept_names_and_adhoc_definitions() {
        let request: ReportRequest = serde_json::from_value(json!({
            "metrics": [
                "revenue",
                {"name": "rpl", "formula": "{revenue} / {leads}", "rounding": 2}
            ],
            "dimensions": ["partner_name"]
        }))
        .unwrap();
        assert_eq!(request.metrics.len(), 2);
        match &request.metrics[1] {
            MetricSpec::AdHoc(adhoc) => {
                assert_eq!(adhoc.name, "rpl");
                assert_eq!(adhoc.rounding, Some(2));
            }
            other => panic!("expected adhoc metric, got {other:?}"),
        }
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = ReportRequest {
            metrics: vec![MetricSpec::Name("revenue".to_string())],
            dimensions: vec!["partner_name".to_string()],
            criteria: vec![Criterion::new(
                "campaign_name",
                CriteriaOp::Neq,
                json!("Campaign 2B"),
            )],
            row_filters: vec![RowFilter::new("revenue", RowFilterOp::Gt, json!(11))],
            rollup: Some(Rollup::Totals),
            pivot: vec![],
            order_by: vec![OrderBy {
                field: "revenue".to_string(),
                direction: SortDirection::Desc,
            }],
            limit: Some(10),
            limit_first: false,
        };
        let value = serde_json::to_value(&request).unwrap();
        let parsed: ReportRequest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.dimensions, vec!["partner_name"]);
        assert_eq!(parsed.rollup, Some(Rollup::Totals));
        assert_eq!(parsed.order_by[0].field, "revenue");
        assert_eq!(parsed.limit, Some(10));
    }
}
