//! Datasources: one SQL backend plus its table/column annotations, field
//! registry, and join graph.
//!
//! Table and column annotations are explicit records resolved at build
//! time from the config and the backend's introspected schema. The
//! possible-joins search turns an anchor table and a target grain into
//! candidate [`TableSet`]s by enumerating simple paths per dimension and
//! consolidating them into a minimal covering join.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;

use crate::backends::{self, BackendConnection};
use crate::config::{ColumnConfig, DataSourceConfig, EngineConfig, TableConfig, TableType};
use crate::dialect::{ConversionUnit, Dialect};
use crate::error::{Result, TributaryError};
use crate::field::{
    is_valid_field_name, Aggregation, Dimension, FieldManager, Metric,
};
use crate::graph::JoinGraph;
use crate::sql::{check_allowed_sql, contains_aggregation};
use crate::types::SqlType;

/// A field provided by a column, optionally through a dialect formula.
#[derive(Debug, Clone)]
pub struct FieldMapping {
    pub field: String,
    /// Fully rendered dialect fragment replacing the bare column.
    pub ds_formula: Option<String>,
    /// Set for generated conversion fields with criteria rewrites.
    pub conversion: Option<ConversionUnit>,
}

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub table: String,
    pub name: String,
    pub sa_type: SqlType,
    pub active: bool,
    pub primary_key: bool,
    pub allow_type_conversions: bool,
    pub type_conversion_prefix: Option<String>,
    pub required_grain: Vec<String>,
    pub fields: Vec<FieldMapping>,
}

impl ColumnMeta {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.field.as_str())
    }

    pub fn mapping(&self, field: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.field == field)
    }

    fn meets_grain(&self, dimension_grain: &BTreeSet<String>) -> bool {
        self.required_grain
            .iter()
            .all(|d| dimension_grain.contains(d))
    }
}

#[derive(Debug, Clone)]
pub struct TableMeta {
    pub name: String,
    pub table_type: TableType,
    pub primary_key: Vec<String>,
    pub parent: Option<String>,
    pub create_fields: bool,
    pub incomplete_dimensions: Vec<String>,
    pub columns: BTreeMap<String, ColumnMeta>,
}

impl TableMeta {
    /// Fields exposed by the table's active columns.
    pub fn field_names(&self) -> BTreeSet<String> {
        self.columns
            .values()
            .filter(|c| c.active)
            .flat_map(|c| c.field_names().map(str::to_string))
            .collect()
    }

    pub fn column_for_field(&self, field: &str) -> Option<&ColumnMeta> {
        self.columns
            .values()
            .find(|c| c.active && c.mapping(field).is_some())
    }

    /// Like [`column_for_field`](Self::column_for_field) but skipping
    /// columns whose `required_grain` is not met by the report.
    pub fn column_for_field_at_grain(
        &self,
        field: &str,
        dimension_grain: &BTreeSet<String>,
    ) -> Option<&ColumnMeta> {
        self.columns
            .values()
            .find(|c| c.active && c.meets_grain(dimension_grain) && c.mapping(field).is_some())
    }
}

/// A qualified column reference inside one datasource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

/// One hop of a join: a pair of adjacent tables (or a single-table
/// placeholder) plus the dimension names joined on.
#[derive(Debug, Clone)]
pub struct JoinPart {
    pub table_names: Vec<String>,
    pub join_fields: Vec<String>,
}

/// A group of join parts used together, with a map of the requested
/// fields this join is meant to satisfy. Identity is the ordered table
/// set.
#[derive(Debug, Clone)]
pub struct Join {
    pub table_names: Vec<String>,
    pub join_parts: Vec<JoinPart>,
    pub field_map: BTreeMap<String, ColumnRef>,
}

impl PartialEq for Join {
    fn eq(&self, other: &Self) -> bool {
        self.table_names == other.table_names
    }
}

impl Eq for Join {}

impl Hash for Join {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table_names.hash(state);
    }
}

impl Join {
    fn from_path(ds: &DataSource, path: &[String], field_map: BTreeMap<String, ColumnRef>) -> Self {
        let mut join_parts = Vec::new();
        if path.len() == 1 {
            // A placeholder join that is really just a single table.
            join_parts.push(JoinPart {
                table_names: path.to_vec(),
                join_fields: Vec::new(),
            });
        } else {
            for pair in path.windows(2) {
                let join_fields = ds
                    .graph
                    .edge_fields(&pair[0], &pair[1])
                    .unwrap_or_default();
                join_parts.push(JoinPart {
                    table_names: pair.to_vec(),
                    join_fields,
                });
            }
        }

        let mut table_names = Vec::new();
        for part in &join_parts {
            for table in &part.table_names {
                if !table_names.contains(table) {
                    table_names.push(table.clone());
                }
            }
        }

        Join {
            table_names,
            join_parts,
            field_map,
        }
    }

    /// Merge a combination of joins sharing an anchor into one join whose
    /// parts cover the union of their tables.
    fn merge(joins: Vec<Join>) -> Join {
        let mut table_names: Vec<String> = Vec::new();
        let mut join_parts = Vec::new();
        let mut field_map = BTreeMap::new();
        let mut seen_parts: BTreeSet<Vec<String>> = BTreeSet::new();

        for join in joins {
            for part in join.join_parts {
                if part.table_names.len() > 1 && !seen_parts.insert(part.table_names.clone()) {
                    continue;
                }
                join_parts.push(part);
            }
            for table in join.table_names {
                if !table_names.contains(&table) {
                    table_names.push(table);
                }
            }
            for (field, column) in join.field_map {
                field_map.entry(field).or_insert(column);
            }
        }

        Join {
            table_names,
            join_parts,
            field_map,
        }
    }

    /// Every field any table in this join can provide.
    pub fn covered_fields(&self, ds: &DataSource) -> BTreeSet<String> {
        let mut fields = BTreeSet::new();
        for table_name in &self.table_names {
            if let Some(table) = ds.get_table(table_name) {
                fields.extend(table.field_names());
            }
        }
        fields
    }

    /// Bind a field to the first join table exposing it.
    pub fn add_field(&mut self, ds: &DataSource, field: &str) -> Result<()> {
        if self.field_map.contains_key(field) {
            return Ok(());
        }
        for table_name in &self.table_names {
            if let Some(table) = ds.get_table(table_name) {
                if let Some(column) = table.column_for_field(field) {
                    self.field_map.insert(
                        field.to_string(),
                        ColumnRef {
                            table: table_name.clone(),
                            column: column.name.clone(),
                        },
                    );
                    return Ok(());
                }
            }
        }
        Err(TributaryError::Report(format!(
            "field {field} is not in any join table: {:?}",
            self.table_names
        )))
    }

    pub fn add_fields<'f>(
        &mut self,
        ds: &DataSource,
        fields: impl IntoIterator<Item = &'f String>,
    ) -> Result<()> {
        for field in fields {
            self.add_field(ds, field)?;
        }
        Ok(())
    }
}

/// A candidate plan fragment: anchor table plus an optional join covering
/// a target grain.
#[derive(Debug, Clone)]
pub struct TableSet {
    pub datasource: String,
    pub ds_table: String,
    pub join: Option<Join>,
    pub grain: BTreeSet<String>,
    pub target_fields: BTreeSet<String>,
}

impl TableSet {
    pub fn table_count(&self) -> usize {
        self.join.as_ref().map(|j| j.table_names.len()).unwrap_or(1)
    }

    /// Fields the anchor table can provide, used to piggyback additional
    /// metrics onto an existing query.
    pub fn covered_fields(&self, ds: &DataSource) -> BTreeSet<String> {
        ds.get_table(&self.ds_table)
            .map(|t| t.field_names())
            .unwrap_or_default()
    }
}

pub struct DataSource {
    name: String,
    backend: Arc<dyn BackendConnection>,
    metrics: BTreeMap<String, Arc<Metric>>,
    dimensions: BTreeMap<String, Arc<Dimension>>,
    tables: BTreeMap<String, TableMeta>,
    graph: JoinGraph,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("name", &self.name)
            .field("metrics", &self.metrics)
            .field("dimensions", &self.dimensions)
            .field("tables", &self.tables)
            .field("graph", &self.graph)
            .finish()
    }
}

impl FieldManager for DataSource {
    fn metric_map(&self) -> &BTreeMap<String, Arc<Metric>> {
        &self.metrics
    }

    fn dimension_map(&self) -> &BTreeMap<String, Arc<Dimension>> {
        &self.dimensions
    }
}

impl DataSource {
    /// Build a datasource from config: connect the backend, introspect the
    /// configured tables, resolve annotations, inject conversion fields,
    /// populate the field registry, and build the join graph.
    pub async fn new(name: &str, config: &DataSourceConfig, engine: &EngineConfig) -> Result<Self> {
        check_datasource_name(name)?;
        let backend = backends::connect(&config.connect)?;
        Self::from_backend(name, backend, config, engine).await
    }

    pub async fn from_backend(
        name: &str,
        backend: Arc<dyn BackendConnection>,
        config: &DataSourceConfig,
        engine: &EngineConfig,
    ) -> Result<Self> {
        check_datasource_name(name)?;
        let mut ds = DataSource {
            name: name.to_string(),
            backend,
            metrics: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            tables: BTreeMap::new(),
            graph: JoinGraph::new(engine.max_join_path_length),
        };

        for (table_name, table_cfg) in &config.tables {
            if !table_cfg.active {
                continue;
            }
            let table = ds.resolve_table(table_name, table_cfg).await?;
            ds.tables.insert(table_name.clone(), table);
        }

        ds.add_conversion_fields()?;
        ds.populate_fields(config)?;
        ds.build_graph()?;

        tracing::info!(
            datasource = name,
            tables = ds.tables.len(),
            metrics = ds.metrics.len(),
            dimensions = ds.dimensions.len(),
            "datasource ready"
        );
        Ok(ds)
    }

    async fn resolve_table(&self, table_name: &str, table_cfg: &TableConfig) -> Result<TableMeta> {
        let schema = self.backend.fetch_schema(table_name).await?;
        if schema.columns.is_empty() {
            return Err(TributaryError::Config(format!(
                "table {} not found in datasource {}",
                table_name, self.name
            )));
        }

        let mut columns = BTreeMap::new();
        for col in &schema.columns {
            let col_cfg = table_cfg.columns.get(&col.name);
            if col_cfg.is_none() && !table_cfg.create_fields {
                if col.primary_key {
                    return Err(TributaryError::Config(format!(
                        "primary key column {}.{} must have fields defined",
                        table_name, col.name
                    )));
                }
                continue;
            }

            let sa_type = SqlType::parse(&col.data_type)?;
            let default_cfg = ColumnConfig::default();
            let cfg = col_cfg.unwrap_or(&default_cfg);

            let mut fields = Vec::new();
            if cfg.fields.is_empty() {
                let field_name =
                    default_field_name(table_name, &col.name, table_cfg.use_full_column_names);
                is_valid_field_name(&field_name)?;
                fields.push(FieldMapping {
                    field: field_name,
                    ds_formula: None,
                    conversion: None,
                });
            } else {
                for field_cfg in &cfg.fields {
                    is_valid_field_name(&field_cfg.name)?;
                    let ds_formula = field_cfg
                        .ds_formula
                        .as_deref()
                        .map(|formula| self.render_ds_formula(formula, table_name, &col.name))
                        .transpose()?;
                    fields.push(FieldMapping {
                        field: field_cfg.name.clone(),
                        ds_formula,
                        conversion: None,
                    });
                }
            }

            columns.insert(
                col.name.clone(),
                ColumnMeta {
                    table: table_name.to_string(),
                    name: col.name.clone(),
                    sa_type,
                    active: cfg.active,
                    primary_key: col.primary_key,
                    allow_type_conversions: cfg.allow_type_conversions,
                    type_conversion_prefix: cfg.type_conversion_prefix.clone(),
                    required_grain: cfg.required_grain.clone(),
                    fields,
                },
            );
        }

        if !columns.values().any(|c| c.active) {
            return Err(TributaryError::Config(format!(
                "table {} has no active annotated columns",
                table_name
            )));
        }

        Ok(TableMeta {
            name: table_name.to_string(),
            table_type: table_cfg.table_type,
            primary_key: table_cfg.primary_key.clone(),
            parent: table_cfg.parent.clone(),
            create_fields: table_cfg.create_fields,
            incomplete_dimensions: table_cfg.incomplete_dimensions.clone(),
            columns,
        })
    }

    fn render_ds_formula(&self, formula: &str, table: &str, column: &str) -> Result<String> {
        check_allowed_sql(formula)?;
        Ok(formula.replace("{}", &self.column_sql(table, column)))
    }

    fn column_sql(&self, table: &str, column: &str) -> String {
        let dialect = self.backend.dialect();
        format!(
            "{}.{}",
            dialect.quote_ident(table),
            dialect.quote_ident(column)
        )
    }

    /// Add dialect conversion fields (year, month, ...) for date columns
    /// that allow them, registering the generated dimensions on this
    /// datasource.
    fn add_conversion_fields(&mut self) -> Result<()> {
        let dialect_conversions = self.backend.dialect().conversions();
        let mut new_dimensions: Vec<Dimension> = Vec::new();

        // Collect per-table prefixes first; tables borrow self immutably.
        let mut additions: Vec<(String, String, Vec<FieldMapping>, Vec<Dimension>)> = Vec::new();
        for table in self.tables.values() {
            let table_fields = table.field_names();
            for (col_name, col) in &table.columns {
                if !col.active || !col.allow_type_conversions || !col.sa_type.is_datelike() {
                    continue;
                }
                let prefix = col.type_conversion_prefix.clone().unwrap_or_default();

                let mut mappings = Vec::new();
                let mut dims = Vec::new();
                for conv in dialect_conversions {
                    if conv.datetime_only && !col.sa_type.is_datetime() {
                        continue;
                    }
                    let field_name = format!("{prefix}{}", conv.name);
                    is_valid_field_name(&field_name)?;
                    if table_fields.contains(&field_name) {
                        tracing::debug!(
                            field = %field_name,
                            column = %col.fullname(),
                            "skipping conversion field, already in table"
                        );
                        continue;
                    }
                    mappings.push(FieldMapping {
                        field: field_name.clone(),
                        ds_formula: Some(conv.render(&self.column_sql(&table.name, col_name))),
                        conversion: conv.unit,
                    });
                    dims.push(Dimension {
                        name: field_name,
                        sa_type: conv.sa_type.clone(),
                        formula: None,
                    });
                }
                additions.push((table.name.clone(), col_name.clone(), mappings, dims));
            }
        }

        for (table_name, col_name, mappings, dims) in additions {
            let table = self.tables.get_mut(&table_name).expect("table exists");
            let col = table.columns.get_mut(&col_name).expect("column exists");
            col.fields.extend(mappings);
            new_dimensions.extend(dims);
        }

        for dim in new_dimensions {
            if !self.has_field(&dim.name) {
                self.dimensions.insert(dim.name.clone(), Arc::new(dim));
            }
        }
        Ok(())
    }

    fn populate_fields(&mut self, config: &DataSourceConfig) -> Result<()> {
        for metric_cfg in &config.metrics {
            if metric_cfg.formula.is_some() {
                return Err(TributaryError::Config(format!(
                    "formula metric {} must be defined at the warehouse level",
                    metric_cfg.name
                )));
            }
            let metric = Metric::from_config(metric_cfg)?;
            self.metrics.insert(metric.name.clone(), Arc::new(metric));
        }
        for dim_cfg in &config.dimensions {
            let dim = Dimension::from_config(dim_cfg)?;
            self.dimensions.insert(dim.name.clone(), Arc::new(dim));
        }

        // Field inference from columns for create_fields tables.
        let mut inferred_metrics: Vec<Metric> = Vec::new();
        let mut inferred_dims: Vec<Dimension> = Vec::new();
        for table in self.tables.values() {
            if !table.create_fields {
                continue;
            }
            for col in table.columns.values() {
                if !col.active {
                    continue;
                }
                for mapping in &col.fields {
                    if self.has_field(&mapping.field)
                        || inferred_metrics.iter().any(|m| m.name == mapping.field)
                        || inferred_dims.iter().any(|d| d.name == mapping.field)
                    {
                        continue;
                    }
                    let metric_like = table.table_type == TableType::Metric
                        && is_probably_metric(col, mapping.ds_formula.as_deref());
                    if metric_like {
                        let (aggregation, rounding) = infer_aggregation_and_rounding(&col.sa_type);
                        inferred_metrics.push(Metric {
                            name: mapping.field.clone(),
                            sa_type: Some(col.sa_type.clone()),
                            aggregation,
                            rounding,
                            weighting_metric: None,
                            technical: None,
                            required_grain: Vec::new(),
                            formula: None,
                        });
                    } else {
                        if table.table_type == TableType::Dimension
                            && self.has_metric(&mapping.field)
                        {
                            return Err(TributaryError::Config(format!(
                                "dimension table {} has metric field {}",
                                table.name, mapping.field
                            )));
                        }
                        inferred_dims.push(Dimension {
                            name: mapping.field.clone(),
                            sa_type: col.sa_type.clone(),
                            formula: None,
                        });
                    }
                }
            }
        }
        for metric in inferred_metrics {
            tracing::debug!(datasource = %self.name, metric = %metric.name, "inferred metric");
            self.metrics.insert(metric.name.clone(), Arc::new(metric));
        }
        for dim in inferred_dims {
            tracing::debug!(datasource = %self.name, dimension = %dim.name, "inferred dimension");
            self.dimensions.insert(dim.name.clone(), Arc::new(dim));
        }
        Ok(())
    }

    fn build_graph(&mut self) -> Result<()> {
        let mut graph = JoinGraph::new(self.graph.max_path_len());
        for table in self.tables.values() {
            graph.add_table(&table.name);
            for neighbor in self.find_neighbor_tables(table)? {
                graph.add_join(&table.name, &neighbor.0, neighbor.1);
            }
        }
        self.graph = graph;
        Ok(())
    }

    /// Neighbors a table can join to: its parent, and (for metric tables)
    /// every dimension table whose primary key dimensions it contains.
    /// Join fields intersecting either side's `incomplete_dimensions` are
    /// not usable as join keys.
    fn find_neighbor_tables(&self, table: &TableMeta) -> Result<Vec<(String, Vec<String>)>> {
        let mut neighbors = Vec::new();
        let fields = table.field_names();

        if table.table_type == TableType::Metric {
            for dim_table in self
                .tables
                .values()
                .filter(|t| t.table_type == TableType::Dimension)
            {
                let pk = &dim_table.primary_key;
                if pk.is_empty() || !pk.iter().all(|f| fields.contains(f)) {
                    continue;
                }
                if join_fields_incomplete(table, dim_table, pk) {
                    continue;
                }
                neighbors.push((dim_table.name.clone(), pk.clone()));
            }
        }

        if let Some(parent_name) = &table.parent {
            let parent = self.tables.get(parent_name).ok_or_else(|| {
                TributaryError::Config(format!(
                    "table {} references unknown parent {}",
                    table.name, parent_name
                ))
            })?;
            let pk = &parent.primary_key;
            for pk_field in pk {
                if !fields.contains(pk_field) {
                    return Err(TributaryError::Config(format!(
                        "table {} is parent of {} but primary key {} is not in both",
                        parent_name, table.name, pk_field
                    )));
                }
            }
            if !join_fields_incomplete(table, parent, pk) {
                neighbors.push((parent_name.clone(), pk.clone()));
            }
        }

        Ok(neighbors)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn BackendConnection> {
        &self.backend
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.backend.dialect()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableMeta> {
        self.tables.values()
    }

    pub fn get_table(&self, name: &str) -> Option<&TableMeta> {
        self.tables.get(name)
    }

    pub fn get_tables_with_field(&self, field: &str) -> Vec<&TableMeta> {
        self.tables
            .values()
            .filter(|t| t.field_names().contains(field))
            .collect()
    }

    pub fn get_metric_tables_with_metric(&self, metric: &str) -> Vec<&TableMeta> {
        self.tables
            .values()
            .filter(|t| t.table_type == TableType::Metric && t.field_names().contains(metric))
            .collect()
    }

    pub fn get_dim_tables_with_dim(&self, dim: &str) -> Vec<&TableMeta> {
        self.tables
            .values()
            .filter(|t| t.table_type == TableType::Dimension && t.field_names().contains(dim))
            .collect()
    }

    pub fn get_columns_with_field(&self, field: &str) -> Vec<&ColumnMeta> {
        self.tables
            .values()
            .flat_map(|t| t.columns.values())
            .filter(|c| c.active && c.mapping(field).is_some())
            .collect()
    }

    /// Tables reachable from the given table through the join graph.
    pub fn find_descendant_tables(&self, table: &str) -> BTreeSet<String> {
        self.graph.descendants(table)
    }

    /// All joins from an anchor table to tables providing a dimension,
    /// one per simple path, each binding the dimension to the earliest
    /// table along the path that exposes it.
    fn find_joins_to_dimension(
        &self,
        anchor: &TableMeta,
        dimension: &str,
        dimension_grain: &BTreeSet<String>,
    ) -> Vec<Join> {
        let mut joins = Vec::new();
        let dim_columns: Vec<&ColumnMeta> = self
            .get_columns_with_field(dimension)
            .into_iter()
            .filter(|c| c.meets_grain(dimension_grain))
            .collect();
        let dim_column_tables: BTreeMap<&str, &ColumnMeta> = dim_columns
            .iter()
            .map(|c| (c.table.as_str(), *c))
            .collect();

        for column in &dim_columns {
            let paths = if column.table == anchor.name {
                Arc::new(vec![vec![anchor.name.clone()]])
            } else {
                self.graph.simple_paths(&anchor.name, &column.table)
            };

            for path in paths.iter() {
                // Bind the dimension to the first table along the path
                // that can provide it.
                let Some(bound) = path
                    .iter()
                    .find_map(|table_name| dim_column_tables.get(table_name.as_str()))
                else {
                    continue;
                };
                let mut field_map = BTreeMap::new();
                field_map.insert(
                    dimension.to_string(),
                    ColumnRef {
                        table: bound.table.clone(),
                        column: bound.name.clone(),
                    },
                );
                let join = Join::from_path(self, path, field_map);
                if !joins.iter().any(|existing| *existing == join) {
                    joins.push(join);
                }
            }
        }

        tracing::debug!(
            dimension,
            anchor = %anchor.name,
            candidates = joins.len(),
            "joins to dimension"
        );
        joins
    }

    /// Consolidate per-dimension candidate joins into one covering join.
    fn consolidate_field_joins(
        &self,
        grain: &BTreeSet<String>,
        field_joins: BTreeMap<String, Vec<Join>>,
    ) -> Option<Join> {
        // Invert dim -> [joins] into join -> {dims covered}.
        let mut join_fields: HashMap<Join, BTreeSet<String>> = HashMap::new();
        for (field, joins) in field_joins {
            for join in joins {
                join_fields
                    .entry(join)
                    .or_default()
                    .insert(field.clone());
            }
        }

        // Expand each join's coverage with any other grain dimensions it
        // happens to contain.
        let mut sorted: Vec<(Join, BTreeSet<String>)> = join_fields
            .into_iter()
            .map(|(join, mut covered)| {
                let all_covered = join.covered_fields(self);
                for field in grain {
                    if all_covered.contains(field) {
                        covered.insert(field.clone());
                    }
                }
                (join, covered)
            })
            .collect();

        // Most coverage first, fewest tables as a tiebreaker.
        sorted.sort_by(|a, b| {
            b.1.len()
                .cmp(&a.1.len())
                .then(a.0.table_names.len().cmp(&b.0.table_names.len()))
                .then(a.0.table_names.cmp(&b.0.table_names))
        });

        if sorted.is_empty() {
            return None;
        }

        if sorted[0].1.len() == grain.len() {
            // A single join covers the entire grain; the sort makes it
            // near-optimal.
            let (mut join, covered) = sorted.swap_remove(0);
            join.add_fields(self, &covered).ok()?;
            return Some(join);
        }

        let remaining = eliminate_redundant_joins(sorted);
        let candidates = find_join_combinations(&remaining, grain);
        let chosen = candidates.into_iter().min_by_key(|combo| {
            let mut tables: BTreeSet<&str> = BTreeSet::new();
            for idx in combo {
                tables.extend(remaining[*idx].0.table_names.iter().map(String::as_str));
            }
            tables.len()
        })?;

        let mut parts = Vec::new();
        let mut covered_fields: BTreeSet<String> = BTreeSet::new();
        for idx in chosen {
            let (join, covered) = &remaining[idx];
            parts.push(join.clone());
            covered_fields.extend(covered.iter().cloned());
        }
        let mut merged = Join::merge(parts);
        merged.add_fields(self, &covered_fields).ok()?;
        Some(merged)
    }

    /// Find a join plan from an anchor table covering the grain, or
    /// `None` when some dimension is unreachable.
    fn get_possible_join(
        &self,
        anchor: &TableMeta,
        grain: &BTreeSet<String>,
        dimension_grain: &BTreeSet<String>,
    ) -> Option<Join> {
        if grain.is_empty() {
            return None;
        }

        let mut field_joins: BTreeMap<String, Vec<Join>> = BTreeMap::new();
        for dimension in grain {
            let dim_joins = self.find_joins_to_dimension(anchor, dimension, dimension_grain);
            if dim_joins.is_empty() {
                tracing::debug!(
                    anchor = %anchor.name,
                    dimension,
                    "anchor cannot satisfy dimension"
                );
                return None;
            }
            field_joins.insert(dimension.clone(), dim_joins);
        }

        self.consolidate_field_joins(grain, field_joins)
    }

    /// Candidate table sets for a field at a grain, one per anchor table
    /// that can reach every grain dimension.
    pub fn find_possible_table_sets(
        &self,
        tables_with_field: &[&TableMeta],
        field: &str,
        grain: &BTreeSet<String>,
        dimension_grain: &BTreeSet<String>,
    ) -> Vec<TableSet> {
        let mut table_sets = Vec::new();
        for anchor in tables_with_field {
            if anchor
                .column_for_field_at_grain(field, dimension_grain)
                .is_none()
            {
                continue;
            }

            if grain.is_empty() || grain.iter().all(|d| anchor.field_names().contains(d)) {
                tracing::debug!(anchor = %anchor.name, ?grain, "full grain covered by anchor");
                table_sets.push(TableSet {
                    datasource: self.name.clone(),
                    ds_table: anchor.name.clone(),
                    join: None,
                    grain: grain.clone(),
                    target_fields: BTreeSet::from([field.to_string()]),
                });
                continue;
            }

            let Some(join) = self.get_possible_join(anchor, grain, dimension_grain) else {
                tracing::debug!(anchor = %anchor.name, ?grain, "anchor cannot meet grain");
                continue;
            };
            table_sets.push(TableSet {
                datasource: self.name.clone(),
                ds_table: anchor.name.clone(),
                join: Some(join),
                grain: grain.clone(),
                target_fields: BTreeSet::from([field.to_string()]),
            });
        }
        table_sets
    }
}

fn join_fields_incomplete(from: &TableMeta, to: &TableMeta, join_fields: &[String]) -> bool {
    join_fields.iter().any(|f| {
        from.incomplete_dimensions.contains(f) || to.incomplete_dimensions.contains(f)
    })
}

fn eliminate_redundant_joins(
    sorted: Vec<(Join, BTreeSet<String>)>,
) -> Vec<(Join, BTreeSet<String>)> {
    let mut delete: BTreeSet<usize> = BTreeSet::new();
    for (i, (join, covered)) in sorted.iter().enumerate() {
        if delete.contains(&i) {
            continue;
        }
        for (j, (other, other_covered)) in sorted.iter().enumerate() {
            if i == j || delete.contains(&j) {
                continue;
            }
            let is_subset = join
                .table_names
                .iter()
                .all(|t| other.table_names.contains(t));
            let has_unique = other_covered.difference(covered).next().is_some();
            if is_subset && !has_unique {
                delete.insert(j);
            }
        }
    }
    sorted
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !delete.contains(i))
        .map(|(_, jc)| jc)
        .collect()
}

/// Enumerate the powerset of joins and keep minimal combinations covering
/// the grain with no subset pairs. Indices refer into `joins`.
fn find_join_combinations(
    joins: &[(Join, BTreeSet<String>)],
    grain: &BTreeSet<String>,
) -> Vec<Vec<usize>> {
    // The candidate list is small after redundancy elimination; cap the
    // powerset to keep worst-case planning bounded.
    let n = joins.len().min(12);
    let mut candidates: Vec<Vec<usize>> = Vec::new();

    for mask in 1u32..(1 << n) {
        let combo: Vec<usize> = (0..n).filter(|i| mask & (1 << i) != 0).collect();

        let mut has_subsets = false;
        'outer: for &a in &combo {
            for &b in &combo {
                if a == b {
                    continue;
                }
                let subset = joins[b]
                    .0
                    .table_names
                    .iter()
                    .all(|t| joins[a].0.table_names.contains(t));
                if subset {
                    has_subsets = true;
                    break 'outer;
                }
            }
        }
        if has_subsets {
            continue;
        }

        let mut covered: BTreeSet<&str> = BTreeSet::new();
        for &idx in &combo {
            covered.extend(joins[idx].1.iter().map(String::as_str));
        }
        if covered.len() != grain.len() {
            continue;
        }

        // Drop combinations that strictly contain an existing candidate.
        let redundant = candidates.iter().any(|existing| {
            existing.iter().all(|idx| combo.contains(idx))
        });
        if redundant {
            continue;
        }
        candidates.push(combo);
    }

    candidates
}

fn default_field_name(table: &str, column: &str, use_full_column_names: bool) -> String {
    let name = if use_full_column_names {
        format!("{}_{}", table.replace('.', "_"), column)
    } else {
        column.to_string()
    };
    field_safe_name(&name)
}

fn field_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn check_datasource_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(TributaryError::Config(format!(
            "datasource name {name:?} has invalid characters"
        )));
    }
    Ok(())
}

fn is_probably_metric(col: &ColumnMeta, formula: Option<&str>) -> bool {
    if let Some(formula) = formula {
        if contains_aggregation(formula) {
            return true;
        }
    }
    if !col.sa_type.is_numeric() || col.primary_key {
        return false;
    }
    if col.name == "id" || col.name.ends_with("_id") || col.name.ends_with("Id") {
        return false;
    }
    true
}

fn infer_aggregation_and_rounding(sa_type: &SqlType) -> (Aggregation, Option<u32>) {
    if sa_type.is_integer() {
        return (Aggregation::Sum, Some(0));
    }
    if let SqlType::Decimal { precision, scale } = sa_type {
        if let (Some(precision), Some(scale)) = (precision, scale) {
            // Narrow decimals (e.g. rates) read better as means.
            let whole_digits = precision.saturating_sub(*scale);
            let aggregation = if whole_digits <= 1 {
                Aggregation::Mean
            } else {
                Aggregation::Sum
            };
            return (aggregation, Some(*scale));
        }
    }
    (Aggregation::Sum, None)
}

/// Literal row data materialized into a temp SQLite table so it can
/// participate in a single report as an ad-hoc datasource.
#[derive(Debug, Clone)]
pub struct AdHocDataTable {
    pub name: String,
    pub table_type: TableType,
    pub primary_key: Vec<String>,
    pub parent: Option<String>,
    pub columns: Vec<(String, SqlType)>,
    pub rows: Vec<Vec<Value>>,
}

pub struct AdHocDataSource {
    datasource: Arc<DataSource>,
    // Holds the backing file; dropped (and deleted) with the value.
    _db_file: tempfile::NamedTempFile,
}

impl AdHocDataSource {
    pub async fn new(
        name: &str,
        datatables: Vec<AdHocDataTable>,
        engine: &EngineConfig,
    ) -> Result<Self> {
        check_datasource_name(name)?;
        let db_file = tempfile::NamedTempFile::new()?;
        let path = db_file.path().to_path_buf();

        let tables = datatables.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = rusqlite::Connection::open(&path)?;
            for table in &tables {
                let column_defs: Vec<String> = table
                    .columns
                    .iter()
                    .map(|(name, ty)| format!("\"{}\" {}", name, ty.to_sqlite()))
                    .collect();
                conn.execute_batch(&format!(
                    "CREATE TABLE \"{}\" ({})",
                    table.name,
                    column_defs.join(", ")
                ))?;

                let placeholders: Vec<String> =
                    (0..table.columns.len()).map(|_| "?".to_string()).collect();
                let insert_sql = format!(
                    "INSERT INTO \"{}\" VALUES ({})",
                    table.name,
                    placeholders.join(", ")
                );
                let tx = conn.unchecked_transaction()?;
                {
                    let mut stmt = tx.prepare(&insert_sql)?;
                    for row in &table.rows {
                        let params: Vec<rusqlite::types::Value> =
                            row.iter().map(json_to_sqlite_value).collect();
                        stmt.execute(rusqlite::params_from_iter(params))?;
                    }
                }
                tx.commit()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| TributaryError::Execution(format!("task join error: {e}")))??;

        let mut table_configs = BTreeMap::new();
        for table in &datatables {
            table_configs.insert(
                table.name.clone(),
                TableConfig {
                    table_type: table.table_type,
                    active: true,
                    primary_key: table.primary_key.clone(),
                    parent: table.parent.clone(),
                    create_fields: true,
                    use_full_column_names: false,
                    incomplete_dimensions: Vec::new(),
                    columns: BTreeMap::new(),
                },
            );
        }
        let config = DataSourceConfig {
            connect: db_file.path().to_string_lossy().into_owned(),
            metrics: Vec::new(),
            dimensions: Vec::new(),
            tables: table_configs,
        };

        let datasource = DataSource::new(name, &config, engine).await?;
        Ok(Self {
            datasource: Arc::new(datasource),
            _db_file: db_file,
        })
    }

    pub fn datasource(&self) -> Arc<DataSource> {
        self.datasource.clone()
    }
}

pub(crate) fn json_to_sqlite_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                rusqlite::types::Value::Integer(i)
            } else {
                rusqlite::types::Value::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => rusqlite::types::Value::Text(s.clone()),
        other => rusqlite::types::Value::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_heuristics() {
        let col = |name: &str, sa_type: SqlType, pk: bool| ColumnMeta {
            table: "t".to_string(),
            name: name.to_string(),
            sa_type,
            active: true,
            primary_key: pk,
            allow_type_conversions: false,
            type_conversion_prefix: None,
            required_grain: Vec::new(),
            fields: Vec::new(),
        };
        assert!(is_probably_metric(
            &col("revenue", SqlType::parse("decimal(10,2)").unwrap(), false),
            None
        ));
        assert!(!is_probably_metric(&col("id", SqlType::Integer, true), None));
        assert!(!is_probably_metric(
            &col("lead_id", SqlType::Integer, false),
            None
        ));
        assert!(!is_probably_metric(
            &col("name", SqlType::VarChar(None), false),
            None
        ));
        // A formula with aggregation wins regardless of column type.
        assert!(is_probably_metric(
            &col("name", SqlType::VarChar(None), false),
            Some("COUNT(DISTINCT x)")
        ));
    }

    #[test]
    fn aggregation_inference() {
        assert_eq!(
            infer_aggregation_and_rounding(&SqlType::Integer),
            (Aggregation::Sum, Some(0))
        );
        assert_eq!(
            infer_aggregation_and_rounding(&SqlType::parse("decimal(10,2)").unwrap()),
            (Aggregation::Sum, Some(2))
        );
        assert_eq!(
            infer_aggregation_and_rounding(&SqlType::parse("decimal(3,2)").unwrap()),
            (Aggregation::Mean, Some(2))
        );
        assert_eq!(
            infer_aggregation_and_rounding(&SqlType::Double),
            (Aggregation::Sum, None)
        );
    }

    #[test]
    fn default_field_names() {
        assert_eq!(default_field_name("campaigns", "name", false), "name");
        assert_eq!(
            default_field_name("main.campaigns", "name", true),
            "main_campaigns_name"
        );
    }

    #[test]
    fn redundancy_elimination_drops_covered_superset_joins() {
        let join = |tables: &[&str]| Join {
            table_names: tables.iter().map(|t| t.to_string()).collect(),
            join_parts: Vec::new(),
            field_map: BTreeMap::new(),
        };
        let fields = |names: &[&str]| -> BTreeSet<String> {
            names.iter().map(|n| n.to_string()).collect()
        };

        let sorted = vec![
            (join(&["sales", "leads"]), fields(&["lead_id"])),
            (join(&["sales", "leads", "campaigns"]), fields(&["lead_id"])),
        ];
        let remaining = eliminate_redundant_joins(sorted);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0.table_names, vec!["sales", "leads"]);
    }

    #[test]
    fn join_combinations_cover_grain_without_subset_pairs() {
        let join = |tables: &[&str]| Join {
            table_names: tables.iter().map(|t| t.to_string()).collect(),
            join_parts: Vec::new(),
            field_map: BTreeMap::new(),
        };
        let fields = |names: &[&str]| -> BTreeSet<String> {
            names.iter().map(|n| n.to_string()).collect()
        };
        let grain = fields(&["a", "b"]);

        let joins = vec![
            (join(&["facts", "t1"]), fields(&["a"])),
            (join(&["facts", "t2"]), fields(&["b"])),
            (join(&["facts", "t3"]), fields(&["a", "b"])),
        ];
        let combos = find_join_combinations(&joins, &grain);
        // t3 alone covers; t1+t2 covers; t1+t2+t3 is a superset of both.
        assert!(combos.contains(&vec![2]));
        assert!(combos.contains(&vec![0, 1]));
        assert!(!combos.contains(&vec![0, 1, 2]));
    }

    #[test]
    fn incomplete_dimensions_block_join_fields() {
        let table = |name: &str, incomplete: &[&str]| TableMeta {
            name: name.to_string(),
            table_type: TableType::Metric,
            primary_key: Vec::new(),
            parent: None,
            create_fields: false,
            incomplete_dimensions: incomplete.iter().map(|d| d.to_string()).collect(),
            columns: BTreeMap::new(),
        };
        let keys = vec!["partner_id".to_string()];
        assert!(join_fields_incomplete(
            &table("facts", &["partner_id"]),
            &table("partners", &[]),
            &keys
        ));
        assert!(join_fields_incomplete(
            &table("facts", &[]),
            &table("partners", &["partner_id"]),
            &keys
        ));
        assert!(!join_fields_incomplete(
            &table("facts", &[]),
            &table("partners", &[]),
            &keys
        ));
    }

    #[test]
    fn merged_joins_dedupe_shared_parts() {
        let part = |a: &str, b: &str| JoinPart {
            table_names: vec![a.to_string(), b.to_string()],
            join_fields: vec!["k".to_string()],
        };
        let a = Join {
            table_names: vec!["sales".into(), "leads".into(), "campaigns".into()],
            join_parts: vec![part("sales", "leads"), part("leads", "campaigns")],
            field_map: BTreeMap::new(),
        };
        let b = Join {
            table_names: vec!["sales".into(), "leads".into(), "partners".into()],
            join_parts: vec![part("sales", "leads"), part("leads", "partners")],
            field_map: BTreeMap::new(),
        };
        let merged = Join::merge(vec![a, b]);
        assert_eq!(
            merged.table_names,
            vec!["sales", "leads", "campaigns", "partners"]
        );
        assert_eq!(merged.join_parts.len(), 3);
    }
}
