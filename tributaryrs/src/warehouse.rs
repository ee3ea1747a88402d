//! The warehouse: an ordered collection of datasources with global field
//! definitions, integrity checks, and table-set selection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::Value;

use crate::config::{EngineConfig, WarehouseConfig};
use crate::datasource::{DataSource, TableSet};
use crate::error::{Result, TributaryError};
use crate::field::{
    expand_formula, Dimension, FieldManager, Metric, RESERVED_FIELD_NAMES,
};
use crate::model::MetadataStore;
use crate::report::{Report, ReportRequest, ReportResult};

#[derive(Debug)]
pub struct Warehouse {
    datasources: Vec<Arc<DataSource>>,
    metrics: BTreeMap<String, Arc<Metric>>,
    dimensions: BTreeMap<String, Arc<Dimension>>,
    ds_priority: Vec<String>,
    engine: EngineConfig,
    config: Option<WarehouseConfig>,
    supported_dims_cache: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl FieldManager for Warehouse {
    fn metric_map(&self) -> &BTreeMap<String, Arc<Metric>> {
        &self.metrics
    }

    fn dimension_map(&self) -> &BTreeMap<String, Arc<Dimension>> {
        &self.dimensions
    }

    fn child_managers(&self) -> Vec<&dyn FieldManager> {
        self.datasources
            .iter()
            .map(|ds| ds.as_ref() as &dyn FieldManager)
            .collect()
    }
}

impl Warehouse {
    /// Build a warehouse from datasources created elsewhere.
    pub fn new(datasources: Vec<Arc<DataSource>>, engine: EngineConfig) -> Result<Self> {
        engine.validate()?;
        if datasources.is_empty() {
            return Err(TributaryError::Config(
                "no datasources provided".to_string(),
            ));
        }
        let ds_priority = datasources.iter().map(|ds| ds.name().to_string()).collect();
        let wh = Warehouse {
            datasources,
            metrics: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            ds_priority,
            engine,
            config: None,
            supported_dims_cache: RwLock::new(HashMap::new()),
        };
        wh.run_integrity_checks(&[])?;
        Ok(wh)
    }

    /// Build a warehouse from a full config: datasources first so global
    /// formula fields can reference fields they define.
    pub async fn from_config(config: &WarehouseConfig, engine: EngineConfig) -> Result<Self> {
        engine.validate()?;
        let start = Instant::now();

        let mut datasources = Vec::new();
        for (name, ds_config) in &config.datasources {
            let ds = DataSource::new(name, ds_config, &engine).await?;
            datasources.push(Arc::new(ds));
        }
        if datasources.is_empty() {
            return Err(TributaryError::Config(
                "no datasources found in config".to_string(),
            ));
        }

        let ds_priority = match &config.ds_priority {
            Some(priority) => {
                if priority.len() != datasources.len() {
                    return Err(TributaryError::Config(
                        "length mismatch between ds_priority and datasources".to_string(),
                    ));
                }
                for name in priority {
                    if !datasources.iter().any(|ds| ds.name() == name) {
                        return Err(TributaryError::Config(format!(
                            "datasource {name} is in ds_priority but not configured"
                        )));
                    }
                }
                priority.clone()
            }
            None => datasources.iter().map(|ds| ds.name().to_string()).collect(),
        };

        let mut wh = Warehouse {
            datasources,
            metrics: BTreeMap::new(),
            dimensions: BTreeMap::new(),
            ds_priority,
            engine,
            config: Some(config.clone()),
            supported_dims_cache: RwLock::new(HashMap::new()),
        };
        wh.populate_global_fields(config)?;
        wh.run_integrity_checks(&[])?;

        tracing::info!(
            datasources = wh.datasources.len(),
            metrics = wh.metrics.len(),
            dimensions = wh.dimensions.len(),
            ms = start.elapsed().as_millis(),
            "warehouse ready"
        );
        Ok(wh)
    }

    /// Load a warehouse config file (YAML or JSON) and build from it.
    pub async fn from_config_path<P: AsRef<std::path::Path>>(
        path: P,
        engine: EngineConfig,
    ) -> Result<Self> {
        let config = WarehouseConfig::from_path(path)?;
        Self::from_config(&config, engine).await
    }

    fn populate_global_fields(&mut self, config: &WarehouseConfig) -> Result<()> {
        // Formula metrics are deferred so their references can be checked
        // against every field defined so far.
        let mut formula_metrics = Vec::new();
        for metric_cfg in &config.metrics {
            let metric = Metric::from_config(metric_cfg)?;
            if metric.is_formula() {
                formula_metrics.push(metric);
            } else {
                self.metrics.insert(metric.name.clone(), Arc::new(metric));
            }
        }
        for dim_cfg in &config.dimensions {
            let dim = Dimension::from_config(dim_cfg)?;
            self.dimensions.insert(dim.name.clone(), Arc::new(dim));
        }
        for metric in formula_metrics {
            let formula = metric.formula.as_deref().expect("formula metric");
            crate::sql::check_allowed_sql(formula)?;
            self.metrics
                .insert(metric.name.clone(), Arc::new(metric.clone()));
            if let Err(e) = expand_formula(self, &metric.name, formula) {
                self.metrics.remove(&metric.name);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn datasources(&self) -> &[Arc<DataSource>] {
        &self.datasources
    }

    pub fn datasource_names(&self) -> Vec<&str> {
        self.datasources.iter().map(|ds| ds.name()).collect()
    }

    pub fn datasource(&self, name: &str) -> Option<&Arc<DataSource>> {
        self.datasources.iter().find(|ds| ds.name() == name)
    }

    pub(crate) fn resolve_datasource(
        &self,
        name: &str,
        adhoc_datasources: &[Arc<DataSource>],
    ) -> Option<Arc<DataSource>> {
        self.datasource(name)
            .cloned()
            .or_else(|| adhoc_datasources.iter().find(|ds| ds.name() == name).cloned())
    }

    /// Add a datasource. Must not be called concurrently with `execute`.
    pub fn add_datasource(&mut self, ds: Arc<DataSource>, skip_integrity_checks: bool) -> Result<()> {
        tracing::debug!(datasource = ds.name(), "adding datasource");
        self.ds_priority.push(ds.name().to_string());
        self.datasources.push(ds);
        self.clear_supported_dimension_cache();
        if !skip_integrity_checks {
            self.run_integrity_checks(&[])?;
        }
        Ok(())
    }

    pub fn remove_datasource(&mut self, name: &str, skip_integrity_checks: bool) -> Result<()> {
        tracing::debug!(datasource = name, "removing datasource");
        self.datasources.retain(|ds| ds.name() != name);
        self.ds_priority.retain(|n| n != name);
        self.clear_supported_dimension_cache();
        if !skip_integrity_checks {
            self.run_integrity_checks(&[])?;
        }
        Ok(())
    }

    fn clear_supported_dimension_cache(&self) {
        self.supported_dims_cache
            .write()
            .expect("dimension cache poisoned")
            .clear();
    }

    /// Build and execute a report.
    pub async fn execute(&self, request: ReportRequest) -> Result<ReportResult> {
        self.execute_with_adhoc(request, Vec::new()).await
    }

    /// Build and execute a report with request-scoped datasources.
    pub async fn execute_with_adhoc(
        &self,
        request: ReportRequest,
        adhoc_datasources: Vec<Arc<DataSource>>,
    ) -> Result<ReportResult> {
        let start = Instant::now();
        let report = Report::new(self, request, adhoc_datasources)?;
        let result = report.execute().await;
        tracing::debug!(ms = start.elapsed().as_millis(), "warehouse report finished");
        result
    }

    /// Build a report without executing it, e.g. to kill it from another
    /// task or re-execute it.
    pub fn build_report(
        &self,
        request: ReportRequest,
        adhoc_datasources: Vec<Arc<DataSource>>,
    ) -> Result<Report<'_>> {
        Report::new(self, request, adhoc_datasources)
    }

    /// Persist this warehouse's config under a unique name.
    pub fn save(&self, store: &MetadataStore, name: &str, meta: Option<Value>) -> Result<i64> {
        let config = self.config.as_ref().ok_or_else(|| {
            TributaryError::Report(
                "only config-built warehouses can be saved".to_string(),
            )
        })?;
        store.save_warehouse(name, &serde_json::to_value(config)?, meta)
    }

    /// Load a saved warehouse by ID.
    pub async fn load(store: &MetadataStore, id: i64, engine: EngineConfig) -> Result<Self> {
        let record = store.load_warehouse(id)?;
        let config: WarehouseConfig = serde_json::from_value(record.params)?;
        Self::from_config(&config, engine).await
    }

    /// Find the best table set to satisfy a metric at a grain: per-DS
    /// candidates, best datasource by priority, fewest tables within it.
    pub fn get_metric_table_set(
        &self,
        metric: &str,
        grain: &BTreeSet<String>,
        dimension_grain: &BTreeSet<String>,
        adhoc_datasources: &[Arc<DataSource>],
    ) -> Result<TableSet> {
        tracing::debug!(metric, ?grain, "finding metric table set");
        let mut ds_table_sets: Vec<(String, Vec<TableSet>)> = Vec::new();
        for ds in self.all_datasources(adhoc_datasources) {
            let tables = ds.get_tables_with_field(metric);
            if tables.is_empty() {
                continue;
            }
            let sets = ds.find_possible_table_sets(&tables, metric, grain, dimension_grain);
            if !sets.is_empty() {
                ds_table_sets.push((ds.name().to_string(), sets));
            }
        }

        if ds_table_sets.is_empty() {
            return Err(TributaryError::UnsupportedGrain(
                self.unsupported_grain_msg(metric, grain, adhoc_datasources),
            ));
        }
        Ok(self.choose_best_table_set(ds_table_sets))
    }

    /// Table set for a dimension-only report: the first grain dimension
    /// with a viable set anchors the plan.
    pub fn get_dimension_table_set(
        &self,
        grain_ordered: &[String],
        grain: &BTreeSet<String>,
        dimension_grain: &BTreeSet<String>,
        adhoc_datasources: &[Arc<DataSource>],
    ) -> Result<TableSet> {
        tracing::debug!(?grain, "finding dimension table set");
        for dim in grain_ordered {
            let mut ds_table_sets: Vec<(String, Vec<TableSet>)> = Vec::new();
            for ds in self.all_datasources(adhoc_datasources) {
                let tables = ds.get_dim_tables_with_dim(dim);
                if tables.is_empty() {
                    continue;
                }
                let sets = ds.find_possible_table_sets(&tables, dim, grain, dimension_grain);
                if !sets.is_empty() {
                    ds_table_sets.push((ds.name().to_string(), sets));
                }
            }
            if !ds_table_sets.is_empty() {
                return Ok(self.choose_best_table_set(ds_table_sets));
            }
        }
        Err(TributaryError::UnsupportedGrain(format!(
            "no dimension table set found to meet grain: {grain:?}"
        )))
    }

    fn all_datasources<'a>(
        &'a self,
        adhoc_datasources: &'a [Arc<DataSource>],
    ) -> impl Iterator<Item = &'a Arc<DataSource>> {
        self.datasources.iter().chain(adhoc_datasources.iter())
    }

    fn choose_best_datasource(&self, names: &[String]) -> String {
        for ds_name in &self.ds_priority {
            if names.contains(ds_name) {
                return ds_name.clone();
            }
        }
        tracing::debug!("no datasource priority match, choosing first option");
        names[0].clone()
    }

    fn choose_best_table_set(&self, ds_table_sets: Vec<(String, Vec<TableSet>)>) -> TableSet {
        let names: Vec<String> = ds_table_sets.iter().map(|(name, _)| name.clone()).collect();
        let best_ds = self.choose_best_datasource(&names);
        let (_, sets) = ds_table_sets
            .into_iter()
            .find(|(name, _)| *name == best_ds)
            .expect("chosen datasource is present");
        sets.into_iter()
            .min_by_key(|ts| ts.table_count())
            .expect("nonempty table sets")
    }

    /// Every dimension reachable from any table providing the metric,
    /// including graph descendants. Cached per metric.
    pub fn supported_dimensions_for_metric(
        &self,
        metric: &str,
        adhoc_datasources: &[Arc<DataSource>],
    ) -> BTreeSet<String> {
        if adhoc_datasources.is_empty() {
            if let Some(cached) = self
                .supported_dims_cache
                .read()
                .expect("dimension cache poisoned")
                .get(metric)
            {
                return cached.clone();
            }
        }

        let mut dims = BTreeSet::new();
        for ds in self.all_datasources(adhoc_datasources) {
            for table in ds.get_tables_with_field(metric) {
                let mut tables = vec![table.name.clone()];
                tables.extend(ds.find_descendant_tables(&table.name));
                for table_name in tables {
                    if let Some(table) = ds.get_table(&table_name) {
                        for field in table.field_names() {
                            if self.has_dimension(&field) || ds.has_dimension(&field) {
                                dims.insert(field);
                            }
                        }
                    }
                }
            }
        }

        if adhoc_datasources.is_empty() {
            self.supported_dims_cache
                .write()
                .expect("dimension cache poisoned")
                .insert(metric.to_string(), dims.clone());
        }
        dims
    }

    fn unsupported_grain_msg(
        &self,
        metric: &str,
        grain: &BTreeSet<String>,
        adhoc_datasources: &[Arc<DataSource>],
    ) -> String {
        let supported = self.supported_dimensions_for_metric(metric, adhoc_datasources);
        let unsupported: Vec<&String> = grain.iter().filter(|d| !supported.contains(*d)).collect();
        if unsupported.is_empty() {
            format!("metric {metric} can not meet grain {grain:?} in any single datasource")
        } else {
            format!(
                "metric {metric} can not meet grain {grain:?} due to unsupported dimensions: {unsupported:?}"
            )
        }
    }

    /// Run the startup integrity checks, aggregating every failure.
    pub fn run_integrity_checks(&self, adhoc_datasources: &[Arc<DataSource>]) -> Result<()> {
        let mut errors = Vec::new();

        for ds in adhoc_datasources {
            if self.datasource(ds.name()).is_some() {
                errors.push(format!(
                    "ad-hoc datasource {} name conflicts with existing datasource",
                    ds.name()
                ));
            }
        }

        errors.extend(self.check_reserved_field_names(adhoc_datasources));
        errors.extend(self.check_conflicting_fields(adhoc_datasources));
        errors.extend(self.check_fields_have_definitions(adhoc_datasources));
        errors.extend(self.check_primary_key_dimensions(adhoc_datasources));
        errors.extend(self.check_weighting_metrics(adhoc_datasources));
        errors.extend(self.check_required_grain_references(adhoc_datasources));
        errors.extend(self.check_incomplete_dimension_references(adhoc_datasources));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TributaryError::WarehouseIntegrity(errors.join("\n")))
        }
    }

    fn scoped_managers<'a>(
        &'a self,
        adhoc_datasources: &'a [Arc<DataSource>],
    ) -> Vec<&'a DataSource> {
        self.all_datasources(adhoc_datasources)
            .map(|ds| ds.as_ref())
            .collect()
    }

    fn scoped_has_dimension(&self, name: &str, adhoc_datasources: &[Arc<DataSource>]) -> bool {
        self.has_dimension(name) || adhoc_datasources.iter().any(|ds| ds.has_dimension(name))
    }

    fn scoped_has_field(&self, name: &str, adhoc_datasources: &[Arc<DataSource>]) -> bool {
        self.has_field(name) || adhoc_datasources.iter().any(|ds| ds.has_field(name))
    }

    fn check_reserved_field_names(&self, adhoc: &[Arc<DataSource>]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut names = self.all_field_names();
        for ds in adhoc {
            names.extend(ds.all_field_names());
        }
        for name in names {
            if RESERVED_FIELD_NAMES.contains(&name.as_str()) {
                errors.push(format!("field name {name} is reserved"));
            }
        }
        errors
    }

    fn check_conflicting_fields(&self, adhoc: &[Arc<DataSource>]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut names = self.all_field_names();
        for ds in adhoc {
            names.extend(ds.all_field_names());
        }

        for name in names {
            let mut is_metric = false;
            let mut is_dimension = false;
            let mut metric_aggregations = BTreeSet::new();
            let mut numeric_flags = BTreeSet::new();

            let mut inspect_metric = |metric: &Metric| {
                is_metric = true;
                metric_aggregations.insert(format!("{:?}", metric.aggregation));
                if let Some(sa_type) = &metric.sa_type {
                    numeric_flags.insert(sa_type.is_numeric());
                }
            };
            if let Some(metric) = self.metrics.get(&name) {
                inspect_metric(metric);
            }
            for ds in self.scoped_managers(adhoc) {
                if let Some(metric) = ds.metric_map().get(&name) {
                    inspect_metric(metric);
                }
            }

            if self.dimensions.contains_key(&name) {
                is_dimension = true;
            }
            for ds in self.scoped_managers(adhoc) {
                if ds.dimension_map().contains_key(&name) {
                    is_dimension = true;
                }
            }

            if is_metric && is_dimension {
                errors.push(format!("field {name} is in both metrics and dimensions"));
            }
            if metric_aggregations.len() > 1 {
                errors.push(format!("field {name} has aggregation mismatches"));
            }
            if numeric_flags.len() > 1 {
                errors.push(format!("field {name} has data type mismatches"));
            }
        }
        errors
    }

    fn check_fields_have_definitions(&self, adhoc: &[Arc<DataSource>]) -> Vec<String> {
        let mut errors = Vec::new();
        for ds in self.scoped_managers(adhoc) {
            for table in ds.tables() {
                for column in table.columns.values() {
                    if !column.active {
                        continue;
                    }
                    for field in column.field_names() {
                        if !self.scoped_has_field(field, adhoc) {
                            errors.push(format!(
                                "field {field} for column {}->{} is not defined as a metric or dimension",
                                ds.name(),
                                column.fullname()
                            ));
                        }
                    }
                }
            }
        }
        errors
    }

    fn check_primary_key_dimensions(&self, adhoc: &[Arc<DataSource>]) -> Vec<String> {
        let mut errors = Vec::new();
        for ds in self.scoped_managers(adhoc) {
            for table in ds.tables() {
                let table_fields = table.field_names();
                for pk_field in &table.primary_key {
                    if !self.scoped_has_dimension(pk_field, adhoc) {
                        errors.push(format!(
                            "primary key field is not a dimension: {pk_field}"
                        ));
                    }
                    if !table_fields.contains(pk_field) {
                        errors.push(format!(
                            "primary key dimension {pk_field} is not in table {}",
                            table.name
                        ));
                    }
                }
            }
        }
        errors
    }

    fn check_weighting_metrics(&self, adhoc: &[Arc<DataSource>]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut metrics = self.all_metrics();
        for ds in adhoc {
            metrics.extend(ds.all_metrics());
        }

        for metric in metrics.values() {
            let Some(weighting) = &metric.weighting_metric else {
                continue;
            };
            if !metrics.contains_key(weighting) {
                errors.push(format!(
                    "metric {} references unknown weighting metric {weighting}",
                    metric.name
                ));
                continue;
            }
            for ds in self.scoped_managers(adhoc) {
                for table in ds.get_tables_with_field(&metric.name) {
                    if !table.field_names().contains(weighting) {
                        errors.push(format!(
                            "table {}->{} has metric {} but not weighting metric {weighting}",
                            ds.name(),
                            table.name,
                            metric.name
                        ));
                    }
                }
            }
        }
        errors
    }

    fn check_required_grain_references(&self, adhoc: &[Arc<DataSource>]) -> Vec<String> {
        let mut errors = Vec::new();
        let mut metrics = self.all_metrics();
        for ds in adhoc {
            metrics.extend(ds.all_metrics());
        }
        for metric in metrics.values() {
            for field in &metric.required_grain {
                if !self.scoped_has_dimension(field, adhoc) {
                    errors.push(format!(
                        "metric {} references unknown dimension {field} in required_grain",
                        metric.name
                    ));
                }
            }
        }
        for ds in self.scoped_managers(adhoc) {
            for table in ds.tables() {
                for column in table.columns.values() {
                    for field in &column.required_grain {
                        if !self.scoped_has_dimension(field, adhoc) {
                            errors.push(format!(
                                "column {}->{} references unknown dimension {field} in required_grain",
                                ds.name(),
                                column.fullname()
                            ));
                        }
                    }
                }
            }
        }
        errors
    }

    fn check_incomplete_dimension_references(&self, adhoc: &[Arc<DataSource>]) -> Vec<String> {
        let mut errors = Vec::new();
        for ds in self.scoped_managers(adhoc) {
            for table in ds.tables() {
                for field in &table.incomplete_dimensions {
                    if !self.scoped_has_dimension(field, adhoc) {
                        errors.push(format!(
                            "table {}->{} references unknown dimension {field} in incomplete_dimensions",
                            ds.name(),
                            table.name
                        ));
                    }
                }
            }
        }
        errors
    }
}
