//! Field models and the hierarchical field registry.
//!
//! Metrics and dimensions are registered on datasources and on the
//! warehouse; lookup falls through from the warehouse to its datasources
//! via the [`FieldManager`] trait. Formula metrics reference other fields
//! with `{name}` templates and expand recursively with a bounded depth.

use std::collections::BTreeSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{DimensionConfig, MetricConfig};
use crate::error::{Result, TributaryError};
use crate::technical::Technical;
use crate::types::SqlType;

pub const MAX_FORMULA_DEPTH: usize = 3;

/// Names claimed by the combined-result machinery.
pub const RESERVED_FIELD_NAMES: &[&str] = &["hash"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Sum,
    Mean,
    Count,
    CountDistinct,
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct Metric {
    pub name: String,
    /// `None` for formula metrics, which have no direct column binding.
    pub sa_type: Option<SqlType>,
    pub aggregation: Aggregation,
    pub rounding: Option<u32>,
    pub weighting_metric: Option<String>,
    pub technical: Option<Technical>,
    pub required_grain: Vec<String>,
    pub formula: Option<String>,
}

impl Metric {
    pub fn from_config(cfg: &MetricConfig) -> Result<Self> {
        is_valid_field_name(&cfg.name)?;
        if cfg.weighting_metric.is_some() && cfg.aggregation != Aggregation::Mean {
            return Err(TributaryError::Config(format!(
                "metric {}: weighting metrics require mean aggregation",
                cfg.name
            )));
        }
        if cfg.formula.is_none() && cfg.sa_type.is_none() {
            return Err(TributaryError::Config(format!(
                "metric {}: a type is required unless a formula is given",
                cfg.name
            )));
        }
        let technical = cfg
            .technical
            .as_deref()
            .map(Technical::parse)
            .transpose()?;
        Ok(Metric {
            name: cfg.name.clone(),
            sa_type: cfg.sa_type.clone(),
            aggregation: cfg.aggregation,
            rounding: cfg.rounding,
            weighting_metric: cfg.weighting_metric.clone(),
            technical,
            required_grain: cfg.required_grain.clone(),
            formula: cfg.formula.clone(),
        })
    }

    pub fn is_formula(&self) -> bool {
        self.formula.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: String,
    pub sa_type: SqlType,
    pub formula: Option<String>,
}

impl Dimension {
    pub fn from_config(cfg: &DimensionConfig) -> Result<Self> {
        is_valid_field_name(&cfg.name)?;
        Ok(Dimension {
            name: cfg.name.clone(),
            sa_type: cfg.sa_type.clone(),
            formula: cfg.formula.clone(),
        })
    }
}

/// Either side of the field namespace.
#[derive(Debug, Clone)]
pub enum Field {
    Metric(Arc<Metric>),
    Dimension(Arc<Dimension>),
}

impl Field {
    pub fn name(&self) -> &str {
        match self {
            Field::Metric(m) => &m.name,
            Field::Dimension(d) => &d.name,
        }
    }

    pub fn formula(&self) -> Option<&str> {
        match self {
            Field::Metric(m) => m.formula.as_deref(),
            Field::Dimension(d) => d.formula.as_deref(),
        }
    }

    pub fn required_grain(&self) -> &[String] {
        match self {
            Field::Metric(m) => &m.required_grain,
            Field::Dimension(_) => &[],
        }
    }
}

pub fn is_valid_field_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(TributaryError::InvalidField(format!(
            "field name {name:?} must match [A-Za-z0-9_]+"
        )));
    }
    Ok(())
}

static EMPTY_DIMENSIONS: Lazy<BTreeMap<String, Arc<Dimension>>> = Lazy::new(BTreeMap::new);

pub(crate) fn empty_dimension_map() -> &'static BTreeMap<String, Arc<Dimension>> {
    &EMPTY_DIMENSIONS
}

/// Hierarchical field lookup. The warehouse implements this with its
/// datasources as children; a report overlays its ad-hoc fields on top.
pub trait FieldManager {
    fn metric_map(&self) -> &BTreeMap<String, Arc<Metric>>;
    fn dimension_map(&self) -> &BTreeMap<String, Arc<Dimension>>;
    fn child_managers(&self) -> Vec<&dyn FieldManager> {
        Vec::new()
    }

    fn directly_has_metric(&self, name: &str) -> bool {
        self.metric_map().contains_key(name)
    }

    fn directly_has_dimension(&self, name: &str) -> bool {
        self.dimension_map().contains_key(name)
    }

    fn has_metric(&self, name: &str) -> bool {
        self.directly_has_metric(name)
            || self.child_managers().iter().any(|fm| fm.has_metric(name))
    }

    fn has_dimension(&self, name: &str) -> bool {
        self.directly_has_dimension(name)
            || self
                .child_managers()
                .iter()
                .any(|fm| fm.has_dimension(name))
    }

    fn has_field(&self, name: &str) -> bool {
        self.has_metric(name) || self.has_dimension(name)
    }

    fn get_metric(&self, name: &str) -> Result<Arc<Metric>> {
        if let Some(metric) = self.metric_map().get(name) {
            return Ok(metric.clone());
        }
        for fm in self.child_managers() {
            if fm.has_metric(name) {
                return fm.get_metric(name);
            }
        }
        Err(TributaryError::InvalidField(format!(
            "invalid metric name: {name}"
        )))
    }

    fn get_dimension(&self, name: &str) -> Result<Arc<Dimension>> {
        if let Some(dim) = self.dimension_map().get(name) {
            return Ok(dim.clone());
        }
        for fm in self.child_managers() {
            if fm.has_dimension(name) {
                return fm.get_dimension(name);
            }
        }
        Err(TributaryError::InvalidField(format!(
            "invalid dimension name: {name}"
        )))
    }

    fn get_field(&self, name: &str) -> Result<Field> {
        if self.has_metric(name) {
            return Ok(Field::Metric(self.get_metric(name)?));
        }
        if self.has_dimension(name) {
            return Ok(Field::Dimension(self.get_dimension(name)?));
        }
        Err(TributaryError::InvalidField(format!(
            "invalid field name: {name}"
        )))
    }

    /// All metrics visible from this manager, children merged under
    /// locally defined names.
    fn all_metrics(&self) -> BTreeMap<String, Arc<Metric>> {
        let mut merged: BTreeMap<String, Arc<Metric>> = BTreeMap::new();
        for fm in self.child_managers() {
            merged.extend(fm.all_metrics());
        }
        for (name, metric) in self.metric_map() {
            merged.insert(name.clone(), metric.clone());
        }
        merged
    }

    fn all_dimensions(&self) -> BTreeMap<String, Arc<Dimension>> {
        let mut merged: BTreeMap<String, Arc<Dimension>> = BTreeMap::new();
        for fm in self.child_managers() {
            merged.extend(fm.all_dimensions());
        }
        for (name, dim) in self.dimension_map() {
            merged.insert(name.clone(), dim.clone());
        }
        merged
    }

    fn all_field_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.all_metrics().into_keys().collect();
        names.extend(self.all_dimensions().into_keys());
        names
    }
}

/// Extract the `{token}` references from a formula template, in order of
/// first appearance.
pub fn formula_tokens(formula: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut rest = formula;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| {
            TributaryError::Config(format!("unbalanced braces in formula: {formula}"))
        })?;
        let token = &after[..end];
        is_valid_field_name(token)?;
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
        rest = &after[end + 1..];
    }
    Ok(tokens)
}

/// Recursively expand a formula into its non-formula leaf fields and a raw
/// formula referencing only those leaves. Depth is bounded by
/// [`MAX_FORMULA_DEPTH`]; cycles are rejected by set membership.
pub fn expand_formula(
    fm: &dyn FieldManager,
    name: &str,
    formula: &str,
) -> Result<(BTreeSet<String>, String)> {
    let mut visiting = BTreeSet::new();
    visiting.insert(name.to_string());
    expand_formula_inner(fm, name, formula, 0, &mut visiting)
}

fn expand_formula_inner(
    fm: &dyn FieldManager,
    name: &str,
    formula: &str,
    depth: usize,
    visiting: &mut BTreeSet<String>,
) -> Result<(BTreeSet<String>, String)> {
    if depth > MAX_FORMULA_DEPTH {
        return Err(TributaryError::MaxFormulaDepth(format!(
            "{name}: {formula}"
        )));
    }

    let mut leaves = BTreeSet::new();
    let mut expanded = formula.to_string();

    for token in formula_tokens(formula)? {
        let field = fm.get_field(&token)?;
        let replacement = match field.formula() {
            Some(sub_formula) => {
                if !visiting.insert(token.clone()) {
                    return Err(TributaryError::MaxFormulaDepth(format!(
                        "circular formula reference through {token}"
                    )));
                }
                let (sub_leaves, sub_expanded) =
                    expand_formula_inner(fm, &token, sub_formula, depth + 1, visiting)?;
                visiting.remove(&token);
                leaves.extend(sub_leaves);
                format!("({sub_expanded})")
            }
            None => {
                leaves.insert(token.clone());
                format!("{{{token}}}")
            }
        };
        expanded = expanded.replace(&format!("{{{token}}}"), &replacement);
    }

    Ok((leaves, expanded))
}

/// Resolve the leaf fields of any field: a formula field expands, a plain
/// field is its own leaf.
pub fn field_leaves(fm: &dyn FieldManager, field: &Field) -> Result<(BTreeSet<String>, Option<String>)> {
    match field.formula() {
        Some(formula) => {
            let (leaves, expanded) = expand_formula(fm, field.name(), formula)?;
            Ok((leaves, Some(expanded)))
        }
        None => {
            let mut leaves = BTreeSet::new();
            leaves.insert(field.name().to_string());
            Ok((leaves, None))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricConfig;

    struct TestManager {
        metrics: BTreeMap<String, Arc<Metric>>,
        dimensions: BTreeMap<String, Arc<Dimension>>,
    }

    impl FieldManager for TestManager {
        fn metric_map(&self) -> &BTreeMap<String, Arc<Metric>> {
            &self.metrics
        }
        fn dimension_map(&self) -> &BTreeMap<String, Arc<Dimension>> {
            &self.dimensions
        }
    }

    fn metric(name: &str, formula: Option<&str>) -> Arc<Metric> {
        Arc::new(Metric {
            name: name.to_string(),
            sa_type: formula.is_none().then(|| SqlType::Integer),
            aggregation: Aggregation::Sum,
            rounding: None,
            weighting_metric: None,
            technical: None,
            required_grain: Vec::new(),
            formula: formula.map(str::to_string),
        })
    }

    fn manager(metrics: Vec<Arc<Metric>>) -> TestManager {
        TestManager {
            metrics: metrics
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
            dimensions: BTreeMap::new(),
        }
    }

    #[test]
    fn formula_tokens_are_extracted_in_order() {
        let tokens = formula_tokens("1.0 * {revenue} / {leads}").unwrap();
        assert_eq!(tokens, vec!["revenue", "leads"]);
    }

    #[test]
    fn expands_nested_formulas_to_leaves() {
        let fm = manager(vec![
            metric("revenue", None),
            metric("leads", None),
            metric("rpl", Some("{revenue} / {leads}")),
            metric("rpl_squared", Some("{rpl} * {rpl}")),
        ]);
        let (leaves, expanded) =
            expand_formula(&fm, "rpl_squared", "{rpl} * {rpl}").unwrap();
        assert_eq!(
            leaves.into_iter().collect::<Vec<_>>(),
            vec!["leads", "revenue"]
        );
        assert_eq!(expanded, "({revenue} / {leads}) * ({revenue} / {leads})");
    }

    #[test]
    fn formula_depth_is_bounded() {
        let fm = manager(vec![
            metric("m0", None),
            metric("m1", Some("{m0} + 1")),
            metric("m2", Some("{m1} + 1")),
            metric("m3", Some("{m2} + 1")),
            metric("m4", Some("{m3} + 1")),
            metric("m5", Some("{m4} + 1")),
        ]);
        let err = expand_formula(&fm, "m5", "{m4} + 1").unwrap_err();
        assert!(matches!(err, TributaryError::MaxFormulaDepth(_)));
    }

    #[test]
    fn circular_formulas_are_rejected() {
        let fm = manager(vec![
            metric("a", Some("{b} + 1")),
            metric("b", Some("{a} + 1")),
        ]);
        let err = expand_formula(&fm, "a", "{b} + 1").unwrap_err();
        assert!(matches!(err, TributaryError::MaxFormulaDepth(_)));
    }

    #[test]
    fn weighting_requires_mean_aggregation() {
        let cfg = MetricConfig {
            name: "revenue".to_string(),
            sa_type: Some(SqlType::Integer),
            aggregation: Aggregation::Sum,
            rounding: None,
            weighting_metric: Some("quantity".to_string()),
            technical: None,
            formula: None,
            required_grain: Vec::new(),
        };
        assert!(Metric::from_config(&cfg).is_err());
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(is_valid_field_name("partner_name").is_ok());
        assert!(is_valid_field_name("bad name").is_err());
        assert!(is_valid_field_name("").is_err());
        assert!(is_valid_field_name("semi;colon").is_err());
    }
}
