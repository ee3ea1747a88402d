//! SQL generation for datasource queries.
//!
//! A small SELECT AST rendered through a [`Dialect`](crate::dialect::Dialect)
//! for identifier quoting and literal/aggregate rendering, plus criteria
//! clause construction and the keyword scan applied to user-supplied
//! formula fragments.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::dialect::Dialect;
use crate::error::{Result, TributaryError};
use crate::field::Aggregation;

#[derive(Debug, Clone)]
pub enum SqlExpr {
    Column {
        table: String,
        name: String,
    },
    /// A pre-rendered fragment, e.g. a `ds_formula`.
    Raw(String),
    Literal(Value),
    IfNull {
        expr: Box<SqlExpr>,
        fallback: Box<SqlExpr>,
    },
    Aggregate {
        agg: Aggregation,
        expr: Box<SqlExpr>,
    },
    /// `SUM(1.0 * x * w) / SUM(w)`. The 1.0 factor defends against
    /// integer division in backends that round intermediate results.
    WeightedMean {
        value: Box<SqlExpr>,
        weight: Box<SqlExpr>,
    },
}

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: SqlExpr,
    pub alias: String,
}

#[derive(Debug, Clone)]
pub struct JoinClause {
    pub table: String,
    /// Equality conditions between already-joined columns and the new
    /// table's columns.
    pub on: Vec<(SqlExpr, SqlExpr)>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub select: Vec<SelectItem>,
    pub from: String,
    pub joins: Vec<JoinClause>,
    /// Rendered criteria fragments, AND-ed together.
    pub filters: Vec<String>,
    /// Number of leading projection positions to GROUP BY.
    pub group_by_positions: usize,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| {
                format!(
                    "{} AS {}",
                    self.render_expr(&item.expr),
                    self.dialect.quote_ident(&item.alias)
                )
            })
            .collect();

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_items.join(", "),
            self.dialect.quote_ident(&query.from)
        );

        for join in &query.joins {
            let on_clause: Vec<String> = join
                .on
                .iter()
                .map(|(left, right)| {
                    format!("{} = {}", self.render_expr(left), self.render_expr(right))
                })
                .collect();
            sql.push_str(&format!(
                " LEFT OUTER JOIN {} ON {}",
                self.dialect.quote_ident(&join.table),
                on_clause.join(" AND ")
            ));
        }

        if !query.filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", query.filters.join(" AND ")));
        }

        if query.group_by_positions > 0 {
            let positions: Vec<String> = (1..=query.group_by_positions)
                .map(|p| p.to_string())
                .collect();
            sql.push_str(&format!(" GROUP BY {}", positions.join(", ")));
        }

        sql
    }

    pub fn render_expr(&self, expr: &SqlExpr) -> String {
        match expr {
            SqlExpr::Column { table, name } => format!(
                "{}.{}",
                self.dialect.quote_ident(table),
                self.dialect.quote_ident(name)
            ),
            SqlExpr::Raw(fragment) => fragment.clone(),
            SqlExpr::Literal(v) => self.dialect.render_literal(v),
            SqlExpr::IfNull { expr, fallback } => self
                .dialect
                .render_ifnull(&self.render_expr(expr), &self.render_expr(fallback)),
            SqlExpr::Aggregate { agg, expr } => self
                .dialect
                .render_aggregation(*agg, &self.render_expr(expr)),
            SqlExpr::WeightedMean { value, weight } => {
                let value = self.render_expr(value);
                let weight = self.render_expr(weight);
                format!("SUM(1.0 * {value} * {weight}) / SUM({weight})")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriteriaOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not in")]
    NotIn,
    #[serde(rename = "between")]
    Between,
    #[serde(rename = "not between")]
    NotBetween,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "not like")]
    NotLike,
}

/// Normalize a criterion's value into the list form the clause builders
/// expect. Scalars become one-element lists.
pub fn criterion_values(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Build a criterion clause against a rendered column expression.
///
/// Multiple values OR together for positive operations and AND together
/// for negated ones. NULL is first-class: `= null` emits `IS NULL`,
/// `in [a, null]` becomes `x = a OR x IS NULL`.
pub fn criterion_sql(
    target: &str,
    op: CriteriaOp,
    values: &[Value],
    dialect: &dyn Dialect,
) -> Result<String> {
    if values.is_empty() {
        return Err(TributaryError::Report(format!(
            "criterion on {target} has no values"
        )));
    }

    let lit = |v: &Value| dialect.render_literal(v);
    let has_null = values.iter().any(Value::is_null);
    let mut use_or = true;

    let clauses: Vec<String> = match op {
        CriteriaOp::Eq => values
            .iter()
            .map(|v| {
                if v.is_null() {
                    format!("{target} IS NULL")
                } else {
                    format!("{target} = {}", lit(v))
                }
            })
            .collect(),
        CriteriaOp::Neq => values
            .iter()
            .map(|v| {
                if v.is_null() {
                    format!("{target} IS NOT NULL")
                } else {
                    format!("{target} != {}", lit(v))
                }
            })
            .collect(),
        CriteriaOp::Gt => values.iter().map(|v| format!("{target} > {}", lit(v))).collect(),
        CriteriaOp::Gte => values
            .iter()
            .map(|v| format!("{target} >= {}", lit(v)))
            .collect(),
        CriteriaOp::Lt => values.iter().map(|v| format!("{target} < {}", lit(v))).collect(),
        CriteriaOp::Lte => values
            .iter()
            .map(|v| format!("{target} <= {}", lit(v)))
            .collect(),
        CriteriaOp::In => {
            if has_null {
                values
                    .iter()
                    .map(|v| {
                        if v.is_null() {
                            format!("{target} IS NULL")
                        } else {
                            format!("{target} = {}", lit(v))
                        }
                    })
                    .collect()
            } else {
                let rendered: Vec<String> = values.iter().map(lit).collect();
                vec![format!("{target} IN ({})", rendered.join(", "))]
            }
        }
        CriteriaOp::NotIn => {
            use_or = false;
            if has_null {
                values
                    .iter()
                    .map(|v| {
                        if v.is_null() {
                            format!("{target} IS NOT NULL")
                        } else {
                            format!("{target} != {}", lit(v))
                        }
                    })
                    .collect()
            } else {
                let rendered: Vec<String> = values.iter().map(lit).collect();
                vec![format!("{target} NOT IN ({})", rendered.join(", "))]
            }
        }
        CriteriaOp::Between | CriteriaOp::NotBetween => {
            let negate = op == CriteriaOp::NotBetween;
            let bounds = between_bounds(target, values)?;
            vec![format!(
                "{target} {}BETWEEN {} AND {}",
                if negate { "NOT " } else { "" },
                lit(&bounds.0),
                lit(&bounds.1)
            )]
        }
        CriteriaOp::Like => values
            .iter()
            .map(|v| format!("{target} LIKE {}", lit(v)))
            .collect(),
        CriteriaOp::NotLike => {
            use_or = false;
            values
                .iter()
                .map(|v| format!("{target} NOT LIKE {}", lit(v)))
                .collect()
        }
    };

    let joined = if clauses.len() == 1 {
        clauses.into_iter().next().expect("nonempty clauses")
    } else if use_or {
        clauses.join(" OR ")
    } else {
        clauses.join(" AND ")
    };
    Ok(format!("({joined})"))
}

fn between_bounds(target: &str, values: &[Value]) -> Result<(Value, Value)> {
    // Accept either a 2-item value list or a single 2-item tuple value.
    let items: &[Value] = match values {
        [Value::Array(pair)] => pair,
        other => other,
    };
    match items {
        [low, high] => Ok((low.clone(), high.clone())),
        _ => Err(TributaryError::Report(format!(
            "between criterion on {target} requires exactly 2 values"
        ))),
    }
}

const FORBIDDEN_KEYWORDS: &[Keyword] = &[
    Keyword::SELECT,
    Keyword::INSERT,
    Keyword::UPDATE,
    Keyword::DELETE,
    Keyword::MERGE,
    Keyword::REPLACE,
    Keyword::CREATE,
    Keyword::ALTER,
    Keyword::DROP,
    Keyword::TRUNCATE,
    Keyword::GRANT,
    Keyword::REVOKE,
    Keyword::WITH,
    Keyword::ATTACH,
    Keyword::PRAGMA,
    Keyword::EXECUTE,
    Keyword::CALL,
    Keyword::UNION,
];

const AGGREGATION_FUNCS: &[&str] = &[
    "AVG", "SUM", "MIN", "MAX", "COUNT", "MEDIAN", "MODE", "STD", "STDDEV", "VAR", "VARIANCE",
];

fn tokenize_fragment(fragment: &str) -> Result<Vec<Token>> {
    // Formula templates carry {field} placeholders the tokenizer does not
    // understand; strip the braces and lex the names as identifiers.
    let cleaned = fragment.replace(['{', '}'], " ");
    Tokenizer::new(&GenericDialect {}, &cleaned)
        .tokenize()
        .map_err(|e| TributaryError::DisallowedSql(format!("could not lex {fragment:?}: {e}")))
}

/// Reject user-supplied SQL fragments containing statement keywords
/// (DML/DDL/CTE). Applied to `ds_formula`s and ad-hoc formulas before
/// planning completes.
pub fn check_allowed_sql(fragment: &str) -> Result<()> {
    for token in tokenize_fragment(fragment)? {
        if let Token::Word(word) = token {
            if FORBIDDEN_KEYWORDS.contains(&word.keyword) {
                return Err(TributaryError::DisallowedSql(format!(
                    "fragment {fragment:?} contains forbidden keyword {}",
                    word.value
                )));
            }
        }
    }
    Ok(())
}

/// Whether a fragment already aggregates, in which case the default
/// aggregation wrap must be skipped.
pub fn contains_aggregation(fragment: &str) -> bool {
    let tokens = match tokenize_fragment(fragment) {
        Ok(tokens) => tokens,
        Err(_) => return false,
    };
    tokens.iter().any(|token| match token {
        Token::Word(word) => AGGREGATION_FUNCS.contains(&word.value.to_uppercase().as_str()),
        _ => false,
    })
}
