//! Technical computations: windowed post-aggregation math applied to
//! metric columns after the combined result is assembled.
//!
//! Parsed from shorthand strings of the form `TYPE[(arg1[, arg2])][:mode]`,
//! e.g. `mean(5,1):group`, `cumsum`, `boll(2):all`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TributaryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalType {
    Mean,
    Sum,
    Median,
    Min,
    Max,
    Std,
    Var,
    Boll,
    Diff,
    PctChange,
    Rank,
    PctRank,
    Cumsum,
    Cummin,
    Cummax,
}

impl TechnicalType {
    fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "mean" => TechnicalType::Mean,
            "sum" => TechnicalType::Sum,
            "median" => TechnicalType::Median,
            "min" => TechnicalType::Min,
            "max" => TechnicalType::Max,
            "std" => TechnicalType::Std,
            "var" => TechnicalType::Var,
            "boll" => TechnicalType::Boll,
            "diff" => TechnicalType::Diff,
            "pct_change" => TechnicalType::PctChange,
            "rank" => TechnicalType::Rank,
            "pct_rank" => TechnicalType::PctRank,
            "cumsum" => TechnicalType::Cumsum,
            "cummin" => TechnicalType::Cummin,
            "cummax" => TechnicalType::Cummax,
            other => {
                return Err(TributaryError::Config(format!(
                    "invalid technical type: {other}"
                )))
            }
        })
    }

    fn is_rolling(&self) -> bool {
        matches!(
            self,
            TechnicalType::Mean
                | TechnicalType::Sum
                | TechnicalType::Median
                | TechnicalType::Min
                | TechnicalType::Max
                | TechnicalType::Std
                | TechnicalType::Var
                | TechnicalType::Boll
        )
    }

    fn is_diff(&self) -> bool {
        matches!(self, TechnicalType::Diff | TechnicalType::PctChange)
    }
}

/// Whether the computation runs per dimension group or across all rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnicalMode {
    #[default]
    Group,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TechnicalParams {
    Rolling { window: usize, min_periods: usize },
    Diff { periods: usize },
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technical {
    pub ttype: TechnicalType,
    pub params: TechnicalParams,
    pub mode: TechnicalMode,
}

impl Technical {
    pub fn parse(val: &str) -> Result<Self> {
        let (body, mode) = match val.split_once(':') {
            Some((body, mode_str)) => {
                let mode = match mode_str.trim() {
                    "group" => TechnicalMode::Group,
                    "all" => TechnicalMode::All,
                    other => {
                        return Err(TributaryError::Config(format!(
                            "invalid technical mode: {other}"
                        )))
                    }
                };
                (body.trim(), mode)
            }
            None => (val.trim(), TechnicalMode::default()),
        };

        let (type_str, args) = match body.split_once('(') {
            Some((name, rest)) => {
                let inner = rest.trim_end_matches(')');
                let args: Vec<&str> = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .collect();
                (name.trim(), args)
            }
            None => (body, Vec::new()),
        };
        if type_str.is_empty() {
            return Err(TributaryError::Config(format!(
                "no technical type could be parsed from: {val}"
            )));
        }

        let ttype = TechnicalType::parse(type_str)?;
        let params = if ttype.is_rolling() {
            if args.is_empty() || args.len() > 2 {
                return Err(TributaryError::Config(format!(
                    "technical {type_str} takes 1 or 2 args: {val}"
                )));
            }
            let window = parse_arg(args[0], val)?;
            let min_periods = match args.get(1) {
                Some(a) => parse_arg(a, val)?,
                None => 1,
            };
            TechnicalParams::Rolling {
                window,
                min_periods,
            }
        } else if ttype.is_diff() {
            if args.len() > 1 {
                return Err(TributaryError::Config(format!(
                    "technical {type_str} takes at most 1 arg: {val}"
                )));
            }
            let periods = match args.first() {
                Some(a) => parse_arg(a, val)?,
                None => 1,
            };
            TechnicalParams::Diff { periods }
        } else {
            if !args.is_empty() {
                return Err(TributaryError::Config(format!(
                    "technical {type_str} takes no args: {val}"
                )));
            }
            TechnicalParams::None
        };

        Ok(Technical {
            ttype,
            params,
            mode,
        })
    }

    /// Run the computation over one slice of a metric column. Bollinger
    /// produces extra band columns; everything else replaces the input.
    pub fn compute(&self, values: &[Option<f64>]) -> TechnicalOutput {
        match self.ttype {
            TechnicalType::Mean
            | TechnicalType::Sum
            | TechnicalType::Median
            | TechnicalType::Min
            | TechnicalType::Max
            | TechnicalType::Std
            | TechnicalType::Var => {
                let (window, min_periods) = self.rolling_params();
                TechnicalOutput::Single(rolling(values, window, min_periods, |xs| {
                    rolling_stat(self.ttype, xs)
                }))
            }
            TechnicalType::Boll => {
                let (window, min_periods) = self.rolling_params();
                let mid = rolling(values, window, min_periods, |xs| {
                    rolling_stat(TechnicalType::Mean, xs)
                });
                let std = rolling(values, window, min_periods, |xs| {
                    rolling_stat(TechnicalType::Std, xs)
                });
                let lower = mid
                    .iter()
                    .zip(&std)
                    .map(|(m, s)| match (m, s) {
                        (Some(m), Some(s)) => Some(m - 2.0 * s),
                        _ => None,
                    })
                    .collect();
                let upper = mid
                    .iter()
                    .zip(&std)
                    .map(|(m, s)| match (m, s) {
                        (Some(m), Some(s)) => Some(m + 2.0 * s),
                        _ => None,
                    })
                    .collect();
                TechnicalOutput::Bollinger { mid, lower, upper }
            }
            TechnicalType::Diff | TechnicalType::PctChange => {
                let periods = match self.params {
                    TechnicalParams::Diff { periods } => periods,
                    _ => 1,
                };
                let out = values
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        let prev = i.checked_sub(periods).and_then(|j| values[j]);
                        match (v, prev) {
                            (Some(cur), Some(prev)) => {
                                if self.ttype == TechnicalType::Diff {
                                    Some(cur - prev)
                                } else if prev != 0.0 {
                                    Some((cur - prev) / prev)
                                } else {
                                    None
                                }
                            }
                            _ => None,
                        }
                    })
                    .collect();
                TechnicalOutput::Single(out)
            }
            TechnicalType::Rank | TechnicalType::PctRank => {
                TechnicalOutput::Single(rank(values, self.ttype == TechnicalType::PctRank))
            }
            TechnicalType::Cumsum | TechnicalType::Cummin | TechnicalType::Cummax => {
                let mut acc: Option<f64> = None;
                let out = values
                    .iter()
                    .map(|v| match v {
                        Some(x) => {
                            acc = Some(match (acc, self.ttype) {
                                (None, _) => *x,
                                (Some(a), TechnicalType::Cumsum) => a + x,
                                (Some(a), TechnicalType::Cummin) => a.min(*x),
                                (Some(a), _) => a.max(*x),
                            });
                            acc
                        }
                        None => None,
                    })
                    .collect();
                TechnicalOutput::Single(out)
            }
        }
    }

    fn rolling_params(&self) -> (usize, usize) {
        match self.params {
            TechnicalParams::Rolling {
                window,
                min_periods,
            } => (window, min_periods),
            _ => (1, 1),
        }
    }
}

pub enum TechnicalOutput {
    Single(Vec<Option<f64>>),
    Bollinger {
        mid: Vec<Option<f64>>,
        lower: Vec<Option<f64>>,
        upper: Vec<Option<f64>>,
    },
}

fn parse_arg(arg: &str, val: &str) -> Result<usize> {
    arg.parse::<usize>().map_err(|_| {
        TributaryError::Config(format!("invalid technical arg {arg:?} in {val}"))
    })
}

/// Trailing window over the present values; emits `None` until
/// `min_periods` non-null values are in the window.
fn rolling<F>(values: &[Option<f64>], window: usize, min_periods: usize, stat: F) -> Vec<Option<f64>>
where
    F: Fn(&[f64]) -> Option<f64>,
{
    let window = window.max(1);
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            let start = (i + 1).saturating_sub(window);
            let present: Vec<f64> = values[start..=i].iter().flatten().copied().collect();
            if present.len() < min_periods.max(1) {
                None
            } else {
                stat(&present)
            }
        })
        .collect()
}

fn rolling_stat(ttype: TechnicalType, xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let n = xs.len() as f64;
    match ttype {
        TechnicalType::Mean => Some(xs.iter().sum::<f64>() / n),
        TechnicalType::Sum => Some(xs.iter().sum()),
        TechnicalType::Min => xs.iter().copied().reduce(f64::min),
        TechnicalType::Max => xs.iter().copied().reduce(f64::max),
        TechnicalType::Median => {
            let mut sorted = xs.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 0 {
                Some((sorted[mid - 1] + sorted[mid]) / 2.0)
            } else {
                Some(sorted[mid])
            }
        }
        TechnicalType::Std | TechnicalType::Var => {
            // Sample variance, matching the usual dataframe default.
            if xs.len() < 2 {
                return None;
            }
            let mean = xs.iter().sum::<f64>() / n;
            let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
            if ttype == TechnicalType::Var {
                Some(var)
            } else {
                Some(var.sqrt())
            }
        }
        _ => None,
    }
}

/// Average rank over present values, ascending; ties share their mean rank.
fn rank(values: &[Option<f64>], pct: bool) -> Vec<Option<f64>> {
    let present: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|x| (i, x)))
        .collect();
    let mut order: Vec<usize> = (0..present.len()).collect();
    order.sort_by(|&a, &b| {
        present[a]
            .1
            .partial_cmp(&present[b].1)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut ranks = vec![None; values.len()];
    let count = present.len() as f64;
    let mut pos = 0;
    while pos < order.len() {
        let mut end = pos + 1;
        while end < order.len() && present[order[end]].1 == present[order[pos]].1 {
            end += 1;
        }
        // Ranks are 1-based; tied values share the mean of their span.
        let mean_rank = (pos + 1..=end).map(|r| r as f64).sum::<f64>() / (end - pos) as f64;
        for &idx in &order[pos..end] {
            let value = if pct { mean_rank / count } else { mean_rank };
            ranks[present[idx].0] = Some(value);
        }
        pos = end;
    }
    ranks
}
