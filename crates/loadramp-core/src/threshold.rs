//! Threshold rules: parsing, evaluation and grace-period tracking
//!
//! A rule is written as `<stat> <op> <bound>`, for example `p(95) < 10000`,
//! `p99 <= 250ms`, `rate < 0.05` or `count == 0`. Trend bounds are in
//! milliseconds; an `s` suffix scales the bound to milliseconds.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};

/// Statistic a predicate reads from an aggregate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Stat {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `(0, 100]`
    Percentile(f64),
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "count"),
            Self::Rate => write!(f, "rate"),
            Self::Avg => write!(f, "avg"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Med => write!(f, "med"),
            Self::Percentile(p) => write!(f, "p({})", p),
        }
    }
}

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

// Two-character operators first so `<=` is not read as `<`.
const OPERATORS: [(&str, Op); 6] = [
    ("<=", Op::Le),
    (">=", Op::Ge),
    ("==", Op::Eq),
    ("!=", Op::Ne),
    ("<", Op::Lt),
    (">", Op::Gt),
];

/// Parsed `<stat> <op> <bound>` expression
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predicate {
    pub stat: Stat,
    pub op: Op,
    pub bound: f64,
}

impl Predicate {
    pub fn parse(expr: &str) -> std::result::Result<Self, String> {
        let expr = expr.trim();
        let (at, symbol, op) = OPERATORS
            .iter()
            .filter_map(|(sym, op)| expr.find(sym).map(|at| (at, *sym, *op)))
            .min_by_key(|(at, sym, _)| (*at, std::cmp::Reverse(sym.len())))
            .ok_or_else(|| format!("no comparison operator in `{}`", expr))?;

        let stat = parse_stat(expr[..at].trim())?;
        let bound = parse_bound(expr[at + symbol.len()..].trim())?;
        Ok(Self { stat, op, bound })
    }

    /// Whether `value` satisfies the predicate
    pub fn holds(&self, value: f64) -> bool {
        self.op.apply(value, self.bound)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.stat, self.op.symbol(), self.bound)
    }
}

fn parse_stat(raw: &str) -> std::result::Result<Stat, String> {
    let stat = match raw {
        "count" => Stat::Count,
        "rate" => Stat::Rate,
        "avg" => Stat::Avg,
        "min" => Stat::Min,
        "max" => Stat::Max,
        "med" => Stat::Med,
        _ => {
            let digits = raw
                .strip_prefix("p(")
                .and_then(|r| r.strip_suffix(')'))
                .or_else(|| raw.strip_prefix('p'))
                .ok_or_else(|| format!("unknown statistic `{}`", raw))?;
            let p: f64 = digits
                .trim()
                .parse()
                .map_err(|_| format!("bad percentile `{}`", raw))?;
            if !(p > 0.0 && p <= 100.0) {
                return Err(format!("percentile {} outside (0, 100]", p));
            }
            Stat::Percentile(p)
        }
    };
    Ok(stat)
}

fn parse_bound(raw: &str) -> std::result::Result<f64, String> {
    let (number, scale) = if let Some(n) = raw.strip_suffix("ms") {
        (n, 1.0)
    } else if let Some(n) = raw.strip_suffix('s') {
        (n, 1000.0)
    } else {
        (raw, 1.0)
    };
    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| format!("bad bound `{}`", raw))?;
    if !value.is_finite() {
        return Err(format!("bound `{}` is not finite", raw));
    }
    Ok(value * scale)
}

/// Threshold as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub metric: String,
    pub threshold: String,
    #[serde(default)]
    pub abort_on_fail: bool,
    #[serde(default, with = "humantime_serde")]
    pub grace_period: Duration,
}

impl ThresholdConfig {
    pub fn new(metric: &str, threshold: &str, abort_on_fail: bool, grace_period: Duration) -> Self {
        Self {
            metric: metric.to_string(),
            threshold: threshold.to_string(),
            abort_on_fail,
            grace_period,
        }
    }
}

/// Compiled, immutable threshold rule
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdRule {
    pub metric: String,
    pub predicate: Predicate,
    pub abort_on_fail: bool,
    pub grace_period: Duration,
}

impl ThresholdRule {
    pub fn compile(config: &ThresholdConfig) -> Result<Self> {
        let predicate =
            Predicate::parse(&config.threshold).map_err(|reason| LoadError::InvalidThreshold {
                metric: config.metric.clone(),
                reason,
            })?;
        Ok(Self {
            metric: config.metric.clone(),
            predicate,
            abort_on_fail: config.abort_on_fail,
            grace_period: config.grace_period,
        })
    }
}

impl fmt::Display for ThresholdRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.predicate)
    }
}

/// Outcome of a rule at the end of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    /// Never evaluated: no sample of its metric arrived
    NoData,
    Passed,
    /// Violated at the end of the run, or unreadable on its metric
    Failed,
    /// Held violated past its grace period and aborted the run
    Triggered,
}

/// Mutable evaluation state of one rule, owned by the evaluator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleState {
    /// Start of the current continuous violation
    pub violated_since: Option<Duration>,
    pub last_value: Option<f64>,
    pub evaluations: u64,
    pub triggered_at: Option<Duration>,
    /// The metric's kind cannot produce the rule's statistic
    pub unsupported: bool,
}

impl RuleState {
    /// Feed the rule's current statistic, observed at `now`
    pub fn observe(&mut self, rule: &ThresholdRule, value: f64, now: Duration) {
        self.evaluations += 1;
        self.last_value = Some(value);
        if rule.predicate.holds(value) {
            self.violated_since = None;
        } else if self.violated_since.is_none() {
            self.violated_since = Some(now);
        }
    }

    /// Whether an abort rule has been violated continuously for its grace period
    pub fn abort_due(&self, rule: &ThresholdRule, now: Duration) -> bool {
        rule.abort_on_fail
            && self
                .violated_since
                .map_or(false, |since| now.saturating_sub(since) >= rule.grace_period)
    }

    pub fn status(&self) -> RuleStatus {
        if self.triggered_at.is_some() {
            RuleStatus::Triggered
        } else if self.unsupported {
            RuleStatus::Failed
        } else if self.evaluations == 0 {
            RuleStatus::NoData
        } else if self.violated_since.is_some() {
            RuleStatus::Failed
        } else {
            RuleStatus::Passed
        }
    }
}
