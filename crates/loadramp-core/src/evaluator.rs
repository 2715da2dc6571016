//! Metrics aggregation and threshold evaluation
//!
//! Samples arrive from every worker concurrently. All aggregate state sits
//! behind one lock, so the evaluator sees a single serialized sample stream
//! and the same ordered stream always produces the same aggregates.
//!
//! Rules read a sliding window of each metric (see [`Aggregate`]), so a long
//! healthy stretch cannot mask an outage. Summaries report run totals.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::metrics::{
    names, Aggregate, Check, CheckTally, MetricKind, MetricSample, MetricSnapshot, DEFAULT_WINDOW,
};
use crate::threshold::{RuleState, RuleStatus, Stat, ThresholdRule};

/// Why a run was aborted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortReason {
    /// Rendered rule, e.g. `checks: rate > 0.95`
    pub rule: String,
    pub metric: String,
    /// Statistic value that last violated the rule
    pub value: Option<f64>,
    /// Run time at which the abort was decided
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Final state of one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub threshold: String,
    pub abort_on_fail: bool,
    pub status: RuleStatus,
    pub last_value: Option<f64>,
}

/// Broker traffic over the current window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    /// Broker calls per second
    pub throughput: f64,
    /// Fraction of calls that failed, `None` when no call finished in the window
    pub error_rate: Option<f64>,
}

/// Everything the evaluator knows at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSnapshot {
    pub metrics: BTreeMap<String, MetricSnapshot>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub checks: BTreeMap<String, CheckTally>,
}

#[derive(Debug, Default)]
struct EvaluatorState {
    metrics: BTreeMap<String, Aggregate>,
    rules: Vec<RuleState>,
    checks: BTreeMap<Check, CheckTally>,
    aborted: Option<AbortReason>,
    ingested: u64,
}

/// Owns every aggregate and rule state of a run
pub struct Evaluator {
    rules: Vec<ThresholdRule>,
    rules_by_metric: HashMap<String, Vec<usize>>,
    kind_overrides: HashMap<String, MetricKind>,
    window: Duration,
    state: Mutex<EvaluatorState>,
}

impl Evaluator {
    pub fn new(rules: Vec<ThresholdRule>, kind_overrides: HashMap<String, MetricKind>) -> Self {
        let mut rules_by_metric: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            rules_by_metric.entry(rule.metric.clone()).or_default().push(i);
        }
        let state = EvaluatorState {
            rules: vec![RuleState::default(); rules.len()],
            ..Default::default()
        };
        Self {
            rules,
            rules_by_metric,
            kind_overrides,
            window: DEFAULT_WINDOW,
            state: Mutex::new(state),
        }
    }

    /// Evaluate rules over a window of `window` instead of the default second
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Aggregate a recorded sample stream from scratch
    pub fn replay<I>(rules: Vec<ThresholdRule>, kind_overrides: HashMap<String, MetricKind>, samples: I) -> Self
    where
        I: IntoIterator<Item = MetricSample>,
    {
        let evaluator = Self::new(rules, kind_overrides);
        for sample in samples {
            evaluator.ingest(sample);
        }
        evaluator
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Fold a sample into its metric and re-evaluate the rules that read it
    pub fn ingest(&self, sample: MetricSample) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.ingested += 1;
        let now = sample.timestamp;

        if !state.metrics.contains_key(&sample.metric) {
            let kind = self
                .kind_overrides
                .get(&sample.metric)
                .copied()
                .unwrap_or(sample.kind);
            debug!("Registered metric {} as {}", sample.metric, kind);
            self.reject_unsupported(state, &sample.metric, kind, now);
            state
                .metrics
                .insert(sample.metric.clone(), Aggregate::with_window(kind, self.window));
        }
        let Some(aggregate) = state.metrics.get_mut(&sample.metric) else {
            return;
        };
        aggregate.add(sample.value, now);

        let Some(indices) = self.rules_by_metric.get(&sample.metric) else {
            return;
        };
        let Some(aggregate) = state.metrics.get(&sample.metric) else {
            return;
        };
        for &i in indices {
            let rule = &self.rules[i];
            let Some(value) = aggregate.stat(rule.predicate.stat, now) else {
                continue;
            };
            let rule_state = &mut state.rules[i];
            rule_state.observe(rule, value, now);

            if state.aborted.is_none() && rule_state.abort_due(rule, now) {
                rule_state.triggered_at = Some(now);
                state.aborted = Some(abort_reason(rule, rule_state, now));
                warn!("Threshold {} triggered at {:?} (value {})", rule, now, value);
            }
        }
    }

    /// Fail every rule on `metric` whose statistic a `kind` aggregate cannot produce
    fn reject_unsupported(&self, state: &mut EvaluatorState, metric: &str, kind: MetricKind, now: Duration) {
        let Some(indices) = self.rules_by_metric.get(metric) else {
            return;
        };
        for &i in indices {
            let rule = &self.rules[i];
            if kind.supports(rule.predicate.stat) {
                continue;
            }
            warn!(
                "Threshold {} reads `{}`, which a {} metric does not have",
                rule, rule.predicate.stat, kind
            );
            let rule_state = &mut state.rules[i];
            rule_state.unsupported = true;
            if rule.abort_on_fail && state.aborted.is_none() {
                rule_state.triggered_at = Some(now);
                state.aborted = Some(abort_reason(rule, rule_state, now));
            }
        }
    }

    /// Record a check result: tallied per check and fed into the `checks` rate
    pub fn record_check(&self, check: Check, passed: bool, timestamp: Duration) {
        self.state.lock().checks.entry(check).or_default().record(passed);
        self.ingest(MetricSample::flag(names::CHECKS, passed, timestamp));
    }

    /// Abort decision polled by the scheduler before every tick
    pub fn check_abort(&self, now: Duration) -> Option<AbortReason> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.aborted {
            return Some(reason.clone());
        }
        let (i, rule) = self
            .rules
            .iter()
            .enumerate()
            .find(|(i, rule)| state.rules[*i].abort_due(rule, now))?;

        let rule_state = &mut state.rules[i];
        rule_state.triggered_at = Some(now);
        let reason = abort_reason(rule, rule_state, now);
        warn!("Threshold {} held past its {:?} grace period", rule, rule.grace_period);
        state.aborted = Some(reason.clone());
        Some(reason)
    }

    /// Number of samples ingested so far
    pub fn ingested(&self) -> u64 {
        self.state.lock().ingested
    }

    /// Throughput and error rate of broker calls over the window ending at `now`
    pub fn window_summary(&self, now: Duration) -> WindowSummary {
        let mut state = self.state.lock();
        let throughput = state
            .metrics
            .get_mut(names::GRPC_REQ_DURATION)
            .map_or(0.0, |agg| {
                agg.advance(now);
                agg.window_samples() as f64 / agg.window_span(now).as_secs_f64()
            });
        let error_rate = state.metrics.get_mut(names::GRPC_REQ_FAILED).and_then(|agg| {
            agg.advance(now);
            agg.stat(Stat::Rate, now)
        });
        WindowSummary {
            throughput,
            error_rate,
        }
    }

    /// Run totals of one metric, mostly for tests
    pub fn metric(&self, name: &str, now: Duration) -> Option<MetricSnapshot> {
        self.state.lock().metrics.get(name).map(|a| a.snapshot(now))
    }

    pub fn snapshot(&self, now: Duration) -> EvaluationSnapshot {
        let state = self.state.lock();
        let metrics = state
            .metrics
            .iter()
            .map(|(name, agg)| (name.clone(), agg.snapshot(now)))
            .collect();
        let thresholds = self
            .rules
            .iter()
            .zip(&state.rules)
            .map(|(rule, rs)| ThresholdOutcome {
                metric: rule.metric.clone(),
                threshold: rule.predicate.to_string(),
                abort_on_fail: rule.abort_on_fail,
                status: rs.status(),
                last_value: rs.last_value,
            })
            .collect();
        let checks = state
            .checks
            .iter()
            .map(|(check, tally)| (check.name().to_string(), *tally))
            .collect();

        EvaluationSnapshot {
            metrics,
            thresholds,
            checks,
        }
    }
}

fn abort_reason(rule: &ThresholdRule, state: &RuleState, now: Duration) -> AbortReason {
    AbortReason {
        rule: rule.to_string(),
        metric: rule.metric.clone(),
        value: state.last_value,
        elapsed: now,
    }
}
