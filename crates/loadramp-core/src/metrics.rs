//! Metric samples and their aggregates

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use hdrhistogram::errors::{AdditionError, SubtractionError};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::threshold::Stat;

/// Names of the metrics emitted by the harness itself
pub mod names {
    use super::MetricKind;

    /// 1 when a connect attempt failed, 0 when it succeeded
    pub const FAILED_CONNECT_ATTEMPTS: &str = "failed_connect_attempts";
    /// Latency of every broker call, in milliseconds
    pub const GRPC_REQ_DURATION: &str = "grpc_req_duration";
    /// 1 when a broker call returned an error, 0 when it succeeded
    pub const GRPC_REQ_FAILED: &str = "grpc_req_failed";
    /// Wall time of a whole iteration, in milliseconds
    pub const ITERATION_DURATION: &str = "iteration_duration";
    /// Completed iterations
    pub const ITERATIONS: &str = "iterations";
    /// Scheduled starts that found no free worker
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    /// Pass/fail of every check
    pub const CHECKS: &str = "checks";

    /// Kind the harness emits a built-in metric as
    pub fn builtin_kind(metric: &str) -> Option<MetricKind> {
        match metric {
            FAILED_CONNECT_ATTEMPTS | GRPC_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
            GRPC_REQ_DURATION | ITERATION_DURATION => Some(MetricKind::Trend),
            ITERATIONS | DROPPED_ITERATIONS => Some(MetricKind::Counter),
            _ => None,
        }
    }
}

/// Statistic family a metric is aggregated as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Sum of values, also reported per second of run time
    Counter,
    /// Fraction of non-zero samples
    Rate,
    /// Distribution of values (latencies in milliseconds)
    Trend,
}

impl MetricKind {
    /// Whether an aggregate of this kind can produce `stat`
    pub fn supports(self, stat: Stat) -> bool {
        match stat {
            Stat::Count => true,
            Stat::Rate => matches!(self, Self::Counter | Self::Rate),
            Stat::Avg | Stat::Min | Stat::Max | Stat::Med | Stat::Percentile(_) => self == Self::Trend,
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Rate => write!(f, "rate"),
            Self::Trend => write!(f, "trend"),
        }
    }
}

/// One observation, never mutated after emission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    /// Kind the emitter intends; configuration may override it
    pub kind: MetricKind,
    pub value: f64,
    /// Offset from run start
    pub timestamp: Duration,
}

impl MetricSample {
    pub fn new(metric: impl Into<String>, kind: MetricKind, value: f64, timestamp: Duration) -> Self {
        Self {
            metric: metric.into(),
            kind,
            value,
            timestamp,
        }
    }

    /// Boolean sample for a rate metric
    pub fn flag(metric: impl Into<String>, value: bool, timestamp: Duration) -> Self {
        Self::new(metric, MetricKind::Rate, if value { 1.0 } else { 0.0 }, timestamp)
    }

    /// Increment of a counter
    pub fn count(metric: impl Into<String>, n: u64, timestamp: Duration) -> Self {
        Self::new(metric, MetricKind::Counter, n as f64, timestamp)
    }

    /// Latency sample recorded in milliseconds
    pub fn latency(metric: impl Into<String>, elapsed: Duration, timestamp: Duration) -> Self {
        Self::new(metric, MetricKind::Trend, elapsed.as_secs_f64() * 1000.0, timestamp)
    }
}

/// Fixed set of checks an iteration records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    PublishOk,
    FetchOk,
}

impl Check {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PublishOk => "publish_ok",
            Self::FetchOk => "fetch_ok",
        }
    }
}

/// Pass/fail tally of one check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passes: u64,
    pub fails: u64,
}

impl CheckTally {
    pub fn record(&mut self, passed: bool) {
        if passed {
            self.passes += 1;
        } else {
            self.fails += 1;
        }
    }
}

/// Span of the sliding window threshold rules read, unless configured otherwise
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Samples leave the window one bucket at a time
const WINDOW_BUCKETS: u32 = 10;

/// Counter rates are computed over at least this much run time
const MIN_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Trend values are kept in the histogram in microseconds
const TREND_SCALE: f64 = 1000.0;

fn new_histogram() -> Histogram<u64> {
    Histogram::new(3).expect("3 significant figures is a valid precision")
}

/// Sufficient statistics of a set of samples
#[derive(Debug, Clone)]
enum Tally {
    Counter {
        sum: f64,
        samples: u64,
    },
    Rate {
        passes: u64,
        samples: u64,
    },
    Trend {
        histogram: Histogram<u64>,
        samples: u64,
        sum: f64,
        min: f64,
        max: f64,
    },
}

impl Tally {
    fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter { sum: 0.0, samples: 0 },
            MetricKind::Rate => Self::Rate { passes: 0, samples: 0 },
            MetricKind::Trend => Self::Trend {
                histogram: new_histogram(),
                samples: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter { .. } => MetricKind::Counter,
            Self::Rate { .. } => MetricKind::Rate,
            Self::Trend { .. } => MetricKind::Trend,
        }
    }

    fn samples(&self) -> u64 {
        match self {
            Self::Counter { samples, .. } | Self::Rate { samples, .. } | Self::Trend { samples, .. } => {
                *samples
            }
        }
    }

    fn record(&mut self, value: f64) {
        match self {
            Self::Counter { sum, samples } => {
                *sum += value;
                *samples += 1;
            }
            Self::Rate { passes, samples } => {
                *samples += 1;
                if value != 0.0 {
                    *passes += 1;
                }
            }
            Self::Trend {
                histogram,
                samples,
                sum,
                min,
                max,
            } => {
                let value = value.max(0.0);
                histogram.saturating_record((value * TREND_SCALE).round() as u64);
                *samples += 1;
                *sum += value;
                *min = min.min(value);
                *max = max.max(value);
            }
        }
    }

    /// Fold another tally of the same kind in
    fn merge(&mut self, other: &Tally) -> Result<(), AdditionError> {
        match (self, other) {
            (Self::Counter { sum, samples }, Self::Counter { sum: s, samples: n }) => {
                *sum += s;
                *samples += n;
            }
            (Self::Rate { passes, samples }, Self::Rate { passes: p, samples: n }) => {
                *passes += p;
                *samples += n;
            }
            (
                Self::Trend {
                    histogram,
                    samples,
                    sum,
                    min,
                    max,
                },
                Self::Trend {
                    histogram: h,
                    samples: n,
                    sum: s,
                    min: lo,
                    max: hi,
                },
            ) => {
                histogram.add(h)?;
                *samples += n;
                *sum += s;
                *min = min.min(*lo);
                *max = max.max(*hi);
            }
            _ => {}
        }
        Ok(())
    }

    /// Take out a tally that was earlier recorded into this one
    fn remove(&mut self, other: &Tally) -> Result<(), SubtractionError> {
        match (self, other) {
            (Self::Counter { sum, samples }, Self::Counter { sum: s, samples: n }) => {
                *samples = samples.saturating_sub(*n);
                *sum = if *samples == 0 { 0.0 } else { *sum - s };
            }
            (Self::Rate { passes, samples }, Self::Rate { passes: p, samples: n }) => {
                *passes = passes.saturating_sub(*p);
                *samples = samples.saturating_sub(*n);
            }
            (
                Self::Trend {
                    histogram,
                    samples,
                    sum,
                    min,
                    max,
                },
                Self::Trend {
                    histogram: h,
                    samples: n,
                    sum: s,
                    ..
                },
            ) => {
                histogram.subtract(h)?;
                *samples = samples.saturating_sub(*n);
                if *samples == 0 {
                    *sum = 0.0;
                    *min = f64::INFINITY;
                    *max = f64::NEG_INFINITY;
                } else {
                    // extremes are only as exact as the histogram once samples leave
                    *sum -= s;
                    *min = histogram.min() as f64 / TREND_SCALE;
                    *max = histogram.max() as f64 / TREND_SCALE;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Value of `stat`; counter rates are per second of `span`
    fn value(&self, stat: Stat, span: Duration) -> Option<f64> {
        match (self, stat) {
            (Self::Counter { sum, .. }, Stat::Count) => Some(*sum),
            (Self::Counter { sum, .. }, Stat::Rate) => Some(*sum / span.as_secs_f64()),
            (Self::Rate { samples, .. }, Stat::Count) => Some(*samples as f64),
            (Self::Rate { passes, samples }, Stat::Rate) => {
                (*samples > 0).then(|| *passes as f64 / *samples as f64)
            }
            (Self::Trend { samples, .. }, Stat::Count) => Some(*samples as f64),
            (Self::Trend { samples: 0, .. }, _) => None,
            (Self::Trend { sum, samples, .. }, Stat::Avg) => Some(*sum / *samples as f64),
            (Self::Trend { min, .. }, Stat::Min) => Some(*min),
            (Self::Trend { max, .. }, Stat::Max) => Some(*max),
            (Self::Trend { histogram, .. }, Stat::Med) => {
                Some(histogram.value_at_quantile(0.5) as f64 / TREND_SCALE)
            }
            (Self::Trend { histogram, .. }, Stat::Percentile(p)) => {
                Some(histogram.value_at_quantile(p / 100.0) as f64 / TREND_SCALE)
            }
            _ => None,
        }
    }
}

/// Running aggregate for one metric
///
/// Keeps the run totals for the summary and a sliding window of time
/// buckets for threshold rules. A bucket leaves the window as a whole, so
/// the window covers between nine and ten tenths of its configured span.
#[derive(Debug, Clone)]
pub struct Aggregate {
    total: Tally,
    window: Tally,
    buckets: VecDeque<(u64, Tally)>,
    span: Duration,
    bucket_width: Duration,
    last_seen: Duration,
}

impl Aggregate {
    pub fn new(kind: MetricKind) -> Self {
        Self::with_window(kind, DEFAULT_WINDOW)
    }

    pub fn with_window(kind: MetricKind, window: Duration) -> Self {
        let span = window.max(Duration::from_millis(WINDOW_BUCKETS as u64));
        Self {
            total: Tally::new(kind),
            window: Tally::new(kind),
            buckets: VecDeque::new(),
            span,
            bucket_width: span / WINDOW_BUCKETS,
            last_seen: Duration::ZERO,
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.total.kind()
    }

    pub fn window(&self) -> Duration {
        self.span
    }

    fn bucket_index(&self, at: Duration) -> u64 {
        (at.as_nanos() / self.bucket_width.as_nanos()) as u64
    }

    /// Fold one sample value in
    pub fn add(&mut self, value: f64, timestamp: Duration) {
        self.advance(timestamp);
        self.last_seen = self.last_seen.max(timestamp);

        // a sample that lost the race to the lock joins the newest bucket
        let index = self
            .buckets
            .back()
            .map_or(0, |(i, _)| *i)
            .max(self.bucket_index(timestamp));
        let kind = self.kind();
        match self.buckets.back_mut() {
            Some((i, bucket)) if *i == index => bucket.record(value),
            _ => {
                let mut bucket = Tally::new(kind);
                bucket.record(value);
                self.buckets.push_back((index, bucket));
            }
        }
        self.total.record(value);
        self.window.record(value);
    }

    /// Slide the window so it ends at `now`
    pub fn advance(&mut self, now: Duration) {
        let oldest_live = self.bucket_index(now).saturating_sub(WINDOW_BUCKETS as u64 - 1);
        let mut rebuild = false;
        while let Some((index, _)) = self.buckets.front() {
            if *index >= oldest_live {
                break;
            }
            if let Some((_, bucket)) = self.buckets.pop_front() {
                if let Err(e) = self.window.remove(&bucket) {
                    debug!("Rebuilding window of {} metric: {}", self.kind(), e);
                    rebuild = true;
                }
            }
        }
        if rebuild {
            self.rebuild_window();
        }
    }

    fn rebuild_window(&mut self) {
        let mut window = Tally::new(self.kind());
        for (_, bucket) in &self.buckets {
            if let Err(e) = window.merge(bucket) {
                debug!("Skipping bucket while rebuilding window: {}", e);
            }
        }
        self.window = window;
    }

    /// Number of samples folded in over the whole run
    pub fn samples(&self) -> u64 {
        self.total.samples()
    }

    /// Number of samples inside the window
    pub fn window_samples(&self) -> u64 {
        self.window.samples()
    }

    /// Run time the window currently covers, never less than a second unless
    /// the window itself is shorter
    pub fn window_span(&self, now: Duration) -> Duration {
        now.max(self.last_seen).max(MIN_RATE_WINDOW).min(self.span)
    }

    /// Value a threshold rule reads. `count` is the run total; every other
    /// statistic covers the window. `None` when the statistic does not apply
    /// or the window holds no data.
    pub fn stat(&self, stat: Stat, now: Duration) -> Option<f64> {
        match stat {
            Stat::Count => self.total.value(stat, now),
            _ => self.window.value(stat, self.window_span(now)),
        }
    }

    /// Value of `stat` over the whole run
    pub fn total_stat(&self, stat: Stat, now: Duration) -> Option<f64> {
        let elapsed = now.max(self.last_seen).max(MIN_RATE_WINDOW);
        self.total.value(stat, elapsed)
    }

    /// Run totals reported in the summary
    pub fn snapshot(&self, now: Duration) -> MetricSnapshot {
        let mut values = BTreeMap::new();
        let stats: &[(&str, Stat)] = match self.kind() {
            MetricKind::Counter => &[("count", Stat::Count), ("rate", Stat::Rate)],
            MetricKind::Rate => &[("rate", Stat::Rate)],
            MetricKind::Trend => &[
                ("avg", Stat::Avg),
                ("min", Stat::Min),
                ("med", Stat::Med),
                ("max", Stat::Max),
                ("p(90)", Stat::Percentile(90.0)),
                ("p(95)", Stat::Percentile(95.0)),
                ("p(99)", Stat::Percentile(99.0)),
            ],
        };
        for (label, stat) in stats {
            if let Some(v) = self.total_stat(*stat, now) {
                values.insert(label.to_string(), v);
            }
        }
        if let Tally::Rate { passes, samples } = &self.total {
            values.insert("passes".to_string(), *passes as f64);
            values.insert("fails".to_string(), (*samples - *passes) as f64);
        }

        MetricSnapshot {
            kind: self.kind(),
            samples: self.samples(),
            values,
        }
    }
}

/// Reported state of one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub kind: MetricKind,
    pub samples: u64,
    pub values: BTreeMap<String, f64>,
}
