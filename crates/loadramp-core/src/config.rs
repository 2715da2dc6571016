//! Run configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoadError, Result};
use crate::metrics::{names, MetricKind, DEFAULT_WINDOW};
use crate::profile::RampProfile;
use crate::threshold::{ThresholdConfig, ThresholdRule};
use crate::workload::WorkloadConfig;

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Broker endpoint settings
    pub broker: BrokerSettings,

    /// Arrival-rate ramp and pool bounds
    pub profile: RampProfile,

    /// Traffic shape
    pub workload: WorkloadConfig,

    /// Abort and pass/fail rules
    pub thresholds: Vec<ThresholdConfig>,

    /// Explicit statistic kind per metric name
    pub metric_kinds: HashMap<String, MetricKind>,

    /// Span of the sliding window thresholds and progress lines read
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Scheduler resolution
    #[serde(with = "humantime_serde")]
    pub tick: Duration,

    /// Base seed for worker random streams; entropy when absent
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            profile: RampProfile::default(),
            workload: WorkloadConfig::default(),
            thresholds: vec![
                ThresholdConfig::new(
                    names::GRPC_REQ_DURATION,
                    "p(95) < 10000",
                    true,
                    Duration::from_secs(10),
                ),
                ThresholdConfig::new(
                    names::FAILED_CONNECT_ATTEMPTS,
                    "rate < 2",
                    true,
                    Duration::from_secs(10),
                ),
            ],
            metric_kinds: HashMap::from([(
                names::FAILED_CONNECT_ATTEMPTS.to_string(),
                MetricKind::Counter,
            )]),
            window: DEFAULT_WINDOW,
            tick: Duration::from_millis(10),
            seed: None,
        }
    }
}

impl RunConfig {
    /// Check every invariant before anything starts
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.profile.validate()?;
        self.workload.validate()?;
        if self.tick.is_zero() {
            return Err(LoadError::Config("tick must be non-zero".into()));
        }
        if self.window.is_zero() {
            return Err(LoadError::Config("window must be non-zero".into()));
        }
        self.compile_thresholds().map(|_| ())
    }

    /// Kind a metric will be aggregated as, when known before the run
    pub fn metric_kind(&self, metric: &str) -> Option<MetricKind> {
        self.metric_kinds
            .get(metric)
            .copied()
            .or_else(|| names::builtin_kind(metric))
    }

    /// Parse every rule and check its statistic against the metric's kind
    pub fn compile_thresholds(&self) -> Result<Vec<ThresholdRule>> {
        self.thresholds
            .iter()
            .map(|config| {
                let rule = ThresholdRule::compile(config)?;
                match self.metric_kind(&rule.metric) {
                    Some(kind) if !kind.supports(rule.predicate.stat) => Err(LoadError::InvalidThreshold {
                        metric: rule.metric.clone(),
                        reason: format!("`{}` is not a statistic of a {} metric", rule.predicate.stat, kind),
                    }),
                    _ => Ok(rule),
                }
            })
            .collect()
    }
}

/// Where and how to reach the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// `host:port` or URI of the gRPC endpoint, or `memory` for the in-process broker
    pub target: String,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            target: "localhost:50043".to_string(),
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl BrokerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.target.trim().is_empty() {
            return Err(LoadError::Config("broker target must not be empty".into()));
        }
        if self.connect_timeout.is_zero() || self.call_timeout.is_zero() {
            return Err(LoadError::Config("broker timeouts must be non-zero".into()));
        }
        Ok(())
    }

    /// Full URI for the target, adding a scheme when missing
    pub fn uri(&self) -> String {
        if self.target.contains("://") {
            self.target.clone()
        } else {
            format!("http://{}", self.target)
        }
    }
}
