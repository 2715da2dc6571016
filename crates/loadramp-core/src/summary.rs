//! Run summary and report rendering

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Gauge, GaugeVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::evaluator::{AbortReason, EvaluationSnapshot, ThresholdOutcome};
use crate::metrics::{CheckTally, MetricSnapshot};
use crate::scheduler::ScheduleReport;
use crate::threshold::RuleStatus;

/// Iteration counts of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IterationCounts {
    pub started: u64,
    pub completed: u64,
    pub dropped: u64,
    pub crashed: u64,
}

/// Worker pool usage over a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerUsage {
    pub max: usize,
    pub instantiated: usize,
    pub peak_busy: usize,
}

/// Everything a finished run reports. Produced for aborted runs too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub target: String,
    pub iterations: IterationCounts,
    pub workers: WorkerUsage,
    pub metrics: BTreeMap<String, MetricSnapshot>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub checks: BTreeMap<String, CheckTally>,
    pub aborted: Option<AbortReason>,
}

impl RunSummary {
    pub fn new(
        started_at: DateTime<Utc>,
        target: impl Into<String>,
        schedule: ScheduleReport,
        workers: WorkerUsage,
        evaluation: EvaluationSnapshot,
    ) -> Self {
        Self {
            started_at,
            elapsed: schedule.elapsed,
            target: target.into(),
            iterations: IterationCounts {
                started: schedule.started,
                completed: schedule.completed,
                dropped: schedule.dropped,
                crashed: schedule.crashed,
            },
            workers,
            metrics: evaluation.metrics,
            thresholds: evaluation.thresholds,
            checks: evaluation.checks,
            aborted: schedule.aborted,
        }
    }

    /// No abort and every rule either passed or saw no data
    pub fn passed(&self) -> bool {
        self.aborted.is_none()
            && self
                .thresholds
                .iter()
                .all(|t| matches!(t.status, RuleStatus::Passed | RuleStatus::NoData))
    }

    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdOutcome> {
        self.thresholds
            .iter()
            .filter(|t| matches!(t.status, RuleStatus::Failed | RuleStatus::Triggered))
    }

    /// Print formatted report
    pub fn print_report(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                  LOADRAMP BROKER RUN RESULTS                 ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Target:            {:<42}║", truncate(&self.target, 42));
        println!(
            "║ Started:           {:<42}║",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
        );
        println!(
            "║ Duration:          {:>10.2} seconds                        ║",
            self.elapsed.as_secs_f64()
        );
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ ITERATIONS                                                   ║");
        println!(
            "║   started:         {:>10}                                ║",
            self.iterations.started
        );
        println!(
            "║   completed:       {:>10}                                ║",
            self.iterations.completed
        );
        println!(
            "║   dropped:         {:>10}                                ║",
            self.iterations.dropped
        );
        if self.iterations.crashed > 0 {
            println!(
                "║   crashed:         {:>10}                                ║",
                self.iterations.crashed
            );
        }
        println!(
            "║   workers:         {:>10} of {:<10} (peak busy {:>6}) ║",
            self.workers.instantiated, self.workers.max, self.workers.peak_busy
        );

        if !self.checks.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ CHECKS                                                       ║");
            for (name, tally) in &self.checks {
                println!(
                    "║   {:<14} {:>10} pass {:>10} fail                ║",
                    name, tally.passes, tally.fails
                );
            }
        }

        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ METRICS                                                      ║");
        for (name, snapshot) in &self.metrics {
            println!("║   {:<25} {:<8} {:>10} samples      ║", name, snapshot.kind, snapshot.samples);
            for (stat, value) in &snapshot.values {
                println!("║     {:<10} {:>20.3}                             ║", stat, value);
            }
        }

        if !self.thresholds.is_empty() {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ THRESHOLDS                                                   ║");
            for t in &self.thresholds {
                let status = match t.status {
                    RuleStatus::Passed => "✅ PASS",
                    RuleStatus::NoData => "➖ NO DATA",
                    RuleStatus::Failed => "❌ FAIL",
                    RuleStatus::Triggered => "🛑 ABORT",
                };
                let rule = format!("{}: {}", t.metric, t.threshold);
                println!("║   {:<44} {:<12}║", truncate(&rule, 44), status);
            }
        }

        if let Some(reason) = &self.aborted {
            println!("╠══════════════════════════════════════════════════════════════╣");
            println!("║ ABORTED                                                      ║");
            println!("║   rule:  {:<52}║", truncate(&reason.rule, 52));
            println!(
                "║   at:    {:>10.2} seconds                                  ║",
                reason.elapsed.as_secs_f64()
            );
        }

        println!("╚══════════════════════════════════════════════════════════════╝\n");
    }

    /// Render the summary in the Prometheus text exposition format
    pub fn to_prometheus(&self) -> Result<String, prometheus::Error> {
        let registry = Registry::new();

        let iterations = IntGaugeVec::new(
            Opts::new("loadramp_iterations", "Iterations by outcome"),
            &["outcome"],
        )?;
        let workers = IntGaugeVec::new(
            Opts::new("loadramp_workers", "Worker pool usage"),
            &["usage"],
        )?;
        let metric_values = GaugeVec::new(
            Opts::new("loadramp_metric", "Final aggregate value per metric statistic"),
            &["metric", "stat"],
        )?;
        let checks = IntGaugeVec::new(
            Opts::new("loadramp_checks", "Check results"),
            &["check", "result"],
        )?;
        let thresholds = IntGaugeVec::new(
            Opts::new("loadramp_threshold_passed", "1 when the threshold held at the end of the run"),
            &["metric", "threshold"],
        )?;
        let aborted = IntGauge::new("loadramp_aborted", "1 when a threshold aborted the run")?;
        let duration = Gauge::new("loadramp_duration_seconds", "Run duration")?;

        registry.register(Box::new(iterations.clone()))?;
        registry.register(Box::new(workers.clone()))?;
        registry.register(Box::new(metric_values.clone()))?;
        registry.register(Box::new(checks.clone()))?;
        registry.register(Box::new(thresholds.clone()))?;
        registry.register(Box::new(aborted.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        for (outcome, n) in [
            ("started", self.iterations.started),
            ("completed", self.iterations.completed),
            ("dropped", self.iterations.dropped),
            ("crashed", self.iterations.crashed),
        ] {
            iterations.with_label_values(&[outcome]).set(n as i64);
        }
        for (usage, n) in [
            ("max", self.workers.max),
            ("instantiated", self.workers.instantiated),
            ("peak_busy", self.workers.peak_busy),
        ] {
            workers.with_label_values(&[usage]).set(n as i64);
        }
        for (name, snapshot) in &self.metrics {
            for (stat, value) in &snapshot.values {
                metric_values
                    .with_label_values(&[name.as_str(), stat.as_str()])
                    .set(*value);
            }
        }
        for (name, tally) in &self.checks {
            checks.with_label_values(&[name.as_str(), "pass"]).set(tally.passes as i64);
            checks.with_label_values(&[name.as_str(), "fail"]).set(tally.fails as i64);
        }
        for t in &self.thresholds {
            let held = matches!(t.status, RuleStatus::Passed | RuleStatus::NoData);
            thresholds
                .with_label_values(&[t.metric.as_str(), t.threshold.as_str()])
                .set(held as i64);
        }
        aborted.set(self.aborted.is_some() as i64);
        duration.set(self.elapsed.as_secs_f64());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricKind;

    fn summary() -> RunSummary {
        let metrics = BTreeMap::from([(
            "grpc_req_duration".to_string(),
            MetricSnapshot {
                kind: MetricKind::Trend,
                samples: 4,
                values: BTreeMap::from([("avg".to_string(), 2.5), ("p(95)".to_string(), 4.0)]),
            },
        )]);
        let evaluation = EvaluationSnapshot {
            metrics,
            thresholds: vec![ThresholdOutcome {
                metric: "grpc_req_duration".into(),
                threshold: "p(95) < 10000".into(),
                abort_on_fail: true,
                status: RuleStatus::Passed,
                last_value: Some(4.0),
            }],
            checks: BTreeMap::from([("publish_ok".to_string(), CheckTally { passes: 3, fails: 1 })]),
        };
        let schedule = ScheduleReport {
            started: 4,
            completed: 4,
            dropped: 2,
            crashed: 0,
            aborted: None,
            elapsed: Duration::from_secs(3),
        };
        RunSummary::new(
            Utc::now(),
            "memory",
            schedule,
            WorkerUsage {
                max: 2,
                instantiated: 2,
                peak_busy: 2,
            },
            evaluation,
        )
    }

    #[test]
    fn test_pass_fail() {
        let mut s = summary();
        assert!(s.passed());
        assert_eq!(s.failed_thresholds().count(), 0);

        s.thresholds[0].status = RuleStatus::Failed;
        assert!(!s.passed());
        assert_eq!(s.failed_thresholds().count(), 1);

        let mut s = summary();
        s.thresholds[0].status = RuleStatus::NoData;
        assert!(s.passed());
        s.aborted = Some(AbortReason {
            rule: "x: rate < 1".into(),
            metric: "x".into(),
            value: Some(1.0),
            elapsed: Duration::from_secs(1),
        });
        assert!(!s.passed());
    }

    #[test]
    fn test_json_roundtrip() {
        let s = summary();
        let json = serde_json::to_string_pretty(&s).unwrap();
        assert!(json.contains("\"elapsed\": \"3s\""));
        let back: RunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn test_prometheus_text() {
        let text = summary().to_prometheus().unwrap();
        assert!(text.contains("loadramp_iterations{outcome=\"dropped\"} 2"));
        assert!(text.contains("loadramp_metric{metric=\"grpc_req_duration\",stat=\"p(95)\"} 4"));
        assert!(text.contains("loadramp_checks{check=\"publish_ok\",result=\"fail\"} 1"));
        assert!(text.contains("loadramp_threshold_passed{metric=\"grpc_req_duration\",threshold=\"p(95) < 10000\"} 1"));
        assert!(text.contains("loadramp_aborted 0"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
    }
}
