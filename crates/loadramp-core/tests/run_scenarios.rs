//! End-to-end runs of the whole runner against in-process fakes

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use loadramp_core::{
    names, BrokerChannel, BrokerConnector, CallError, FetchReply, FetchRequest, LoadError,
    LoadTestRunner, MetricKind, PublishReply, PublishRequest, RampProfile, RuleStatus, RunConfig,
    Stage, ThresholdConfig, WorkloadConfig,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Publish(String),
    Fetch(String, i32),
}

#[derive(Default)]
struct Recorder {
    refuse_connect: bool,
    publish_delay: Duration,
    next_id: AtomicI32,
    sessions: Mutex<Vec<Vec<Call>>>,
}

struct RecordingConnector(Arc<Recorder>);

struct RecordingChannel {
    recorder: Arc<Recorder>,
    calls: Vec<Call>,
}

#[async_trait]
impl BrokerConnector for RecordingConnector {
    fn endpoint(&self) -> &str {
        "recorder"
    }

    async fn connect(&self) -> Result<Box<dyn BrokerChannel>, CallError> {
        if self.0.refuse_connect {
            return Err(CallError::Connect("connection refused".into()));
        }
        Ok(Box::new(RecordingChannel {
            recorder: Arc::clone(&self.0),
            calls: Vec::new(),
        }))
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    async fn publish(&mut self, request: PublishRequest) -> Result<PublishReply, CallError> {
        if !self.recorder.publish_delay.is_zero() {
            tokio::time::sleep(self.recorder.publish_delay).await;
        }
        self.calls.push(Call::Publish(request.subject));
        let id = self.recorder.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PublishReply { id })
    }

    async fn fetch(&mut self, request: FetchRequest) -> Result<FetchReply, CallError> {
        self.calls.push(Call::Fetch(request.subject, request.id));
        Ok(FetchReply {
            body: b"payload".to_vec(),
        })
    }

    async fn close(&mut self) {
        let calls = std::mem::take(&mut self.calls);
        self.recorder.sessions.lock().push(calls);
    }
}

fn config(profile: RampProfile, thresholds: Vec<ThresholdConfig>) -> RunConfig {
    RunConfig {
        profile,
        thresholds,
        metric_kinds: HashMap::new(),
        seed: Some(42),
        ..Default::default()
    }
}

fn flat(rate: f64, duration: Duration, pre: usize, max: usize) -> RampProfile {
    RampProfile {
        start_rate: rate,
        time_unit: Duration::from_secs(1),
        preallocated_workers: pre,
        max_workers: max,
        stages: vec![Stage::new(rate, duration)],
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_connects_trigger_abort_after_grace() {
    let recorder = Arc::new(Recorder {
        refuse_connect: true,
        ..Default::default()
    });
    let config = config(
        flat(10.0, Duration::from_secs(30), 5, 50),
        vec![ThresholdConfig::new(
            names::FAILED_CONNECT_ATTEMPTS,
            "rate < 0.05",
            true,
            Duration::from_millis(500),
        )],
    );
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(Arc::clone(&recorder)))).unwrap();

    let summary = runner.run().await.unwrap();

    let reason = summary.aborted.clone().expect("run should abort");
    assert_eq!(reason.metric, names::FAILED_CONNECT_ATTEMPTS);
    assert!(reason.elapsed >= Duration::from_millis(500));
    assert!(reason.elapsed < Duration::from_secs(2));
    assert!(summary.elapsed < Duration::from_secs(30));
    assert!(!summary.passed());

    assert_eq!(summary.metrics[names::FAILED_CONNECT_ATTEMPTS].values["rate"], 1.0);
    assert_eq!(summary.thresholds[0].status, RuleStatus::Triggered);
    assert!(summary.checks.is_empty());
    assert!(recorder.sessions.lock().is_empty());
    assert_eq!(summary.iterations.completed, summary.iterations.started);
}

#[tokio::test(start_paused = true)]
async fn test_default_connect_counter_rule_triggers_after_grace() {
    let recorder = Arc::new(Recorder {
        refuse_connect: true,
        ..Default::default()
    });
    let config = RunConfig {
        profile: flat(10.0, Duration::from_secs(30), 5, 50),
        seed: Some(42),
        ..Default::default()
    };
    assert_eq!(
        config.metric_kind(names::FAILED_CONNECT_ATTEMPTS),
        Some(MetricKind::Counter)
    );
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(recorder))).unwrap();

    let summary = runner.run().await.unwrap();

    let reason = summary.aborted.clone().expect("run should abort");
    assert_eq!(reason.metric, names::FAILED_CONNECT_ATTEMPTS);
    assert_eq!(reason.rule, "failed_connect_attempts: rate < 2");
    assert!(reason.elapsed >= Duration::from_secs(10));
    assert!(reason.elapsed < Duration::from_secs(11));
    assert!(reason.value.unwrap() >= 2.0);
    assert!(summary.elapsed < Duration::from_secs(30));

    let failed = &summary.metrics[names::FAILED_CONNECT_ATTEMPTS];
    assert_eq!(failed.kind, MetricKind::Counter);
    assert_eq!(failed.values["count"], summary.iterations.started as f64);
    assert_eq!(summary.thresholds[0].status, RuleStatus::NoData);
    assert_eq!(summary.thresholds[1].status, RuleStatus::Triggered);
}

#[tokio::test(start_paused = true)]
async fn test_default_connect_counter_rule_tolerates_sparse_failures() {
    let recorder = Arc::new(Recorder {
        refuse_connect: true,
        ..Default::default()
    });
    let config = RunConfig {
        profile: flat(1.0, Duration::from_secs(5), 1, 5),
        seed: Some(42),
        ..Default::default()
    };
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(recorder))).unwrap();

    let summary = runner.run().await.unwrap();
    assert!(summary.aborted.is_none());
    assert_eq!(summary.iterations.started, 5);
    assert_eq!(summary.metrics[names::FAILED_CONNECT_ATTEMPTS].values["count"], 5.0);
    assert_eq!(summary.thresholds[1].status, RuleStatus::Passed);
    assert_eq!(summary.thresholds[1].last_value, Some(1.0));
    assert!(summary.passed());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_iterations_count_rule() {
    let recorder = Arc::new(Recorder {
        publish_delay: Duration::from_secs(5),
        ..Default::default()
    });
    let config = config(
        flat(10.0, Duration::from_secs(1), 1, 1),
        vec![ThresholdConfig::new(
            names::DROPPED_ITERATIONS,
            "count == 0",
            true,
            Duration::ZERO,
        )],
    );
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(Arc::clone(&recorder)))).unwrap();

    let summary = runner.run().await.unwrap();
    let reason = summary.aborted.clone().expect("first drop should abort");
    assert_eq!(reason.metric, names::DROPPED_ITERATIONS);
    assert_eq!(reason.value, Some(1.0));
    assert!(reason.elapsed >= Duration::from_millis(200));
    assert!(reason.elapsed < Duration::from_millis(300));
    assert_eq!(summary.iterations.started, 1);
    assert_eq!(summary.iterations.dropped, 1);
    assert_eq!(summary.iterations.completed, 1);
    assert_eq!(summary.thresholds[0].status, RuleStatus::Triggered);

    // without abort the rule only fails the run at the end
    let config = RunConfig {
        profile: flat(10.0, Duration::from_secs(1), 1, 1),
        thresholds: vec![ThresholdConfig::new(
            names::DROPPED_ITERATIONS,
            "count == 0",
            false,
            Duration::ZERO,
        )],
        seed: Some(42),
        ..Default::default()
    };
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(recorder))).unwrap();
    let summary = runner.run().await.unwrap();
    assert!(summary.aborted.is_none());
    assert_eq!(summary.iterations.dropped, 9);
    assert_eq!(summary.thresholds[0].status, RuleStatus::Failed);
    assert_eq!(summary.thresholds[0].last_value, Some(9.0));
    assert!(!summary.passed());
}

#[test]
fn test_rule_on_wrong_statistic_is_rejected_up_front() {
    let config = config(
        flat(1.0, Duration::from_secs(1), 1, 1),
        vec![ThresholdConfig::new(
            names::GRPC_REQ_DURATION,
            "rate < 0.05",
            true,
            Duration::ZERO,
        )],
    );
    let err = LoadTestRunner::new(config, Arc::new(RecordingConnector(Arc::new(Recorder::default()))))
        .err()
        .expect("config should be rejected");
    assert!(matches!(err, LoadError::InvalidThreshold { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_probability_one_fetches_every_publish() {
    let recorder = Arc::new(Recorder::default());
    let mut config = config(flat(20.0, Duration::from_secs(2), 5, 20), vec![]);
    config.workload = WorkloadConfig {
        fetch_probability: 1.0,
        ..Default::default()
    };
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(Arc::clone(&recorder)))).unwrap();

    let summary = runner.run().await.unwrap();
    assert!(summary.passed());
    assert_eq!(summary.iterations.started, 40);
    assert_eq!(summary.iterations.dropped, 0);

    let sessions = recorder.sessions.lock();
    assert_eq!(sessions.len(), 40);
    for calls in sessions.iter() {
        match calls.as_slice() {
            [Call::Publish(published), Call::Fetch(fetched, id)] => {
                assert_eq!(published, fetched);
                assert!(*id > 0);
            }
            other => panic!("expected publish then fetch, got {:?}", other),
        }
    }

    assert_eq!(summary.checks["publish_ok"].passes, 40);
    assert_eq!(summary.checks["fetch_ok"].passes, 40);
    assert_eq!(summary.metrics[names::GRPC_REQ_DURATION].samples, 80);
    assert_eq!(summary.metrics[names::ITERATIONS].values["count"], 40.0);
    assert_eq!(summary.metrics[names::FAILED_CONNECT_ATTEMPTS].values["rate"], 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_single_worker_drops_overlapping_starts() {
    let recorder = Arc::new(Recorder {
        publish_delay: Duration::from_secs(5),
        ..Default::default()
    });
    let config = config(flat(10.0, Duration::from_secs(1), 1, 1), vec![]);
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(Arc::clone(&recorder)))).unwrap();

    let summary = runner.run().await.unwrap();
    assert_eq!(summary.iterations.started, 1);
    assert_eq!(summary.iterations.dropped, 9);
    assert_eq!(summary.workers.instantiated, 1);
    assert_eq!(summary.workers.peak_busy, 1);
    assert_eq!(summary.metrics[names::DROPPED_ITERATIONS].values["count"], 9.0);
    assert_eq!(recorder.sessions.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_batched_rounds_share_one_connection() {
    let recorder = Arc::new(Recorder::default());
    let mut config = config(flat(5.0, Duration::from_secs(1), 1, 5), vec![]);
    config.workload = WorkloadConfig {
        fetch_probability: 0.0,
        iterations_per_connection: 3,
        ..Default::default()
    };
    let runner = LoadTestRunner::new(config, Arc::new(RecordingConnector(Arc::clone(&recorder)))).unwrap();

    let summary = runner.run().await.unwrap();
    let sessions = recorder.sessions.lock();
    assert_eq!(sessions.len() as u64, summary.iterations.started);
    assert!(sessions.iter().all(|calls| calls.len() == 3
        && calls.iter().all(|c| matches!(c, Call::Publish(_)))));
    assert!(!summary.checks.contains_key("fetch_ok"));
}

#[test]
fn test_invalid_config_is_rejected_up_front() {
    let recorder = Arc::new(Recorder::default());
    let config = config(
        flat(1.0, Duration::from_secs(1), 1, 1),
        vec![ThresholdConfig::new("checks", "rate ~ 1", false, Duration::ZERO)],
    );
    let err = LoadTestRunner::new(config, Arc::new(RecordingConnector(recorder)))
        .err()
        .expect("config should be rejected");
    assert!(matches!(err, LoadError::InvalidThreshold { .. }));
}
