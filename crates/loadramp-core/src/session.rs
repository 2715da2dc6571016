//! Worker session: one connection lifecycle and the iterations run on it

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, BrokerConnector, FetchRequest, PublishRequest};
use crate::clock::RunClock;
use crate::error::CallError;
use crate::evaluator::Evaluator;
use crate::metrics::{names, Check, MetricSample};
use crate::workload::{Iteration, WorkloadGenerator};

/// Connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Closed,
    Failed,
}

/// What one session did, returned to the scheduler's callback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub connected: bool,
    pub publishes: u64,
    pub fetches: u64,
    pub failed_calls: u64,
    /// Publish/fetch rounds completed on the connection
    pub rounds: u64,
}

/// Owns one broker channel for the duration of an iteration
pub struct WorkerSession {
    id: usize,
    state: SessionState,
    channel: Option<Box<dyn BrokerChannel>>,
    evaluator: Arc<Evaluator>,
    clock: RunClock,
    ignore_unavailable: bool,
}

impl WorkerSession {
    pub fn new(id: usize, evaluator: Arc<Evaluator>, clock: RunClock) -> Self {
        Self {
            id,
            state: SessionState::Disconnected,
            channel: None,
            evaluator,
            clock,
            ignore_unavailable: false,
        }
    }

    /// Keep `Unavailable` statuses out of `grpc_req_failed`. The check still fails.
    pub fn ignoring_unavailable(mut self, ignore: bool) -> Self {
        self.ignore_unavailable = ignore;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn emit(&self, sample: MetricSample) {
        self.evaluator.ingest(sample);
    }

    /// Open the channel. Always emits one `failed_connect_attempts` sample.
    pub async fn connect(&mut self, connector: &dyn BrokerConnector) -> Result<(), CallError> {
        let result = connector.connect().await;
        let failed = result.is_err();
        self.emit(MetricSample::flag(
            names::FAILED_CONNECT_ATTEMPTS,
            failed,
            self.clock.elapsed(),
        ));

        match result {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Session {} could not connect to {}: {}",
                    self.id,
                    connector.endpoint(),
                    e
                );
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Publish, then fetch if the iteration asks for it and publish returned an id.
    /// Call failures become failed checks; they never end the iteration early.
    pub async fn run_iteration(&mut self, iteration: &mut Iteration, report: &mut SessionReport) {
        let Some(mut channel) = self.channel.take() else {
            debug!("Session {} has no channel, skipping iteration", self.id);
            return;
        };

        let request = PublishRequest {
            subject: iteration.subject.clone(),
            body: iteration.body.clone(),
            expiration_seconds: iteration.expiration.as_secs().min(i32::MAX as u64) as i32,
        };
        let started = Instant::now();
        let published = channel.publish(request).await;
        let latency = started.elapsed();
        report.publishes += 1;

        let publish_id = match &published {
            Ok(reply) => Some(reply.id),
            Err(e) => {
                debug!("Session {} publish to {} failed: {}", self.id, iteration.subject, e);
                report.failed_calls += 1;
                None
            }
        };
        iteration.published_id = publish_id;
        self.record_call(Check::PublishOk, published.as_ref().err(), latency);

        if let (true, Some(id)) = (iteration.fetch, publish_id) {
            let request = FetchRequest {
                subject: iteration.subject.clone(),
                id,
            };
            let started = Instant::now();
            let fetched = channel.fetch(request).await;
            let latency = started.elapsed();
            report.fetches += 1;
            iteration.did_fetch = true;

            if let Err(e) = &fetched {
                debug!("Session {} fetch {}/{} failed: {}", self.id, iteration.subject, id, e);
                report.failed_calls += 1;
            }
            self.record_call(Check::FetchOk, fetched.as_ref().err(), latency);
        }

        self.channel = Some(channel);
        report.rounds += 1;
    }

    fn record_call(&self, check: Check, error: Option<&CallError>, latency: Duration) {
        let now = self.clock.elapsed();
        self.emit(MetricSample::latency(names::GRPC_REQ_DURATION, latency, now));
        let failed = error.map_or(false, |e| !(self.ignore_unavailable && e.is_unavailable()));
        self.emit(MetricSample::flag(names::GRPC_REQ_FAILED, failed, now));
        self.evaluator.record_check(check, error.is_none(), now);
    }

    /// Release the channel. Safe on every state; the channel is closed at most once.
    pub async fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        if self.state != SessionState::Failed {
            self.state = SessionState::Closed;
        }
    }

    /// Full session lifecycle: connect, `rounds` iterations, close.
    pub async fn execute<R: Rng + ?Sized>(
        mut self,
        connector: &dyn BrokerConnector,
        generator: &WorkloadGenerator,
        rng: &mut R,
        rounds: usize,
    ) -> SessionReport {
        let started = Instant::now();
        let mut report = SessionReport::default();

        if self.connect(connector).await.is_ok() {
            report.connected = true;
            for _ in 0..rounds {
                let mut iteration = generator.generate(rng);
                self.run_iteration(&mut iteration, &mut report).await;
            }
        }
        self.close().await;

        if report.connected {
            let now = self.clock.elapsed();
            self.emit(MetricSample::latency(names::ITERATION_DURATION, started.elapsed(), now));
            self.emit(MetricSample::count(names::ITERATIONS, 1, now));
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{FetchReply, PublishReply};
    use crate::workload::WorkloadConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Publish(String),
        Fetch(String, i32),
        Close,
    }

    #[derive(Default)]
    struct Script {
        refuse_connect: bool,
        fail_publish: bool,
        calls: Mutex<Vec<Call>>,
    }

    struct FakeConnector(Arc<Script>);
    struct FakeChannel(Arc<Script>, i32);

    #[async_trait]
    impl BrokerConnector for FakeConnector {
        fn endpoint(&self) -> &str {
            "fake"
        }

        async fn connect(&self) -> Result<Box<dyn BrokerChannel>, CallError> {
            if self.0.refuse_connect {
                return Err(CallError::Connect("refused".into()));
            }
            Ok(Box::new(FakeChannel(Arc::clone(&self.0), 0)))
        }
    }

    #[async_trait]
    impl BrokerChannel for FakeChannel {
        async fn publish(&mut self, request: PublishRequest) -> Result<PublishReply, CallError> {
            self.0.calls.lock().push(Call::Publish(request.subject));
            if self.0.fail_publish {
                return Err(CallError::Status {
                    code: "Unavailable".into(),
                    message: "closed".into(),
                });
            }
            self.1 += 1;
            Ok(PublishReply { id: self.1 })
        }

        async fn fetch(&mut self, request: FetchRequest) -> Result<FetchReply, CallError> {
            self.0.calls.lock().push(Call::Fetch(request.subject, request.id));
            Ok(FetchReply { body: vec![] })
        }

        async fn close(&mut self) {
            self.0.calls.lock().push(Call::Close);
        }
    }

    fn generator(fetch_probability: f64) -> WorkloadGenerator {
        WorkloadGenerator::new(&WorkloadConfig {
            fetch_probability,
            ..Default::default()
        })
        .unwrap()
    }

    fn evaluator() -> Arc<Evaluator> {
        Arc::new(Evaluator::new(vec![], HashMap::new()))
    }

    #[tokio::test]
    async fn test_publish_then_fetch_same_subject_and_id() {
        let script = Arc::new(Script::default());
        let ev = evaluator();
        let session = WorkerSession::new(1, Arc::clone(&ev), RunClock::start());
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        let report = session
            .execute(&FakeConnector(Arc::clone(&script)), &generator(1.0), &mut rng, 3)
            .await;
        assert!(report.connected);
        assert_eq!(report.publishes, 3);
        assert_eq!(report.fetches, 3);
        assert_eq!(report.rounds, 3);

        let calls = script.calls.lock().clone();
        assert_eq!(calls.len(), 7);
        for (n, pair) in calls[..6].chunks(2).enumerate() {
            match pair {
                [Call::Publish(s1), Call::Fetch(s2, id)] => {
                    assert_eq!(s1, s2);
                    assert_eq!(*id, n as i32 + 1);
                }
                other => panic!("unexpected calls {:?}", other),
            }
        }
        assert_eq!(calls[6], Call::Close);

        let snap = ev.snapshot(Duration::ZERO);
        assert_eq!(snap.checks["publish_ok"].passes, 3);
        assert_eq!(snap.checks["fetch_ok"].passes, 3);
        assert_eq!(snap.metrics[names::FAILED_CONNECT_ATTEMPTS].values["rate"], 0.0);
        assert_eq!(snap.metrics[names::GRPC_REQ_DURATION].samples, 6);
        assert_eq!(snap.metrics[names::GRPC_REQ_FAILED].values["rate"], 0.0);
        assert_eq!(snap.metrics[names::ITERATIONS].values["count"], 1.0);
    }

    #[tokio::test]
    async fn test_connect_failure_skips_rpcs() {
        let script = Arc::new(Script {
            refuse_connect: true,
            ..Default::default()
        });
        let ev = evaluator();
        let mut session = WorkerSession::new(2, Arc::clone(&ev), RunClock::start());
        let connector = FakeConnector(Arc::clone(&script));

        assert!(session.connect(&connector).await.is_err());
        assert_eq!(session.state(), SessionState::Failed);
        session.close().await;
        assert_eq!(session.state(), SessionState::Failed);
        assert!(script.calls.lock().is_empty());

        let snap = ev.snapshot(Duration::ZERO);
        assert_eq!(snap.metrics[names::FAILED_CONNECT_ATTEMPTS].values["rate"], 1.0);
        assert!(snap.checks.is_empty());
        assert!(!snap.metrics.contains_key(names::ITERATIONS));
    }

    #[tokio::test]
    async fn test_failed_publish_skips_fetch_but_closes() {
        let script = Arc::new(Script {
            fail_publish: true,
            ..Default::default()
        });
        let ev = evaluator();
        let session = WorkerSession::new(3, Arc::clone(&ev), RunClock::start());
        let mut rng = ChaCha8Rng::seed_from_u64(9);

        let report = session
            .execute(&FakeConnector(Arc::clone(&script)), &generator(1.0), &mut rng, 1)
            .await;
        assert_eq!(report.failed_calls, 1);
        assert_eq!(report.fetches, 0);

        let calls = script.calls.lock().clone();
        assert!(matches!(calls.as_slice(), [Call::Publish(_), Call::Close]));
        let snap = ev.snapshot(Duration::ZERO);
        assert_eq!(snap.checks["publish_ok"].fails, 1);
        assert!(!snap.checks.contains_key("fetch_ok"));
        assert_eq!(snap.metrics[names::GRPC_REQ_FAILED].values["rate"], 1.0);
    }

    #[tokio::test]
    async fn test_ignored_unavailable_is_not_a_failed_request() {
        let script = Arc::new(Script {
            fail_publish: true,
            ..Default::default()
        });
        let ev = evaluator();
        let session = WorkerSession::new(5, Arc::clone(&ev), RunClock::start()).ignoring_unavailable(true);
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        let report = session
            .execute(&FakeConnector(Arc::clone(&script)), &generator(0.0), &mut rng, 2)
            .await;
        assert_eq!(report.failed_calls, 2);

        let snap = ev.snapshot(Duration::ZERO);
        assert_eq!(snap.metrics[names::GRPC_REQ_FAILED].values["rate"], 0.0);
        assert_eq!(snap.metrics[names::GRPC_REQ_FAILED].samples, 2);
        assert_eq!(snap.checks["publish_ok"].fails, 2);
    }

    #[tokio::test]
    async fn test_close_transitions_connected_session() {
        let script = Arc::new(Script::default());
        let mut session = WorkerSession::new(4, evaluator(), RunClock::start());
        session.connect(&FakeConnector(Arc::clone(&script))).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(script.calls.lock().as_slice(), &[Call::Close]);
    }
}
