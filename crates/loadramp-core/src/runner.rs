//! Run orchestration: wires config, pool, evaluator and scheduler together

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::broker::BrokerConnector;
use crate::clock::RunClock;
use crate::config::RunConfig;
use crate::error::Result;
use crate::evaluator::Evaluator;
use crate::pool::WorkerPool;
use crate::scheduler::Scheduler;
use crate::session::WorkerSession;
use crate::summary::{RunSummary, WorkerUsage};
use crate::workload::WorkloadGenerator;

/// Load test runner
pub struct LoadTestRunner {
    config: RunConfig,
    connector: Arc<dyn BrokerConnector>,
    generator: Arc<WorkloadGenerator>,
}

impl LoadTestRunner {
    /// Validate the configuration and prepare a runner
    pub fn new(config: RunConfig, connector: Arc<dyn BrokerConnector>) -> Result<Self> {
        config.validate()?;
        let generator = Arc::new(WorkloadGenerator::new(&config.workload)?);
        Ok(Self {
            config,
            connector,
            generator,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the profile to completion or abort and summarize
    pub async fn run(&self) -> Result<RunSummary> {
        let rules = self.config.compile_thresholds()?;
        let evaluator = Arc::new(
            Evaluator::new(rules, self.config.metric_kinds.clone()).with_window(self.config.window),
        );
        let pool = WorkerPool::new(
            self.config.profile.preallocated_workers,
            self.config.profile.max_workers,
            self.config.seed,
        );

        info!(
            "Starting run against {} ({} subjects, {} threshold(s))",
            self.connector.endpoint(),
            self.generator.subject_cardinality(),
            evaluator.rules().len()
        );

        let started_at = Utc::now();
        let clock = RunClock::start();
        let scheduler = Scheduler::new(
            self.config.profile.clone(),
            Arc::clone(&pool),
            Arc::clone(&evaluator),
            clock,
            self.config.tick,
        );
        let rounds = self.config.workload.iterations_per_connection;
        let ignore_unavailable = self.config.workload.ignore_unavailable_errors;

        let report = scheduler
            .run(|mut slot| {
                let connector = Arc::clone(&self.connector);
                let generator = Arc::clone(&self.generator);
                let evaluator = Arc::clone(&evaluator);
                async move {
                    let worker = slot.worker();
                    let session = WorkerSession::new(worker.id(), evaluator, clock)
                        .ignoring_unavailable(ignore_unavailable);
                    let outcome = session
                        .execute(connector.as_ref(), &generator, worker.rng(), rounds)
                        .await;
                    debug!("Worker {} finished: {:?}", worker.id(), outcome);
                }
            })
            .await;

        let evaluation = evaluator.snapshot(clock.elapsed());
        let workers = WorkerUsage {
            max: pool.max_workers(),
            instantiated: pool.instantiated(),
            peak_busy: pool.peak_busy(),
        };
        let summary = RunSummary::new(
            started_at,
            self.connector.endpoint(),
            report,
            workers,
            evaluation,
        );

        info!(
            "Run finished: {} started, {} dropped, {} sample(s), passed={}",
            summary.iterations.started,
            summary.iterations.dropped,
            evaluator.ingested(),
            summary.passed()
        );
        Ok(summary)
    }
}
