//! Arrival-rate scheduler
//!
//! A single control loop ticks at a fixed resolution. Each tick it asks the
//! evaluator whether the run must abort, works out how many starts the ramp
//! curve owes since the last tick, and hands each one a worker from the pool.
//! A start that finds the pool exhausted is dropped on the spot.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::RunClock;
use crate::evaluator::{AbortReason, Evaluator};
use crate::metrics::{names, MetricSample};
use crate::pool::{WorkerPool, WorkerSlot};
use crate::profile::{RampProfile, RampSchedule};

/// Counts produced by one scheduler run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleReport {
    pub started: u64,
    pub completed: u64,
    pub dropped: u64,
    /// Iterations whose task panicked
    pub crashed: u64,
    pub aborted: Option<AbortReason>,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
}

/// Turns a [`RampProfile`] into iteration starts
pub struct Scheduler {
    profile: RampProfile,
    schedule: RampSchedule,
    pool: Arc<WorkerPool>,
    evaluator: Arc<Evaluator>,
    clock: RunClock,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        profile: RampProfile,
        pool: Arc<WorkerPool>,
        evaluator: Arc<Evaluator>,
        clock: RunClock,
        tick: Duration,
    ) -> Self {
        let schedule = RampSchedule::from_profile(&profile);
        Self {
            profile,
            schedule,
            pool,
            evaluator,
            clock,
            tick,
        }
    }

    pub fn schedule(&self) -> &RampSchedule {
        &self.schedule
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Drive the profile to completion or abort. `on_iteration_start` receives
    /// the leased worker and returns the iteration; the lease is released when
    /// the returned future drops it.
    pub async fn run<F, Fut>(&self, mut on_iteration_start: F) -> ScheduleReport
    where
        F: FnMut(WorkerSlot) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let total = self.schedule.total_duration();
        info!(
            "Scheduling {} stage(s) over {:?}: start rate {}/{:?}, {} preallocated / {} max workers",
            self.profile.stages.len(),
            total,
            self.profile.start_rate,
            self.profile.time_unit,
            self.pool.instantiated(),
            self.pool.max_workers()
        );

        let mut report = ScheduleReport::default();
        let mut inflight = JoinSet::new();
        let mut issued: u64 = 0;
        let mut stage = None;
        let report_period = self.evaluator.window();
        let mut next_progress = report_period;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let elapsed = self.clock.elapsed();

            if let Some(reason) = self.evaluator.check_abort(elapsed) {
                warn!(
                    "Aborting run at {:?}: threshold {} failed, waiting for {} in-flight iteration(s)",
                    elapsed,
                    reason.rule,
                    inflight.len()
                );
                report.aborted = Some(reason);
                break;
            }

            let current = self.schedule.stage_at(elapsed);
            if current != stage {
                if let Some(i) = current {
                    let s = &self.profile.stages[i];
                    info!(
                        "Stage {}/{}: ramping to {}/{:?} over {:?}",
                        i + 1,
                        self.profile.stages.len(),
                        s.target,
                        self.profile.time_unit,
                        s.duration
                    );
                }
                stage = current;
            }

            let due = self.schedule.due_by(elapsed);
            while issued < due {
                issued += 1;
                match self.pool.try_acquire() {
                    Some(slot) => {
                        report.started += 1;
                        inflight.spawn(on_iteration_start(slot));
                    }
                    None => {
                        report.dropped += 1;
                        self.evaluator
                            .ingest(MetricSample::count(names::DROPPED_ITERATIONS, 1, elapsed));
                    }
                }
            }

            while let Some(result) = inflight.try_join_next() {
                reap(result, &mut report);
            }

            if elapsed >= next_progress {
                let window = self.evaluator.window_summary(elapsed);
                info!(
                    "t={:.1}s throughput={:.1}/s error_rate={} busy={} dropped={}",
                    elapsed.as_secs_f64(),
                    window.throughput,
                    window
                        .error_rate
                        .map_or_else(|| "-".to_string(), |r| format!("{:.3}", r)),
                    self.pool.busy(),
                    report.dropped
                );
                next_progress = elapsed + report_period;
            }

            debug!(
                "t={:?} rate={:.2}/s issued={} busy={} dropped={}",
                elapsed,
                self.schedule.rate_at(elapsed),
                issued,
                self.pool.busy(),
                report.dropped
            );

            if elapsed >= total {
                break;
            }
        }

        while let Some(result) = inflight.join_next().await {
            reap(result, &mut report);
        }

        report.elapsed = self.clock.elapsed();
        info!(
            "Scheduling finished after {:?}: {} started, {} completed, {} dropped",
            report.elapsed, report.started, report.completed, report.dropped
        );
        report
    }
}

fn reap(result: Result<(), JoinError>, report: &mut ScheduleReport) {
    match result {
        Ok(()) => report.completed += 1,
        Err(e) => {
            error!("Iteration task failed: {}", e);
            report.crashed += 1;
        }
    }
}
