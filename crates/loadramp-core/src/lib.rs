//! # loadramp core
//!
//! Open-model load generation for a publish/fetch message broker.
//!
//! Iterations start at a time-varying arrival rate that does not depend on
//! how long earlier iterations take. Each iteration connects, publishes a
//! random message, optionally fetches it back by id and disconnects. Every
//! outcome becomes a metric sample; threshold rules watch a sliding window of
//! the aggregates and can abort the run once continuously violated past their
//! grace period.
//!
//! ```text
//!   RampProfile ──► Scheduler ──tick──► WorkerPool ──slot──► WorkerSession
//!                      ▲                                       │
//!                      │ check_abort                 samples   │
//!                      └──────────── Evaluator ◄───────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Dry run against the in-process broker
//! cargo run --package loadramp-cli -- --target memory --config loadramp.toml
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod pool;
pub mod profile;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod summary;
pub mod threshold;
pub mod workload;

pub use broker::{BrokerChannel, BrokerConnector, FetchReply, FetchRequest, PublishReply, PublishRequest};
pub use clock::RunClock;
pub use config::{BrokerSettings, RunConfig};
pub use error::{CallError, LoadError, Result};
pub use evaluator::{AbortReason, EvaluationSnapshot, Evaluator, ThresholdOutcome, WindowSummary};
pub use metrics::{names, Check, CheckTally, MetricKind, MetricSample, MetricSnapshot, DEFAULT_WINDOW};
pub use pool::{Worker, WorkerPool, WorkerSlot};
pub use profile::{RampProfile, RampSchedule, Stage};
pub use runner::LoadTestRunner;
pub use scheduler::{ScheduleReport, Scheduler};
pub use session::{SessionReport, SessionState, WorkerSession};
pub use summary::{IterationCounts, RunSummary, WorkerUsage};
pub use threshold::{Predicate, RuleStatus, ThresholdConfig, ThresholdRule};
pub use workload::{Iteration, WorkloadConfig, WorkloadGenerator};
