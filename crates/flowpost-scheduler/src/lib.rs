//! # Flowpost Scheduler
//!
//! Flow execution engine: advances per-recipient runs through authored
//! automation graphs, one bounded tick at a time.
//!
//! ## Design
//! - SQLite persistence. Runs survive restarts.
//! - A delay is a timestamp on the run, never an in-process sleep.
//! - Optimistic concurrency on run rows, so concurrent ticks never double-step.
//! - Per-run failures are recorded on the run. They never abort a batch.
//!
//! ## Architecture
//! ```text
//! Tick (cron / HTTP / engine loop)
//!   └── FlowEngine::tick(flow)
//!         ├── load Flow → normalize graph (trigger, delay, condition, email)
//!         ├── ready runs (updated_at ASC, available_at ≤ now)
//!         └── StepExecutor per run
//!               ├── claim (version CAS)
//!               ├── trigger → condition(AlwaysNo) → … → delay (arm) | email (send once)
//!               └── commit run + audit events
//!
//! QueueWorker (job view derived from runs)
//!   ├── project: one pending job per active run (idempotent enqueue)
//!   └── batch: claim job → step run → enqueue follow-up
//! ```

pub mod branch;
pub mod delay;
pub mod engine;
pub mod enqueue;
pub mod enroll;
pub mod executor;
pub mod graph;
pub mod ops;
pub mod persistence;
pub mod runs;
pub mod worker;

pub use branch::{AlwaysNo, BranchContext, BranchResolver};
pub use engine::{FlowEngine, EngineSettings, TickAllReport, TickReport, spawn_engine_loop};
pub use enqueue::{EnqueueOutcome, enqueue_next};
pub use enroll::{EnrollOutcome, EnrollRequest, TriggerEvent};
pub use executor::{Collaborators, StepExecutor, StepOutcome, StepReport};
pub use graph::{Edge, Flow, FlowDocument, FlowStore, Node, NodeKind};
pub use persistence::SchedulerDb;
pub use runs::{FailureCode, JobStatus, QueueJob, Run, RunStatus};
pub use worker::{QueueWorker, WorkerReport};
