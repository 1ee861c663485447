//! Flow engine: the tick coordinator and the background loop.
//!
//! A tick loads one flow, selects a bounded batch of ready runs (oldest
//! update first) and steps each one exactly once. A run that blows up is
//! failed and reported; it never aborts the batch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowpost_core::config::EngineConfig;
use flowpost_core::{FlowpostError, MessageGateway, Result};
use serde::Serialize;

use crate::branch::BranchResolver;
use crate::enroll::{self, EnrollOutcome, EnrollRequest};
use crate::executor::{Collaborators, StepExecutor, StepOutcome};
use crate::graph::Flow;
use crate::persistence::SchedulerDb;
use crate::runs::FailureCode;
use crate::worker::QueueWorker;

/// Hard ceiling for runs processed by one tick call.
pub const MAX_RUNS_CEILING: usize = 250;

/// Clamp a requested batch size into `1..=MAX_RUNS_CEILING`.
pub fn clamp_max_runs(requested: Option<usize>, default: usize) -> usize {
    requested.unwrap_or(default).clamp(1, MAX_RUNS_CEILING)
}

/// Batch limits, taken from `[engine]` config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_runs_per_tick: usize,
    pub max_flows_per_pass: usize,
    pub max_hops_per_step: usize,
    pub worker_batch_limit: usize,
    pub tick_interval_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(c: &EngineConfig) -> Self {
        Self {
            max_runs_per_tick: c.max_runs_per_tick.clamp(1, MAX_RUNS_CEILING),
            max_flows_per_pass: c.max_flows_per_pass.max(1),
            max_hops_per_step: c.max_hops_per_step.max(1),
            worker_batch_limit: c.worker_batch_limit.max(1),
            tick_interval_secs: c.tick_interval_secs.max(1),
        }
    }
}

/// Result of one tick over one flow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub flow_id: String,
    pub picked: usize,
    pub processed: usize,
    pub skipped: usize,
    pub sent: usize,
    pub failed: usize,
    pub advanced: usize,
    pub done: usize,
    pub notes: Vec<String>,
    pub errors: Vec<String>,
}

/// A flow that could not be ticked at all.
#[derive(Debug, Clone, Serialize)]
pub struct FlowFailure {
    pub flow_id: String,
    pub code: String,
    pub error: String,
}

/// Result of ticking every flow with due work.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickAllReport {
    pub flows: usize,
    pub picked: usize,
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub reports: Vec<TickReport>,
    pub flow_errors: Vec<FlowFailure>,
}

/// The engine. Owns the run store and the collaborators.
pub struct FlowEngine {
    db: Arc<SchedulerDb>,
    deps: Collaborators,
    settings: EngineSettings,
}

impl FlowEngine {
    /// Engine backed entirely by `db`, sending through `gateway`.
    pub fn new(db: Arc<SchedulerDb>, gateway: Arc<dyn MessageGateway>) -> Self {
        let deps = Collaborators::from_db(&db, gateway);
        Self::with_collaborators(db, deps)
    }

    pub fn with_collaborators(db: Arc<SchedulerDb>, deps: Collaborators) -> Self {
        Self {
            db,
            deps,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_branch_resolver(mut self, resolver: Arc<dyn BranchResolver>) -> Self {
        self.deps.branches = resolver;
        self
    }

    pub fn db(&self) -> &Arc<SchedulerDb> {
        &self.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.deps
    }

    pub fn executor(&self) -> StepExecutor<'_> {
        StepExecutor::new(&self.db, &self.deps, self.settings.max_hops_per_step)
    }

    /// Load a flow for execution. Missing flow or trigger is a call-level error.
    pub fn load_flow(&self, flow_id: &str) -> Result<Flow> {
        let flow = self
            .deps
            .flows
            .load_flow(flow_id)?
            .ok_or_else(|| FlowpostError::FlowNotFound(flow_id.to_string()))?;
        if flow.trigger().is_none() {
            return Err(FlowpostError::NoTrigger(flow_id.to_string()));
        }
        Ok(flow)
    }

    pub async fn tick(&self, flow_id: &str, max_runs: Option<usize>) -> Result<TickReport> {
        self.tick_at(flow_id, max_runs, Utc::now()).await
    }

    /// Tick one flow as of `now`.
    pub async fn tick_at(
        &self,
        flow_id: &str,
        max_runs: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<TickReport> {
        let flow = self.load_flow(flow_id)?;
        let limit = clamp_max_runs(max_runs, self.settings.max_runs_per_tick);
        let runs: Vec<_> = self
            .db
            .ready_runs(flow_id, now, limit)?
            .into_iter()
            .filter(|r| r.is_ready(now))
            .collect();

        let mut report = TickReport {
            flow_id: flow_id.to_string(),
            picked: runs.len(),
            ..Default::default()
        };
        let executor = self.executor();

        for run in &runs {
            match executor.step(&flow, run, now).await {
                Ok(step) => {
                    report.sent += step.sent;
                    if step.moved() {
                        report.advanced += 1;
                    }
                    match &step.outcome {
                        StepOutcome::Skipped => report.skipped += 1,
                        StepOutcome::Failed(_) => {
                            report.processed += 1;
                            report.failed += 1;
                        }
                        StepOutcome::Done => {
                            report.processed += 1;
                            report.done += 1;
                        }
                        StepOutcome::Waiting { .. } => report.processed += 1,
                    }
                    report.notes.push(step.note());
                }
                Err(e) => {
                    let code = FailureCode::Internal(e.to_string()).to_string();
                    tracing::warn!("⚠️ Run {} errored during tick: {e}", run.id);
                    match self.db.force_fail_run(&run.id, &code, now) {
                        Ok(_) => report.failed += 1,
                        Err(e2) => report
                            .errors
                            .push(format!("run {}: could not record failure: {e2}", run.id)),
                    }
                    report.processed += 1;
                    report.errors.push(format!("run {}: {e}", run.id));
                }
            }
        }

        if report.picked > 0 {
            tracing::info!(
                "⏱️ Tick {}: picked={} processed={} sent={} failed={} advanced={}",
                flow_id,
                report.picked,
                report.processed,
                report.sent,
                report.failed,
                report.advanced
            );
        }
        Ok(report)
    }

    pub async fn tick_all(
        &self,
        max_flows: Option<usize>,
        max_per_flow: Option<usize>,
    ) -> Result<TickAllReport> {
        self.tick_all_at(max_flows, max_per_flow, Utc::now()).await
    }

    /// Tick every flow that has due runs. One bad flow does not stop the pass.
    pub async fn tick_all_at(
        &self,
        max_flows: Option<usize>,
        max_per_flow: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<TickAllReport> {
        let max_flows = max_flows.unwrap_or(self.settings.max_flows_per_pass).max(1);
        let flow_ids = self.db.flows_with_ready_runs(now, max_flows)?;

        let mut all = TickAllReport {
            flows: flow_ids.len(),
            ..Default::default()
        };
        for flow_id in flow_ids {
            match self.tick_at(&flow_id, max_per_flow, now).await {
                Ok(r) => {
                    all.picked += r.picked;
                    all.processed += r.processed;
                    all.sent += r.sent;
                    all.failed += r.failed;
                    all.reports.push(r);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Tick skipped flow {flow_id}: {e}");
                    all.flow_errors.push(FlowFailure {
                        flow_id,
                        code: e.code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(all)
    }

    /// Enroll a recipient, using this engine's stores.
    pub fn enroll(&self, req: &EnrollRequest) -> Result<EnrollOutcome> {
        enroll::enroll(
            &self.db,
            self.deps.flows.as_ref(),
            self.deps.recipients.as_ref(),
            req,
            Utc::now(),
        )
    }
}

/// Spawn the engine loop: every interval, tick all due flows and then drain
/// one batch of the job queue.
pub async fn spawn_engine_loop(engine: Arc<FlowEngine>, check_interval_secs: u64) {
    tracing::info!(
        "⏰ Flow engine started (check every {}s, gateway={})",
        check_interval_secs,
        engine.collaborators().gateway.name()
    );

    let worker = QueueWorker::new(engine.clone());
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));

    loop {
        interval.tick().await;

        match engine.tick_all(None, None).await {
            Ok(pass) if pass.flows > 0 => tracing::info!(
                "🔁 Pass: flows={} processed={} sent={} failed={}",
                pass.flows,
                pass.processed,
                pass.sent,
                pass.failed
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Tick pass failed: {e}"),
        }

        if let Err(e) = worker.run_batch(None).await {
            tracing::warn!("⚠️ Queue worker batch failed: {e}");
        }
    }
}
