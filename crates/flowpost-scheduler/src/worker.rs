//! Queue worker: the job-queue view of run state.
//!
//! Jobs are derived from runs, never the other way round. Projection
//! enqueues one job per active run at its current position; the worker
//! claims due jobs, steps the run a job points at, and enqueues the
//! follow-up job from the run's new position.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowpost_core::Result;
use serde::Serialize;

use crate::engine::{FlowEngine, MAX_RUNS_CEILING};
use crate::enqueue::{EnqueueOutcome, enqueue_next};
use crate::executor::{StepExecutor, StepOutcome};
use crate::graph::Flow;
use crate::runs::{FailureCode, JobStatus, QueueJob, Run, RunStatus};

/// Upper bound on runs projected per flow in one call.
const PROJECT_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectReport {
    pub flow_id: String,
    pub inserted: usize,
    pub deduped: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub claimed: usize,
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Jobs whose run had moved on or finished before the job ran.
    pub superseded: usize,
    pub enqueued: usize,
    pub errors: Vec<String>,
}

pub struct QueueWorker {
    engine: Arc<FlowEngine>,
}

impl QueueWorker {
    pub fn new(engine: Arc<FlowEngine>) -> Self {
        Self { engine }
    }

    /// Enqueue a job for every active run of a flow at its current position.
    pub fn project_flow(&self, flow_id: &str, now: DateTime<Utc>) -> Result<ProjectReport> {
        let flow = self.engine.load_flow(flow_id)?;
        let runs = self
            .engine
            .db()
            .list_runs(flow_id, Some(RunStatus::Active), PROJECT_LIMIT)?;

        let mut report = ProjectReport {
            flow_id: flow_id.to_string(),
            ..Default::default()
        };
        for run in &runs {
            match self.enqueue_follow_up(&flow, run, now)? {
                EnqueueOutcome::Inserted => report.inserted += 1,
                EnqueueOutcome::Deduped => report.deduped += 1,
            }
        }
        tracing::info!(
            "📥 Projected flow {flow_id}: {} job(s) inserted, {} already pending",
            report.inserted,
            report.deduped
        );
        Ok(report)
    }

    pub async fn run_batch(&self, limit: Option<usize>) -> Result<WorkerReport> {
        self.run_batch_at(limit, Utc::now()).await
    }

    /// Process up to `limit` due jobs.
    pub async fn run_batch_at(&self, limit: Option<usize>, now: DateTime<Utc>) -> Result<WorkerReport> {
        let limit = limit
            .unwrap_or(self.engine.settings().worker_batch_limit)
            .clamp(1, MAX_RUNS_CEILING);
        let db = self.engine.db();
        let jobs = db.due_jobs(now, limit)?;
        let executor = self.engine.executor();
        let mut flows: HashMap<String, Flow> = HashMap::new();
        let mut report = WorkerReport::default();

        for job in &jobs {
            if !db.claim_job(&job.id, now)? {
                continue;
            }
            report.claimed += 1;
            if let Err(e) = self
                .process(job, &executor, &mut flows, &mut report, now)
                .await
            {
                tracing::warn!("⚠️ Job {} failed: {e}", job.id);
                report.errors.push(format!("job {}: {e}", job.id));
                if let Err(e2) = db.finish_job(&job.id, JobStatus::Failed, now) {
                    report
                        .errors
                        .push(format!("job {}: could not mark failed: {e2}", job.id));
                }
            }
        }

        if report.claimed > 0 {
            tracing::info!(
                "🧵 Worker: claimed={} processed={} sent={} superseded={}",
                report.claimed,
                report.processed,
                report.sent,
                report.superseded
            );
        }
        Ok(report)
    }

    async fn process(
        &self,
        job: &QueueJob,
        executor: &StepExecutor<'_>,
        flows: &mut HashMap<String, Flow>,
        report: &mut WorkerReport,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let db = self.engine.db();
        let Some(run) = db.find_active_run(&job.flow_id, &job.recipient_id, &job.owner_id)? else {
            db.finish_job(&job.id, JobStatus::Done, now)?;
            report.superseded += 1;
            return Ok(());
        };

        if !flows.contains_key(&job.flow_id) {
            let flow = self.engine.load_flow(&job.flow_id)?;
            flows.insert(job.flow_id.clone(), flow);
        }
        let Some(flow) = flows.get(&job.flow_id) else {
            return Ok(());
        };

        if position(flow, &run) != job.next_node_id || !run.is_ready(now) {
            db.finish_job(&job.id, JobStatus::Done, now)?;
            report.superseded += 1;
            if self.enqueue_follow_up(flow, &run, now)? == EnqueueOutcome::Inserted {
                report.enqueued += 1;
            }
            return Ok(());
        }

        let step = match executor.step(flow, &run, now).await {
            Ok(step) => step,
            Err(e) => {
                let code = FailureCode::Internal(e.to_string()).to_string();
                tracing::warn!("⚠️ Run {} errored in worker: {e}", run.id);
                report.processed += 1;
                report.errors.push(format!("run {}: {e}", run.id));
                match db.force_fail_run(&run.id, &code, now) {
                    Ok(_) => report.failed += 1,
                    Err(e2) => report
                        .errors
                        .push(format!("run {}: could not record failure: {e2}", run.id)),
                }
                db.finish_job(&job.id, JobStatus::Failed, now)?;
                return Ok(());
            }
        };
        report.sent += step.sent;
        let job_status = match step.outcome {
            StepOutcome::Skipped => {
                report.superseded += 1;
                JobStatus::Done
            }
            StepOutcome::Failed(_) => {
                report.processed += 1;
                report.failed += 1;
                JobStatus::Failed
            }
            StepOutcome::Done | StepOutcome::Waiting { .. } => {
                report.processed += 1;
                JobStatus::Done
            }
        };
        db.finish_job(&job.id, job_status, now)?;

        if let Some(after) = db.get_run(&run.id)?
            && after.status == RunStatus::Active
            && self.enqueue_follow_up(flow, &after, now)? == EnqueueOutcome::Inserted
        {
            report.enqueued += 1;
        }
        Ok(())
    }

    fn enqueue_follow_up(&self, flow: &Flow, run: &Run, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        enqueue_next(
            self.engine.db(),
            &run.owner_id,
            &run.flow_id,
            &run.recipient_id,
            &position(flow, run),
            run.available_at.unwrap_or(now),
        )
    }
}

/// Node a run will visit next: its pointer, or the trigger before entry.
fn position(flow: &Flow, run: &Run) -> String {
    run.current_node_id
        .clone()
        .or_else(|| flow.trigger().map(|t| t.id.clone()))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FlowDocument;
    use crate::persistence::SchedulerDb;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use flowpost_core::{MessageGateway, OutboundEmail, Recipient, SendReceipt, SenderIdentity};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TallyGateway {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl MessageGateway for TallyGateway {
        fn name(&self) -> &str {
            "tally"
        }

        async fn send(&self, _email: &OutboundEmail) -> Result<SendReceipt> {
            let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(SendReceipt {
                provider_message_id: Some(format!("t{n}")),
            })
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 3, 7, 30, 0).unwrap()
    }

    fn setup() -> (Arc<SchedulerDb>, Arc<FlowEngine>) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let engine = Arc::new(FlowEngine::new(db.clone(), Arc::new(TallyGateway::default())));
        db.set_sender(
            "u1",
            &SenderIdentity {
                from_email: "team@shop.test".into(),
                from_name: "Team".into(),
            },
            now(),
        )
        .unwrap();
        db.upsert_flow(
            &FlowDocument {
                id: "f1".into(),
                owner_id: "u1".into(),
                name: "mail".into(),
                nodes: json!([
                    {"id": "t", "type": "trigger"},
                    {"id": "e", "type": "email", "data": {"subject": "Hi", "html": "<p>Hi</p>"}}
                ]),
                edges: json!([{"source": "t", "target": "e"}]),
            },
            now(),
        )
        .unwrap();
        for id in ["r1", "r2"] {
            db.upsert_recipient(
                &Recipient {
                    id: id.into(),
                    owner_id: "u1".into(),
                    email: Some(format!("{id}@example.com")),
                    name: None,
                },
                now(),
            )
            .unwrap();
            db.create_run(&Run::new("u1", "f1", id, now())).unwrap();
        }
        (db, engine)
    }

    #[tokio::test]
    async fn test_store_failure_mid_step_fails_the_run() {
        let (db, engine) = setup();
        let worker = QueueWorker::new(engine);
        assert_eq!(worker.project_flow("f1", now()).unwrap().inserted, 2);

        // Every commit that would finish a run is rejected by the store.
        db.execute_raw(
            "CREATE TRIGGER refuse_done BEFORE UPDATE ON runs WHEN NEW.status = 'done'
             BEGIN SELECT RAISE(ABORT, 'disk is full'); END;",
        )
        .unwrap();

        let report = worker.run_batch_at(None, now()).await.unwrap();
        assert_eq!(report.claimed, 2);
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.errors.len(), 2);

        for id in ["r1", "r2"] {
            assert!(db.find_active_run("f1", id, "u1").unwrap().is_none());
        }
        let failed = db.list_runs("f1", Some(RunStatus::Failed), 10).unwrap();
        assert_eq!(failed.len(), 2);
        for run in &failed {
            let err = run.last_error.as_deref().unwrap();
            assert!(err.starts_with("INTERNAL: "), "{err}");
            assert!(err.contains("disk is full"), "{err}");
        }

        let jobs = db.list_jobs("f1").unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
    }
}
