//! Idempotent enqueue of queue jobs.
//!
//! Duplicate scheduling attempts collapse into one pending job: an existing
//! pending job for the same (flow, recipient, node) slot, or a uniqueness
//! conflict on insert, both count as success.

use chrono::{DateTime, Utc};
use flowpost_core::Result;
use serde::Serialize;

use crate::persistence::SchedulerDb;
use crate::runs::{JobStatus, QueueJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EnqueueOutcome {
    Inserted,
    Deduped,
}

pub fn enqueue_next(
    db: &SchedulerDb,
    owner_id: &str,
    flow_id: &str,
    recipient_id: &str,
    next_node_id: &str,
    run_at: DateTime<Utc>,
) -> Result<EnqueueOutcome> {
    if let Some(existing) = db.pending_job_id(flow_id, recipient_id, next_node_id)? {
        tracing::debug!("Job already pending for {flow_id}/{recipient_id}/{next_node_id}: {existing}");
        return Ok(EnqueueOutcome::Deduped);
    }

    let now = Utc::now();
    let job = QueueJob {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: owner_id.to_string(),
        flow_id: flow_id.to_string(),
        recipient_id: recipient_id.to_string(),
        next_node_id: next_node_id.to_string(),
        run_at,
        status: JobStatus::Pending,
        created_at: now,
        updated_at: now,
    };
    if db.insert_job(&job)? {
        Ok(EnqueueOutcome::Inserted)
    } else {
        tracing::debug!("Enqueue race on {flow_id}/{recipient_id}/{next_node_id}, collapsed");
        Ok(EnqueueOutcome::Deduped)
    }
}
