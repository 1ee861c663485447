//! Enrollment: create (or find) runs for a recipient.
//!
//! Forced enrollment targets one flow and is ownership-checked. Event
//! enrollment scans the recipient owner's flows for triggers listening to
//! that event.

use chrono::{DateTime, Utc};
use flowpost_core::{FlowpostError, RecipientStore, Result};
use serde::{Deserialize, Serialize};

use crate::graph::{Flow, FlowStore, NodeKind};
use crate::persistence::SchedulerDb;
use crate::runs::Run;

/// Trigger events a flow can start on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    ListSubscribed,
    LeadCreated,
    CrmSent,
    Manual,
    Other(String),
}

impl TriggerEvent {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "list_subscribed" => TriggerEvent::ListSubscribed,
            "lead_created" => TriggerEvent::LeadCreated,
            "crm_sent" => TriggerEvent::CrmSent,
            "manual" => TriggerEvent::Manual,
            other => TriggerEvent::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TriggerEvent::ListSubscribed => "list_subscribed",
            TriggerEvent::LeadCreated => "lead_created",
            TriggerEvent::CrmSent => "crm_sent",
            TriggerEvent::Manual => "manual",
            TriggerEvent::Other(s) => s,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub recipient_id: String,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    /// Event-specific match key (list subscriptions).
    #[serde(default)]
    pub list_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrollOutcome {
    pub enrolled_flow_count: usize,
    pub runs_created: usize,
    pub runs_existing: usize,
    pub run_ids: Vec<String>,
}

/// Whether `flow`'s trigger listens to `event` (with `list_id` for lists).
pub fn trigger_matches(flow: &Flow, event: &TriggerEvent, list_id: Option<&str>) -> bool {
    let Some(NodeKind::Trigger(spec)) = flow.trigger().map(|n| &n.kind) else {
        return false;
    };
    let Some(configured) = spec.event.as_deref() else {
        return false;
    };
    if TriggerEvent::parse(configured) != *event {
        return false;
    }
    match event {
        TriggerEvent::ListSubscribed => match (spec.list_id.as_deref(), list_id) {
            (Some(want), Some(got)) => want == got.trim(),
            _ => false,
        },
        _ => true,
    }
}

/// Find the active run for (flow, recipient, owner) or create one.
/// Returns the run and whether it was created by this call.
pub fn ensure_run(
    db: &SchedulerDb,
    owner_id: &str,
    flow_id: &str,
    recipient_id: &str,
    now: DateTime<Utc>,
) -> Result<(Run, bool)> {
    if let Some(existing) = db.find_active_run(flow_id, recipient_id, owner_id)? {
        return Ok((existing, false));
    }
    let run = Run::new(owner_id, flow_id, recipient_id, now);
    if db.create_run(&run)? {
        tracing::info!("➕ Run {} created: flow={} recipient={}", run.id, flow_id, recipient_id);
        return Ok((run, true));
    }
    // Lost a race with a concurrent enrollment: report the winner.
    db.find_active_run(flow_id, recipient_id, owner_id)?
        .map(|r| (r, false))
        .ok_or_else(|| {
            FlowpostError::Database(format!(
                "active run for flow {flow_id} / recipient {recipient_id} vanished"
            ))
        })
}

pub fn enroll(
    db: &SchedulerDb,
    flows: &dyn FlowStore,
    recipients: &dyn RecipientStore,
    req: &EnrollRequest,
    now: DateTime<Utc>,
) -> Result<EnrollOutcome> {
    let recipient_id = req.recipient_id.trim();
    if recipient_id.is_empty() {
        return Err(FlowpostError::InvalidInput("recipient_id is required".into()));
    }
    let recipient = recipients
        .get_recipient(recipient_id)?
        .ok_or_else(|| FlowpostError::RecipientNotFound(recipient_id.to_string()))?;

    let targets: Vec<Flow> = match req.flow_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(flow_id) => {
            let flow = flows
                .load_flow(flow_id)?
                .ok_or_else(|| FlowpostError::FlowNotFound(flow_id.to_string()))?;
            if flow.owner_id != recipient.owner_id {
                return Err(FlowpostError::TenantMismatch(format!(
                    "flow {flow_id} and recipient {recipient_id} belong to different owners"
                )));
            }
            if flow.trigger().is_none() {
                return Err(FlowpostError::NoTrigger(flow_id.to_string()));
            }
            vec![flow]
        }
        None => {
            let event = req
                .event
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .map(TriggerEvent::parse)
                .ok_or_else(|| {
                    FlowpostError::InvalidInput("either flow_id or event is required".into())
                })?;
            flows
                .flows_for_owner(&recipient.owner_id)?
                .into_iter()
                .filter(|f| trigger_matches(f, &event, req.list_id.as_deref()))
                .collect()
        }
    };

    let mut outcome = EnrollOutcome {
        enrolled_flow_count: targets.len(),
        ..Default::default()
    };
    for flow in &targets {
        let (run, created) = ensure_run(db, &recipient.owner_id, &flow.id, &recipient.id, now)?;
        if created {
            outcome.runs_created += 1;
        } else {
            outcome.runs_existing += 1;
        }
        outcome.run_ids.push(run.id);
    }
    Ok(outcome)
}
