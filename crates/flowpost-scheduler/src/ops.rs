//! Operator actions and read-only diagnostics.
//!
//! The engine never retries failed runs or cancels anything by itself;
//! these are the explicit levers for that.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use flowpost_core::{FlowpostError, Result};
use serde::{Deserialize, Serialize};

use crate::graph::{EmailBody, Flow, NodeKind};
use crate::persistence::{ResetCounts, SchedulerDb};
use crate::runs::{Run, RunStatus};

/// Which failed runs to requeue. Every given field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequeueFilter {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub recipient_id: Option<String>,
}

impl RequeueFilter {
    fn is_empty(&self) -> bool {
        self.run_id.is_none() && self.flow_id.is_none() && self.recipient_id.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequeueReport {
    pub matched: usize,
    pub requeued: usize,
    /// Failed runs whose slot is already taken by a newer active run.
    pub blocked: usize,
}

/// Reset matching failed runs to active, due now, error cleared.
pub fn requeue(db: &SchedulerDb, filter: &RequeueFilter, now: DateTime<Utc>) -> Result<RequeueReport> {
    if filter.is_empty() {
        return Err(FlowpostError::InvalidInput(
            "requeue needs run_id, flow_id or recipient_id".into(),
        ));
    }
    let ids = db.failed_run_ids(
        filter.run_id.as_deref(),
        filter.flow_id.as_deref(),
        filter.recipient_id.as_deref(),
    )?;
    let mut report = RequeueReport {
        matched: ids.len(),
        ..Default::default()
    };
    for id in &ids {
        if db.requeue_run(id, now)? {
            report.requeued += 1;
        } else {
            report.blocked += 1;
        }
    }
    if report.requeued > 0 {
        tracing::info!("🔄 Requeued {} failed run(s)", report.requeued);
    }
    Ok(report)
}

/// Make every active run of a flow due immediately. Returns runs touched.
pub fn kick(db: &SchedulerDb, flow_id: &str, now: DateTime<Utc>) -> Result<usize> {
    let touched = db.kick_flow(flow_id, now)?;
    tracing::info!("👢 Kicked flow {flow_id}: {touched} active run(s) due now");
    Ok(touched)
}

/// Terminate a run. Returns the run as stored afterwards and whether this
/// call changed it.
pub fn cancel(db: &SchedulerDb, run_id: &str, now: DateTime<Utc>) -> Result<(Run, bool)> {
    if db.get_run(run_id)?.is_none() {
        return Err(FlowpostError::RunNotFound(run_id.to_string()));
    }
    let changed = db.cancel_run(run_id, now)?;
    let run = db
        .get_run(run_id)?
        .ok_or_else(|| FlowpostError::RunNotFound(run_id.to_string()))?;
    if changed {
        tracing::info!("✋ Run {run_id} cancelled");
    }
    Ok((run, changed))
}

/// Delete all execution state of a flow. Requires explicit confirmation.
pub fn reset_flow(db: &SchedulerDb, flow_id: &str, confirm_deletion: bool) -> Result<ResetCounts> {
    if !confirm_deletion {
        return Err(FlowpostError::InvalidInput(
            "confirm_deletion must be true to reset a flow".into(),
        ));
    }
    let counts = db.reset_flow(flow_id)?;
    tracing::warn!(
        "🗑️ Flow {flow_id} reset: {} run(s), {} job(s), {} event(s) deleted",
        counts.runs,
        counts.jobs,
        counts.events
    );
    Ok(counts)
}

// ─── Stats ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStat {
    /// `None` for runs not yet past the trigger.
    pub node_id: Option<String>,
    pub node_type: String,
    pub active: usize,
    pub done: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FlowStats {
    pub flow_id: String,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_node: Vec<NodeStat>,
}

/// Run counts per status and per current node, in graph order.
pub fn node_stats(db: &SchedulerDb, flow: &Flow) -> Result<FlowStats> {
    let counts = db.node_counts(&flow.id)?;
    let mut stats = FlowStats {
        flow_id: flow.id.clone(),
        ..Default::default()
    };
    let mut by_node: BTreeMap<Option<String>, NodeStat> = BTreeMap::new();

    for c in counts {
        stats.total += c.count;
        *stats.by_status.entry(c.status.as_str().to_string()).or_default() += c.count;

        let entry = by_node.entry(c.node_id.clone()).or_insert_with(|| NodeStat {
            node_id: c.node_id.clone(),
            node_type: match c.node_id.as_deref() {
                None => "entry".to_string(),
                Some(id) => flow
                    .node(id)
                    .map(|n| n.kind.type_name().to_string())
                    .unwrap_or_else(|| "missing".to_string()),
            },
            ..Default::default()
        });
        match c.status {
            RunStatus::Active => entry.active += c.count,
            RunStatus::Done => entry.done += c.count,
            RunStatus::Failed => entry.failed += c.count,
        }
    }

    let order = |id: &Option<String>| match id {
        None => 0,
        Some(id) => flow
            .nodes
            .iter()
            .position(|n| &n.id == id)
            .map(|p| p + 1)
            .unwrap_or(usize::MAX),
    };
    let mut nodes: Vec<NodeStat> = by_node.into_values().collect();
    nodes.sort_by_key(|s| order(&s.node_id));
    stats.by_node = nodes;
    Ok(stats)
}

// ─── Diagnose ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnosis {
    pub flow_id: String,
    pub owner_id: String,
    pub ok: bool,
    pub trigger_id: Option<String>,
    pub trigger_event: Option<String>,
    pub first_target: Option<String>,
    pub node_types: BTreeMap<String, String>,
    pub dangling_edges: Vec<String>,
    pub unreachable_nodes: Vec<String>,
    pub email_nodes_without_content: Vec<String>,
    pub active_runs: usize,
    pub problems: Vec<String>,
}

/// Structural checks of a flow, plus how many runs are live in it.
pub fn diagnose(db: &SchedulerDb, flow: &Flow) -> Result<Diagnosis> {
    let mut d = Diagnosis {
        flow_id: flow.id.clone(),
        owner_id: flow.owner_id.clone(),
        node_types: flow
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.kind.type_name().to_string()))
            .collect(),
        ..Default::default()
    };

    match flow.trigger() {
        Some(trigger) => {
            d.trigger_id = Some(trigger.id.clone());
            if let NodeKind::Trigger(spec) = &trigger.kind {
                d.trigger_event = spec.event.clone();
            }
            d.first_target = flow.next_target(&trigger.id).map(String::from);
            if d.first_target.is_none() {
                d.problems.push("trigger has no outgoing edge".into());
            }
        }
        None => d.problems.push("NO_TRIGGER: flow has no trigger node".into()),
    }

    for e in &flow.edges {
        let missing: Vec<&str> = [e.source.as_str(), e.target.as_str()]
            .into_iter()
            .filter(|id| flow.node(id).is_none())
            .collect();
        if !missing.is_empty() {
            d.dangling_edges.push(format!("{} → {}", e.source, e.target));
        }
    }
    if !d.dangling_edges.is_empty() {
        d.problems
            .push(format!("{} edge(s) reference unknown nodes", d.dangling_edges.len()));
    }

    if let Some(start) = &d.trigger_id {
        let mut seen: HashSet<&str> = HashSet::from([start.as_str()]);
        let mut queue: VecDeque<&str> = VecDeque::from([start.as_str()]);
        while let Some(id) = queue.pop_front() {
            for e in flow.edges.iter().filter(|e| e.source == id) {
                if seen.insert(e.target.as_str()) {
                    queue.push_back(e.target.as_str());
                }
            }
        }
        d.unreachable_nodes = flow
            .nodes
            .iter()
            .filter(|n| !seen.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();
    }

    d.email_nodes_without_content = flow
        .nodes
        .iter()
        .filter(|n| matches!(&n.kind, NodeKind::Email(spec) if spec.body == EmailBody::Missing))
        .map(|n| n.id.clone())
        .collect();
    if !d.email_nodes_without_content.is_empty() {
        d.problems.push(format!(
            "{} email node(s) have no body",
            d.email_nodes_without_content.len()
        ));
    }

    d.active_runs = db
        .node_counts(&flow.id)?
        .iter()
        .filter(|c| c.status == RunStatus::Active)
        .map(|c| c.count)
        .sum();
    d.ok = d.problems.is_empty();
    Ok(d)
}
