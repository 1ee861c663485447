//! Step executor: advances one ready run through its flow.
//!
//! One step claims and leases the run, walks it forward until it has to
//! wait, then commits the new state together with its audit trail. A step
//! stops when the run:
//! - arrives at a delay node (the delay is armed on arrival),
//! - has sent one email,
//! - reaches a terminal state.
//!
//! Trigger, condition, pass-through and elapsed-delay nodes are chained
//! within the same step, bounded by `max_hops`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowpost_core::{
    ContentResolver, CorrelationTags, FlowpostError, MessageGateway, OutboundEmail,
    RecipientStore, Result, SendReceipt, SenderIdentity, SenderResolver,
};

use crate::branch::{AlwaysNo, BranchContext, BranchResolver};
use crate::delay;
use crate::graph::{EmailBody, EmailSpec, Flow, FlowStore, Node, NodeKind};
use crate::persistence::SchedulerDb;
use crate::runs::{EventKind, FailureCode, NewEvent, Run, RunStatus};

/// External collaborators the engine reads from and sends through.
#[derive(Clone)]
pub struct Collaborators {
    pub flows: Arc<dyn FlowStore>,
    pub recipients: Arc<dyn RecipientStore>,
    pub senders: Arc<dyn SenderResolver>,
    pub content: Arc<dyn ContentResolver>,
    pub gateway: Arc<dyn MessageGateway>,
    pub branches: Arc<dyn BranchResolver>,
}

impl Collaborators {
    /// Every store backed by the scheduler database, `AlwaysNo` branching.
    pub fn from_db(db: &Arc<SchedulerDb>, gateway: Arc<dyn MessageGateway>) -> Self {
        Self {
            flows: db.clone(),
            recipients: db.clone(),
            senders: db.clone(),
            content: db.clone(),
            gateway,
            branches: Arc::new(AlwaysNo),
        }
    }
}

/// How a step left the run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Still active, parked at `node_id` until `until`.
    Waiting {
        node_id: String,
        until: DateTime<Utc>,
    },
    Done,
    Failed(FailureCode),
    /// Not processed: not ready, or another writer holds a newer version.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub run_id: String,
    pub outcome: StepOutcome,
    /// Emails handed to the gateway during this step (0 or 1).
    pub sent: usize,
    /// Nodes the pointer moved onto, in order.
    pub path: Vec<String>,
}

impl StepReport {
    fn skipped(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            outcome: StepOutcome::Skipped,
            sent: 0,
            path: Vec::new(),
        }
    }

    pub fn moved(&self) -> bool {
        !self.path.is_empty()
    }

    /// One-line operator note.
    pub fn note(&self) -> String {
        let short = self.run_id.get(..8).unwrap_or(&self.run_id);
        let path = if self.path.is_empty() {
            String::new()
        } else {
            format!(" via {}", self.path.join(" → "))
        };
        match &self.outcome {
            StepOutcome::Waiting { node_id, until } => {
                format!("run {short}: waiting at {node_id} until {}{path}", until.to_rfc3339())
            }
            StepOutcome::Done => format!("run {short}: done{path}"),
            StepOutcome::Failed(code) => format!("run {short}: failed {code}{path}"),
            StepOutcome::Skipped => format!("run {short}: skipped"),
        }
    }
}

/// Accumulates what happened during one step.
#[derive(Default)]
struct Trail {
    events: Vec<NewEvent>,
    path: Vec<String>,
    sent: usize,
}

impl Trail {
    fn push(&mut self, kind: EventKind, node_id: Option<&str>, detail: Option<String>) {
        self.events.push(NewEvent::new(kind, node_id, detail));
    }
}

pub struct StepExecutor<'a> {
    db: &'a SchedulerDb,
    deps: &'a Collaborators,
    max_hops: usize,
}

impl<'a> StepExecutor<'a> {
    pub fn new(db: &'a SchedulerDb, deps: &'a Collaborators, max_hops: usize) -> Self {
        Self {
            db,
            deps,
            max_hops: max_hops.max(1),
        }
    }

    /// Process one run once. Per-run failures are recorded on the run and
    /// reported in the outcome; `Err` means storage itself failed.
    pub async fn step(&self, flow: &Flow, run: &Run, now: DateTime<Utc>) -> Result<StepReport> {
        if !run.is_ready(now) || run.flow_id != flow.id {
            return Ok(StepReport::skipped(&run.id));
        }
        if !self.db.claim_run(&run.id, run.version, now)? {
            tracing::debug!("Run {} claimed elsewhere, skipping", run.id);
            return Ok(StepReport::skipped(&run.id));
        }
        let claimed = run.version + 1;
        let mut state = run.clone();
        state.version = claimed;

        let mut trail = Trail::default();
        let outcome = self.drive(flow, &mut state, &mut trail, now).await;

        match &outcome {
            StepOutcome::Done => {
                state.status = RunStatus::Done;
                trail.push(EventKind::Done, state.current_node_id.as_deref(), None);
                tracing::info!("🏁 Run {} finished flow {}", state.id, flow.id);
            }
            StepOutcome::Failed(code) => {
                state.status = RunStatus::Failed;
                state.last_error = Some(code.to_string());
                trail.push(
                    EventKind::Failed,
                    state.current_node_id.as_deref(),
                    Some(code.to_string()),
                );
                tracing::warn!("⚠️ Run {} failed at {:?}: {code}", state.id, state.current_node_id);
            }
            StepOutcome::Waiting { .. } | StepOutcome::Skipped => {}
        }
        state.updated_at = now;

        let committed = self.db.commit_run(&state, claimed, &trail.events, now)?;
        let outcome = if committed {
            outcome
        } else {
            tracing::warn!(
                "⚠️ Run {} changed during its step (sent={}); state not written",
                state.id,
                trail.sent
            );
            StepOutcome::Skipped
        };

        Ok(StepReport {
            run_id: state.id,
            outcome,
            sent: trail.sent,
            path: trail.path,
        })
    }

    async fn drive(
        &self,
        flow: &Flow,
        state: &mut Run,
        trail: &mut Trail,
        now: DateTime<Utc>,
    ) -> StepOutcome {
        if state.owner_id != flow.owner_id {
            return StepOutcome::Failed(FailureCode::TenantMismatch);
        }
        match self.deps.recipients.get_recipient(&state.recipient_id) {
            Ok(Some(r)) if r.owner_id != state.owner_id => {
                return StepOutcome::Failed(FailureCode::TenantMismatch);
            }
            Ok(_) => {}
            Err(e) => return StepOutcome::Failed(FailureCode::Internal(e.to_string())),
        }

        for _ in 0..self.max_hops {
            let node = match state.current_node_id.as_deref() {
                None => flow.trigger(),
                Some(id) => flow.node(id),
            };
            let Some(node) = node else {
                return StepOutcome::Failed(FailureCode::NodeNotFound);
            };
            tracing::debug!("Run {} at {} ({})", state.id, node.id, node.kind.type_name());

            let target = match &node.kind {
                NodeKind::Condition(_) => {
                    let ctx = BranchContext {
                        flow,
                        run: state,
                        now,
                    };
                    let branch = self.deps.branches.resolve_branch(node, &ctx);
                    trail.push(EventKind::BranchTaken, Some(&node.id), Some(branch.clone()));
                    flow.branch_target(&node.id, &branch)
                }
                NodeKind::Email(spec) => match self.send_email(flow, node, spec, state).await {
                    Ok(receipt) => {
                        trail.sent += 1;
                        trail.push(EventKind::EmailSent, Some(&node.id), receipt.provider_message_id);
                        let Some(next) = flow.next_target(&node.id) else {
                            return StepOutcome::Done;
                        };
                        let until = self.arrive(flow, state, trail, next, now).unwrap_or(now);
                        state.available_at = Some(until);
                        return StepOutcome::Waiting {
                            node_id: next.to_string(),
                            until,
                        };
                    }
                    Err(code) => return StepOutcome::Failed(code),
                },
                // Trigger, elapsed delay, anything else: pass through.
                _ => flow.next_target(&node.id),
            };

            let Some(target) = target else {
                return StepOutcome::Done;
            };
            if let Some(until) = self.arrive(flow, state, trail, target, now) {
                return StepOutcome::Waiting {
                    node_id: target.to_string(),
                    until,
                };
            }
        }

        StepOutcome::Failed(FailureCode::MaxHopsExceeded)
    }

    /// Move the pointer onto `target`. Arriving at a delay arms it and
    /// returns the wake-up time.
    fn arrive(
        &self,
        flow: &Flow,
        state: &mut Run,
        trail: &mut Trail,
        target: &str,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        state.current_node_id = Some(target.to_string());
        state.available_at = None;
        trail.path.push(target.to_string());
        trail.push(EventKind::Advanced, Some(target), None);

        let Some(Node {
            kind: NodeKind::Delay(spec),
            ..
        }) = flow.node(target)
        else {
            return None;
        };
        let until = delay::resolve(spec.amount, &spec.unit, now);
        state.available_at = Some(until);
        trail.push(EventKind::DelayArmed, Some(target), Some(until.to_rfc3339()));
        Some(until)
    }

    async fn send_email(
        &self,
        flow: &Flow,
        node: &Node,
        spec: &EmailSpec,
        run: &Run,
    ) -> std::result::Result<SendReceipt, FailureCode> {
        let internal = |e: FlowpostError| FailureCode::Internal(e.to_string());

        let recipient = self
            .deps
            .recipients
            .get_recipient(&run.recipient_id)
            .map_err(internal)?
            .ok_or(FailureCode::RecipientNotFound)?;
        if recipient.owner_id != run.owner_id || flow.owner_id != run.owner_id {
            return Err(FailureCode::TenantMismatch);
        }
        let to = recipient
            .address()
            .ok_or(FailureCode::RecipientNoAddress)?
            .to_string();
        let from = self.sender(spec, &run.owner_id)?;
        let html = self.html(spec, &run.owner_id)?;

        let email = OutboundEmail {
            to,
            from,
            subject: spec.subject.clone(),
            html,
            tags: CorrelationTags {
                flow_id: flow.id.clone(),
                node_id: node.id.clone(),
                run_id: run.id.clone(),
                owner_id: run.owner_id.clone(),
                recipient_id: run.recipient_id.clone(),
            },
        };

        match self.deps.gateway.send(&email).await {
            Ok(receipt) => {
                tracing::info!(
                    "📤 Email '{}' sent to {} via {} (run {}, node {})",
                    email.subject,
                    email.to,
                    self.deps.gateway.name(),
                    run.id,
                    node.id
                );
                Ok(receipt)
            }
            Err(FlowpostError::Gateway(detail)) => Err(FailureCode::SendFailed(detail)),
            Err(e) => Err(FailureCode::SendFailed(e.to_string())),
        }
    }

    /// Node-level From overrides the owner's account identity.
    fn sender(&self, spec: &EmailSpec, owner_id: &str) -> std::result::Result<SenderIdentity, FailureCode> {
        let account = self
            .deps
            .senders
            .sender_for(owner_id)
            .map_err(|e| FailureCode::Internal(e.to_string()))?;

        match (spec.from_email.as_deref(), account) {
            (Some(from_email), account) => Ok(SenderIdentity {
                from_email: from_email.to_string(),
                from_name: spec
                    .from_name
                    .clone()
                    .or_else(|| account.map(|a| a.from_name))
                    .unwrap_or_default(),
            }),
            (None, Some(mut account)) => {
                if let Some(name) = &spec.from_name {
                    account.from_name = name.clone();
                }
                Ok(account)
            }
            (None, None) => Err(FailureCode::SenderNotConfigured),
        }
    }

    fn html(&self, spec: &EmailSpec, owner_id: &str) -> std::result::Result<String, FailureCode> {
        match &spec.body {
            EmailBody::Inline(html) => Ok(html.clone()),
            EmailBody::Ref(html_ref) => self
                .deps
                .content
                .resolve_html(owner_id, html_ref)
                .map_err(|e| FailureCode::Internal(e.to_string()))?
                .ok_or(FailureCode::ContentMissing),
            EmailBody::Missing => Err(FailureCode::ContentMissing),
        }
    }
}
