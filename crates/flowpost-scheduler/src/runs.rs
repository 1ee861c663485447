//! Run and queue-job records, failure codes, and the audit event vocabulary.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a run through a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Done,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Done => "done",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RunStatus::Active),
            "done" => Some(RunStatus::Done),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// One recipient's progress through one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub owner_id: String,
    pub flow_id: String,
    pub recipient_id: String,
    pub status: RunStatus,
    /// `None` until the run has moved past the trigger.
    pub current_node_id: Option<String>,
    pub available_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; used as the optimistic-concurrency token.
    pub version: i64,
}

impl Run {
    /// A fresh run, parked before the trigger.
    pub fn new(owner_id: &str, flow_id: &str, recipient_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            flow_id: flow_id.to_string(),
            recipient_id: recipient_id.to_string(),
            status: RunStatus::Active,
            current_node_id: None,
            available_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Active && self.available_at.is_none_or(|t| t <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "done" => Some(JobStatus::Done),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A scheduled node visit, projected from run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: String,
    pub owner_id: String,
    pub flow_id: String,
    pub recipient_id: String,
    pub next_node_id: String,
    pub run_at: DateTime<Utc>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal per-run failure, stored on `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCode {
    TenantMismatch,
    NodeNotFound,
    RecipientNotFound,
    RecipientNoAddress,
    SenderNotConfigured,
    ContentMissing,
    SendFailed(String),
    MaxHopsExceeded,
    /// Unexpected error coerced into a failure by the tick loop.
    Internal(String),
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCode::TenantMismatch => write!(f, "TENANT_MISMATCH"),
            FailureCode::NodeNotFound => write!(f, "NODE_NOT_FOUND"),
            FailureCode::RecipientNotFound => write!(f, "RECIPIENT_NOT_FOUND"),
            FailureCode::RecipientNoAddress => write!(f, "RECIPIENT_NO_ADDRESS"),
            FailureCode::SenderNotConfigured => write!(f, "SENDER_NOT_CONFIGURED"),
            FailureCode::ContentMissing => write!(f, "CONTENT_MISSING"),
            FailureCode::SendFailed(detail) => write!(f, "SEND_FAILED: {detail}"),
            FailureCode::MaxHopsExceeded => write!(f, "MAX_HOPS_EXCEEDED"),
            FailureCode::Internal(detail) => write!(f, "INTERNAL: {detail}"),
        }
    }
}

/// Kinds of audit entries written alongside run updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Entered,
    Advanced,
    DelayArmed,
    BranchTaken,
    EmailSent,
    Done,
    Failed,
    Requeued,
    Cancelled,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entered => "entered",
            EventKind::Advanced => "advanced",
            EventKind::DelayArmed => "delay_armed",
            EventKind::BranchTaken => "branch_taken",
            EventKind::EmailSent => "email_sent",
            EventKind::Done => "done",
            EventKind::Failed => "failed",
            EventKind::Requeued => "requeued",
            EventKind::Cancelled => "cancelled",
        }
    }
}

/// An audit entry not yet written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub node_id: Option<String>,
    pub kind: EventKind,
    pub detail: Option<String>,
}

impl NewEvent {
    pub fn new(kind: EventKind, node_id: Option<&str>, detail: Option<String>) -> Self {
        Self {
            node_id: node_id.map(String::from),
            kind,
            detail,
        }
    }
}

/// A stored audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    pub node_id: Option<String>,
    pub kind: String,
    pub detail: Option<String>,
    pub at: String,
}

/// Timestamp text form used in storage: RFC 3339, UTC, milliseconds.
/// Fixed width, so lexical order matches time order.
pub fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
