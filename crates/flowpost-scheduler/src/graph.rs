//! Flow graph model.
//!
//! Flows are authored as loose JSON (node `data` maps with many optional and
//! aliased keys). They are normalized exactly once, when loaded, into typed
//! nodes so the executor never probes field names.

use flowpost_core::{FlowpostError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A normalized automation flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flow {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// One typed step of a flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Trigger(TriggerSpec),
    Delay(DelaySpec),
    Condition(ConditionSpec),
    Email(EmailSpec),
    Other { raw_type: String },
}

impl NodeKind {
    pub fn type_name(&self) -> &str {
        match self {
            NodeKind::Trigger(_) => "trigger",
            NodeKind::Delay(_) => "delay",
            NodeKind::Condition(_) => "condition",
            NodeKind::Email(_) => "email",
            NodeKind::Other { raw_type } => raw_type,
        }
    }
}

/// Trigger configuration: which enrollment event starts this flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TriggerSpec {
    pub event: Option<String>,
    pub list_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DelaySpec {
    pub amount: f64,
    pub unit: String,
}

/// Condition payload is kept opaque; branch choice is a policy decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionSpec {
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmailSpec {
    pub subject: String,
    pub from_email: Option<String>,
    pub from_name: Option<String>,
    pub body: EmailBody,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum EmailBody {
    Inline(String),
    Ref(String),
    Missing,
}

/// Directed connection. `branch` only matters when leaving a condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub branch: Option<String>,
}

/// A flow as stored/imported: raw node and edge JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDocument {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub nodes: Value,
    #[serde(default)]
    pub edges: Value,
}

impl FlowDocument {
    pub fn normalize(&self) -> Result<Flow> {
        Flow::from_json(&self.id, &self.owner_id, &self.name, &self.nodes, &self.edges)
    }
}

/// Read-only flow source.
pub trait FlowStore: Send + Sync {
    fn load_flow(&self, flow_id: &str) -> Result<Option<Flow>>;

    /// All valid flows of one owner. Flows that fail to normalize are skipped.
    fn flows_for_owner(&self, owner_id: &str) -> Result<Vec<Flow>>;
}

// ─── Lookups ──────────────────────────────────────────────

pub fn find_trigger(nodes: &[Node]) -> Option<&Node> {
    nodes
        .iter()
        .find(|n| matches!(n.kind, NodeKind::Trigger(_)))
}

pub fn find_node<'a>(nodes: &'a [Node], id: &str) -> Option<&'a Node> {
    nodes.iter().find(|n| n.id == id)
}

/// First edge in declaration order leaving `source`.
pub fn first_outgoing_edge<'a>(edges: &'a [Edge], source: &str) -> Option<&'a Edge> {
    edges.iter().find(|e| e.source == source)
}

/// First edge leaving `source` tagged `branch`. Falls back to the first
/// outgoing edge when no edge carries that tag.
pub fn branch_outgoing_edge<'a>(edges: &'a [Edge], source: &str, branch: &str) -> Option<&'a Edge> {
    edges
        .iter()
        .find(|e| {
            e.source == source
                && e
                    .branch
                    .as_deref()
                    .is_some_and(|b| b.eq_ignore_ascii_case(branch))
        })
        .or_else(|| first_outgoing_edge(edges, source))
}

impl Flow {
    pub fn trigger(&self) -> Option<&Node> {
        find_trigger(&self.nodes)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        find_node(&self.nodes, id)
    }

    pub fn next_target(&self, source: &str) -> Option<&str> {
        first_outgoing_edge(&self.edges, source).map(|e| e.target.as_str())
    }

    pub fn branch_target(&self, source: &str, branch: &str) -> Option<&str> {
        branch_outgoing_edge(&self.edges, source, branch).map(|e| e.target.as_str())
    }

    /// Normalize raw node/edge JSON. Accepts arrays or JSON-encoded strings.
    pub fn from_json(
        id: &str,
        owner_id: &str,
        name: &str,
        nodes: &Value,
        edges: &Value,
    ) -> Result<Self> {
        let nodes_raw = as_array(nodes, "nodes")?;
        let edges_raw = as_array(edges, "edges")?;

        let mut parsed: Vec<Node> = Vec::with_capacity(nodes_raw.len());
        for raw in &nodes_raw {
            let node = normalize_node(raw)?;
            if parsed.iter().any(|n| n.id == node.id) {
                return Err(FlowpostError::InvalidFlow(format!(
                    "flow {id}: duplicate node id '{}'",
                    node.id
                )));
            }
            parsed.push(node);
        }

        let triggers = parsed
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Trigger(_)))
            .count();
        if triggers > 1 {
            return Err(FlowpostError::InvalidFlow(format!(
                "flow {id}: {triggers} trigger nodes, expected one"
            )));
        }

        let mut parsed_edges = Vec::with_capacity(edges_raw.len());
        for raw in &edges_raw {
            match normalize_edge(raw) {
                Some(edge) => parsed_edges.push(edge),
                None => tracing::warn!("⚠️ Flow {id}: skipping edge without source/target: {raw}"),
            }
        }

        Ok(Self {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            nodes: parsed,
            edges: parsed_edges,
        })
    }
}

// ─── Normalization ────────────────────────────────────────

fn as_array(v: &Value, what: &str) -> Result<Vec<Value>> {
    match v {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Err(FlowpostError::InvalidFlow(format!("{what} is not a JSON array"))),
        },
        _ => Err(FlowpostError::InvalidFlow(format!("{what} is not an array"))),
    }
}

/// String or number as an owned string, trimmed, non-empty.
fn scalar(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn first_scalar(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| scalar(&data[*k]))
}

fn normalize_node(raw: &Value) -> Result<Node> {
    let id = scalar(&raw["id"])
        .ok_or_else(|| FlowpostError::InvalidFlow(format!("node without id: {raw}")))?;
    let data = &raw["data"];
    let node_type = scalar(&raw["type"])
        .or_else(|| scalar(&data["type"]))
        .unwrap_or_default()
        .to_lowercase();

    let kind = match node_type.as_str() {
        "trigger" => NodeKind::Trigger(TriggerSpec {
            event: first_scalar(data, &["triggerType", "trigger_type", "event"])
                .map(|e| e.to_lowercase()),
            list_id: first_scalar(data, &["listId", "list_id"]),
        }),
        "delay" => NodeKind::Delay(normalize_delay(data)),
        "condition" => NodeKind::Condition(ConditionSpec { data: data.clone() }),
        "email" => NodeKind::Email(normalize_email(data)),
        other => NodeKind::Other {
            raw_type: other.to_string(),
        },
    };

    Ok(Node { id, kind })
}

fn normalize_delay(data: &Value) -> DelaySpec {
    let nested = &data["delay"];
    let explicit_unit = scalar(&data["unit"]).or_else(|| scalar(&nested["unit"]));

    let generic = number(&data["amount"])
        .or_else(|| number(&nested["amount"]))
        .or_else(|| number(&data["value"]));
    let in_minutes = number(&data["minutes"])
        .or_else(|| number(&data["delay_minutes"]))
        .or_else(|| number(&data["delayMinutes"]));

    match (generic, in_minutes) {
        (Some(amount), _) => DelaySpec {
            amount,
            unit: explicit_unit.unwrap_or_else(|| "minutes".into()),
        },
        (None, Some(amount)) => DelaySpec {
            amount,
            unit: "minutes".into(),
        },
        (None, None) => DelaySpec {
            amount: 0.0,
            unit: explicit_unit.unwrap_or_else(|| "minutes".into()),
        },
    }
}

fn normalize_email(data: &Value) -> EmailSpec {
    let subject = first_scalar(data, &["subject", "label", "emailName"]).unwrap_or_default();
    let body = if let Some(html) = first_scalar(data, &["html", "htmlContent", "body", "content"]) {
        EmailBody::Inline(html)
    } else if let Some(r) = first_scalar(data, &["htmlRef", "htmlPath", "storagePath"]) {
        EmailBody::Ref(r)
    } else {
        EmailBody::Missing
    };

    EmailSpec {
        subject,
        from_email: first_scalar(data, &["fromEmail", "from_email"]),
        from_name: first_scalar(data, &["fromName", "from_name"]),
        body,
    }
}

fn normalize_edge(raw: &Value) -> Option<Edge> {
    let source = scalar(&raw["source"])?;
    let target = scalar(&raw["target"])?;
    let branch = first_scalar(raw, &["branch", "sourceHandle", "source_handle"])
        .map(|b| b.to_lowercase());
    Some(Edge {
        source,
        target,
        branch,
    })
}
