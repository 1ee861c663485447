//! Condition branch policy.

use chrono::{DateTime, Utc};

use crate::graph::{Flow, Node};
use crate::runs::Run;

pub const BRANCH_YES: &str = "yes";
pub const BRANCH_NO: &str = "no";

/// What a resolver may look at when choosing a branch.
pub struct BranchContext<'a> {
    pub flow: &'a Flow,
    pub run: &'a Run,
    pub now: DateTime<Utc>,
}

/// Picks the branch tag a condition node routes a run through.
pub trait BranchResolver: Send + Sync {
    fn name(&self) -> &str;

    fn resolve_branch(&self, node: &Node, ctx: &BranchContext<'_>) -> String;
}

/// Built-in policy: with no engagement data to evaluate, every condition
/// takes the "no" branch.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysNo;

impl BranchResolver for AlwaysNo {
    fn name(&self) -> &str {
        "always_no"
    }

    fn resolve_branch(&self, _node: &Node, _ctx: &BranchContext<'_>) -> String {
        BRANCH_NO.to_string()
    }
}
