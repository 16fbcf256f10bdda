use super::task_executor::{SubRunRequest, TaskRequest};
use crate::types::*;
use serde_json::Value;

/// Spawn parameters of one sibling token
#[derive(Debug, Clone, PartialEq)]
pub struct BranchSeed {
    pub index: usize,
    pub total: usize,
    pub item: Option<Value>,
}

/// An intended state change, produced by the router, fan synchronizer or
/// dispatcher and applied exactly once by the run machine. Never persisted.
#[derive(Debug, Clone)]
pub enum Decision {
    Dispatch {
        token_id: TokenId,
        node_id: NodeId,
        request: TaskRequest,
    },
    StartSubRun {
        token_id: TokenId,
        node_id: NodeId,
        action_id: ActionDefId,
        request: SubRunRequest,
    },
    /// Output mapping writes of a finished task
    CompleteNode {
        token_id: TokenId,
        node_id: NodeId,
        writes: Vec<(String, Value)>,
    },
    FailNode {
        token_id: TokenId,
        node_id: NodeId,
        error: String,
    },
    Advance {
        token_id: TokenId,
        from: NodeId,
        to: NodeId,
        priority: u32,
    },
    SpawnTokens {
        parent: TokenId,
        fan_out_node_id: NodeId,
        to_node: NodeId,
        branches: Vec<BranchSeed>,
    },
    ParkAtFanIn {
        token_id: TokenId,
        node_id: NodeId,
        group: GroupId,
    },
    Merge {
        group: GroupId,
        fan_in_node: NodeId,
        target: String,
        value: Value,
        /// In branch index order
        contributors: Vec<TokenId>,
        triggered_by: TokenId,
    },
    CancelToken {
        token_id: TokenId,
        reason: String,
    },
    /// Late arrival at an already merged group
    DiscardToken {
        token_id: TokenId,
        reason: String,
    },
    CompleteToken {
        token_id: TokenId,
    },
    CompleteRun,
    FailRun {
        failure: RunFailure,
    },
}

impl Decision {
    pub fn fail_run(kind: FailureKind, message: impl Into<String>) -> Self {
        Decision::FailRun {
            failure: RunFailure::new(kind, message),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Decision::Dispatch { .. } => "dispatch",
            Decision::StartSubRun { .. } => "start_sub_run",
            Decision::CompleteNode { .. } => "complete_node",
            Decision::FailNode { .. } => "fail_node",
            Decision::Advance { .. } => "advance",
            Decision::SpawnTokens { .. } => "spawn_tokens",
            Decision::ParkAtFanIn { .. } => "park_at_fan_in",
            Decision::Merge { .. } => "merge",
            Decision::CancelToken { .. } => "cancel_token",
            Decision::DiscardToken { .. } => "discard_token",
            Decision::CompleteToken { .. } => "complete_token",
            Decision::CompleteRun => "complete_run",
            Decision::FailRun { .. } => "fail_run",
        }
    }
}

impl From<crate::error::EngineError> for Decision {
    fn from(err: crate::error::EngineError) -> Self {
        Decision::fail_run(err.failure_kind(), err.to_string())
    }
}
