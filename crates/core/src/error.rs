//! Error types for the workflow engine.

use crate::types::{FailureKind, NodeId, RunId, TokenId, WorkflowDefId};
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while loading definitions or driving a run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow definition is structurally invalid.
    #[error("invalid workflow definition '{workflow}': {message}")]
    Definition {
        workflow: WorkflowDefId,
        message: String,
    },

    /// None of a node's outgoing transitions matched the context.
    #[error("no transition out of node '{node_id}' matched")]
    NoMatchingTransition { node_id: NodeId },

    /// An expression failed to parse or produced an unusable value.
    #[error("expression `{expr}`: {message}")]
    Expression { expr: String, message: String },

    /// A context path could not be read or written.
    #[error("context path '{path}': {message}")]
    ContextPath { path: String, message: String },

    /// Sibling tokens can no longer satisfy a fan-in.
    #[error("fan-in at node '{node_id}' cannot be satisfied: {message}")]
    FanIn { node_id: NodeId, message: String },

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(WorkflowDefId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error("run {0} is not active")]
    RunNotActive(RunId),

    #[error("token {0} not found")]
    TokenNotFound(TokenId),

    #[error("step limit of {0} exceeded")]
    StepLimitExceeded(u64),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl EngineError {
    /// Failure category recorded on the run when this error ends it
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            EngineError::Definition { .. }
            | EngineError::NoMatchingTransition { .. }
            | EngineError::Expression { .. }
            | EngineError::ContextPath { .. }
            | EngineError::FanIn { .. }
            | EngineError::WorkflowNotFound(_)
            | EngineError::StepLimitExceeded(_) => FailureKind::Definition,
            EngineError::RunNotFound(_)
            | EngineError::RunNotActive(_)
            | EngineError::TokenNotFound(_)
            | EngineError::Storage(_) => FailureKind::Infrastructure,
        }
    }

    pub(crate) fn expression(expr: &str, message: impl Into<String>) -> Self {
        EngineError::Expression {
            expr: expr.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn path(path: &str, message: impl Into<String>) -> Self {
        EngineError::ContextPath {
            path: path.to_string(),
            message: message.into(),
        }
    }
}
