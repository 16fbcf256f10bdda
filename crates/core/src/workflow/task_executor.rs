use crate::types::*;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::timeout;

/// Node action with its input resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAction {
    pub action_id: ActionDefId,
    pub kind: ActionKind,
    pub input: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Work handed to an executor, correlated by `(run_id, token_id)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub run_id: RunId,
    pub token_id: TokenId,
    pub node_id: NodeId,
    pub action: ResolvedAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub token_id: TokenId,
    /// Node the task was dispatched for; results for an earlier node of
    /// the same token are stale
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(token_id: TokenId, output: Value) -> Self {
        Self {
            token_id,
            node_id: None,
            status: TaskStatus::Success,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(token_id: TokenId, error: impl Into<String>) -> Self {
        Self {
            token_id,
            node_id: None,
            status: TaskStatus::Failure,
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn at(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Whether this result answers a dispatch made at `node_id`
    pub fn answers(&self, node_id: &NodeId) -> bool {
        self.node_id.as_ref().map_or(true, |n| n == node_id)
    }
}

/// Request to start a child run for an `invoke_workflow` node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRunRequest {
    pub parent_run_id: RunId,
    pub parent_token_id: TokenId,
    pub workflow_def_id: WorkflowDefId,
    pub version: Option<u32>,
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRunOutcome {
    pub status: RunStatus,
    pub output: Option<Value>,
    pub error: Option<RunFailure>,
}

impl SubRunOutcome {
    pub fn failed(failure: RunFailure) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            error: Some(failure),
        }
    }
}

/// Performs node work outside the coordinator
///
/// `Ok(Some(outcome))` is an inline result. `Ok(None)` means the result will
/// be reported later through the coordinator. `Err` is a dispatch fault and
/// is surfaced to the run as a task failure.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: TaskRequest) -> Result<Option<TaskOutcome>>;
}

#[async_trait::async_trait]
impl<T: TaskExecutor + ?Sized> TaskExecutor for std::sync::Arc<T> {
    async fn execute(&self, request: TaskRequest) -> Result<Option<TaskOutcome>> {
        (**self).execute(request).await
    }
}

/// Applies an action's timeout and retry policy around another executor
///
/// Without a retry policy a task gets exactly one attempt.
pub struct PolicyExecutor<E> {
    inner: E,
}

impl<E: TaskExecutor> PolicyExecutor<E> {
    pub fn new(inner: E) -> Self {
        Self { inner }
    }

    async fn attempt(&self, request: &TaskRequest) -> Result<Option<TaskOutcome>> {
        match request.action.timeout_ms {
            Some(ms) => {
                let limit = Duration::from_millis(ms);
                match timeout(limit, self.inner.execute(request.clone())).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!("Task for node {} timed out after {}ms", request.node_id, ms);
                        Ok(Some(TaskOutcome::failure(
                            request.token_id,
                            format!("timed out after {}ms", ms),
                        )))
                    }
                }
            }
            None => self.inner.execute(request.clone()).await,
        }
    }
}

#[async_trait::async_trait]
impl<E: TaskExecutor> TaskExecutor for PolicyExecutor<E> {
    async fn execute(&self, request: TaskRequest) -> Result<Option<TaskOutcome>> {
        let max_attempts = request
            .action
            .retry
            .as_ref()
            .map(|p| p.max_attempts.max(1))
            .unwrap_or(1);

        let mut attempt = 1;
        loop {
            let error = match self.attempt(&request).await {
                Ok(Some(outcome)) if outcome.status == TaskStatus::Success => {
                    return Ok(Some(outcome))
                }
                Ok(None) => return Ok(None),
                Ok(Some(outcome)) => outcome
                    .error
                    .unwrap_or_else(|| "task failed".to_string()),
                Err(e) => format!("{:#}", e),
            };

            if attempt >= max_attempts {
                return Ok(Some(TaskOutcome::failure(request.token_id, error)));
            }

            let backoff = request
                .action
                .retry
                .as_ref()
                .map(|p| p.backoff_ms)
                .unwrap_or(0);
            let multiplier = 1u64 << (attempt - 1).min(16);
            let backoff_duration = Duration::from_millis(backoff.saturating_mul(multiplier));

            tracing::info!(
                "Retrying node {} after {:?} (attempt {}): {}",
                request.node_id,
                backoff_duration,
                attempt + 1,
                error
            );

            tokio::time::sleep(backoff_duration).await;
            attempt += 1;
        }
    }
}
