//! Pull-based task queue for external workers.
//!
//! Dispatched tasks are parked here and handed out through
//! `GET /api/tasks/next`. Workers report outcomes back through
//! `POST /api/runs/{run_id}/results`.

use anyhow::Result;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use weft_core::workflow::{TaskExecutor, TaskOutcome, TaskRequest};

pub struct TaskQueue {
    pending: Mutex<VecDeque<TaskRequest>>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Take the oldest task, waiting up to `wait` for one to show up
    pub async fn next(&self, wait: Duration) -> Option<TaskRequest> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(request) = self.pending.lock().await.pop_front() {
                return Some(request);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TaskExecutor for TaskQueue {
    async fn execute(&self, request: TaskRequest) -> Result<Option<TaskOutcome>> {
        tracing::debug!(
            "Queued task for node {} of run {}",
            request.node_id,
            request.run_id
        );
        self.pending.lock().await.push_back(request);
        self.notify.notify_one();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use weft_core::types::{ActionDefId, ActionKind, NodeId, RunId, TokenId};
    use weft_core::workflow::ResolvedAction;

    fn request(node: &str) -> TaskRequest {
        TaskRequest {
            run_id: RunId::new(),
            token_id: TokenId::new(),
            node_id: NodeId::new(node),
            action: ResolvedAction {
                action_id: ActionDefId::new("summarize"),
                kind: ActionKind::Llm {
                    model: "small".to_string(),
                    prompt: "summarize".to_string(),
                },
                input: json!({"text": "hello"}),
                timeout_ms: None,
                retry: None,
            },
        }
    }

    #[tokio::test]
    async fn test_tasks_are_handed_out_in_order() {
        let queue = TaskQueue::new();
        assert!(queue.execute(request("a")).await.unwrap().is_none());
        assert!(queue.execute(request("b")).await.unwrap().is_none());
        assert_eq!(queue.len().await, 2);

        let first = queue.next(Duration::from_millis(10)).await.unwrap();
        let second = queue.next(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.node_id, NodeId::new("a"));
        assert_eq!(second.node_id, NodeId::new("b"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_times_out_when_idle() {
        let queue = TaskQueue::new();
        assert!(queue.next(Duration::from_secs(30)).await.is_none());
    }

    #[tokio::test]
    async fn test_waiting_worker_is_woken() {
        let queue = Arc::new(TaskQueue::new());

        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.execute(request("late")).await.unwrap();

        let received = worker.await.unwrap().unwrap();
        assert_eq!(received.node_id, NodeId::new("late"));
    }
}
