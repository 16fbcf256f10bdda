use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event in a run's audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub run_id: RunId,
    /// Monotonic per run, starting at 1
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<TokenId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub event_type: EventType,
}

impl Event {
    pub fn new(run_id: RunId, sequence: u64, event_type: EventType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            sequence,
            timestamp: Utc::now(),
            token_id: None,
            node_id: None,
            event_type,
        }
    }

    pub fn with_token(mut self, token_id: TokenId) -> Self {
        self.token_id = Some(token_id);
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    // Run lifecycle events
    RunStarted {
        workflow_def_id: WorkflowDefId,
        version: u32,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
    },
    RunCompleted {
        output: serde_json::Value,
    },
    RunFailed {
        failure: RunFailure,
    },
    RunCancelled {
        reason: String,
    },

    // Node lifecycle events
    NodeStarted {
        action_id: ActionDefId,
    },
    NodeCompleted {
        writes: Vec<String>,
    },
    NodeFailed {
        error: String,
    },

    // Fan-out / fan-in events
    TokensSpawned {
        group: GroupId,
        fan_out_node_id: NodeId,
        token_ids: Vec<TokenId>,
    },
    FanInArrived {
        group: GroupId,
    },
    FanInTriggered {
        group: GroupId,
        fan_out_node_id: NodeId,
        contributors: Vec<TokenId>,
        merged_token: TokenId,
        target: String,
    },
    BranchCompleted {
        group: GroupId,
    },

    // Token fate events
    TokenCancelled {
        reason: String,
    },
    TokenDiscarded {
        reason: String,
    },
}

impl EventType {
    /// Short name, matching the serialized tag
    pub fn name(&self) -> &'static str {
        match self {
            EventType::RunStarted { .. } => "run_started",
            EventType::RunCompleted { .. } => "run_completed",
            EventType::RunFailed { .. } => "run_failed",
            EventType::RunCancelled { .. } => "run_cancelled",
            EventType::NodeStarted { .. } => "node_started",
            EventType::NodeCompleted { .. } => "node_completed",
            EventType::NodeFailed { .. } => "node_failed",
            EventType::TokensSpawned { .. } => "tokens_spawned",
            EventType::FanInArrived { .. } => "fan_in_arrived",
            EventType::FanInTriggered { .. } => "fan_in_triggered",
            EventType::BranchCompleted { .. } => "branch_completed",
            EventType::TokenCancelled { .. } => "token_cancelled",
            EventType::TokenDiscarded { .. } => "token_discarded",
        }
    }

    /// Last event a run emits
    pub fn ends_run(&self) -> bool {
        matches!(
            self,
            EventType::RunCompleted { .. }
                | EventType::RunFailed { .. }
                | EventType::RunCancelled { .. }
        )
    }
}

/// Event log writer trait
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event to the log
    async fn append(&self, event: Event) -> anyhow::Result<()>;

    /// Get all events for a run, ordered by sequence
    async fn get_run_events(&self, run_id: RunId) -> anyhow::Result<Vec<Event>>;

    /// Make a run's appended events durable
    async fn flush(&self, _run_id: RunId) -> anyhow::Result<()> {
        Ok(())
    }

    /// Get events for a run within a time range
    async fn get_run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Event>> {
        let events = self.get_run_events(run_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = Event::new(
            RunId::new(),
            3,
            EventType::NodeStarted {
                action_id: ActionDefId::new("summarize"),
            },
        )
        .with_node(NodeId::new("llm"));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["node_id"], "llm");
        assert_eq!(json["event_type"]["type"], event.event_type.name());
        assert!(json.get("token_id").is_none());
    }
}
