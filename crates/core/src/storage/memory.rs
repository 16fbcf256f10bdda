use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Event log kept in process memory; used by tests and embedded coordinators
#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs with at least one event
    pub async fn run_count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        self.events
            .write()
            .await
            .entry(event.run_id)
            .or_default()
            .push(event);
        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let mut events = self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    #[tokio::test]
    async fn test_events_are_returned_in_sequence_order() {
        let log = InMemoryEventLog::new();
        let run_id = RunId::new();

        for sequence in [2, 1, 3] {
            log.append(Event::new(
                run_id,
                sequence,
                EventType::RunCancelled {
                    reason: "test".to_string(),
                },
            ))
            .await
            .unwrap();
        }

        let events = log.get_run_events(run_id).await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(log.run_count().await, 1);
        assert!(log.get_run_events(RunId::new()).await.unwrap().is_empty());
    }
}
