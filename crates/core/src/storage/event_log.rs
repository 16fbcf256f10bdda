use crate::events::{Event, EventLog};
use crate::types::RunId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const DEFAULT_FLUSH_THRESHOLD: usize = 100;

/// Event log implementation using gzip-compressed JSONL (JSON Lines) files
pub struct JsonlEventLog {
    base_path: PathBuf,
    flush_threshold: usize,
    // Buffered events per run, flushed once a run's buffer grows past the
    // threshold or the run ends
    buffer: Mutex<HashMap<RunId, Vec<Event>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path).context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            buffer: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold.max(1);
        self
    }

    /// Get the path to the event log file for a run on a given day
    /// Format: events/YYYY/MM/DD/<run_id>.jsonl.gz
    fn event_log_path(&self, run_id: &RunId, date: NaiveDate) -> PathBuf {
        self.base_path
            .join("events")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", run_id))
    }

    /// Write a run's buffered events to disk
    async fn flush_run(&self, run_id: &RunId) -> Result<()> {
        let events = {
            let mut buffer = self.buffer.lock().await;
            match buffer.remove(run_id) {
                Some(events) if !events.is_empty() => events,
                _ => return Ok(()),
            }
        };

        let mut events_by_date: HashMap<NaiveDate, Vec<Event>> = HashMap::new();
        for event in events {
            events_by_date
                .entry(event.timestamp.date_naive())
                .or_default()
                .push(event);
        }

        for (date, events) in events_by_date {
            let path = self.event_log_path(run_id, date);

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create event log directory")?;
            }

            let mut all_events = if path.exists() {
                read_jsonl_gz(&path)?
            } else {
                Vec::new()
            };
            all_events.extend(events);

            write_jsonl_gz(&path, &all_events).await?;
        }

        Ok(())
    }

    /// Get all event log files for a run
    fn get_log_files(&self, run_id: &RunId) -> Result<Vec<PathBuf>> {
        let events_dir = self.base_path.join("events");
        if !events_dir.exists() {
            return Ok(Vec::new());
        }

        let filename = format!("{}.jsonl.gz", run_id);
        let files = walkdir::WalkDir::new(&events_dir)
            .min_depth(4)
            .max_depth(4)
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to walk event log directory")?
            .into_iter()
            .filter(|entry| entry.file_type().is_file() && entry.file_name() == filename.as_str())
            .map(|entry| entry.into_path())
            .collect();

        Ok(files)
    }
}

fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from event log")?;
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line).context("Failed to parse event")?;
        events.push(event);
    }

    Ok(events)
}

async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write event log file")?;

    Ok(())
}

#[async_trait::async_trait]
impl EventLog for JsonlEventLog {
    async fn append(&self, event: Event) -> Result<()> {
        let run_id = event.run_id;
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            let events = buffer.entry(run_id).or_default();
            let ends_run = event.event_type.ends_run();
            events.push(event);
            ends_run || events.len() >= self.flush_threshold
        };

        if should_flush {
            self.flush_run(&run_id).await?;
        }

        Ok(())
    }

    async fn get_run_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        self.flush_run(&run_id).await?;

        let mut all_events = Vec::new();
        for file in self.get_log_files(&run_id)? {
            all_events.extend(read_jsonl_gz(&file)?);
        }

        all_events.sort_by_key(|e| e.sequence);

        Ok(all_events)
    }

    async fn get_run_events_range(
        &self,
        run_id: RunId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        let all_events = self.get_run_events(run_id).await?;
        Ok(all_events
            .into_iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .collect())
    }

    async fn flush(&self, run_id: RunId) -> Result<()> {
        self.flush_run(&run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use tempfile::TempDir;

    fn started(run_id: RunId, sequence: u64) -> Event {
        Event::new(
            run_id,
            sequence,
            EventType::RunStarted {
                workflow_def_id: crate::types::WorkflowDefId::new("test"),
                version: 1,
                input: serde_json::json!({}),
                parent: None,
            },
        )
    }

    #[tokio::test]
    async fn test_jsonl_event_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();

        let run_id = RunId::new();
        let event = started(run_id, 1);

        log.append(event.clone()).await.unwrap();
        log.flush(run_id).await.unwrap();

        let events = log.get_run_events(run_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, event.id);
    }

    #[tokio::test]
    async fn test_runs_are_flushed_to_separate_files() {
        let temp_dir = TempDir::new().unwrap();
        let log = JsonlEventLog::new(temp_dir.path().to_path_buf())
            .unwrap()
            .with_flush_threshold(2);

        let first = RunId::new();
        let second = RunId::new();
        log.append(started(first, 2)).await.unwrap();
        log.append(started(second, 1)).await.unwrap();
        log.append(started(first, 1)).await.unwrap();

        let first_events = log.get_run_events(first).await.unwrap();
        assert_eq!(first_events.len(), 2);
        assert_eq!(first_events[0].sequence, 1);
        assert_eq!(first_events[1].sequence, 2);

        let second_events = log.get_run_events(second).await.unwrap();
        assert_eq!(second_events.len(), 1);
    }

    #[tokio::test]
    async fn test_finished_run_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let run_id = RunId::new();
        {
            let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
            log.append(started(run_id, 1)).await.unwrap();
            log.append(Event::new(
                run_id,
                2,
                EventType::RunCompleted {
                    output: serde_json::json!({"ok": true}),
                },
            ))
            .await
            .unwrap();
        }

        let reopened = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        let events = reopened.get_run_events(run_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type.name(), "run_completed");
    }

    #[tokio::test]
    async fn test_explicit_flush_persists_running_run() {
        let temp_dir = TempDir::new().unwrap();
        let run_id = RunId::new();
        {
            let log = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
            for sequence in 1..=4 {
                log.append(started(run_id, sequence)).await.unwrap();
            }
            log.flush(run_id).await.unwrap();
        }

        let reopened = JsonlEventLog::new(temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(reopened.get_run_events(run_id).await.unwrap().len(), 4);
    }
}
