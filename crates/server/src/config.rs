use crate::queue::TaskQueue;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use weft_core::storage::{InMemoryDefinitionStore, JsonlEventLog, RedbIndexStore};
use weft_core::workflow::{Coordinator, EngineConfig, PolicyExecutor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_index_file")]
    pub index_file: String,

    /// JSON workflow and action definitions loaded at startup
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: String,
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_index_file() -> String {
    "index.redb".to_string()
}

fn default_definitions_dir() -> String {
    "definitions".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_log_dir: default_event_log_dir(),
            index_file: default_index_file(),
            definitions_dir: default_definitions_dir(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                engine: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    /// Relative to the data directory unless absolute
    pub fn definitions_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.definitions_dir)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub queue: Arc<TaskQueue>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let loaded = definitions
            .load_dir(&config.definitions_path())
            .context("Failed to load definitions")?;
        tracing::info!("Loaded {} definition files", loaded);

        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let index_store = Arc::new(
            RedbIndexStore::new(config.index_path()).context("Failed to create index store")?,
        );

        let queue = Arc::new(TaskQueue::new());
        let executor = Arc::new(PolicyExecutor::new(queue.clone()));

        let coordinator = Coordinator::new(definitions, executor, event_log)
            .with_index(index_store)
            .with_config(config.engine.clone());

        Ok(Self { coordinator, queue })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&dir.path().join("weft.toml"), dir.path().join("data")).unwrap();

        assert!(dir.path().join("data").is_dir());
        assert_eq!(config.index_path(), dir.path().join("data").join("index.redb"));
        assert_eq!(config.engine.max_steps, 10_000);
    }

    #[test]
    fn test_config_file_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("weft.toml");
        std::fs::write(
            &path,
            r#"
[storage]
definitions_dir = "/etc/weft/definitions"

[engine]
max_steps = 500
"#,
        )
        .unwrap();

        let config = ServerConfig::load(&path, dir.path().to_path_buf()).unwrap();
        assert_eq!(config.definitions_path(), PathBuf::from("/etc/weft/definitions"));
        assert_eq!(config.storage.event_log_dir, "events");
        assert_eq!(config.engine.max_steps, 500);
        assert_eq!(config.engine.inbox_capacity, 256);
    }

    #[tokio::test]
    async fn test_app_state_starts_on_empty_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig::load(&dir.path().join("weft.toml"), dir.path().to_path_buf()).unwrap();

        let state = AppState::new(&config).unwrap();
        assert!(state.coordinator.list_runs().unwrap().is_empty());
        assert!(state.queue.is_empty().await);
    }
}
