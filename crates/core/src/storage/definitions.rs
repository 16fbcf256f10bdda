use crate::types::{ActionDef, ActionDefId, WorkflowDef, WorkflowDefId};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

/// Source of immutable workflow and action definitions
pub trait DefinitionStore: Send + Sync {
    /// Fetch a workflow; `None` for the version means the latest one
    fn workflow(&self, id: &WorkflowDefId, version: Option<u32>) -> Result<Option<WorkflowDef>>;

    fn action(&self, id: &ActionDefId) -> Result<Option<ActionDef>>;

    fn list_workflows(&self) -> Result<Vec<WorkflowDef>>;
}

/// On-disk bundle format: one JSON file may carry any number of definitions
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DefinitionBundle {
    #[serde(default)]
    pub workflows: Vec<WorkflowDef>,
    #[serde(default)]
    pub actions: Vec<ActionDef>,
}

/// Definition store held in memory, keyed by id and version
#[derive(Default)]
pub struct InMemoryDefinitionStore {
    workflows: RwLock<HashMap<WorkflowDefId, BTreeMap<u32, WorkflowDef>>>,
    actions: RwLock<HashMap<ActionDefId, ActionDef>>,
}

impl InMemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow version; versions are immutable once registered
    pub fn register_workflow(&self, def: WorkflowDef) -> Result<()> {
        let mut workflows = self
            .workflows
            .write()
            .map_err(|_| anyhow::anyhow!("definition store lock poisoned"))?;
        let versions = workflows.entry(def.id.clone()).or_default();

        if versions.contains_key(&def.version) {
            bail!("workflow {} v{} is already registered", def.id, def.version);
        }

        tracing::info!("Registered workflow: {} v{}", def.id, def.version);
        versions.insert(def.version, def);
        Ok(())
    }

    /// Register or replace an action definition
    pub fn register_action(&self, action: ActionDef) -> Result<()> {
        let mut actions = self
            .actions
            .write()
            .map_err(|_| anyhow::anyhow!("definition store lock poisoned"))?;
        tracing::debug!("Registered action: {}", action.id);
        actions.insert(action.id.clone(), action);
        Ok(())
    }

    pub fn register_bundle(&self, bundle: DefinitionBundle) -> Result<()> {
        for action in bundle.actions {
            self.register_action(action)?;
        }
        for workflow in bundle.workflows {
            self.register_workflow(workflow)?;
        }
        Ok(())
    }

    /// Load every `*.json` bundle below `dir`
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.exists() {
            tracing::warn!("Definitions directory {} does not exist", dir.display());
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.context("Failed to walk definitions directory")?;
            let path = entry.path();
            let is_json = path.extension().and_then(|ext| ext.to_str()) == Some("json");
            if !entry.file_type().is_file() || !is_json {
                continue;
            }

            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let bundle: DefinitionBundle = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?;

            loaded += bundle.workflows.len();
            self.register_bundle(bundle)
                .with_context(|| format!("Failed to register {}", path.display()))?;
        }

        tracing::info!("Loaded {} workflow definitions from {}", loaded, dir.display());
        Ok(loaded)
    }
}

impl DefinitionStore for InMemoryDefinitionStore {
    fn workflow(&self, id: &WorkflowDefId, version: Option<u32>) -> Result<Option<WorkflowDef>> {
        let workflows = self
            .workflows
            .read()
            .map_err(|_| anyhow::anyhow!("definition store lock poisoned"))?;
        let Some(versions) = workflows.get(id) else {
            return Ok(None);
        };

        let def = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        Ok(def.cloned())
    }

    fn action(&self, id: &ActionDefId) -> Result<Option<ActionDef>> {
        let actions = self
            .actions
            .read()
            .map_err(|_| anyhow::anyhow!("definition store lock poisoned"))?;
        Ok(actions.get(id).cloned())
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowDef>> {
        let workflows = self
            .workflows
            .read()
            .map_err(|_| anyhow::anyhow!("definition store lock poisoned"))?;
        let mut defs: Vec<WorkflowDef> = workflows
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id).then(a.version.cmp(&b.version)));
        Ok(defs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, NodeDef, NodeId};
    use tempfile::TempDir;

    fn workflow(id: &str, version: u32) -> WorkflowDef {
        WorkflowDef {
            id: WorkflowDefId::new(id),
            version,
            name: None,
            initial_node: NodeId::new("start"),
            nodes: vec![NodeDef {
                id: NodeId::new("start"),
                ..Default::default()
            }],
            transitions: vec![],
            output_mapping: None,
        }
    }

    #[test]
    fn test_latest_version_is_default() {
        let store = InMemoryDefinitionStore::new();
        store.register_workflow(workflow("flow", 1)).unwrap();
        store.register_workflow(workflow("flow", 3)).unwrap();
        store.register_workflow(workflow("flow", 2)).unwrap();

        let id = WorkflowDefId::new("flow");
        assert_eq!(store.workflow(&id, None).unwrap().unwrap().version, 3);
        assert_eq!(store.workflow(&id, Some(2)).unwrap().unwrap().version, 2);
        assert!(store.workflow(&id, Some(9)).unwrap().is_none());
        assert_eq!(store.list_workflows().unwrap().len(), 3);
    }

    #[test]
    fn test_duplicate_version_is_rejected() {
        let store = InMemoryDefinitionStore::new();
        store.register_workflow(workflow("flow", 1)).unwrap();
        assert!(store.register_workflow(workflow("flow", 1)).is_err());
    }

    #[test]
    fn test_load_dir_reads_json_bundles() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("team");
        std::fs::create_dir_all(&nested).unwrap();

        let bundle = serde_json::json!({
            "actions": [{"id": "summarize", "kind": {"type": "llm", "model": "small", "prompt": "tl;dr"}}],
            "workflows": [{
                "id": "summary",
                "initial_node": "start",
                "nodes": [{"id": "start"}],
            }],
        });
        std::fs::write(nested.join("summary.json"), bundle.to_string()).unwrap();
        std::fs::write(temp_dir.path().join("README.md"), "ignored").unwrap();

        let store = InMemoryDefinitionStore::new();
        assert_eq!(store.load_dir(temp_dir.path()).unwrap(), 1);

        let action = store
            .action(&ActionDefId::new("summarize"))
            .unwrap()
            .unwrap();
        assert!(matches!(action.kind, ActionKind::Llm { .. }));
        let def = store
            .workflow(&WorkflowDefId::new("summary"), None)
            .unwrap()
            .unwrap();
        assert_eq!(def.version, 1);
    }
}
