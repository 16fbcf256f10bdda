use crate::types::{RunId, RunRecord, RunStatus, WorkflowDefId};
use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

const RUNS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Index store for fast run queries using redb
#[derive(Clone)]
pub struct RedbIndexStore {
    db: Arc<Database>,
}

impl RedbIndexStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create index directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _runs_table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open runs table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Index a run for fast queries, replacing any earlier record
    pub fn index_run(&self, run: &RunRecord) -> Result<()> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut table = write_txn
                .open_table(RUNS_TABLE)
                .context("Failed to open table")?;

            let key = run.id.to_string();
            let value = serde_json::to_vec(run).context("Failed to serialize run")?;

            table
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert run")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let key = run_id.to_string();
        let value = table.get(key.as_str()).context("Failed to get run")?;

        match value {
            Some(guard) => {
                let run: RunRecord =
                    serde_json::from_slice(guard.value()).context("Failed to deserialize run")?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// List runs, most recent first
    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn.open_table(RUNS_TABLE).context("Failed to open table")?;

        let mut runs = Vec::new();
        for item in table.iter().context("Failed to iterate runs")? {
            let (_key, value) = item.context("Failed to read item")?;
            let run: RunRecord =
                serde_json::from_slice(value.value()).context("Failed to deserialize run")?;
            runs.push(run);
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(runs)
    }

    pub fn list_runs_for_workflow(&self, workflow: &WorkflowDefId) -> Result<Vec<RunRecord>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|run| &run.workflow_def_id == workflow)
            .collect())
    }

    /// Child runs started by a run's invoke_workflow nodes
    pub fn list_children(&self, parent: &RunId) -> Result<Vec<RunRecord>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|run| run.parent.is_some_and(|p| &p.run_id == parent))
            .collect())
    }

    pub fn update_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        let mut run = self.get_run(run_id)?.context("Run not found")?;

        run.status = status;
        if status.is_terminal() {
            run.completed_at = Some(chrono::Utc::now());
        }

        self.index_run(&run)
    }
}

/// Trait for index storage
pub trait IndexStore: Send + Sync {
    fn index_run(&self, run: &RunRecord) -> Result<()>;

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>>;

    fn list_runs(&self) -> Result<Vec<RunRecord>>;

    fn list_children(&self, parent: &RunId) -> Result<Vec<RunRecord>>;

    fn update_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<()>;
}

impl IndexStore for RedbIndexStore {
    fn index_run(&self, run: &RunRecord) -> Result<()> {
        RedbIndexStore::index_run(self, run)
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        RedbIndexStore::get_run(self, run_id)
    }

    fn list_runs(&self) -> Result<Vec<RunRecord>> {
        RedbIndexStore::list_runs(self)
    }

    fn list_children(&self, parent: &RunId) -> Result<Vec<RunRecord>> {
        RedbIndexStore::list_children(self, parent)
    }

    fn update_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<()> {
        RedbIndexStore::update_run_status(self, run_id, status)
    }
}
