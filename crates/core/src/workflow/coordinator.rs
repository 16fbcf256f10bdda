//! Async shell around run machines.
//!
//! Every run is owned by one tokio task that holds its `RunMachine` and
//! reads an mpsc inbox. Task dispatches run as their own tokio tasks and
//! post results back into that inbox; sub-runs are launched as sibling runs
//! that report to the parent inbox when they finish. A deferred task with a
//! `timeout_ms` keeps its dispatch task alive as a deadline that reports a
//! failure unless the real result arrives first.

use super::graph::GraphIndex;
use super::machine::{EngineConfig, Inbound, Outbound, RunMachine, RunSnapshot};
use super::task_executor::{SubRunOutcome, TaskExecutor, TaskOutcome, TaskRequest};
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventLog};
use crate::storage::{DefinitionStore, IndexStore};
use crate::types::*;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

struct RunHandle {
    inbox: mpsc::Sender<Inbound>,
    snapshot: watch::Receiver<RunSnapshot>,
}

/// Work a run has handed out and not yet heard back from
struct InFlight {
    inbox: mpsc::Sender<Inbound>,
    // Latest dispatch per token, keyed with the node it was made at
    tasks: HashMap<TokenId, (NodeId, JoinHandle<()>)>,
    children: HashMap<TokenId, RunId>,
    // Messages the run addresses to itself, consumed before the inbox
    pending: VecDeque<Inbound>,
}

/// Starts runs and routes results to them
#[derive(Clone)]
pub struct Coordinator {
    definitions: Arc<dyn DefinitionStore>,
    executor: Arc<dyn TaskExecutor>,
    event_log: Arc<dyn EventLog>,
    index: Option<Arc<dyn IndexStore>>,
    config: EngineConfig,
    graphs: Arc<RwLock<HashMap<(WorkflowDefId, u32), Arc<GraphIndex>>>>,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
    // Terminal runs still held in `runs`, oldest first
    finished: Arc<Mutex<VecDeque<RunId>>>,
}

impl Coordinator {
    pub fn new(
        definitions: Arc<dyn DefinitionStore>,
        executor: Arc<dyn TaskExecutor>,
        event_log: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            definitions,
            executor,
            event_log,
            index: None,
            config: EngineConfig::default(),
            graphs: Arc::new(RwLock::new(HashMap::new())),
            runs: Arc::new(RwLock::new(HashMap::new())),
            finished: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn with_index(mut self, index: Arc<dyn IndexStore>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    /// Start a run of the latest version of a workflow
    pub fn start_run(&self, workflow_def_id: &WorkflowDefId, input: Value) -> EngineResult<RunId> {
        self.launch(workflow_def_id, None, input, None)
    }

    pub fn start_run_version(
        &self,
        workflow_def_id: &WorkflowDefId,
        version: u32,
        input: Value,
    ) -> EngineResult<RunId> {
        self.launch(workflow_def_id, Some(version), input, None)
    }

    /// Deliver the result of a deferred task
    pub async fn report_result(&self, run_id: RunId, outcome: TaskOutcome) -> EngineResult<()> {
        self.send(run_id, Inbound::TaskResult(outcome)).await
    }

    pub async fn cancel(&self, run_id: RunId, reason: impl Into<String>) -> EngineResult<()> {
        self.send(
            run_id,
            Inbound::Cancel {
                reason: reason.into(),
            },
        )
        .await
    }

    /// Latest state of a run known to this coordinator
    pub fn snapshot(&self, run_id: RunId) -> Option<RunSnapshot> {
        let runs = self.runs.read().ok()?;
        runs.get(&run_id).map(|h| h.snapshot.borrow().clone())
    }

    /// Wait until a run reaches a terminal status
    pub async fn wait(&self, run_id: RunId) -> EngineResult<RunSnapshot> {
        let mut receiver = {
            let runs = self.runs.read().map_err(poisoned)?;
            runs.get(&run_id)
                .map(|h| h.snapshot.clone())
                .ok_or(EngineError::RunNotFound(run_id))?
        };

        let snapshot = receiver
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| EngineError::RunNotActive(run_id))?;
        Ok(snapshot.clone())
    }

    pub fn get_run(&self, run_id: RunId) -> EngineResult<Option<RunRecord>> {
        if let Some(snapshot) = self.snapshot(run_id) {
            return Ok(Some(snapshot.record()));
        }
        match &self.index {
            Some(index) => Ok(index.get_run(&run_id)?),
            None => Ok(None),
        }
    }

    /// Runs newest first
    pub fn list_runs(&self) -> EngineResult<Vec<RunRecord>> {
        if let Some(index) = &self.index {
            return Ok(index.list_runs()?);
        }

        let runs = self.runs.read().map_err(poisoned)?;
        let mut records: Vec<RunRecord> = runs
            .values()
            .map(|h| h.snapshot.borrow().record())
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    pub async fn events(&self, run_id: RunId) -> EngineResult<Vec<Event>> {
        Ok(self.event_log.get_run_events(run_id).await?)
    }

    /// Compiled graph for a workflow version, cached across runs
    fn graph(
        &self,
        workflow_def_id: &WorkflowDefId,
        version: Option<u32>,
    ) -> EngineResult<Arc<GraphIndex>> {
        let def = self
            .definitions
            .workflow(workflow_def_id, version)?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_def_id.clone()))?;

        let key = (def.id.clone(), def.version);
        if let Some(graph) = self.graphs.read().map_err(poisoned)?.get(&key) {
            return Ok(graph.clone());
        }

        let graph = Arc::new(GraphIndex::load(&def, self.definitions.as_ref())?);
        self.graphs
            .write()
            .map_err(poisoned)?
            .insert(key, graph.clone());
        Ok(graph)
    }

    fn launch(
        &self,
        workflow_def_id: &WorkflowDefId,
        version: Option<u32>,
        input: Value,
        parent: Option<ParentLink>,
    ) -> EngineResult<RunId> {
        let graph = self.graph(workflow_def_id, version)?;
        let run_id = RunId::new();
        let machine = RunMachine::new(run_id, graph, input, parent, &self.config);

        let (inbox_tx, inbox_rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(machine.snapshot());
        self.runs.write().map_err(poisoned)?.insert(
            run_id,
            RunHandle {
                inbox: inbox_tx.clone(),
                snapshot: snapshot_rx,
            },
        );

        tokio::spawn(self.clone().drive(machine, inbox_tx, inbox_rx, snapshot_tx));
        Ok(run_id)
    }

    async fn drive(
        self,
        mut machine: RunMachine,
        inbox_tx: mpsc::Sender<Inbound>,
        mut inbox: mpsc::Receiver<Inbound>,
        snapshots: watch::Sender<RunSnapshot>,
    ) {
        let run_id = machine.run_id();
        let mut work = InFlight {
            inbox: inbox_tx,
            tasks: HashMap::new(),
            children: HashMap::new(),
            pending: VecDeque::new(),
        };

        let outbound = machine.start();
        self.index_record(&machine.snapshot().record());
        self.settle(&mut machine, outbound, &mut work, &snapshots).await;

        while !machine.is_terminal() {
            let message = match work.pending.pop_front() {
                Some(message) => message,
                None => match inbox.recv().await {
                    Some(message) => message,
                    None => break,
                },
            };

            match &message {
                Inbound::TaskResult(outcome) => {
                    let tracked = work
                        .tasks
                        .get(&outcome.token_id)
                        .is_some_and(|(node_id, _)| outcome.answers(node_id));
                    // Stops a pending deadline once the real result is in
                    if tracked {
                        if let Some((_, task)) = work.tasks.remove(&outcome.token_id) {
                            task.abort();
                        }
                    }
                }
                Inbound::SubRunFinished { token_id, .. } => {
                    work.children.remove(token_id);
                }
                Inbound::Cancel { .. } => {}
            }

            let outbound = machine.handle(message);
            self.settle(&mut machine, outbound, &mut work, &snapshots).await;
        }

        for (_, (_, task)) in work.tasks.drain() {
            task.abort();
        }
        self.finish(&machine).await;
        self.retire(run_id);
        tracing::debug!("Run {} driver exiting", run_id);
    }

    /// Persist new events, hand out outbound work and publish the snapshot
    async fn settle(
        &self,
        machine: &mut RunMachine,
        outbound: Vec<Outbound>,
        work: &mut InFlight,
        snapshots: &watch::Sender<RunSnapshot>,
    ) {
        let run_id = machine.run_id();
        for event in machine.drain_events() {
            if let Err(e) = self.event_log.append(event).await {
                tracing::error!("Failed to append event for run {}: {:#}", run_id, e);
            }
        }

        for item in outbound {
            match item {
                Outbound::Dispatch(request) => {
                    let (token_id, node_id) = (request.token_id, request.node_id.clone());
                    let task = self.spawn_task(request, work.inbox.clone());
                    if let Some((_, previous)) = work.tasks.insert(token_id, (node_id, task)) {
                        previous.abort();
                    }
                }
                Outbound::StartSubRun(request) => {
                    let parent = ParentLink {
                        run_id,
                        token_id: request.parent_token_id,
                    };
                    match self.launch(
                        &request.workflow_def_id,
                        request.version,
                        request.input,
                        Some(parent),
                    ) {
                        Ok(child) => {
                            tracing::info!("Run {} started sub-run {}", run_id, child);
                            work.children.insert(parent.token_id, child);
                        }
                        Err(e) => {
                            tracing::error!("Run {} could not start sub-run: {}", run_id, e);
                            work.pending.push_back(Inbound::SubRunFinished {
                                token_id: parent.token_id,
                                outcome: SubRunOutcome::failed(RunFailure::new(
                                    e.failure_kind(),
                                    e.to_string(),
                                )),
                            });
                        }
                    }
                }
                Outbound::CancelTask(token_id) => {
                    if let Some((_, task)) = work.tasks.remove(&token_id) {
                        task.abort();
                    }
                    if let Some(child) = work.children.remove(&token_id) {
                        let reason = format!("parent run {} cancelled it", run_id);
                        if let Err(e) = self.cancel(child, reason).await {
                            tracing::debug!("Sub-run {} already finished: {}", child, e);
                        }
                    }
                }
            }
        }

        snapshots.send_replace(machine.snapshot());
    }

    fn spawn_task(&self, request: TaskRequest, inbox: mpsc::Sender<Inbound>) -> JoinHandle<()> {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let token_id = request.token_id;
            let node_id = request.node_id.clone();
            let deadline = request.action.timeout_ms;
            let outcome = match executor.execute(request).await {
                Ok(Some(outcome)) => outcome.at(node_id.clone()),
                Ok(None) => {
                    let Some(ms) = deadline else {
                        tracing::debug!("Task for node {} deferred", node_id);
                        return;
                    };
                    tracing::debug!("Task for node {} deferred with a {}ms deadline", node_id, ms);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    tracing::warn!("Deferred task for node {} timed out after {}ms", node_id, ms);
                    TaskOutcome::failure(token_id, format!("timed out after {}ms", ms))
                        .at(node_id.clone())
                }
                Err(e) => {
                    tracing::warn!("Dispatch for node {} failed: {:#}", node_id, e);
                    TaskOutcome::failure(token_id, format!("dispatch failed: {:#}", e))
                        .at(node_id.clone())
                }
            };
            if inbox.send(Inbound::TaskResult(outcome)).await.is_err() {
                tracing::debug!("Run gone before result of node {} arrived", node_id);
            }
        })
    }

    async fn finish(&self, machine: &RunMachine) {
        let record = machine.snapshot().record();
        if let Err(e) = self.event_log.flush(record.id).await {
            tracing::error!("Failed to flush events of run {}: {:#}", record.id, e);
        }
        self.index_record(&record);

        let Some(parent) = machine.parent() else {
            return;
        };
        let outcome = SubRunOutcome {
            status: record.status,
            output: record.output,
            error: record.error,
        };
        let message = Inbound::SubRunFinished {
            token_id: parent.token_id,
            outcome,
        };
        if let Err(e) = self.send(parent.run_id, message).await {
            tracing::debug!("Parent of run {} no longer listening: {}", record.id, e);
        }
    }

    /// Keep at most `retain_finished_runs` terminal runs in memory; older
    /// ones are served from the index
    fn retire(&self, run_id: RunId) {
        let evicted: Vec<RunId> = match self.finished.lock() {
            Ok(mut finished) => {
                finished.push_back(run_id);
                let excess = finished
                    .len()
                    .saturating_sub(self.config.retain_finished_runs);
                finished.drain(..excess).collect()
            }
            Err(_) => {
                tracing::error!("Finished-run list poisoned, keeping run {}", run_id);
                return;
            }
        };
        if evicted.is_empty() {
            return;
        }

        match self.runs.write() {
            Ok(mut runs) => {
                for id in &evicted {
                    runs.remove(id);
                }
                tracing::debug!("Evicted {} finished runs from memory", evicted.len());
            }
            Err(_) => tracing::error!("Run map poisoned, could not evict finished runs"),
        }
    }

    fn index_record(&self, record: &RunRecord) {
        if let Some(index) = &self.index {
            if let Err(e) = index.index_run(record) {
                tracing::error!("Failed to index run {}: {:#}", record.id, e);
            }
        }
    }

    async fn send(&self, run_id: RunId, message: Inbound) -> EngineResult<()> {
        let inbox = {
            let runs = self.runs.read().map_err(poisoned)?;
            runs.get(&run_id)
                .map(|h| h.inbox.clone())
                .ok_or(EngineError::RunNotFound(run_id))?
        };
        inbox
            .send(message)
            .await
            .map_err(|_| EngineError::RunNotActive(run_id))
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Storage(anyhow::anyhow!("coordinator lock poisoned"))
}
