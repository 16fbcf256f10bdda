//! The per-run decision executor.
//!
//! A `RunMachine` is the single serialization point of a run. It pulls
//! arrivals off its work queue, asks the router (and through it the fan
//! synchronizer and task dispatcher) for decisions, applies each decision
//! exactly once and records the matching event. Work leaving the run
//! (dispatches, sub-runs, cancellations) is returned as `Outbound` items;
//! results come back as `Inbound` items. The machine never blocks and does
//! no I/O.

use super::context::{ContextSnapshot, RunContext};
use super::decision::{BranchSeed, Decision};
use super::dispatcher::TaskDispatcher;
use super::fan::{FanGroup, FanSynchronizer};
use super::graph::GraphIndex;
use super::router::{last_error, Router, LAST_ERROR};
use super::task_executor::{SubRunOutcome, SubRunRequest, TaskOutcome, TaskRequest};
use super::token::TokenTable;
use crate::error::{EngineError, EngineResult};
use crate::events::{Event, EventType};
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// Engine limits, read from the `[engine]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Arrivals a single run may process before it is failed
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Buffered inbound messages per run
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Finished runs kept in memory for snapshots; older ones are only
    /// available through the run index
    #[serde(default = "default_retain_finished_runs")]
    pub retain_finished_runs: usize,
}

fn default_max_steps() -> u64 {
    10_000
}

fn default_inbox_capacity() -> usize {
    256
}

fn default_retain_finished_runs() -> usize {
    1_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            inbox_capacity: default_inbox_capacity(),
            retain_finished_runs: default_retain_finished_runs(),
        }
    }
}

/// Results and commands delivered to a run
#[derive(Debug, Clone)]
pub enum Inbound {
    TaskResult(TaskOutcome),
    SubRunFinished {
        token_id: TokenId,
        outcome: SubRunOutcome,
    },
    Cancel {
        reason: String,
    },
}

/// Work the run hands to the outside world
#[derive(Debug, Clone)]
pub enum Outbound {
    Dispatch(TaskRequest),
    StartSubRun(SubRunRequest),
    /// Abort in-flight work of a token, be it a task or a child run
    CancelTask(TokenId),
}

/// Inspectable state of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow_def_id: WorkflowDefId,
    pub version: u32,
    pub parent: Option<ParentLink>,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub context: ContextSnapshot,
    pub tokens: Vec<Token>,
}

impl RunSnapshot {
    pub fn record(&self) -> RunRecord {
        RunRecord {
            id: self.run_id,
            workflow_def_id: self.workflow_def_id.clone(),
            version: self.version,
            status: self.status,
            parent: self.parent,
            started_at: self.started_at,
            completed_at: self.completed_at,
            output: self.context.output.clone(),
            error: self.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    token_id: TokenId,
    // Produced by the merge at this node, so it skips fan-in handling
    synchronized: bool,
}

pub struct RunMachine {
    run_id: RunId,
    graph: Arc<GraphIndex>,
    parent: Option<ParentLink>,
    status: RunStatus,
    failure: Option<RunFailure>,
    context: RunContext,
    tokens: TokenTable,
    fan: FanSynchronizer,
    dispatcher: TaskDispatcher,
    queue: VecDeque<Arrival>,
    events: Vec<Event>,
    outbound: Vec<Outbound>,
    sequence: u64,
    steps: u64,
    max_steps: u64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl RunMachine {
    pub fn new(
        run_id: RunId,
        graph: Arc<GraphIndex>,
        input: Value,
        parent: Option<ParentLink>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            run_id,
            graph,
            parent,
            status: RunStatus::Running,
            failure: None,
            context: RunContext::new(input),
            tokens: TokenTable::new(),
            fan: FanSynchronizer::new(),
            dispatcher: TaskDispatcher::new(run_id),
            queue: VecDeque::new(),
            events: Vec::new(),
            outbound: Vec::new(),
            sequence: 0,
            steps: 0,
            max_steps: config.max_steps,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn parent(&self) -> Option<ParentLink> {
        self.parent
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        self.failure.as_ref()
    }

    pub fn output(&self) -> Option<&Value> {
        self.context.output()
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn tokens(&self) -> &TokenTable {
        &self.tokens
    }

    /// Create the root token at the initial node and run until the run
    /// waits on outside work
    pub fn start(&mut self) -> Vec<Outbound> {
        tracing::info!(
            "Starting run {} of {} v{}",
            self.run_id,
            self.graph.workflow_id(),
            self.graph.version()
        );

        self.emit(
            None,
            None,
            EventType::RunStarted {
                workflow_def_id: self.graph.workflow_id().clone(),
                version: self.graph.version(),
                input: self.context.input().clone(),
                parent: self.parent,
            },
        );

        let mut root = Token::new(self.graph.initial_node().clone(), Vec::new());
        root.status = TokenStatus::Active;
        let root_id = self.tokens.insert(root);
        self.queue.push_back(Arrival {
            token_id: root_id,
            synchronized: false,
        });

        self.drive();
        std::mem::take(&mut self.outbound)
    }

    /// Fold one inbound message into the run
    pub fn handle(&mut self, inbound: Inbound) -> Vec<Outbound> {
        if self.is_terminal() {
            tracing::debug!("Run {} is {:?}, ignoring {:?}", self.run_id, self.status, inbound);
            return Vec::new();
        }

        match inbound {
            Inbound::TaskResult(outcome) => {
                let token_id = outcome.token_id;
                let current = self.tokens.get(&token_id).is_some_and(|t| {
                    t.status == TokenStatus::Active && outcome.answers(&t.node_id)
                });
                if !current {
                    tracing::warn!(
                        "Discarding late result for token {} in run {}",
                        token_id,
                        self.run_id
                    );
                } else {
                    let resolution = self.dispatcher.on_result(outcome);
                    let decisions = self.router().on_resolution(&token_id, resolution);
                    self.apply_result(decisions);
                }
            }
            Inbound::SubRunFinished { token_id, outcome } => {
                if self.tokens.status(&token_id) != Some(TokenStatus::WaitingOnSubRun) {
                    tracing::warn!(
                        "Discarding sub-run result for token {} in run {}",
                        token_id,
                        self.run_id
                    );
                } else {
                    let decisions = self.resolve_sub_run(token_id, outcome);
                    self.apply_result(decisions);
                }
            }
            Inbound::Cancel { reason } => self.cancel(reason),
        }

        self.drive();
        std::mem::take(&mut self.outbound)
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            workflow_def_id: self.graph.workflow_id().clone(),
            version: self.graph.version(),
            parent: self.parent,
            status: self.status,
            failure: self.failure.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            context: self.context.snapshot(),
            tokens: self.tokens.iter().cloned().collect(),
        }
    }

    fn router(&self) -> Router<'_> {
        Router {
            graph: &self.graph,
            tokens: &self.tokens,
            context: &self.context,
            fan: &self.fan,
            dispatcher: &self.dispatcher,
        }
    }

    fn resolve_sub_run(&mut self, token_id: TokenId, outcome: SubRunOutcome) -> EngineResult<Vec<Decision>> {
        self.tokens.set_status(&token_id, TokenStatus::Active)?;
        let token = self.tokens.require(&token_id)?;
        let node = self.graph.require_node(&token.node_id)?;
        let resolution = self.dispatcher.on_sub_run_result(node, outcome);
        self.router().on_resolution(&token_id, resolution)
    }

    /// Process queued arrivals until the run waits on outside work
    fn drive(&mut self) {
        while let Some(arrival) = self.queue.pop_front() {
            if self.is_terminal() {
                self.queue.clear();
                break;
            }
            if self.tokens.status(&arrival.token_id) != Some(TokenStatus::Active) {
                tracing::debug!("Skipping arrival of inactive token {}", arrival.token_id);
                continue;
            }

            self.steps += 1;
            if self.steps > self.max_steps {
                let err = EngineError::StepLimitExceeded(self.max_steps);
                self.fail(RunFailure::new(err.failure_kind(), err.to_string()));
                break;
            }

            let decisions = self
                .router()
                .on_arrival(&arrival.token_id, arrival.synchronized);
            self.apply_result(decisions);
        }

        self.finish_if_idle();
    }

    /// A running run without live tokens has nothing left to wait for
    fn finish_if_idle(&mut self) {
        if self.status == RunStatus::Running && self.tokens.live_count() == 0 {
            if let Err(e) = self.complete_run() {
                self.fail_with(e);
            }
        }
    }

    fn apply_result(&mut self, decisions: EngineResult<Vec<Decision>>) {
        match decisions {
            Ok(decisions) => self.apply_all(decisions),
            Err(e) => self.fail_with(e),
        }
    }

    fn apply_all(&mut self, decisions: Vec<Decision>) {
        for decision in decisions {
            if self.is_terminal() {
                break;
            }
            let name = decision.name();
            if let Err(e) = self.apply(decision) {
                tracing::error!("Applying {} in run {} failed: {}", name, self.run_id, e);
                self.fail_with(e);
            }
        }
    }

    /// Mutate run state for one decision, then record its event
    fn apply(&mut self, decision: Decision) -> EngineResult<()> {
        match decision {
            Decision::Dispatch {
                token_id,
                node_id,
                request,
            } => {
                self.emit(
                    Some(token_id),
                    Some(node_id),
                    EventType::NodeStarted {
                        action_id: request.action.action_id.clone(),
                    },
                );
                self.outbound.push(Outbound::Dispatch(request));
            }

            Decision::StartSubRun {
                token_id,
                node_id,
                action_id,
                request,
            } => {
                self.tokens.set_status(&token_id, TokenStatus::WaitingOnSubRun)?;
                self.emit(Some(token_id), Some(node_id), EventType::NodeStarted { action_id });
                self.outbound.push(Outbound::StartSubRun(request));
            }

            Decision::CompleteNode {
                token_id,
                node_id,
                writes,
            } => {
                let token = self.tokens.require(&token_id)?;
                self.context.write(token, &writes)?;
                let targets = writes.into_iter().map(|(target, _)| target).collect();
                self.emit(
                    Some(token_id),
                    Some(node_id),
                    EventType::NodeCompleted { writes: targets },
                );
            }

            Decision::FailNode {
                token_id,
                node_id,
                error,
            } => {
                let token = self.tokens.require(&token_id)?;
                let value = last_error(&node_id, &token_id, &error);
                self.context.write(token, &[(LAST_ERROR.to_string(), value)])?;
                self.emit(Some(token_id), Some(node_id), EventType::NodeFailed { error });
            }

            Decision::Advance {
                token_id,
                from,
                to,
                priority,
            } => {
                tracing::debug!("Token {} {} -> {} (priority {})", token_id, from, to, priority);
                let token = self.tokens.require_mut(&token_id)?;
                token.node_id = to;
                token.status = TokenStatus::Active;
                self.queue.push_back(Arrival {
                    token_id,
                    synchronized: false,
                });
            }

            Decision::SpawnTokens {
                parent,
                fan_out_node_id,
                to_node,
                branches,
            } => self.spawn(parent, fan_out_node_id, to_node, branches)?,

            Decision::ParkAtFanIn {
                token_id,
                node_id,
                group,
            } => {
                self.tokens.set_status(&token_id, TokenStatus::WaitingAtFanIn)?;
                self.fan.park(&group, token_id, &node_id);
                self.emit(Some(token_id), Some(node_id), EventType::FanInArrived { group });
            }

            Decision::Merge {
                group,
                fan_in_node,
                target,
                value,
                contributors,
                triggered_by,
            } => self.merge(group, fan_in_node, target, value, contributors, triggered_by)?,

            Decision::CancelToken { token_id, reason } => {
                if !self.tokens.is_live(&token_id) {
                    return self.cancel_nested(token_id, &reason);
                }
                let previous = self.tokens.set_status(&token_id, TokenStatus::Cancelled)?;
                self.context.discard_region(&token_id);
                if matches!(previous, TokenStatus::Active | TokenStatus::WaitingOnSubRun) {
                    self.outbound.push(Outbound::CancelTask(token_id));
                }

                let token = self.tokens.require(&token_id)?;
                let (node_id, group) = (token.node_id.clone(), token.branch().map(|b| b.group));
                self.emit(Some(token_id), Some(node_id), EventType::TokenCancelled { reason });

                if let Some(group) = group {
                    self.depart(group, token_id)?;
                }
            }

            Decision::DiscardToken { token_id, reason } => {
                tracing::warn!("Discarding token {}: {}", token_id, reason);
                self.tokens.set_status(&token_id, TokenStatus::Completed)?;
                self.context.discard_region(&token_id);
                let node_id = self.tokens.require(&token_id)?.node_id.clone();
                self.emit(Some(token_id), Some(node_id), EventType::TokenDiscarded { reason });
            }

            Decision::CompleteToken { token_id } => {
                self.tokens.set_status(&token_id, TokenStatus::Completed)?;
                let token = self.tokens.require(&token_id)?.clone();
                let Some(group) = token.branch().map(|b| b.group) else {
                    return Ok(());
                };

                // Open group: the branch output folds into the enclosing scope
                if self.fan.is_open(&group) {
                    self.context.commit_branch(&token);
                } else {
                    self.context.discard_region(&token_id);
                }
                self.emit(
                    Some(token_id),
                    Some(token.node_id),
                    EventType::BranchCompleted { group },
                );
                self.depart(group, token_id)?;
            }

            Decision::CompleteRun => self.complete_run()?,

            Decision::FailRun { failure } => self.fail(failure),
        }

        Ok(())
    }

    fn spawn(
        &mut self,
        parent: TokenId,
        fan_out_node_id: NodeId,
        to_node: NodeId,
        branches: Vec<BranchSeed>,
    ) -> EngineResult<()> {
        self.tokens.set_status(&parent, TokenStatus::Completed)?;
        let parent_stack = self.tokens.require(&parent)?.branch_stack.clone();

        let group = self.fan.next_group_id();
        self.context.stash(group, &parent);

        let mut members = Vec::with_capacity(branches.len());
        for seed in branches {
            let mut stack = parent_stack.clone();
            stack.push(BranchFrame {
                group,
                fan_out_node_id: fan_out_node_id.clone(),
                index: seed.index,
                total: seed.total,
                item: seed.item,
            });
            let mut token = Token::new(to_node.clone(), stack);
            token.status = TokenStatus::Active;
            members.push(self.tokens.insert(token));
        }

        self.fan
            .open(FanGroup::new(group, fan_out_node_id.clone(), parent, members.clone()));
        self.queue.extend(members.iter().map(|&token_id| Arrival {
            token_id,
            synchronized: false,
        }));

        self.emit(
            Some(parent),
            Some(fan_out_node_id.clone()),
            EventType::TokensSpawned {
                group,
                fan_out_node_id,
                token_ids: members,
            },
        );
        Ok(())
    }

    fn merge(
        &mut self,
        group: GroupId,
        fan_in_node: NodeId,
        target: String,
        value: Value,
        contributors: Vec<TokenId>,
        triggered_by: TokenId,
    ) -> EngineResult<()> {
        let Some(closed) = self.fan.close(&group) else {
            return Err(EngineError::FanIn {
                node_id: fan_in_node,
                message: format!("group {} merged twice", group),
            });
        };

        let mut stack = self.tokens.require(&triggered_by)?.branch_stack.clone();
        stack.pop();

        for contributor in &contributors {
            self.tokens.set_status(contributor, TokenStatus::Completed)?;
            self.context.discard_region(contributor);
        }

        let outer = stack.last().map(|frame| frame.group);
        let mut merged = Token::new(fan_in_node.clone(), stack);
        merged.status = TokenStatus::Active;
        self.context.restore_stash(group, &merged);
        self.context.write(&merged, &[(target.clone(), value)])?;
        let merged_id = self.tokens.insert(merged);
        if let Some(outer) = outer {
            self.fan.replace_member(&outer, closed.spawner, merged_id);
        }

        self.queue.push_back(Arrival {
            token_id: merged_id,
            synchronized: true,
        });

        self.emit(
            Some(merged_id),
            Some(fan_in_node),
            EventType::FanInTriggered {
                group,
                fan_out_node_id: closed.fan_out_node_id,
                contributors,
                merged_token: merged_id,
                target,
            },
        );
        Ok(())
    }

    /// A sibling left its group without arriving; the fan-in may now fire
    /// or become unsatisfiable
    fn depart(&mut self, group: GroupId, token_id: TokenId) -> EngineResult<()> {
        if !self.fan.is_open(&group) {
            return Ok(());
        }
        self.fan.depart(&group, token_id);

        let node = self
            .fan
            .group(&group)
            .and_then(|g| g.fan_in_node.as_ref())
            .and_then(|id| self.graph.node(id));
        let decisions = self
            .fan
            .after_departure(&group, node, &self.tokens, &self.context)?;
        self.apply_all(decisions);
        self.dissolve_if_abandoned(group)
    }

    /// Close a group whose members all left without reaching a fan-in and
    /// let its spawning token leave the enclosing group in turn
    fn dissolve_if_abandoned(&mut self, group: GroupId) -> EngineResult<()> {
        let Some(spawner) = self
            .fan
            .group(&group)
            .filter(|g| g.is_abandoned())
            .map(|g| g.spawner)
        else {
            return Ok(());
        };

        self.fan.close(&group);
        let spawner_stack = self.tokens.require(&spawner)?.branch_stack.clone();
        self.context.dissolve_stash(&group, &spawner_stack);
        tracing::debug!("Group {} ended without a merge", group);

        match spawner_stack.last() {
            Some(outer) => self.depart(outer.group, spawner),
            None => Ok(()),
        }
    }

    /// A member that fanned out again lives on in its nested group; cancel
    /// that group and every live descendant
    fn cancel_nested(&mut self, spawner: TokenId, reason: &str) -> EngineResult<()> {
        let Some(group) = self.fan.spawned_by(&spawner) else {
            return Ok(());
        };
        let Some(closed) = self.fan.close(&group) else {
            return Ok(());
        };
        self.context.discard_stash(&group);
        tracing::debug!("Cancelling nested group {} of token {}", group, spawner);

        for member in closed.members {
            self.apply(Decision::CancelToken {
                token_id: member,
                reason: reason.to_string(),
            })?;
        }
        Ok(())
    }

    fn complete_run(&mut self) -> EngineResult<()> {
        if self.is_terminal() {
            return Ok(());
        }

        let output = self.context.build_output(self.graph.output_mapping())?;
        self.context.set_output(output.clone());
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.queue.clear();

        tracing::info!("Run {} completed", self.run_id);
        self.emit(None, None, EventType::RunCompleted { output });
        Ok(())
    }

    fn fail_with(&mut self, err: EngineError) {
        self.fail(RunFailure::new(err.failure_kind(), err.to_string()));
    }

    fn fail(&mut self, failure: RunFailure) {
        if self.is_terminal() {
            return;
        }
        tracing::error!("Run {} failed: {}", self.run_id, failure);

        self.abort_live_tokens();
        self.status = RunStatus::Failed;
        self.failure = Some(failure.clone());
        self.completed_at = Some(Utc::now());
        self.emit(None, None, EventType::RunFailed { failure });
    }

    fn cancel(&mut self, reason: String) {
        tracing::info!("Cancelling run {}: {}", self.run_id, reason);

        self.abort_live_tokens();
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.emit(None, None, EventType::RunCancelled { reason });
    }

    /// Stop every live token; in-flight work is cancelled best effort
    fn abort_live_tokens(&mut self) {
        self.queue.clear();
        for token_id in self.tokens.live_ids() {
            if let Ok(previous) = self.tokens.set_status(&token_id, TokenStatus::Cancelled) {
                if matches!(previous, TokenStatus::Active | TokenStatus::WaitingOnSubRun) {
                    self.outbound.push(Outbound::CancelTask(token_id));
                }
            }
        }
    }

    fn emit(&mut self, token_id: Option<TokenId>, node_id: Option<NodeId>, event_type: EventType) {
        self.sequence += 1;
        let mut event = Event::new(self.run_id, self.sequence, event_type);
        event.token_id = token_id;
        event.node_id = node_id;
        tracing::debug!(
            "Run {} event #{} {}",
            self.run_id,
            event.sequence,
            event.event_type.name()
        );
        self.events.push(event);
    }
}
