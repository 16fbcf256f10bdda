use super::context::{with_result, RunContext};
use super::decision::{BranchSeed, Decision};
use super::dispatcher::{Resolution, TaskDispatcher};
use super::fan::FanSynchronizer;
use super::graph::{BranchSource, CompiledTransition, GraphIndex, Spawn};
use super::token::TokenTable;
use crate::error::{EngineError, EngineResult};
use crate::expr::{set_path, strip_state_prefix};
use crate::types::*;
use serde_json::{json, Value};

/// Outcome of evaluating a node's outgoing transitions
#[derive(Debug)]
pub enum Choice<'g> {
    Advance(&'g CompiledTransition),
    Spawn(&'g CompiledTransition, Vec<BranchSeed>),
    NoMatch,
}

/// Pure decision function over one run's current state
pub struct Router<'a> {
    pub graph: &'a GraphIndex,
    pub tokens: &'a TokenTable,
    pub context: &'a RunContext,
    pub fan: &'a FanSynchronizer,
    pub dispatcher: &'a TaskDispatcher,
}

impl<'a> Router<'a> {
    /// A token reached its current node
    ///
    /// Branch tokens arriving at a fan-in node are handed to the fan
    /// synchronizer unless they are the product of that node's merge.
    pub fn on_arrival(&self, token_id: &TokenId, synchronized: bool) -> EngineResult<Vec<Decision>> {
        let token = self.tokens.require(token_id)?;
        let node = self.graph.require_node(&token.node_id)?;

        if node.fan_in().is_some() && !token.branch_stack.is_empty() && !synchronized {
            return self.fan.on_arrival(token, node, self.tokens, self.context);
        }

        let scope = self.context.scope(token);
        match self
            .dispatcher
            .dispatch(token, node, &scope, self.context.input())?
        {
            Some(decision) => Ok(vec![decision]),
            None => self.route(token, &scope),
        }
    }

    pub fn on_resolution(&self, token_id: &TokenId, resolution: Resolution) -> EngineResult<Vec<Decision>> {
        let token = self.tokens.require(token_id)?;
        match resolution {
            Resolution::Completed(result) => self.on_task_completed(token, result),
            Resolution::Failed { kind, error } => self.on_task_failed(token, kind, error),
            Resolution::FailRun(failure) => Ok(vec![
                Decision::FailNode {
                    token_id: token.id,
                    node_id: token.node_id.clone(),
                    error: failure.message.clone(),
                },
                Decision::FailRun { failure },
            ]),
        }
    }

    /// Apply the output mapping, then route against the post-write scope
    pub fn on_task_completed(&self, token: &Token, result: Value) -> EngineResult<Vec<Decision>> {
        let node = self.graph.require_node(&token.node_id)?;
        let mut scope = with_result(self.context.scope(token), result);

        let writes = node.output_mapping.evaluate(&scope);
        if let Some(state) = scope.get_mut("state") {
            for (target, value) in &writes {
                set_path(state, strip_state_prefix(target), value.clone())?;
            }
        }

        let mut decisions = vec![Decision::CompleteNode {
            token_id: token.id,
            node_id: token.node_id.clone(),
            writes,
        }];
        decisions.extend(self.route(token, &scope)?);
        Ok(decisions)
    }

    /// Expose the failure as `state._last_error` and route on it
    ///
    /// When no transition handles the failure the run fails with `kind`
    /// and the task error.
    pub fn on_task_failed(
        &self,
        token: &Token,
        kind: FailureKind,
        error: String,
    ) -> EngineResult<Vec<Decision>> {
        let mut scope = self.context.scope(token);
        if let Some(state) = scope.get_mut("state") {
            set_path(state, LAST_ERROR, last_error(&token.node_id, &token.id, &error))?;
        }

        tracing::warn!("Node {} failed for token {}: {}", token.node_id, token.id, error);

        let unhandled = format!("node '{}' failed: {}", token.node_id, error);
        let mut decisions = vec![Decision::FailNode {
            token_id: token.id,
            node_id: token.node_id.clone(),
            error,
        }];
        decisions.extend(self.leave(token, &scope, || {
            tracing::error!("No transition handles the failure of token {}", token.id);
            RunFailure::new(kind, unhandled)
        })?);
        Ok(decisions)
    }

    /// Leave the token's current node
    pub fn route(&self, token: &Token, scope: &Value) -> EngineResult<Vec<Decision>> {
        self.leave(token, scope, || {
            let err = EngineError::NoMatchingTransition {
                node_id: token.node_id.clone(),
            };
            tracing::error!("Token {} is stuck: {}", token.id, err);
            RunFailure::new(FailureKind::Definition, err.to_string())
        })
    }

    fn leave(
        &self,
        token: &Token,
        scope: &Value,
        unmatched: impl FnOnce() -> RunFailure,
    ) -> EngineResult<Vec<Decision>> {
        if self.graph.is_terminal(&token.node_id) {
            let mut decisions = vec![Decision::CompleteToken { token_id: token.id }];
            if !self.tokens.others_live(&token.id) {
                decisions.push(Decision::CompleteRun);
            }
            return Ok(decisions);
        }

        let decision = match self.choose(&token.node_id, scope)? {
            Choice::Advance(t) => Decision::Advance {
                token_id: token.id,
                from: t.from.clone(),
                to: t.to.clone(),
                priority: t.priority,
            },
            Choice::Spawn(t, branches) => Decision::SpawnTokens {
                parent: token.id,
                fan_out_node_id: t.from.clone(),
                to_node: t.to.clone(),
                branches,
            },
            Choice::NoMatch => Decision::FailRun {
                failure: unmatched(),
            },
        };
        Ok(vec![decision])
    }

    /// First matching transition by ascending priority
    ///
    /// A spawning transition whose collection is empty does not match.
    pub fn choose(&self, node_id: &NodeId, scope: &Value) -> EngineResult<Choice<'a>> {
        for transition in self.graph.outgoing(node_id) {
            if !transition.matches(scope) {
                continue;
            }

            let Some(spawn) = &transition.spawn else {
                return Ok(Choice::Advance(transition));
            };

            let branches = match spawn {
                Spawn::Foreach(expr) => match expr.evaluate(scope) {
                    Value::Array(items) => {
                        let total = items.len();
                        items
                            .into_iter()
                            .enumerate()
                            .map(|(index, item)| BranchSeed {
                                index,
                                total,
                                item: Some(item),
                            })
                            .collect::<Vec<_>>()
                    }
                    other => {
                        return Err(self.invalid(format!(
                            "foreach of {} -> {} produced {} instead of an array",
                            transition.from,
                            transition.to,
                            type_name(&other)
                        )))
                    }
                },
                Spawn::Branches(source) => {
                    let total = match source {
                        BranchSource::Literal(n) => *n,
                        BranchSource::Expr(expr) => {
                            let value = expr.evaluate(scope);
                            value.as_u64().map(|n| n as usize).ok_or_else(|| {
                                self.invalid(format!(
                                    "branch count of {} -> {} is {} instead of a non-negative integer",
                                    transition.from, transition.to, value
                                ))
                            })?
                        }
                    };
                    (0..total)
                        .map(|index| BranchSeed {
                            index,
                            total,
                            item: None,
                        })
                        .collect()
                }
            };

            if branches.is_empty() {
                tracing::debug!(
                    "Transition {} -> {} has nothing to spawn, trying next",
                    transition.from,
                    transition.to
                );
                continue;
            }
            return Ok(Choice::Spawn(transition, branches));
        }

        Ok(Choice::NoMatch)
    }

    fn invalid(&self, message: String) -> EngineError {
        EngineError::Definition {
            workflow: self.graph.workflow_id().clone(),
            message,
        }
    }
}

/// Reserved state key carrying the latest task failure
pub const LAST_ERROR: &str = "_last_error";

pub fn last_error(node_id: &NodeId, token_id: &TokenId, message: &str) -> Value {
    json!({
        "node_id": node_id,
        "token_id": token_id,
        "message": message,
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::graph::tests::{llm_actions, workflow};

    struct Fixture {
        graph: GraphIndex,
        tokens: TokenTable,
        context: RunContext,
        fan: FanSynchronizer,
        dispatcher: TaskDispatcher,
    }

    impl Fixture {
        fn new(def: serde_json::Value, input: Value) -> Self {
            Self {
                graph: GraphIndex::compile(&workflow(def), &llm_actions()).unwrap(),
                tokens: TokenTable::new(),
                context: RunContext::new(input),
                fan: FanSynchronizer::new(),
                dispatcher: TaskDispatcher::new(RunId::new()),
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

        fn token_at(&mut self, node: &str) -> TokenId {
            let mut token = Token::new(NodeId::new(node), vec![]);
            token.status = TokenStatus::Active;
            self.tokens.insert(token)
        }
    }

    fn branching() -> serde_json::Value {
        json!({
            "id": "branching",
            "initial_node": "review",
            "nodes": [{"id": "review"}, {"id": "approve"}, {"id": "reject"}, {"id": "fallback"}],
            "transitions": [
                {"from": "review", "to": "approve", "priority": 1, "condition": "input.score >= 5"},
                {"from": "review", "to": "reject", "priority": 2, "condition": "input.score < 5"},
                {"from": "review", "to": "fallback", "priority": 3, "condition": "input.score == null"},
            ],
        })
    }

    #[test]
    fn test_transition_choice_is_deterministic() {
        let fixture = Fixture::new(branching(), json!({"score": 7}));
        let router = fixture.router();
        let scope = json!({"input": {"score": 7}, "state": {}});
        let review = NodeId::new("review");

        let first = match router.choose(&review, &scope).unwrap() {
            Choice::Advance(t) => (t.to.clone(), t.priority),
            other => panic!("unexpected choice: {other:?}"),
        };
        let second = match router.choose(&review, &scope).unwrap() {
            Choice::Advance(t) => (t.to.clone(), t.priority),
            other => panic!("unexpected choice: {other:?}"),
        };
        assert_eq!(first, second);
        assert_eq!(first, (NodeId::new("approve"), 1));
    }

    #[test]
    fn test_no_match_is_definition_failure() {
        let mut fixture = Fixture::new(branching(), json!({"score": "high"}));
        let token_id = fixture.token_at("review");

        let router = fixture.router();
        let token = fixture.tokens.get(&token_id).unwrap();
        let decisions = router
            .route(token, &fixture.context.scope(token))
            .unwrap();

        assert_eq!(decisions.len(), 1);
        match &decisions[0] {
            Decision::FailRun { failure } => {
                assert_eq!(failure.kind, FailureKind::Definition);
                assert!(failure.message.contains("review"));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_fan_out_all_spawns_indexed_branches() {
        let mut fixture = Fixture::new(
            json!({
                "id": "judges",
                "initial_node": "split",
                "nodes": [{"id": "split"}, {"id": "judge"}],
                "transitions": [
                    {"from": "split", "to": "judge", "priority": 1, "fan_out": "all", "branches": "input.judges"},
                ],
            }),
            json!({"judges": 4}),
        );
        let token_id = fixture.token_at("split");
        let router = fixture.router();
        let token = fixture.tokens.get(&token_id).unwrap();

        let decisions = router.route(token, &fixture.context.scope(token)).unwrap();
        match &decisions[..] {
            [Decision::SpawnTokens {
                fan_out_node_id,
                to_node,
                branches,
                ..
            }] => {
                assert_eq!(fan_out_node_id, &NodeId::new("split"));
                assert_eq!(to_node, &NodeId::new("judge"));
                let indices: Vec<usize> = branches.iter().map(|b| b.index).collect();
                assert_eq!(indices, vec![0, 1, 2, 3]);
                assert!(branches.iter().all(|b| b.total == 4));
            }
            other => panic!("unexpected decisions: {other:?}"),
        }
    }

    #[test]
    fn test_empty_foreach_falls_through() {
        let def = json!({
            "id": "items",
            "initial_node": "split",
            "nodes": [{"id": "split"}, {"id": "each"}, {"id": "empty"}],
            "transitions": [
                {"from": "split", "to": "each", "priority": 1, "foreach": "input.items"},
                {"from": "split", "to": "empty", "priority": 2},
            ],
        });

        let mut empty = Fixture::new(def.clone(), json!({"items": []}));
        let token_id = empty.token_at("split");
        let token = empty.tokens.get(&token_id).unwrap();
        let decisions = empty.router().route(token, &empty.context.scope(token)).unwrap();
        assert!(matches!(
            &decisions[..],
            [Decision::Advance { to, .. }] if to == &NodeId::new("empty")
        ));

        let mut items = Fixture::new(def.clone(), json!({"items": ["a", "b"]}));
        let token_id = items.token_at("split");
        let token = items.tokens.get(&token_id).unwrap();
        let decisions = items.router().route(token, &items.context.scope(token)).unwrap();
        match &decisions[..] {
            [Decision::SpawnTokens { branches, .. }] => {
                assert_eq!(branches[1].item, Some(json!("b")));
            }
            other => panic!("unexpected decisions: {other:?}"),
        }

        let mut scalar = Fixture::new(def, json!({"items": "nope"}));
        let token_id = scalar.token_at("split");
        let token = scalar.tokens.get(&token_id).unwrap();
        let err = scalar
            .router()
            .route(token, &scalar.context.scope(token))
            .unwrap_err();
        assert_eq!(err.failure_kind(), FailureKind::Definition);
    }

    #[test]
    fn test_task_failure_routes_on_last_error() {
        let mut fixture = Fixture::new(
            json!({
                "id": "guarded",
                "initial_node": "call",
                "nodes": [{"id": "call", "action": "summarize"}, {"id": "recover"}, {"id": "done"}],
                "transitions": [
                    {"from": "call", "to": "recover", "priority": 1, "condition": "state._last_error != null"},
                    {"from": "call", "to": "done", "priority": 2},
                ],
            }),
            json!({}),
        );
        let token_id = fixture.token_at("call");
        let router = fixture.router();
        let token = fixture.tokens.get(&token_id).unwrap();

        let decisions = router
            .on_task_failed(token, FailureKind::Task, "rate limited".to_string())
            .unwrap();
        assert!(matches!(&decisions[0], Decision::FailNode { error, .. } if error == "rate limited"));
        assert!(matches!(
            &decisions[1],
            Decision::Advance { to, .. } if to == &NodeId::new("recover")
        ));
    }

    #[test]
    fn test_unhandled_task_failure_keeps_task_error() {
        let mut fixture = Fixture::new(
            json!({
                "id": "gated",
                "initial_node": "call",
                "nodes": [{"id": "call", "action": "summarize"}, {"id": "ok"}],
                "transitions": [
                    {"from": "call", "to": "ok", "priority": 1, "condition": "state._last_error == null"},
                ],
            }),
            json!({}),
        );
        let token_id = fixture.token_at("call");
        let router = fixture.router();
        let token = fixture.tokens.get(&token_id).unwrap();

        let decisions = router
            .on_task_failed(token, FailureKind::Task, "upstream 503".to_string())
            .unwrap();
        match &decisions[..] {
            [Decision::FailNode { .. }, Decision::FailRun { failure }] => {
                assert_eq!(failure.kind, FailureKind::Task);
                assert!(failure.message.contains("call"));
                assert!(failure.message.contains("upstream 503"));
            }
            other => panic!("unexpected decisions: {other:?}"),
        }

        let decisions = router
            .on_task_failed(token, FailureKind::SubRun, "child failed".to_string())
            .unwrap();
        assert!(matches!(
            decisions.last(),
            Some(Decision::FailRun { failure }) if failure.kind == FailureKind::SubRun
        ));
    }

    #[test]
    fn test_terminal_node_completes_run_when_last() {
        let mut fixture = Fixture::new(branching(), json!({"score": 9}));
        let token_id = fixture.token_at("approve");
        let token = fixture.tokens.get(&token_id).unwrap().clone();

        let decisions = fixture
            .router()
            .route(&token, &fixture.context.scope(&token))
            .unwrap();
        assert!(matches!(
            &decisions[..],
            [Decision::CompleteToken { .. }, Decision::CompleteRun]
        ));

        fixture.token_at("reject");
        let decisions = fixture
            .router()
            .route(&token, &fixture.context.scope(&token))
            .unwrap();
        assert!(matches!(&decisions[..], [Decision::CompleteToken { .. }]));
    }
}
