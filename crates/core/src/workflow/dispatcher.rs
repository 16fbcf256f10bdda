use super::decision::Decision;
use super::graph::CompiledNode;
use super::task_executor::{
    ResolvedAction, SubRunOutcome, SubRunRequest, TaskOutcome, TaskRequest, TaskStatus,
};
use crate::error::EngineResult;
use crate::types::*;
use serde_json::Value;

/// What a finished task or sub-run means for its token
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Apply the output mapping with `result` bound, then route
    Completed(Value),
    /// Record `_last_error`, then route; `kind` fails the run when no
    /// transition handles it
    Failed { kind: FailureKind, error: String },
    /// Fail the node and the whole run
    FailRun(RunFailure),
}

/// Turns node actions into outbound work and results back into router input
pub struct TaskDispatcher {
    run_id: RunId,
}

impl TaskDispatcher {
    pub fn new(run_id: RunId) -> Self {
        Self { run_id }
    }

    /// `None` for pass-through nodes
    pub fn dispatch(
        &self,
        token: &Token,
        node: &CompiledNode,
        scope: &Value,
        run_input: &Value,
    ) -> EngineResult<Option<Decision>> {
        let Some(action) = &node.action else {
            return Ok(None);
        };

        let decision = match &action.kind {
            ActionKind::Noop => None,
            ActionKind::InvokeWorkflow {
                workflow_def_id,
                version,
                ..
            } => Some(Decision::StartSubRun {
                token_id: token.id,
                node_id: node.id().clone(),
                action_id: action.id.clone(),
                request: SubRunRequest {
                    parent_run_id: self.run_id,
                    parent_token_id: token.id,
                    workflow_def_id: workflow_def_id.clone(),
                    version: *version,
                    input: resolve_input(node, scope, run_input)?,
                },
            }),
            ActionKind::Llm { .. }
            | ActionKind::Http { .. }
            | ActionKind::Tool { .. }
            | ActionKind::HumanApproval { .. } => Some(Decision::Dispatch {
                token_id: token.id,
                node_id: node.id().clone(),
                request: TaskRequest {
                    run_id: self.run_id,
                    token_id: token.id,
                    node_id: node.id().clone(),
                    action: ResolvedAction {
                        action_id: action.id.clone(),
                        kind: action.kind.clone(),
                        input: resolve_input(node, scope, run_input)?,
                        timeout_ms: action.timeout_ms,
                        retry: action.retry.clone(),
                    },
                },
            }),
        };

        Ok(decision)
    }

    pub fn on_result(&self, outcome: TaskOutcome) -> Resolution {
        match outcome.status {
            TaskStatus::Success => Resolution::Completed(outcome.output.unwrap_or(Value::Null)),
            TaskStatus::Failure => {
                Resolution::Failed {
                    kind: FailureKind::Task,
                    error: outcome.error.unwrap_or_else(|| "task failed".to_string()),
                }
            }
        }
    }

    pub fn on_sub_run_result(&self, node: &CompiledNode, outcome: SubRunOutcome) -> Resolution {
        if outcome.status == RunStatus::Completed {
            return Resolution::Completed(outcome.output.unwrap_or(Value::Null));
        }

        let message = match &outcome.error {
            Some(failure) => failure.message.clone(),
            None => format!("sub-run ended as {:?}", outcome.status),
        };

        let policy = match node.action.as_ref().map(|a| &a.kind) {
            Some(ActionKind::InvokeWorkflow { on_failure, .. }) => *on_failure,
            _ => SubRunFailurePolicy::Propagate,
        };

        match policy {
            SubRunFailurePolicy::Propagate => Resolution::FailRun(RunFailure::new(
                FailureKind::SubRun,
                format!("sub-run of node '{}' failed: {}", node.id(), message),
            )),
            SubRunFailurePolicy::Route => Resolution::Failed {
                kind: FailureKind::SubRun,
                error: message,
            },
        }
    }
}

/// Node input: the input mapping over the token scope, or the run input
fn resolve_input(node: &CompiledNode, scope: &Value, run_input: &Value) -> EngineResult<Value> {
    if node.input_mapping.is_empty() {
        Ok(run_input.clone())
    } else {
        node.input_mapping.build(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::CompiledMapping;
    use serde_json::json;

    fn node(kind: Option<ActionKind>, input_mapping: &[(&str, &str)]) -> CompiledNode {
        let mapping: Mapping = input_mapping
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        CompiledNode {
            def: NodeDef {
                id: NodeId::new("step"),
                input_mapping: mapping.clone(),
                ..Default::default()
            },
            action: kind.map(|kind| ActionDef {
                id: ActionDefId::new("action"),
                kind,
                timeout_ms: Some(500),
                retry: None,
            }),
            input_mapping: CompiledMapping::compile(&mapping).unwrap(),
            output_mapping: CompiledMapping::default(),
        }
    }

    #[test]
    fn test_pass_through_nodes_dispatch_nothing() {
        let dispatcher = TaskDispatcher::new(RunId::new());
        let token = Token::new(NodeId::new("step"), vec![]);

        for n in [node(None, &[]), node(Some(ActionKind::Noop), &[])] {
            assert!(dispatcher
                .dispatch(&token, &n, &json!({}), &json!({}))
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_dispatch_resolves_input_mapping() {
        let run_id = RunId::new();
        let dispatcher = TaskDispatcher::new(run_id);
        let token = Token::new(NodeId::new("step"), vec![]);
        let llm = node(
            Some(ActionKind::Llm {
                model: "small".to_string(),
                prompt: "summarize".to_string(),
            }),
            &[("text", "input.text")],
        );
        let scope = json!({"input": {"text": "hello"}, "state": {}});

        let decision = dispatcher
            .dispatch(&token, &llm, &scope, &json!({"text": "hello"}))
            .unwrap();
        match decision {
            Some(Decision::Dispatch { request, .. }) => {
                assert_eq!(request.run_id, run_id);
                assert_eq!(request.token_id, token.id);
                assert_eq!(request.action.input, json!({"text": "hello"}));
                assert_eq!(request.action.timeout_ms, Some(500));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_invoke_workflow_starts_sub_run_with_run_input() {
        let dispatcher = TaskDispatcher::new(RunId::new());
        let token = Token::new(NodeId::new("step"), vec![]);
        let invoke = node(
            Some(ActionKind::InvokeWorkflow {
                workflow_def_id: WorkflowDefId::new("child"),
                version: Some(2),
                on_failure: SubRunFailurePolicy::Propagate,
            }),
            &[],
        );

        let decision = dispatcher
            .dispatch(&token, &invoke, &json!({}), &json!({"doc": 1}))
            .unwrap();
        match decision {
            Some(Decision::StartSubRun { request, .. }) => {
                assert_eq!(request.parent_token_id, token.id);
                assert_eq!(request.version, Some(2));
                assert_eq!(request.input, json!({"doc": 1}));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }

    #[test]
    fn test_sub_run_failure_policies() {
        let dispatcher = TaskDispatcher::new(RunId::new());
        let failed = SubRunOutcome::failed(RunFailure::new(FailureKind::Task, "boom"));

        let propagate = node(
            Some(ActionKind::InvokeWorkflow {
                workflow_def_id: WorkflowDefId::new("child"),
                version: None,
                on_failure: SubRunFailurePolicy::Propagate,
            }),
            &[],
        );
        match dispatcher.on_sub_run_result(&propagate, failed.clone()) {
            Resolution::FailRun(failure) => {
                assert_eq!(failure.kind, FailureKind::SubRun);
                assert!(failure.message.contains("boom"));
            }
            other => panic!("unexpected resolution: {other:?}"),
        }

        let route = node(
            Some(ActionKind::InvokeWorkflow {
                workflow_def_id: WorkflowDefId::new("child"),
                version: None,
                on_failure: SubRunFailurePolicy::Route,
            }),
            &[],
        );
        assert_eq!(
            dispatcher.on_sub_run_result(&route, failed),
            Resolution::Failed {
                kind: FailureKind::SubRun,
                error: "boom".to_string(),
            }
        );
    }
}
