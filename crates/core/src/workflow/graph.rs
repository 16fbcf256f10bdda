use crate::error::{EngineError, EngineResult};
use crate::expr::{is_reserved, strip_state_prefix, CompiledMapping, Expr};
use crate::storage::DefinitionStore;
use crate::types::*;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use std::collections::{HashMap, HashSet};

/// A node with its action resolved and mappings parsed
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub def: NodeDef,
    pub action: Option<ActionDef>,
    pub input_mapping: CompiledMapping,
    pub output_mapping: CompiledMapping,
}

impl CompiledNode {
    pub fn id(&self) -> &NodeId {
        &self.def.id
    }

    pub fn fan_in(&self) -> Option<&FanInConfig> {
        self.def.fan_in.as_ref()
    }
}

/// How a transition multiplies the token taking it
#[derive(Debug, Clone)]
pub enum Spawn {
    Foreach(Expr),
    Branches(BranchSource),
}

#[derive(Debug, Clone)]
pub enum BranchSource {
    Literal(usize),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct CompiledTransition {
    pub from: NodeId,
    pub to: NodeId,
    pub priority: u32,
    pub condition: Option<Expr>,
    pub spawn: Option<Spawn>,
}

impl CompiledTransition {
    /// A missing condition always matches
    pub fn matches(&self, scope: &serde_json::Value) -> bool {
        self.condition
            .as_ref()
            .map(|c| c.is_true(scope))
            .unwrap_or(true)
    }
}

/// Read-only compiled view of one workflow definition
///
/// Nodes live in a petgraph arena indexed by node id; outgoing transitions
/// are kept per source node, sorted by ascending priority.
#[derive(Debug)]
pub struct GraphIndex {
    workflow_id: WorkflowDefId,
    version: u32,
    initial: NodeId,
    graph: DiGraph<CompiledNode, u32>,
    node_indices: HashMap<NodeId, NodeIndex>,
    outgoing: HashMap<NodeId, Vec<CompiledTransition>>,
    output_mapping: Option<CompiledMapping>,
}

impl GraphIndex {
    /// Compile a definition, resolving actions through the store
    pub fn load(def: &WorkflowDef, store: &dyn DefinitionStore) -> EngineResult<Self> {
        let mut actions = HashMap::new();
        for action_id in def.nodes.iter().filter_map(|n| n.action.as_ref()) {
            if actions.contains_key(action_id) {
                continue;
            }
            if let Some(action) = store.action(action_id)? {
                actions.insert(action_id.clone(), action);
            }
        }
        Self::compile(def, &actions)
    }

    pub fn compile(def: &WorkflowDef, actions: &HashMap<ActionDefId, ActionDef>) -> EngineResult<Self> {
        let invalid = |message: String| EngineError::Definition {
            workflow: def.id.clone(),
            message,
        };

        let mut graph = DiGraph::new();
        let mut node_indices = HashMap::new();

        for node in &def.nodes {
            if node_indices.contains_key(&node.id) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }

            let action = match &node.action {
                Some(action_id) => Some(actions.get(action_id).cloned().ok_or_else(|| {
                    invalid(format!("node '{}' references unknown action '{}'", node.id, action_id))
                })?),
                None => None,
            };

            for target in node.output_mapping.keys() {
                if targets_reserved(target) {
                    return Err(invalid(format!(
                        "node '{}' writes reserved path '{}'",
                        node.id, target
                    )));
                }
            }

            if let Some(fan_in) = &node.fan_in {
                let target = strip_state_prefix(&fan_in.target);
                if target.trim().is_empty() || targets_reserved(target) {
                    return Err(invalid(format!(
                        "node '{}' has invalid merge target '{}'",
                        node.id, fan_in.target
                    )));
                }
                if fan_in.policy == FanInPolicy::MOfN(0) {
                    return Err(invalid(format!("node '{}' uses m_of_n with m = 0", node.id)));
                }
            }

            let compiled = CompiledNode {
                def: node.clone(),
                action,
                input_mapping: CompiledMapping::compile(&node.input_mapping)?,
                output_mapping: CompiledMapping::compile(&node.output_mapping)?,
            };
            let index = graph.add_node(compiled);
            node_indices.insert(node.id.clone(), index);
        }

        let Some(&start) = node_indices.get(&def.initial_node) else {
            return Err(invalid(format!("initial node '{}' is not defined", def.initial_node)));
        };

        let mut outgoing: HashMap<NodeId, Vec<CompiledTransition>> = HashMap::new();
        for transition in &def.transitions {
            let (Some(&from), Some(&to)) = (
                node_indices.get(&transition.from),
                node_indices.get(&transition.to),
            ) else {
                return Err(invalid(format!(
                    "transition {} -> {} references an unknown node",
                    transition.from, transition.to
                )));
            };

            let siblings = outgoing.entry(transition.from.clone()).or_default();
            if siblings.iter().any(|t| t.priority == transition.priority) {
                return Err(invalid(format!(
                    "node '{}' has two transitions with priority {}",
                    transition.from, transition.priority
                )));
            }

            let spawn = compile_spawn(transition).map_err(|e| match e {
                SpawnError::Invalid(message) => invalid(message),
                SpawnError::Engine(e) => e,
            })?;

            siblings.push(CompiledTransition {
                from: transition.from.clone(),
                to: transition.to.clone(),
                priority: transition.priority,
                condition: transition.condition.as_deref().map(Expr::parse).transpose()?,
                spawn,
            });
            graph.add_edge(from, to, transition.priority);
        }

        for transitions in outgoing.values_mut() {
            transitions.sort_by_key(|t| t.priority);
        }

        let output_mapping = def
            .output_mapping
            .as_ref()
            .map(CompiledMapping::compile)
            .transpose()?;

        let index = Self {
            workflow_id: def.id.clone(),
            version: def.version,
            initial: def.initial_node.clone(),
            graph,
            node_indices,
            outgoing,
            output_mapping,
        };
        index.warn_unreachable(start);
        Ok(index)
    }

    fn warn_unreachable(&self, start: NodeIndex) {
        let mut reachable = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(node) = bfs.next(&self.graph) {
            reachable.insert(node);
        }

        for index in self.graph.node_indices() {
            if !reachable.contains(&index) {
                tracing::warn!(
                    "Node '{}' in workflow {} v{} is unreachable from '{}'",
                    self.graph[index].id(),
                    self.workflow_id,
                    self.version,
                    self.initial
                );
            }
        }
    }

    pub fn workflow_id(&self) -> &WorkflowDefId {
        &self.workflow_id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn initial_node(&self) -> &NodeId {
        &self.initial
    }

    pub fn node(&self, id: &NodeId) -> Option<&CompiledNode> {
        self.node_indices.get(id).map(|&index| &self.graph[index])
    }

    pub fn require_node(&self, id: &NodeId) -> EngineResult<&CompiledNode> {
        self.node(id).ok_or_else(|| EngineError::Definition {
            workflow: self.workflow_id.clone(),
            message: format!("node '{}' is not defined", id),
        })
    }

    /// Outgoing transitions in ascending priority
    pub fn outgoing(&self, id: &NodeId) -> &[CompiledTransition] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A node is terminal iff it has no outgoing transitions
    pub fn is_terminal(&self, id: &NodeId) -> bool {
        self.outgoing(id).is_empty()
    }

    pub fn output_mapping(&self) -> Option<&CompiledMapping> {
        self.output_mapping.as_ref()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

fn targets_reserved(target: &str) -> bool {
    strip_state_prefix(target)
        .split('.')
        .next()
        .map(is_reserved)
        .unwrap_or(false)
}

enum SpawnError {
    Invalid(String),
    Engine(EngineError),
}

impl From<EngineError> for SpawnError {
    fn from(e: EngineError) -> Self {
        SpawnError::Engine(e)
    }
}

fn compile_spawn(transition: &TransitionDef) -> Result<Option<Spawn>, SpawnError> {
    let label = format!("{} -> {}", transition.from, transition.to);
    let fan_out_all = transition.fan_out == Some(FanOutMode::All);

    match (&transition.foreach, fan_out_all, &transition.branches) {
        (Some(_), true, _) => Err(SpawnError::Invalid(format!(
            "transition {} combines foreach with fan_out: all",
            label
        ))),
        (Some(expr), false, None) => Ok(Some(Spawn::Foreach(Expr::parse(expr)?))),
        (Some(_), false, Some(_)) => Err(SpawnError::Invalid(format!(
            "transition {} sets branches on a foreach",
            label
        ))),
        (None, true, None) => Err(SpawnError::Invalid(format!(
            "transition {} uses fan_out: all without branches",
            label
        ))),
        (None, true, Some(BranchCount::Literal(0))) => Err(SpawnError::Invalid(format!(
            "transition {} fans out to zero branches",
            label
        ))),
        (None, true, Some(BranchCount::Literal(n))) => {
            Ok(Some(Spawn::Branches(BranchSource::Literal(*n))))
        }
        (None, true, Some(BranchCount::Expr(expr))) => Ok(Some(Spawn::Branches(
            BranchSource::Expr(Expr::parse(expr)?),
        ))),
        (None, false, Some(_)) => Err(SpawnError::Invalid(format!(
            "transition {} sets branches without fan_out: all",
            label
        ))),
        (None, false, None) => Ok(None),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn workflow(value: serde_json::Value) -> WorkflowDef {
        serde_json::from_value(value).unwrap()
    }

    pub(crate) fn llm_actions() -> HashMap<ActionDefId, ActionDef> {
        let mut actions = HashMap::new();
        for (id, kind) in [
            ("noop", json!({"type": "noop"})),
            ("summarize", json!({"type": "llm", "model": "small", "prompt": "summarize"})),
            ("judge", json!({"type": "llm", "model": "small", "prompt": "score"})),
        ] {
            let action: ActionDef =
                serde_json::from_value(json!({"id": id, "kind": kind})).unwrap();
            actions.insert(action.id.clone(), action);
        }
        actions
    }

    #[test]
    fn test_outgoing_sorted_by_priority() {
        let def = workflow(json!({
            "id": "flow",
            "initial_node": "a",
            "nodes": [{"id": "a"}, {"id": "b"}, {"id": "c"}],
            "transitions": [
                {"from": "a", "to": "c", "priority": 2},
                {"from": "a", "to": "b", "priority": 1, "condition": "input.go"},
            ],
        }));
        let graph = GraphIndex::compile(&def, &HashMap::new()).unwrap();

        let priorities: Vec<u32> = graph
            .outgoing(&NodeId::new("a"))
            .iter()
            .map(|t| t.priority)
            .collect();
        assert_eq!(priorities, vec![1, 2]);
        assert!(graph.is_terminal(&NodeId::new("b")));
        assert!(!graph.is_terminal(&NodeId::new("a")));
        assert_eq!(graph.node_count(), 3);
    }

    fn assert_invalid(value: serde_json::Value, fragment: &str) {
        let err = GraphIndex::compile(&workflow(value), &llm_actions()).unwrap_err();
        assert!(
            matches!(err, EngineError::Definition { .. }),
            "unexpected error: {err}"
        );
        assert!(err.to_string().contains(fragment), "{err}");
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{"id": "a"}, {"id": "b"}, {"id": "c"}],
                "transitions": [
                    {"from": "a", "to": "b", "priority": 1},
                    {"from": "a", "to": "c", "priority": 1},
                ],
            }),
            "priority 1",
        );
    }

    #[test]
    fn test_structural_errors_rejected() {
        assert_invalid(
            json!({"id": "flow", "initial_node": "missing", "nodes": [{"id": "a"}]}),
            "initial node",
        );
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{"id": "a"}, {"id": "a"}],
            }),
            "duplicate node",
        );
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{"id": "a"}],
                "transitions": [{"from": "a", "to": "nowhere", "priority": 1}],
            }),
            "unknown node",
        );
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{"id": "a", "action": "missing"}],
            }),
            "unknown action",
        );
    }

    #[test]
    fn test_fan_configuration_errors_rejected() {
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{"id": "a"}, {"id": "b"}],
                "transitions": [{"from": "a", "to": "b", "priority": 1, "fan_out": "all"}],
            }),
            "without branches",
        );
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{"id": "a"}, {"id": "b"}],
                "transitions": [{
                    "from": "a", "to": "b", "priority": 1,
                    "fan_out": "all", "branches": 2, "foreach": "input.items",
                }],
            }),
            "foreach",
        );
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{
                    "id": "a",
                    "fan_in": {"policy": "all", "merge": "append", "target": "state._hidden"},
                }],
            }),
            "merge target",
        );
        assert_invalid(
            json!({
                "id": "flow",
                "initial_node": "a",
                "nodes": [{
                    "id": "a",
                    "fan_in": {"policy": {"m_of_n": 0}, "merge": "append", "target": "votes"},
                }],
            }),
            "m = 0",
        );
    }

    #[test]
    fn test_bad_condition_is_expression_error() {
        let def = workflow(json!({
            "id": "flow",
            "initial_node": "a",
            "nodes": [{"id": "a"}, {"id": "b"}],
            "transitions": [{"from": "a", "to": "b", "priority": 1, "condition": "input.x =="}],
        }));
        let err = GraphIndex::compile(&def, &HashMap::new()).unwrap_err();
        assert!(matches!(err, EngineError::Expression { .. }));
        assert_eq!(err.failure_kind(), FailureKind::Definition);
    }

    #[test]
    fn test_load_resolves_actions_from_store() {
        let store = crate::storage::InMemoryDefinitionStore::new();
        for action in llm_actions().into_values() {
            store.register_action(action).unwrap();
        }
        let def = workflow(json!({
            "id": "flow",
            "initial_node": "a",
            "nodes": [{"id": "a", "action": "summarize"}, {"id": "island"}],
        }));

        let graph = GraphIndex::load(&def, &store).unwrap();
        let node = graph.node(&NodeId::new("a")).unwrap();
        assert!(matches!(
            node.action.as_ref().map(|a| &a.kind),
            Some(ActionKind::Llm { .. })
        ));
    }
}
