//! Per-run context: input, shared state, output and isolated token regions.
//!
//! Every token writes its node output into its own region. A token outside
//! any fan-out is a group of size one, so its writes land in `state` at once.
//! Branch tokens keep their region until the fan-in merge reads it. While a
//! branch token is routed it sees `state` overlaid with the regions of every
//! enclosing fan-out and then its own region.

use crate::error::EngineResult;
use crate::expr::{deep_merge, is_reserved, set_path, strip_state_prefix, CompiledMapping};
use crate::types::{BranchFrame, GroupId, NodeId, Token, TokenId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Isolated output of one branch token
#[derive(Debug, Clone)]
pub struct Region {
    pub fan_out_node_id: NodeId,
    pub index: usize,
    pub data: Value,
}

/// Read-only view of a run's context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub input: Value,
    pub state: Value,
    pub output: Option<Value>,
    /// In-flight branch regions, addressable by fan-out node and branch index
    pub branches: Vec<BranchRegion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRegion {
    pub token_id: TokenId,
    pub fan_out_node_id: NodeId,
    pub branch_index: usize,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct RunContext {
    input: Value,
    state: Value,
    output: Option<Value>,
    regions: HashMap<TokenId, Region>,
    // Region of the token that spawned each open group
    stashes: HashMap<GroupId, Value>,
}

impl RunContext {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            state: Value::Object(Map::new()),
            output: None,
            regions: HashMap::new(),
            stashes: HashMap::new(),
        }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn region(&self, token_id: &TokenId) -> Option<&Region> {
        self.regions.get(token_id)
    }

    /// Branch output of a token with reserved keys removed
    pub fn branch_output(&self, token_id: &TokenId) -> Value {
        self.regions
            .get(token_id)
            .map(|r| without_reserved(&r.data))
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    /// Expression scope seen by a token: `{input, state, branch, result}`
    pub fn scope(&self, token: &Token) -> Value {
        let mut state = self.state.clone();
        for frame in &token.branch_stack {
            if let Some(stash) = self.stashes.get(&frame.group) {
                deep_merge(&mut state, stash);
            }
        }
        if let Some(region) = self.regions.get(&token.id) {
            deep_merge(&mut state, &region.data);
        }

        let branch = match token.branch() {
            Some(frame) => json!({
                "index": frame.index,
                "total": frame.total,
                "item": frame.item.clone().unwrap_or(Value::Null),
                "fan_out_node_id": frame.fan_out_node_id,
            }),
            None => Value::Null,
        };

        json!({
            "input": self.input,
            "state": state,
            "branch": branch,
            "result": Value::Null,
        })
    }

    /// Apply node writes for a token; all writes land or none do
    pub fn write(&mut self, token: &Token, writes: &[(String, Value)]) -> EngineResult<()> {
        let Some(frame) = token.branch() else {
            let mut state = self.state.clone();
            for (target, value) in writes {
                set_path(&mut state, strip_state_prefix(target), value.clone())?;
            }
            self.state = state;
            return Ok(());
        };

        let mut data = self
            .regions
            .get(&token.id)
            .map(|r| r.data.clone())
            .unwrap_or_else(|| Value::Object(Map::new()));
        for (target, value) in writes {
            set_path(&mut data, strip_state_prefix(target), value.clone())?;
        }
        self.regions.insert(
            token.id,
            Region {
                fan_out_node_id: frame.fan_out_node_id.clone(),
                index: frame.index,
                data,
            },
        );
        Ok(())
    }

    /// Park the spawning token's region with its new group
    pub fn stash(&mut self, group: GroupId, parent: &TokenId) {
        if let Some(region) = self.regions.remove(parent) {
            self.stashes.insert(group, region.data);
        }
    }

    /// Seed a merged token with the region its group was spawned from
    pub fn restore_stash(&mut self, group: GroupId, token: &Token) {
        let Some(stash) = self.stashes.remove(&group) else {
            return;
        };
        match token.branch() {
            Some(frame) => {
                self.regions.insert(
                    token.id,
                    Region {
                        fan_out_node_id: frame.fan_out_node_id.clone(),
                        index: frame.index,
                        data: stash,
                    },
                );
            }
            None => deep_merge(&mut self.state, &stash),
        }
    }

    /// Fold a finished branch into the enclosing scope: the stash of its
    /// group when nested, shared state otherwise
    pub fn commit_branch(&mut self, token: &Token) {
        if let Some(region) = self.regions.remove(&token.id) {
            self.commit(&token.branch_stack, &region.data);
        }
    }

    pub fn discard_region(&mut self, token_id: &TokenId) {
        self.regions.remove(token_id);
    }

    /// Drop a cancelled group's stash without folding it anywhere
    pub fn discard_stash(&mut self, group: &GroupId) {
        self.stashes.remove(group);
    }

    /// A group ended without a merge; its spawning token's region folds
    /// outward as if that token had finished
    pub fn dissolve_stash(&mut self, group: &GroupId, spawner_stack: &[BranchFrame]) {
        if let Some(stash) = self.stashes.remove(group) {
            self.commit(spawner_stack, &stash);
        }
    }

    fn commit(&mut self, stack: &[BranchFrame], data: &Value) {
        let data = without_reserved(data);
        match stack {
            [_, .., top] => {
                let stash = self
                    .stashes
                    .entry(top.group)
                    .or_insert_with(|| Value::Object(Map::new()));
                deep_merge(stash, &data);
            }
            _ => deep_merge(&mut self.state, &data),
        }
    }

    /// Run output: the workflow output mapping over `{input, state}`, or the
    /// state without reserved keys
    pub fn build_output(&self, mapping: Option<&CompiledMapping>) -> EngineResult<Value> {
        match mapping {
            Some(mapping) => {
                let scope = json!({"input": self.input, "state": self.state});
                mapping.build(&scope)
            }
            None => Ok(without_reserved(&self.state)),
        }
    }

    /// Output is written once; later writes are ignored
    pub fn set_output(&mut self, output: Value) {
        if self.output.is_some() {
            tracing::warn!("Run output already written, ignoring second write");
            return;
        }
        self.output = Some(output);
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let mut branches: Vec<BranchRegion> = self
            .regions
            .iter()
            .map(|(token_id, region)| BranchRegion {
                token_id: *token_id,
                fan_out_node_id: region.fan_out_node_id.clone(),
                branch_index: region.index,
                data: region.data.clone(),
            })
            .collect();
        branches.sort_by(|a, b| {
            a.fan_out_node_id
                .cmp(&b.fan_out_node_id)
                .then(a.branch_index.cmp(&b.branch_index))
        });

        ContextSnapshot {
            input: self.input.clone(),
            state: self.state.clone(),
            output: self.output.clone(),
            branches,
        }
    }
}

/// Copy of an object with `_`-prefixed top-level keys dropped
pub fn without_reserved(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !is_reserved(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Scope with the task result bound
pub fn with_result(mut scope: Value, result: Value) -> Value {
    if let Value::Object(map) = &mut scope {
        map.insert("result".to_string(), result);
    }
    scope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BranchFrame;

    fn branch_token(group: u64, index: usize) -> Token {
        Token::new(
            NodeId::new("judge"),
            vec![BranchFrame {
                group: GroupId(group),
                fan_out_node_id: NodeId::new("split"),
                index,
                total: 3,
                item: Some(json!({"name": format!("item{index}")})),
            }],
        )
    }

    #[test]
    fn test_root_writes_go_straight_to_state() {
        let mut ctx = RunContext::new(json!({"text": "hello"}));
        let root = Token::new(NodeId::new("llm"), vec![]);

        ctx.write(&root, &[("state.summary".to_string(), json!("hi"))])
            .unwrap();

        assert_eq!(ctx.state()["summary"], "hi");
        assert!(ctx.region(&root.id).is_none());
        assert_eq!(ctx.scope(&root)["input"]["text"], "hello");
    }

    #[test]
    fn test_branch_writes_are_isolated() {
        let mut ctx = RunContext::new(json!({}));
        let first = branch_token(0, 0);
        let second = branch_token(0, 1);

        ctx.write(&first, &[("score".to_string(), json!(1))]).unwrap();
        ctx.write(&second, &[("score".to_string(), json!(2))]).unwrap();

        assert!(ctx.state().get("score").is_none());
        assert_eq!(ctx.scope(&first)["state"]["score"], 1);
        assert_eq!(ctx.scope(&second)["state"]["score"], 2);
        assert_eq!(ctx.scope(&second)["branch"]["index"], 1);
        assert_eq!(ctx.scope(&second)["branch"]["item"]["name"], "item1");

        let snapshot = ctx.snapshot();
        assert_eq!(snapshot.branches.len(), 2);
        assert_eq!(snapshot.branches[0].branch_index, 0);
        assert_eq!(snapshot.branches[1].data["score"], 2);
    }

    #[test]
    fn test_failed_write_leaves_state_untouched() {
        let mut ctx = RunContext::new(json!({}));
        let root = Token::new(NodeId::new("a"), vec![]);
        ctx.write(&root, &[("x".to_string(), json!(1))]).unwrap();

        let result = ctx.write(
            &root,
            &[
                ("y".to_string(), json!(2)),
                ("x.nested".to_string(), json!(3)),
            ],
        );
        assert!(result.is_err());
        assert_eq!(ctx.state(), &json!({"x": 1}));
    }

    #[test]
    fn test_stash_is_visible_to_children_and_restored() {
        let mut ctx = RunContext::new(json!({}));
        let parent = branch_token(0, 2);
        ctx.write(&parent, &[("seen".to_string(), json!(true))])
            .unwrap();

        ctx.stash(GroupId(1), &parent.id);
        let mut child = branch_token(0, 2);
        child.branch_stack.push(BranchFrame {
            group: GroupId(1),
            fan_out_node_id: NodeId::new("inner"),
            index: 0,
            total: 1,
            item: None,
        });
        assert_eq!(ctx.scope(&child)["state"]["seen"], true);

        let merged = branch_token(0, 2);
        ctx.restore_stash(GroupId(1), &merged);
        assert_eq!(ctx.region(&merged.id).unwrap().data["seen"], true);
    }

    #[test]
    fn test_finished_branches_fold_outward() {
        let mut ctx = RunContext::new(json!({}));
        let outer = branch_token(0, 0);
        ctx.write(&outer, &[("outer".to_string(), json!(1))]).unwrap();
        ctx.stash(GroupId(1), &outer.id);

        let mut inner = branch_token(0, 0);
        inner.branch_stack.push(BranchFrame {
            group: GroupId(1),
            fan_out_node_id: NodeId::new("inner"),
            index: 0,
            total: 1,
            item: None,
        });
        ctx.write(&inner, &[("inner".to_string(), json!(2))]).unwrap();
        ctx.commit_branch(&inner);
        assert!(ctx.state().get("inner").is_none());

        ctx.dissolve_stash(&GroupId(1), &outer.branch_stack);
        assert_eq!(ctx.state(), &json!({"outer": 1, "inner": 2}));
    }

    #[test]
    fn test_output_defaults_to_public_state() {
        let mut ctx = RunContext::new(json!({}));
        let root = Token::new(NodeId::new("a"), vec![]);
        ctx.write(
            &root,
            &[
                ("summary".to_string(), json!("hi")),
                ("_last_error".to_string(), json!({"message": "boom"})),
            ],
        )
        .unwrap();

        assert_eq!(ctx.build_output(None).unwrap(), json!({"summary": "hi"}));

        let mapping =
            CompiledMapping::compile(&[("text".to_string(), "state.summary".to_string())].into())
                .unwrap();
        assert_eq!(
            ctx.build_output(Some(&mapping)).unwrap(),
            json!({"text": "hi"})
        );

        ctx.set_output(json!(1));
        ctx.set_output(json!(2));
        assert_eq!(ctx.output(), Some(&json!(1)));
    }
}
