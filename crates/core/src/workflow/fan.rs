//! Fan-out group bookkeeping and fan-in synchronization.
//!
//! Deciding is pure (`on_arrival`, `after_departure`); the run machine
//! applies the resulting decisions and records them through `park`,
//! `depart` and `close`. Merge content only depends on the contributing
//! branch outputs, sorted by branch index, never on arrival order.

use super::context::RunContext;
use super::decision::Decision;
use super::graph::CompiledNode;
use super::token::TokenTable;
use crate::error::{EngineError, EngineResult};
use crate::types::*;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct FanGroup {
    pub id: GroupId,
    pub fan_out_node_id: NodeId,
    /// Token that spawned the group
    pub spawner: TokenId,
    /// Spawned siblings in branch index order
    pub members: Vec<TokenId>,
    /// Siblings waiting at the fan-in, in arrival order
    pub arrived: Vec<TokenId>,
    /// Siblings that finished elsewhere or were cancelled before arriving
    pub departed: BTreeSet<TokenId>,
    pub fan_in_node: Option<NodeId>,
}

impl FanGroup {
    pub fn new(id: GroupId, fan_out_node_id: NodeId, spawner: TokenId, members: Vec<TokenId>) -> Self {
        Self {
            id,
            fan_out_node_id,
            spawner,
            members,
            arrived: Vec::new(),
            departed: BTreeSet::new(),
            fan_in_node: None,
        }
    }

    /// Members that may still arrive or have arrived
    fn expected(&self) -> usize {
        self.members.len().saturating_sub(self.departed.len())
    }

    /// Every member left without arriving, so no merge can happen
    pub fn is_abandoned(&self) -> bool {
        self.arrived.is_empty() && self.departed.len() == self.members.len()
    }

    fn pending(&self) -> impl Iterator<Item = &TokenId> {
        self.members
            .iter()
            .filter(|id| !self.arrived.contains(id) && !self.departed.contains(id))
    }
}

#[derive(Debug, Default)]
pub struct FanSynchronizer {
    groups: HashMap<GroupId, FanGroup>,
    merged: HashSet<GroupId>,
    next_group: u64,
}

impl FanSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_group_id(&mut self) -> GroupId {
        let id = GroupId(self.next_group);
        self.next_group += 1;
        id
    }

    pub fn open(&mut self, group: FanGroup) {
        tracing::debug!(
            "Opened fan-out group {} at {} with {} members",
            group.id,
            group.fan_out_node_id,
            group.members.len()
        );
        self.groups.insert(group.id, group);
    }

    pub fn group(&self, id: &GroupId) -> Option<&FanGroup> {
        self.groups.get(id)
    }

    pub fn is_open(&self, id: &GroupId) -> bool {
        self.groups.contains_key(id)
    }

    pub fn is_merged(&self, id: &GroupId) -> bool {
        self.merged.contains(id)
    }

    /// Record a sibling waiting at the fan-in node
    pub fn park(&mut self, id: &GroupId, token_id: TokenId, node_id: &NodeId) {
        if let Some(group) = self.groups.get_mut(id) {
            group.fan_in_node.get_or_insert_with(|| node_id.clone());
            if !group.arrived.contains(&token_id) {
                group.arrived.push(token_id);
            }
        }
    }

    /// Remove a sibling from the expected set
    pub fn depart(&mut self, id: &GroupId, token_id: TokenId) {
        if let Some(group) = self.groups.get_mut(id) {
            if !group.arrived.contains(&token_id) {
                group.departed.insert(token_id);
            }
        }
    }

    /// A merged token takes the place of the member that spawned its group
    pub fn replace_member(&mut self, id: &GroupId, old: TokenId, new: TokenId) {
        if let Some(group) = self.groups.get_mut(id) {
            for member in group.members.iter_mut().filter(|m| **m == old) {
                *member = new;
            }
        }
    }

    /// Open group spawned by a token that fanned out again
    pub fn spawned_by(&self, spawner: &TokenId) -> Option<GroupId> {
        self.groups
            .values()
            .find(|group| group.spawner == *spawner)
            .map(|group| group.id)
    }

    /// Destroy a group once its merge fired; late arrivals are discarded
    pub fn close(&mut self, id: &GroupId) -> Option<FanGroup> {
        let group = self.groups.remove(id);
        self.merged.insert(*id);
        group
    }

    /// A branch token reached a fan-in node
    pub fn on_arrival(
        &self,
        token: &Token,
        node: &CompiledNode,
        tokens: &TokenTable,
        context: &RunContext,
    ) -> EngineResult<Vec<Decision>> {
        let (Some(frame), Some(config)) = (token.branch(), node.fan_in()) else {
            return Ok(Vec::new());
        };

        let Some(group) = self.groups.get(&frame.group) else {
            let reason = if self.merged.contains(&frame.group) {
                format!("group {} already merged at {}", frame.group, node.id())
            } else {
                format!("group {} is unknown", frame.group)
            };
            return Ok(vec![Decision::DiscardToken {
                token_id: token.id,
                reason,
            }]);
        };

        if let Some(expected) = &group.fan_in_node {
            if expected != node.id() {
                let err = EngineError::FanIn {
                    node_id: node.id().clone(),
                    message: format!(
                        "siblings from {} converge on both '{}' and '{}'",
                        group.fan_out_node_id,
                        expected,
                        node.id()
                    ),
                };
                return Ok(vec![err.into()]);
            }
        }

        if group.arrived.contains(&token.id) {
            return Ok(Vec::new());
        }

        let mut decisions = vec![Decision::ParkAtFanIn {
            token_id: token.id,
            node_id: node.id().clone(),
            group: group.id,
        }];

        let mut arrived = group.arrived.clone();
        arrived.push(token.id);

        let contributors = match config.policy {
            FanInPolicy::Any => Some(vec![token.id]),
            FanInPolicy::All => (arrived.len() >= group.expected()).then(|| arrived.clone()),
            FanInPolicy::MOfN(m) => (arrived.len() >= m).then(|| arrived.clone()),
        };

        match contributors {
            Some(contributors) => {
                decisions.push(self.merge(group, node, config, contributors, token.id, tokens, context)?);

                let cancel_losers = match config.policy {
                    FanInPolicy::Any => true,
                    FanInPolicy::MOfN(_) => config.on_early_complete == EarlyCompletion::Cancel,
                    FanInPolicy::All => false,
                };
                if cancel_losers {
                    decisions.extend(group.pending().filter(|id| **id != token.id).map(|id| {
                        Decision::CancelToken {
                            token_id: *id,
                            reason: format!("fan-in at {} completed without it", node.id()),
                        }
                    }));
                }
            }
            None => {
                if let Some(failure) = unsatisfiable(group, node, config.policy) {
                    decisions.push(failure);
                }
            }
        }

        Ok(decisions)
    }

    /// Re-check a group after one of its members departed
    pub fn after_departure(
        &self,
        id: &GroupId,
        graph_node: Option<&CompiledNode>,
        tokens: &TokenTable,
        context: &RunContext,
    ) -> EngineResult<Vec<Decision>> {
        let (Some(group), Some(node)) = (self.groups.get(id), graph_node) else {
            return Ok(Vec::new());
        };
        let Some(config) = node.fan_in() else {
            return Ok(Vec::new());
        };

        let ready = match config.policy {
            FanInPolicy::All => !group.arrived.is_empty() && group.arrived.len() >= group.expected(),
            FanInPolicy::Any | FanInPolicy::MOfN(_) => false,
        };
        if ready {
            let Some(&last) = group.arrived.last() else {
                return Ok(Vec::new());
            };
            let merge = self.merge(group, node, config, group.arrived.clone(), last, tokens, context)?;
            return Ok(vec![merge]);
        }

        Ok(unsatisfiable(group, node, config.policy).into_iter().collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn merge(
        &self,
        group: &FanGroup,
        node: &CompiledNode,
        config: &FanInConfig,
        mut contributors: Vec<TokenId>,
        triggered_by: TokenId,
        tokens: &TokenTable,
        context: &RunContext,
    ) -> EngineResult<Decision> {
        let index_of = |id: &TokenId| -> EngineResult<usize> {
            Ok(tokens.require(id)?.branch().map(|b| b.index).unwrap_or(0))
        };

        let mut indexed = contributors
            .iter()
            .map(|id| Ok((index_of(id)?, *id)))
            .collect::<EngineResult<Vec<_>>>()?;
        indexed.sort_by_key(|(index, _)| *index);
        contributors = indexed.iter().map(|(_, id)| *id).collect();

        let outputs: Vec<(usize, TokenId, Value)> = indexed
            .into_iter()
            .map(|(index, id)| (index, id, context.branch_output(&id)))
            .collect();

        let value = merge_outputs(config.merge, config.policy, &outputs, triggered_by);

        tracing::info!(
            "Fan-in at {} merging {} of {} branches from {} ({:?})",
            node.id(),
            contributors.len(),
            group.members.len(),
            group.fan_out_node_id,
            config.merge
        );

        Ok(Decision::Merge {
            group: group.id,
            fan_in_node: node.id().clone(),
            target: config.target.clone(),
            value,
            contributors,
            triggered_by,
        })
    }
}

/// Combine branch outputs, given in branch index order
pub fn merge_outputs(
    strategy: MergeStrategy,
    policy: FanInPolicy,
    outputs: &[(usize, TokenId, Value)],
    triggered_by: TokenId,
) -> Value {
    match strategy {
        MergeStrategy::Append => Value::Array(outputs.iter().map(|(_, _, v)| v.clone()).collect()),
        MergeStrategy::MergeObject => {
            let mut merged = Map::new();
            for (index, _, output) in outputs {
                match output {
                    Value::Object(map) => {
                        merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    other => tracing::warn!(
                        "Branch {} produced {} which cannot be merged as an object",
                        index,
                        other
                    ),
                }
            }
            Value::Object(merged)
        }
        MergeStrategy::KeyedByBranch => Value::Object(
            outputs
                .iter()
                .map(|(index, _, v)| (index.to_string(), v.clone()))
                .collect(),
        ),
        MergeStrategy::LastWins => {
            let chosen = match policy {
                FanInPolicy::All => outputs.last(),
                FanInPolicy::Any | FanInPolicy::MOfN(_) => outputs
                    .iter()
                    .find(|(_, id, _)| *id == triggered_by)
                    .or(outputs.last()),
            };
            chosen.map(|(_, _, v)| v.clone()).unwrap_or(Value::Null)
        }
    }
}

/// `m_of_n` fails the run once too many siblings have departed
fn unsatisfiable(group: &FanGroup, node: &CompiledNode, policy: FanInPolicy) -> Option<Decision> {
    let FanInPolicy::MOfN(m) = policy else {
        return None;
    };
    if group.expected() >= m {
        return None;
    }

    let err = EngineError::FanIn {
        node_id: node.id().clone(),
        message: format!(
            "needs {} of {} branches but only {} can still arrive",
            m,
            group.members.len(),
            group.expected()
        ),
    };
    tracing::error!("{}", err);
    Some(err.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(values: &[(usize, Value)]) -> (Vec<(usize, TokenId, Value)>, Vec<TokenId>) {
        let ids: Vec<TokenId> = values.iter().map(|_| TokenId::new()).collect();
        let outputs = values
            .iter()
            .zip(&ids)
            .map(|((index, v), id)| (*index, *id, v.clone()))
            .collect();
        (outputs, ids)
    }

    #[test]
    fn test_merge_strategies() {
        let (outs, ids) = outputs(&[
            (0, json!({"a": 1, "shared": "first"})),
            (1, json!({"b": 2, "shared": "second"})),
            (2, json!({"c": 3})),
        ]);

        assert_eq!(
            merge_outputs(MergeStrategy::Append, FanInPolicy::All, &outs, ids[0]),
            json!([{"a": 1, "shared": "first"}, {"b": 2, "shared": "second"}, {"c": 3}])
        );
        assert_eq!(
            merge_outputs(MergeStrategy::MergeObject, FanInPolicy::All, &outs, ids[0]),
            json!({"a": 1, "b": 2, "c": 3, "shared": "second"})
        );
        assert_eq!(
            merge_outputs(MergeStrategy::KeyedByBranch, FanInPolicy::All, &outs, ids[0]),
            json!({"0": {"a": 1, "shared": "first"}, "1": {"b": 2, "shared": "second"}, "2": {"c": 3}})
        );
    }

    #[test]
    fn test_last_wins_depends_on_policy() {
        let (outs, ids) = outputs(&[(0, json!("zero")), (1, json!("one")), (2, json!("two"))]);

        assert_eq!(
            merge_outputs(MergeStrategy::LastWins, FanInPolicy::All, &outs, ids[0]),
            json!("two")
        );
        assert_eq!(
            merge_outputs(MergeStrategy::LastWins, FanInPolicy::Any, &outs, ids[1]),
            json!("one")
        );
        assert_eq!(
            merge_outputs(MergeStrategy::LastWins, FanInPolicy::MOfN(2), &outs, ids[0]),
            json!("zero")
        );
    }

    #[test]
    fn test_group_bookkeeping() {
        let mut fan = FanSynchronizer::new();
        let members: Vec<TokenId> = (0..3).map(|_| TokenId::new()).collect();
        let id = fan.next_group_id();
        fan.open(FanGroup::new(id, NodeId::new("split"), TokenId::new(), members.clone()));
        assert_eq!(fan.next_group_id(), GroupId(1));

        fan.park(&id, members[1], &NodeId::new("join"));
        fan.park(&id, members[1], &NodeId::new("join"));
        fan.depart(&id, members[2]);
        fan.depart(&id, members[1]);

        let group = fan.group(&id).unwrap();
        assert_eq!(group.arrived, vec![members[1]]);
        assert_eq!(group.departed.len(), 1);
        assert_eq!(group.expected(), 2);
        assert_eq!(group.pending().copied().collect::<Vec<_>>(), vec![members[0]]);
        assert_eq!(group.fan_in_node, Some(NodeId::new("join")));

        assert!(fan.close(&id).is_some());
        assert!(!fan.is_open(&id));
        assert!(fan.is_merged(&id));
    }
}
