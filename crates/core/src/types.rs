use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for an execution token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub Uuid);

impl TokenId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a node within a workflow definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a workflow definition (all versions share it)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowDefId(pub String);

impl WorkflowDefId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for WorkflowDefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an action definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionDefId(pub String);

impl ActionDefId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for ActionDefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a fan-out group, unique within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Target path -> source expression
pub type Mapping = BTreeMap<String, String>;

/// Definition of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub id: WorkflowDefId,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub initial_node: NodeId,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
    /// Builds the run output from `{input, state}`; the whole state is used when absent
    #[serde(default)]
    pub output_mapping: Option<Mapping>,
}

fn default_version() -> u32 {
    1
}

/// A single step of a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: NodeId,
    #[serde(default)]
    pub action: Option<ActionDefId>,
    #[serde(default)]
    pub input_mapping: Mapping,
    #[serde(default)]
    pub output_mapping: Mapping,
    #[serde(default)]
    pub fan_in: Option<FanInConfig>,
}

/// Prioritized conditional edge between two nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: NodeId,
    pub to: NodeId,
    pub priority: u32,
    #[serde(default)]
    pub condition: Option<String>,
    /// Expression yielding an array; one token is spawned per element
    #[serde(default)]
    pub foreach: Option<String>,
    #[serde(default)]
    pub fan_out: Option<FanOutMode>,
    #[serde(default)]
    pub branches: Option<BranchCount>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    All,
    FirstMatch,
}

/// Number of branches for `fan_out: all`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BranchCount {
    Literal(usize),
    Expr(String),
}

/// Synchronization settings of a fan-in node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanInConfig {
    pub policy: FanInPolicy,
    pub merge: MergeStrategy,
    pub target: String,
    #[serde(default)]
    pub on_early_complete: EarlyCompletion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanInPolicy {
    Any,
    All,
    #[serde(rename = "m_of_n")]
    MOfN(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Append,
    MergeObject,
    KeyedByBranch,
    LastWins,
}

/// Fate of siblings that did not make it into an early merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyCompletion {
    #[default]
    Cancel,
    Continue,
}

/// Work performed by a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDef {
    pub id: ActionDefId,
    pub kind: ActionKind,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

/// Closed set of action kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Pass-through, nothing is dispatched
    Noop,
    /// Call a language model
    Llm { model: String, prompt: String },
    /// Call an HTTP endpoint
    Http { method: String, url: String },
    /// Invoke a named tool
    Tool {
        name: String,
        #[serde(default)]
        parameters: serde_json::Value,
    },
    /// Wait for a human decision
    HumanApproval { approvers: Vec<String> },
    /// Run another workflow as a child run
    InvokeWorkflow {
        workflow_def_id: WorkflowDefId,
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        on_failure: SubRunFailurePolicy,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubRunFailurePolicy {
    /// Child failure fails the parent run
    #[default]
    Propagate,
    /// Child failure is routed like a task failure through `_last_error`
    Route,
}

/// Retry policy applied by the executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Status of an execution token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Created,
    Active,
    WaitingAtFanIn,
    WaitingOnSubRun,
    Completed,
    Cancelled,
}

impl TokenStatus {
    /// Live tokens keep a run from completing
    pub fn is_live(&self) -> bool {
        !matches!(self, TokenStatus::Completed | TokenStatus::Cancelled)
    }
}

/// Membership of a token in one fan-out group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchFrame {
    pub group: GroupId,
    pub fan_out_node_id: NodeId,
    pub index: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<serde_json::Value>,
}

/// An execution cursor moving through the graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub node_id: NodeId,
    pub status: TokenStatus,
    /// Innermost fan-out membership last; empty for the root token
    #[serde(default)]
    pub branch_stack: Vec<BranchFrame>,
}

impl Token {
    pub fn new(node_id: NodeId, branch_stack: Vec<BranchFrame>) -> Self {
        Self {
            id: TokenId::new(),
            node_id,
            status: TokenStatus::Created,
            branch_stack,
        }
    }

    /// Current fan-out membership, if any
    pub fn branch(&self) -> Option<&BranchFrame> {
        self.branch_stack.last()
    }

    pub fn fan_out_node_id(&self) -> Option<&NodeId> {
        self.branch().map(|b| &b.fan_out_node_id)
    }
}

/// Link from a child run back to the token that started it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub run_id: RunId,
    pub token_id: TokenId,
}

/// Category of a run failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-retryable configuration fault in the workflow definition
    Definition,
    /// Task failure that no transition handled
    Task,
    /// Child workflow failure propagated to the parent
    SubRun,
    /// Storage, dispatch or internal fault
    Infrastructure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Indexed summary of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub workflow_def_id: WorkflowDefId,
    pub version: u32,
    pub status: RunStatus,
    pub parent: Option<ParentLink>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<RunFailure>,
}
