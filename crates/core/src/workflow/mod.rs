pub mod context;
pub mod coordinator;
pub mod decision;
pub mod dispatcher;
pub mod fan;
pub mod graph;
pub mod machine;
pub mod router;
pub mod task_executor;
pub mod token;

pub use context::{BranchRegion, ContextSnapshot, RunContext};
pub use coordinator::Coordinator;
pub use decision::{BranchSeed, Decision};
pub use dispatcher::{Resolution, TaskDispatcher};
pub use fan::{merge_outputs, FanGroup, FanSynchronizer};
pub use graph::{CompiledNode, CompiledTransition, GraphIndex};
pub use machine::{EngineConfig, Inbound, Outbound, RunMachine, RunSnapshot};
pub use router::Router;
pub use task_executor::{
    PolicyExecutor, ResolvedAction, SubRunOutcome, SubRunRequest, TaskExecutor, TaskOutcome,
    TaskRequest, TaskStatus,
};
pub use token::TokenTable;
