// Core engine of the Weft workflow coordinator

pub mod error;
pub mod events;
pub mod expr;
pub mod storage;
pub mod types;
pub mod workflow;

pub use error::{EngineError, EngineResult};
pub use types::*;
