pub mod definitions;
pub mod event_log;
pub mod index;
pub mod memory;

pub use definitions::{DefinitionBundle, DefinitionStore, InMemoryDefinitionStore};
pub use event_log::JsonlEventLog;
pub use index::{IndexStore, RedbIndexStore};
pub use memory::InMemoryEventLog;
