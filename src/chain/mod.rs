//! Chain model: definitions, execution contexts, tasks and lifecycle events.

pub mod context;
pub mod events;
pub mod model;
pub mod task;

pub use context::{ChainExecutionContext, ChainHandle};
pub use events::{ChainEvent, EventBus};
pub use model::{
    ChainDefinition, ChainId, ChainMetrics, ChainOutcome, ChainStatus, ChainView, Priority,
};
pub use task::{ChainProgress, ChainTask, FailFast, RecoveryDecision, RecoveryStrategy};
