//! chainwatch: orchestration and monitoring engine for workflow chains.
//!
//! Chains are registered with dependencies, a priority and a retry policy,
//! dispatched onto a bounded worker pool, retried with backoff, swept for
//! timeouts by a background monitor and persisted for crash recovery.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod chain;     // Chain model, tasks and lifecycle events
pub mod monitor;   // Timeout sweep and snapshot persistence
pub mod recovery;  // Restore from snapshot after restart
pub mod retry;     // Backoff strategies and retry timers
pub mod scheduler; // Registration, dispatch and the worker pool
pub mod stats;
pub mod storage;
pub mod system;
pub mod telemetry;

// Re-exports for convenience
pub use chain::{
    ChainDefinition, ChainEvent, ChainHandle, ChainId, ChainMetrics, ChainOutcome, ChainProgress,
    ChainStatus, ChainTask, ChainView, FailFast, Priority, RecoveryDecision, RecoveryStrategy,
};
pub use core::config::{EngineConfig, EngineConfigBuilder};
pub use core::errors::{ChainError, ExecutionError, Result};
pub use monitor::{ExecutionMonitor, TickReport};
pub use recovery::{DurabilityMode, Recovery, RecoveryConfig, RecoveryStats};
pub use retry::{BackoffStrategy, ExponentialBackoff, FixedBackoff, Jittered, LinearBackoff, RetryPolicy};
pub use scheduler::{ChainScheduler, Dispatch, PoolStats};
pub use stats::{ChainPerformance, StatsSnapshot};
pub use storage::{ActiveSnapshot, HistoryRecord, MemoryStateStore, SledStateStore, StateStore};
pub use system::{ChainSystem, ChainSystemBuilder, SystemStatus};
