use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::chain::context::ActiveSet;
use crate::chain::model::{ChainId, ChainStatus, ChainView};
use crate::core::errors::ExecutionError;

/// The work a chain performs. The engine treats it as opaque.
#[async_trait]
pub trait ChainTask: Send + Sync + 'static {
    /// Run one attempt. `progress` may be used to report progress back
    /// into the chain's context before completing.
    async fn run(&self, progress: ChainProgress) -> Result<Value, ExecutionError>;
}

#[async_trait]
impl<F, Fut> ChainTask for F
where
    F: Fn(ChainProgress) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
{
    async fn run(&self, progress: ChainProgress) -> Result<Value, ExecutionError> {
        (self)(progress).await
    }
}

/// Handle given to a running attempt for progress reporting
#[derive(Clone)]
pub struct ChainProgress {
    active: Arc<ActiveSet>,
    chain_id: ChainId,
    epoch: u64,
}

impl ChainProgress {
    pub(crate) fn new(active: Arc<ActiveSet>, chain_id: ChainId, epoch: u64) -> Self {
        Self {
            active,
            chain_id,
            epoch,
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Record progress (clamped to 100). Lower values than the current
    /// progress are ignored. Returns false once the attempt is stale.
    pub fn set_progress(&self, percentage: u8) -> bool {
        self.update(|ctx| {
            let percentage = percentage.min(100);
            if percentage > ctx.progress_percentage {
                ctx.progress_percentage = percentage;
            }
        })
    }

    pub fn set_step(&self, step: impl Into<String>) -> bool {
        let step = step.into();
        self.update(|ctx| ctx.current_step = Some(step))
    }

    /// Convenience for reporting both at once
    pub fn report(&self, percentage: u8, step: impl Into<String>) -> bool {
        self.set_step(step) && self.set_progress(percentage)
    }

    fn update(&self, apply: impl FnOnce(&mut crate::chain::context::ChainExecutionContext)) -> bool {
        let applied = match self.active.chains.get_mut(&self.chain_id) {
            Some(mut ctx)
                if ctx.epoch == self.epoch
                    && matches!(ctx.status, ChainStatus::Running | ChainStatus::Paused) =>
            {
                apply(&mut *ctx);
                true
            }
            _ => false,
        };
        if applied {
            self.active.touch();
        }
        applied
    }
}

/// Decision returned by a recovery strategy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Let the retry policy schedule another attempt if retries remain
    Retry,
    /// Fail the chain now
    GiveUp,
}

/// Per-chain failure handling supplied at registration time
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Called after every retryable failure, before the retry decision
    async fn on_failure(&self, _chain: &ChainView, _error: &ExecutionError) -> RecoveryDecision {
        RecoveryDecision::Retry
    }

    /// Called once when the chain reaches FAILED
    async fn on_exhausted(&self, _chain: &ChainView) {}
}

/// Strategy that never retries
pub struct FailFast;

#[async_trait]
impl RecoveryStrategy for FailFast {
    async fn on_failure(&self, _chain: &ChainView, _error: &ExecutionError) -> RecoveryDecision {
        RecoveryDecision::GiveUp
    }
}
