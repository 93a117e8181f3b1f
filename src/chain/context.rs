use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::chain::model::{
    ChainDefinition, ChainId, ChainMetrics, ChainOutcome, ChainStatus, ChainView, Priority,
};
use crate::chain::task::{ChainTask, RecoveryStrategy};
use crate::core::errors::{ChainError, Result};
use crate::retry::RetryPolicy;

/// Active chains keyed by id, plus a revision counter bumped on every
/// mutation. All context mutations go through the per-entry lock.
pub struct ActiveSet {
    pub(crate) chains: DashMap<ChainId, ChainExecutionContext>,
    revision: AtomicU64,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
            revision: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn views(&self) -> Vec<ChainView> {
        let mut views: Vec<ChainView> = self.chains.iter().map(|entry| entry.view()).collect();
        views.sort_by(|a, b| a.chain_id.cmp(&b.chain_id));
        views
    }
}

impl Default for ActiveSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable state of a registered chain while it is active
pub struct ChainExecutionContext {
    pub chain_id: ChainId,
    pub name: String,
    pub description: String,
    pub task_id: Option<String>,
    pub status: ChainStatus,
    pub priority: Priority,
    pub dependencies: Vec<ChainId>,
    pub max_retries: u32,
    pub progress_percentage: u8,
    pub current_step: Option<String>,
    pub metrics: ChainMetrics,

    // Runtime-only state
    /// Bumped for every submitted attempt; completions of older attempts are stale
    pub(crate) epoch: u64,
    pub(crate) first_started_at: Option<Instant>,
    pub(crate) attempt_started_at: Option<Instant>,
    /// A worker is currently running the task for `epoch`
    pub(crate) executing: bool,
    pub(crate) retry: RetryPolicy,
    pub(crate) recovery: Option<Arc<dyn RecoveryStrategy>>,
    pub(crate) task: Option<Arc<dyn ChainTask>>,
    pub(crate) retry_timer: Option<AbortHandle>,
    outcome_tx: watch::Sender<Option<ChainOutcome>>,
}

impl ChainExecutionContext {
    pub fn new(
        chain_id: ChainId,
        definition: ChainDefinition,
        max_retries: u32,
        retry: RetryPolicy,
    ) -> Self {
        let (outcome_tx, _) = watch::channel(None);
        Self {
            chain_id,
            name: definition.name,
            description: definition.description,
            task_id: definition.task_id,
            status: ChainStatus::Pending,
            priority: definition.priority,
            dependencies: definition.dependencies,
            max_retries,
            progress_percentage: 0,
            current_step: None,
            metrics: ChainMetrics::default(),
            epoch: 0,
            first_started_at: None,
            attempt_started_at: None,
            executing: false,
            retry,
            recovery: definition.recovery,
            task: None,
            retry_timer: None,
            outcome_tx,
        }
    }

    /// Rebuild a context from a persisted view
    pub fn restored(view: ChainView, status: ChainStatus, retry: RetryPolicy) -> Self {
        let (outcome_tx, _) = watch::channel(None);
        Self {
            chain_id: view.chain_id,
            name: view.name,
            description: String::new(),
            task_id: view.task_id,
            status,
            priority: view.priority,
            dependencies: view.dependencies,
            max_retries: view.max_retries,
            progress_percentage: view.progress.min(100),
            current_step: view.current_step,
            metrics: ChainMetrics {
                retry_count: view.metrics.retry_count.min(view.max_retries),
                ..view.metrics
            },
            epoch: 0,
            first_started_at: None,
            attempt_started_at: None,
            executing: false,
            retry,
            recovery: None,
            task: None,
            retry_timer: None,
            outcome_tx,
        }
    }

    pub fn view(&self) -> ChainView {
        ChainView {
            chain_id: self.chain_id.clone(),
            name: self.name.clone(),
            task_id: self.task_id.clone(),
            status: self.status,
            priority: self.priority,
            dependencies: self.dependencies.clone(),
            progress: self.progress_percentage,
            current_step: self.current_step.clone(),
            max_retries: self.max_retries,
            metrics: self.metrics.clone(),
        }
    }

    pub fn handle(&self) -> ChainHandle {
        ChainHandle {
            chain_id: self.chain_id.clone(),
            rx: self.outcome_tx.subscribe(),
        }
    }

    /// Prepare a new attempt: RUNNING, fresh epoch, progress reset. The
    /// attempt clock starts when a worker picks the attempt up.
    pub(crate) fn begin_attempt(&mut self) -> u64 {
        self.status = ChainStatus::Running;
        self.epoch += 1;
        self.progress_percentage = 0;
        self.attempt_started_at = None;
        self.executing = false;
        self.epoch
    }

    pub(crate) fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn publish_outcome(&self, outcome: ChainOutcome) {
        self.outcome_tx.send_replace(Some(outcome));
    }
}

/// Resolves once the chain reaches a terminal state
#[derive(Debug, Clone)]
pub struct ChainHandle {
    chain_id: ChainId,
    rx: watch::Receiver<Option<ChainOutcome>>,
}

impl ChainHandle {
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Outcome if the chain has already finished
    pub fn try_outcome(&self) -> Option<ChainOutcome> {
        self.rx.borrow().clone()
    }

    /// Wait for the terminal outcome
    pub async fn wait(mut self) -> Result<ChainOutcome> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return Ok(outcome);
            }
            if self.rx.changed().await.is_err() {
                let last = self.rx.borrow().clone();
                return last.ok_or(ChainError::ChannelClosed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn context(name: &str) -> ChainExecutionContext {
        ChainExecutionContext::new(
            name.to_string(),
            ChainDefinition::new(name).depends_on("upstream"),
            3,
            RetryPolicy::default(),
        )
    }

    #[test]
    fn test_new_context_is_pending() {
        let ctx = context("c1");
        let view = ctx.view();
        assert_eq!(view.status, ChainStatus::Pending);
        assert_eq!(view.progress, 0);
        assert_eq!(view.dependencies, vec!["upstream".to_string()]);
        assert_eq!(view.max_retries, 3);
        assert_eq!(view.metrics.retry_count, 0);
    }

    #[tokio::test]
    async fn test_begin_attempt_bumps_epoch() {
        let mut ctx = context("c1");
        ctx.progress_percentage = 40;
        let first = ctx.begin_attempt();
        let second = ctx.begin_attempt();
        assert_eq!(second, first + 1);
        assert_eq!(ctx.status, ChainStatus::Running);
        assert_eq!(ctx.progress_percentage, 0);
        // Queued attempts do not run the timeout clock
        assert!(ctx.attempt_started_at.is_none());
    }

    #[test]
    fn test_restored_clamps_retry_count() {
        let mut view = context("c2").view();
        view.metrics.retry_count = 9;
        view.progress = 250;
        let ctx = ChainExecutionContext::restored(view, ChainStatus::Paused, RetryPolicy::default());
        assert_eq!(ctx.metrics.retry_count, 3);
        assert_eq!(ctx.progress_percentage, 100);
        assert_eq!(ctx.status, ChainStatus::Paused);
    }

    #[tokio::test]
    async fn test_handle_resolves_after_drop() {
        let ctx = context("c3");
        let handle = ctx.handle();
        assert!(handle.try_outcome().is_none());

        ctx.publish_outcome(ChainOutcome {
            chain_id: "c3".to_string(),
            status: ChainStatus::Success,
            output: None,
            error: None,
            retry_count: 0,
        });
        drop(ctx);

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_handle_closed_without_outcome() {
        let ctx = context("c4");
        let handle = ctx.handle();
        drop(ctx);
        assert!(matches!(handle.wait().await, Err(ChainError::ChannelClosed)));
    }

    #[test]
    fn test_active_set_revision() {
        let set = ActiveSet::new();
        let before = set.revision();
        set.touch();
        assert_eq!(set.revision(), before + 1);
        assert!(set.is_empty());
    }
}
