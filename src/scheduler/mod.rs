//! Chain scheduler: registration, dependency checks, dispatch and the
//! execution wrapper that drives the chain state machine.
//!
//! Every transition of a chain happens while holding its entry in the
//! active map. Terminal transitions remove the entry, so exactly one caller
//! wins and runs [`ChainScheduler::finalize`].

pub mod graph;
pub mod worker_pool;

pub use graph::DependencyGraph;
pub use worker_pool::{PoolStats, WorkerPool};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::chain::context::{ActiveSet, ChainExecutionContext, ChainHandle};
use crate::chain::events::{ChainEvent, EventBus};
use crate::chain::model::{
    ChainDefinition, ChainId, ChainOutcome, ChainStatus, ChainView, Priority,
};
use crate::chain::task::{ChainProgress, ChainTask, RecoveryDecision};
use crate::core::config::EngineConfig;
use crate::core::errors::{ChainError, ExecutionError, Result};
use crate::retry::RetryPolicy;
use crate::stats::StatsAggregator;
use crate::storage::{ActiveSnapshot, HistoryRecord, StateStore};

/// Result of a dispatch request
#[derive(Debug)]
pub enum Dispatch {
    /// The chain is RUNNING and an attempt was handed to the worker pool
    Started(ChainHandle),
    /// Dependencies are not met; the chain is PAUSED and holds no worker
    Paused { unmet: Vec<ChainId> },
    /// The chain already has an attempt in flight
    Busy(ChainStatus),
    /// The chain already reached a terminal state
    Finished(ChainStatus),
}

impl Dispatch {
    pub fn is_started(&self) -> bool {
        matches!(self, Dispatch::Started(_))
    }

    pub fn handle(self) -> Option<ChainHandle> {
        match self {
            Dispatch::Started(handle) => Some(handle),
            _ => None,
        }
    }
}

enum ResumeStep {
    NotPaused,
    /// The attempt is still executing; only the status flips back
    Continued(String),
    /// Never dispatched, back to PENDING
    Reset(String),
    Redispatch(Arc<dyn ChainTask>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PersistState {
    InFlight,
    Done,
    Failed,
}

struct CompletedEntry {
    seq: u64,
    record: HistoryRecord,
    state: PersistState,
}

pub struct ChainScheduler {
    self_ref: Weak<ChainScheduler>,
    active: Arc<ActiveSet>,
    completed: Mutex<VecDeque<CompletedEntry>>,
    next_seq: AtomicU64,
    completed_count: AtomicU64,
    store: Arc<dyn StateStore>,
    stats: Arc<StatsAggregator>,
    pool: Arc<WorkerPool>,
    events: EventBus,
    config: EngineConfig,
}

impl ChainScheduler {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        stats: Arc<StatsAggregator>,
        pool: Arc<WorkerPool>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            active: Arc::new(ActiveSet::new()),
            completed: Mutex::new(VecDeque::new()),
            next_seq: AtomicU64::new(0),
            completed_count: AtomicU64::new(0),
            store,
            stats,
            pool,
            events: EventBus::new(config.event_capacity),
            config,
        })
    }

    /// Register a chain as PENDING. Fails if the id is already active.
    pub fn register(&self, definition: ChainDefinition) -> Result<ChainId> {
        let chain_id = definition.id.clone().unwrap_or_else(cuid2::create_id);
        let name = definition.name.clone();
        let max_retries = definition
            .max_retries
            .unwrap_or(self.config.default_max_retries);
        let retry = definition
            .retry
            .clone()
            .unwrap_or_else(|| self.default_retry());

        match self.active.chains.entry(chain_id.clone()) {
            Entry::Occupied(_) => {
                warn!(chain_id = %chain_id, "Duplicate chain registration rejected");
                return Err(ChainError::DuplicateRegistration { chain_id });
            }
            Entry::Vacant(slot) => {
                slot.insert(ChainExecutionContext::new(
                    chain_id.clone(),
                    definition,
                    max_retries,
                    retry,
                ));
            }
        }
        self.active.touch();
        self.events
            .publish(ChainEvent::new(&chain_id, &name, None, ChainStatus::Pending));

        if DependencyGraph::from_views(&self.active.views()).has_cycle() {
            warn!(chain_id = %chain_id, "Dependency cycle among active chains");
        }
        info!(chain_id = %chain_id, name = %name, max_retries, "Chain registered");
        Ok(chain_id)
    }

    /// Start an attempt if all dependencies are met, else park the chain
    /// in PAUSED. The task is stored for retries and `resume`.
    pub async fn dispatch(&self, chain_id: &str, task: Arc<dyn ChainTask>) -> Result<Dispatch> {
        let current = self
            .active
            .chains
            .get(chain_id)
            .map(|ctx| (ctx.status, ctx.executing, ctx.dependencies.clone()));
        let (status, executing, dependencies) = match current {
            Some(current) => current,
            None => {
                return match self.finished_status(chain_id).await {
                    Some(status) => Ok(Dispatch::Finished(status)),
                    None => Err(ChainError::unknown(chain_id)),
                };
            }
        };
        // A chain paused mid-attempt still owns its worker
        if status.is_in_flight() || executing {
            debug!(chain_id = %chain_id, %status, "Dispatch ignored, attempt in flight");
            return Ok(Dispatch::Busy(status));
        }

        let unmet = self.unmet_dependencies(chain_id, &dependencies).await;

        let mut ctx = match self.active.chains.get_mut(chain_id) {
            Some(ctx) => ctx,
            // Finished while dependencies were being checked
            None => {
                return match self.buffered_status(chain_id) {
                    Some(status) => Ok(Dispatch::Finished(status)),
                    None => Err(ChainError::unknown(chain_id)),
                };
            }
        };
        if ctx.status.is_in_flight() || ctx.executing {
            return Ok(Dispatch::Busy(ctx.status));
        }

        let from = ctx.status;
        ctx.task = Some(task.clone());

        if !unmet.is_empty() {
            ctx.status = ChainStatus::Paused;
            ctx.metrics.last_error = Some(format!("waiting on dependencies: {}", unmet.join(", ")));
            let name = ctx.name.clone();
            drop(ctx);

            self.active.touch();
            if from != ChainStatus::Paused {
                self.events
                    .publish(ChainEvent::new(chain_id, name, Some(from), ChainStatus::Paused));
            }
            info!(chain_id = %chain_id, unmet = ?unmet, "Dependencies unmet, chain paused");
            return Ok(Dispatch::Paused { unmet });
        }

        let epoch = ctx.begin_attempt();
        if ctx.metrics.start_time.is_none() {
            ctx.metrics.start_time = Some(Utc::now());
        }
        if ctx.first_started_at.is_none() {
            ctx.first_started_at = Some(Instant::now());
        }
        let handle = ctx.handle();
        let priority = ctx.priority;
        if let Err(e) = self.submit_attempt(chain_id, priority, epoch, task) {
            ctx.status = from;
            return Err(e);
        }
        let name = ctx.name.clone();
        drop(ctx);

        self.active.touch();
        self.events
            .publish(ChainEvent::new(chain_id, name, Some(from), ChainStatus::Running));
        info!(chain_id = %chain_id, ?priority, "Chain dispatched");
        Ok(Dispatch::Started(handle))
    }

    /// Move a PENDING, RUNNING or RETRYING chain to PAUSED. A pending retry
    /// timer is cancelled; an attempt already executing keeps running.
    pub async fn pause(&self, chain_id: &str) -> Result<bool> {
        let transition = self.with_context(chain_id, |ctx| match ctx.status {
            ChainStatus::Pending | ChainStatus::Running | ChainStatus::Retrying => {
                let from = ctx.status;
                ctx.cancel_retry_timer();
                ctx.status = ChainStatus::Paused;
                Some((from, ctx.name.clone()))
            }
            _ => None,
        });
        let (from, name) = match transition {
            Some(Some(transition)) => transition,
            Some(None) => return Ok(false),
            None => return self.inactive_result(chain_id).await,
        };

        self.active.touch();
        self.events
            .publish(ChainEvent::new(chain_id, name, Some(from), ChainStatus::Paused));
        info!(chain_id = %chain_id, from = %from, "Chain paused");
        Ok(true)
    }

    /// Resume a PAUSED chain. Dependencies are checked again using the stored
    /// task. Returns true when an attempt is running afterwards; a chain that
    /// was never dispatched goes back to PENDING and returns false.
    pub async fn resume(&self, chain_id: &str) -> Result<bool> {
        let step = self.with_context(chain_id, |ctx| {
            if ctx.status != ChainStatus::Paused {
                return ResumeStep::NotPaused;
            }
            if ctx.executing {
                ctx.status = ChainStatus::Running;
                return ResumeStep::Continued(ctx.name.clone());
            }
            match ctx.task.clone() {
                Some(task) => ResumeStep::Redispatch(task),
                None => {
                    ctx.status = ChainStatus::Pending;
                    ResumeStep::Reset(ctx.name.clone())
                }
            }
        });

        match step {
            None => self.inactive_result(chain_id).await,
            Some(ResumeStep::NotPaused) => Ok(false),
            Some(ResumeStep::Continued(name)) => {
                self.active.touch();
                self.events.publish(ChainEvent::new(
                    chain_id,
                    name,
                    Some(ChainStatus::Paused),
                    ChainStatus::Running,
                ));
                info!(chain_id = %chain_id, "Chain resumed with attempt in progress");
                Ok(true)
            }
            Some(ResumeStep::Reset(name)) => {
                self.active.touch();
                self.events.publish(ChainEvent::new(
                    chain_id,
                    name,
                    Some(ChainStatus::Paused),
                    ChainStatus::Pending,
                ));
                info!(chain_id = %chain_id, "Chain resumed to pending, awaiting dispatch");
                Ok(false)
            }
            Some(ResumeStep::Redispatch(task)) => {
                Ok(self.dispatch(chain_id, task).await?.is_started())
            }
        }
    }

    /// Cancel a non-terminal chain. Returns false when it already finished.
    pub async fn cancel(&self, chain_id: &str) -> Result<bool> {
        match self.active.chains.remove(chain_id) {
            Some((_, ctx)) => {
                self.finish_cancelled(ctx, None).await;
                Ok(true)
            }
            None => self.inactive_result(chain_id).await,
        }
    }

    /// Cancel every RUNNING or RETRYING chain whose current attempt started
    /// more than `limit` ago. Returns the number cancelled.
    pub async fn expire_overdue(&self, limit: Duration) -> usize {
        let now = Instant::now();
        let is_overdue = |ctx: &ChainExecutionContext| {
            ctx.status.is_in_flight()
                && ctx
                    .attempt_started_at
                    .map(|started| now.saturating_duration_since(started) > limit)
                    .unwrap_or(false)
        };

        let overdue: Vec<ChainId> = self
            .active
            .chains
            .iter()
            .filter(|entry| is_overdue(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut expired = 0;
        for chain_id in overdue {
            if let Some((_, ctx)) = self.active.chains.remove_if(&chain_id, |_, ctx| is_overdue(ctx)) {
                warn!(chain_id = %chain_id, limit_secs = limit.as_secs(), "Chain exceeded execution timeout");
                let reason = ExecutionError::Timeout(limit).to_string();
                self.finish_cancelled(ctx, Some(reason)).await;
                expired += 1;
            }
        }
        expired
    }

    /// Re-create a context from a snapshot entry. False if the id is active.
    pub fn restore(&self, view: ChainView, status: ChainStatus) -> bool {
        let chain_id = view.chain_id.clone();
        let name = view.name.clone();
        let retry = self.default_retry();
        match self.active.chains.entry(chain_id.clone()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(ChainExecutionContext::restored(view, status, retry));
            }
        }
        self.active.touch();
        self.events
            .publish(ChainEvent::new(&chain_id, name, None, status));
        true
    }

    // Queries

    pub fn status(&self, chain_id: &str) -> Option<ChainStatus> {
        if let Some(ctx) = self.active.chains.get(chain_id) {
            return Some(ctx.status);
        }
        self.buffered_status(chain_id)
    }

    pub fn context(&self, chain_id: &str) -> Option<ChainView> {
        self.active.chains.get(chain_id).map(|ctx| ctx.view())
    }

    /// Views of all active chains, sorted by id
    pub fn active(&self) -> Vec<ChainView> {
        self.active.views()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Outcome handle of an active chain
    pub fn watch(&self, chain_id: &str) -> Option<ChainHandle> {
        self.active.chains.get(chain_id).map(|ctx| ctx.handle())
    }

    pub fn snapshot(&self) -> ActiveSnapshot {
        ActiveSnapshot::new(self.active.views())
    }

    /// Changes on every mutation of the active set or the history buffer
    pub fn revision(&self) -> u64 {
        self.active.revision()
    }

    pub fn completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Most recent records from the in-memory buffer, newest first
    pub fn recent_completed(&self, limit: usize) -> Vec<HistoryRecord> {
        self.completed_buffer()
            .iter()
            .rev()
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect()
    }

    pub fn buffered_len(&self) -> usize {
        self.completed_buffer().len()
    }

    /// Durable history for a chain plus buffered records not yet persisted
    pub async fn history(&self, chain_id: &str) -> Result<Vec<HistoryRecord>> {
        let mut records = self.store.get_history(chain_id).await?;
        records.extend(
            self.completed_buffer()
                .iter()
                .filter(|entry| entry.record.chain_id == chain_id && entry.state != PersistState::Done)
                .map(|entry| entry.record.clone()),
        );
        Ok(records)
    }

    pub fn dependency_dot(&self) -> String {
        DependencyGraph::from_views(&self.active.views()).to_dot()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    // History maintenance, driven by the monitor

    /// Re-append records whose durable write failed. Returns how many
    /// were written.
    pub async fn flush_pending_history(&self) -> usize {
        let pending: Vec<(u64, HistoryRecord)> = {
            let mut buffer = self.completed_buffer();
            buffer
                .iter_mut()
                .filter(|entry| entry.state == PersistState::Failed)
                .map(|entry| {
                    entry.state = PersistState::InFlight;
                    (entry.seq, entry.record.clone())
                })
                .collect()
        };

        let mut flushed = 0;
        for (seq, record) in pending {
            match self.store.append_history(&record).await {
                Ok(()) => {
                    self.mark_persisted(seq, PersistState::Done);
                    flushed += 1;
                }
                Err(e) => {
                    self.mark_persisted(seq, PersistState::Failed);
                    warn!(chain_id = %record.chain_id, error = %e, "History write retry failed");
                }
            }
        }
        if flushed > 0 {
            info!(flushed, "Flushed pending history records");
        }
        flushed
    }

    /// Evict oldest buffered records beyond `capacity`, stopping at the first
    /// record the durable store does not hold yet
    pub fn prune_history(&self, capacity: usize) -> usize {
        let mut buffer = self.completed_buffer();
        let mut pruned = 0;
        while buffer.len() > capacity {
            match buffer.front() {
                Some(entry) if entry.state == PersistState::Done => {
                    buffer.pop_front();
                    pruned += 1;
                }
                _ => break,
            }
        }
        if pruned > 0 {
            debug!(pruned, remaining = buffer.len(), "Pruned completed chain buffer");
        }
        pruned
    }

    // Execution

    fn submit_attempt(
        &self,
        chain_id: &str,
        priority: Priority,
        epoch: u64,
        task: Arc<dyn ChainTask>,
    ) -> Result<()> {
        let scheduler = self.self_ref.upgrade().ok_or(ChainError::SystemShutdown)?;
        let id = chain_id.to_string();
        let job = async move { scheduler.run_attempt(id, epoch, task).await }.boxed();
        self.pool.submit(chain_id, priority, job)
    }

    async fn run_attempt(self: Arc<Self>, chain_id: ChainId, epoch: u64, task: Arc<dyn ChainTask>) {
        match self.active.chains.get_mut(&chain_id) {
            Some(mut ctx) if ctx.epoch == epoch && ctx.status == ChainStatus::Running => {
                ctx.attempt_started_at = Some(Instant::now());
                ctx.executing = true;
            }
            _ => {
                debug!(chain_id = %chain_id, epoch, "Skipping stale attempt");
                return;
            }
        }

        let progress = ChainProgress::new(self.active.clone(), chain_id.clone(), epoch);
        let result = match AssertUnwindSafe(task.run(progress)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(chain_id = %chain_id, panic = %message, "Chain task panicked");
                Err(ExecutionError::Panicked(message))
            }
        };

        match result {
            Ok(output) => self.on_success(&chain_id, epoch, output).await,
            Err(e) => self.on_failure(&chain_id, epoch, e).await,
        }
    }

    async fn on_success(&self, chain_id: &str, epoch: u64, output: Value) {
        let removed = self.active.chains.remove_if(chain_id, |_, ctx| {
            ctx.epoch == epoch && matches!(ctx.status, ChainStatus::Running | ChainStatus::Paused)
        });
        match removed {
            Some((_, mut ctx)) => {
                let from = ctx.status;
                ctx.status = ChainStatus::Success;
                ctx.progress_percentage = 100;
                ctx.executing = false;
                self.finalize(ctx, from, Some(output)).await;
            }
            None => debug!(chain_id = %chain_id, epoch, "Ignoring stale completion"),
        }
    }

    async fn on_failure(&self, chain_id: &str, epoch: u64, error: ExecutionError) {
        let current = |ctx: &ChainExecutionContext| {
            ctx.epoch == epoch && matches!(ctx.status, ChainStatus::Running | ChainStatus::Paused)
        };

        let (view, recovery) = match self.active.chains.get(chain_id) {
            Some(ctx) if current(&ctx) => (ctx.view(), ctx.recovery.clone()),
            _ => {
                debug!(chain_id = %chain_id, epoch, "Ignoring stale failure");
                return;
            }
        };

        let decision = if !error.is_retryable() {
            RecoveryDecision::GiveUp
        } else if let Some(strategy) = &recovery {
            strategy.on_failure(&view, &error).await
        } else {
            RecoveryDecision::Retry
        };
        let message = error.to_string();

        {
            let mut ctx = match self.active.chains.get_mut(chain_id) {
                Some(ctx) if current(&ctx) => ctx,
                _ => return,
            };
            ctx.executing = false;
            ctx.metrics.error_count += 1;
            ctx.metrics.last_error = Some(message.clone());

            if ctx.status == ChainStatus::Paused {
                drop(ctx);
                self.active.touch();
                warn!(chain_id = %chain_id, error = %message, "Attempt failed while paused");
                return;
            }

            if decision == RecoveryDecision::Retry && ctx.metrics.retry_count < ctx.max_retries {
                let retry_count = ctx.metrics.retry_count;
                ctx.status = ChainStatus::Retrying;
                ctx.attempt_started_at = None;
                let scheduler = self.self_ref.clone();
                let id = chain_id.to_string();
                let timer = ctx.retry.schedule(chain_id, retry_count, move || async move {
                    if let Some(scheduler) = scheduler.upgrade() {
                        scheduler.fire_retry(&id, epoch).await;
                    }
                });
                ctx.retry_timer = Some(timer);
                let name = ctx.name.clone();
                drop(ctx);

                self.active.touch();
                self.events.publish(ChainEvent::new(
                    chain_id,
                    name,
                    Some(ChainStatus::Running),
                    ChainStatus::Retrying,
                ));
                warn!(chain_id = %chain_id, retry_count, error = %message, "Chain attempt failed, retry scheduled");
                return;
            }
        }

        let removed = self
            .active
            .chains
            .remove_if(chain_id, |_, ctx| ctx.epoch == epoch && ctx.status == ChainStatus::Running);
        if let Some((_, mut ctx)) = removed {
            ctx.status = ChainStatus::Failed;
            if let Some(strategy) = &ctx.recovery {
                strategy.on_exhausted(&ctx.view()).await;
            }
            self.finalize(ctx, ChainStatus::Running, None).await;
        }
    }

    /// Timer callback: next attempt for a RETRYING chain. A chain whose
    /// retry cannot be submitted is finalized as FAILED.
    async fn fire_retry(&self, chain_id: &str, epoch: u64) {
        let rejected = match self.submit_retry(chain_id, epoch) {
            Ok(()) => return,
            Err(e) => e,
        };
        let removed = self
            .active
            .chains
            .remove_if(chain_id, |_, ctx| ctx.epoch == epoch && ctx.status == ChainStatus::Retrying);
        if let Some((_, mut ctx)) = removed {
            warn!(chain_id = %chain_id, error = %rejected, "Retry could not be submitted, chain failed");
            // Runs on the timer's own task, which must not abort itself
            ctx.retry_timer = None;
            ctx.status = ChainStatus::Failed;
            ctx.metrics.error_count += 1;
            ctx.metrics.last_error = Some(format!("retry not submitted: {}", rejected));
            self.finalize(ctx, ChainStatus::Retrying, None).await;
        }
    }

    /// Start the next attempt. Errors leave the context untouched.
    fn submit_retry(&self, chain_id: &str, epoch: u64) -> Result<()> {
        let mut ctx = match self.active.chains.get_mut(chain_id) {
            Some(ctx) if ctx.epoch == epoch && ctx.status == ChainStatus::Retrying => ctx,
            _ => {
                debug!(chain_id = %chain_id, epoch, "Retry timer fired for stale attempt");
                return Ok(());
            }
        };
        let task = match ctx.task.clone() {
            Some(task) => task,
            None => {
                error!(chain_id = %chain_id, "Retry fired without a stored task");
                return Err(ChainError::configuration("no task stored for retry"));
            }
        };

        // The worker cannot observe the new epoch until this guard drops
        self.submit_attempt(chain_id, ctx.priority, ctx.epoch + 1, task)?;
        ctx.retry_timer = None;
        ctx.metrics.retry_count += 1;
        let retry_count = ctx.metrics.retry_count;
        ctx.begin_attempt();
        let name = ctx.name.clone();
        drop(ctx);

        self.active.touch();
        self.events.publish(ChainEvent::new(
            chain_id,
            name,
            Some(ChainStatus::Retrying),
            ChainStatus::Running,
        ));
        info!(chain_id = %chain_id, retry_count, "Retrying chain");
        Ok(())
    }

    async fn finish_cancelled(&self, mut ctx: ChainExecutionContext, reason: Option<String>) {
        let from = ctx.status;
        ctx.status = ChainStatus::Cancelled;
        if let Some(reason) = reason {
            ctx.metrics.error_count += 1;
            ctx.metrics.last_error = Some(reason);
        }
        self.finalize(ctx, from, None).await;
    }

    /// Terminal path shared by success, failure and cancellation
    async fn finalize(&self, mut ctx: ChainExecutionContext, from: ChainStatus, output: Option<Value>) {
        ctx.cancel_retry_timer();
        ctx.metrics.end_time = Some(Utc::now());
        ctx.metrics.duration = ctx.first_started_at.map(|started| started.elapsed());

        let status = ctx.status;
        let error = match status {
            ChainStatus::Success => None,
            _ => ctx.metrics.last_error.clone(),
        };
        let record = HistoryRecord {
            chain_id: ctx.chain_id.clone(),
            name: ctx.name.clone(),
            task_id: ctx.task_id.clone(),
            status,
            priority: ctx.priority,
            start_time: ctx.metrics.start_time,
            end_time: ctx.metrics.end_time,
            duration: ctx.metrics.duration,
            retry_count: ctx.metrics.retry_count,
            error: error.clone(),
            metrics: json!({
                "metrics": ctx.metrics,
                "progress": ctx.progress_percentage,
                "current_step": ctx.current_step,
                "max_retries": ctx.max_retries,
            }),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);
        self.completed_buffer().push_back(CompletedEntry {
            seq,
            record: record.clone(),
            state: PersistState::InFlight,
        });
        self.stats
            .record(&ctx.name, status, ctx.metrics.duration.unwrap_or_default());
        self.completed_count.fetch_add(1, Ordering::AcqRel);
        self.active.touch();
        self.events
            .publish(ChainEvent::new(&ctx.chain_id, &ctx.name, Some(from), status));

        match status {
            ChainStatus::Success => info!(
                chain_id = %ctx.chain_id,
                retry_count = ctx.metrics.retry_count,
                duration_ms = ctx.metrics.duration.map(|d| d.as_millis() as u64).unwrap_or(0),
                "Chain succeeded"
            ),
            _ => warn!(
                chain_id = %ctx.chain_id,
                %status,
                retry_count = ctx.metrics.retry_count,
                error = ?error,
                "Chain finished without success"
            ),
        }

        match self.store.append_history(&record).await {
            Ok(()) => self.mark_persisted(seq, PersistState::Done),
            Err(e) => {
                self.mark_persisted(seq, PersistState::Failed);
                warn!(chain_id = %ctx.chain_id, error = %e, "History write failed, will retry");
            }
        }

        ctx.publish_outcome(ChainOutcome {
            chain_id: ctx.chain_id.clone(),
            status,
            output,
            error,
            retry_count: ctx.metrics.retry_count,
        });
    }

    // Helpers

    /// Run `f` under the chain's entry lock
    fn with_context<R>(
        &self,
        chain_id: &str,
        f: impl FnOnce(&mut ChainExecutionContext) -> R,
    ) -> Option<R> {
        self.active.chains.get_mut(chain_id).map(|mut ctx| f(&mut *ctx))
    }

    fn default_retry(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.config.default_backoff.clone())
    }

    fn completed_buffer(&self) -> MutexGuard<'_, VecDeque<CompletedEntry>> {
        match self.completed.lock() {
            Ok(buffer) => buffer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_persisted(&self, seq: u64, state: PersistState) {
        if let Some(entry) = self
            .completed_buffer()
            .iter_mut()
            .rev()
            .find(|entry| entry.seq == seq)
        {
            entry.state = state;
        }
    }

    fn buffered_status(&self, chain_id: &str) -> Option<ChainStatus> {
        self.completed_buffer()
            .iter()
            .rev()
            .find(|entry| entry.record.chain_id == chain_id)
            .map(|entry| entry.record.status)
    }

    /// Terminal status from the buffer, then the durable store
    async fn finished_status(&self, chain_id: &str) -> Option<ChainStatus> {
        if let Some(status) = self.buffered_status(chain_id) {
            return Some(status);
        }
        match self.store.get_history(chain_id).await {
            Ok(records) => records.last().map(|record| record.status),
            Err(e) => {
                warn!(chain_id = %chain_id, error = %e, "History lookup failed");
                None
            }
        }
    }

    /// Ok(false) for a chain that already finished, UnknownChain otherwise
    async fn inactive_result(&self, chain_id: &str) -> Result<bool> {
        match self.finished_status(chain_id).await {
            Some(_) => Ok(false),
            None => Err(ChainError::unknown(chain_id)),
        }
    }

    /// A dependency is met only when its latest execution is SUCCESS
    async fn unmet_dependencies(&self, chain_id: &str, dependencies: &[ChainId]) -> Vec<ChainId> {
        let mut unmet = Vec::new();
        for dep in dependencies {
            if self.active.chains.contains_key(dep) {
                unmet.push(dep.clone());
                continue;
            }
            match self.finished_status(dep).await {
                Some(ChainStatus::Success) => {}
                Some(_) => unmet.push(dep.clone()),
                None => {
                    warn!(chain_id = %chain_id, dependency = %dep, "Dependency was never created");
                    unmet.push(dep.clone());
                }
            }
        }
        unmet
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStateStore;
    use pretty_assertions::assert_eq;

    fn scheduler_with(store: Arc<MemoryStateStore>) -> Arc<ChainScheduler> {
        let config = EngineConfig::development();
        let pool = Arc::new(WorkerPool::new(config.max_concurrency));
        ChainScheduler::new(config, store, Arc::new(StatsAggregator::new()), pool)
    }

    fn scheduler() -> Arc<ChainScheduler> {
        scheduler_with(Arc::new(MemoryStateStore::new()))
    }

    fn ok_task() -> Arc<dyn ChainTask> {
        Arc::new(|_progress: ChainProgress| async { Ok::<_, ExecutionError>(json!({"ok": true})) })
    }

    #[tokio::test]
    async fn test_register_generates_id_and_rejects_duplicates() {
        let scheduler = scheduler();
        let generated = scheduler.register(ChainDefinition::new("load")).unwrap();
        assert!(!generated.is_empty());
        assert_eq!(scheduler.status(&generated), Some(ChainStatus::Pending));

        scheduler
            .register(ChainDefinition::new("load").with_id("fixed"))
            .unwrap();
        let err = scheduler
            .register(ChainDefinition::new("other").with_id("fixed"))
            .unwrap_err();
        assert!(matches!(err, ChainError::DuplicateRegistration { .. }));
        assert_eq!(scheduler.active_count(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_chain() {
        let scheduler = scheduler();
        let err = scheduler.dispatch("nope", ok_task()).await.unwrap_err();
        assert!(matches!(err, ChainError::UnknownChain { .. }));
        assert!(matches!(
            scheduler.cancel("nope").await,
            Err(ChainError::UnknownChain { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_is_recorded_once() {
        let store = Arc::new(MemoryStateStore::new());
        let scheduler = scheduler_with(store.clone());
        let id = scheduler
            .register(ChainDefinition::new("load").with_id("c1"))
            .unwrap();

        let handle = scheduler.dispatch(&id, ok_task()).await.unwrap().handle().unwrap();
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.status, ChainStatus::Success);
        assert_eq!(outcome.output, Some(json!({"ok": true})));
        assert_eq!(scheduler.status("c1"), Some(ChainStatus::Success));
        assert!(scheduler.context("c1").is_none());
        assert_eq!(store.get_history("c1").await.unwrap().len(), 1);
        assert_eq!(scheduler.completed_count(), 1);

        // Dispatching a finished chain is reported, not rerun
        let again = scheduler.dispatch("c1", ok_task()).await.unwrap();
        assert!(matches!(again, Dispatch::Finished(ChainStatus::Success)));
        assert!(!scheduler.cancel("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_dependency_pauses_and_records_error() {
        let scheduler = scheduler();
        let id = scheduler
            .register(ChainDefinition::new("child").depends_on("ghost"))
            .unwrap();
        match scheduler.dispatch(&id, ok_task()).await.unwrap() {
            Dispatch::Paused { unmet } => assert_eq!(unmet, vec!["ghost".to_string()]),
            other => panic!("unexpected dispatch result: {:?}", other),
        }
        let view = scheduler.context(&id).unwrap();
        assert_eq!(view.status, ChainStatus::Paused);
        assert!(view.metrics.last_error.unwrap().contains("ghost"));
        assert_eq!(scheduler.pool_stats().queued, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_skips_retries() {
        let scheduler = scheduler();
        let id = scheduler
            .register(ChainDefinition::new("strict").max_retries(5))
            .unwrap();
        let task: Arc<dyn ChainTask> = Arc::new(|_p: ChainProgress| async {
            Err::<Value, _>(ExecutionError::fatal("bad input"))
        });
        let outcome = scheduler
            .dispatch(&id, task)
            .await
            .unwrap()
            .handle()
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.status, ChainStatus::Failed);
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(outcome.error.as_deref(), Some("fatal: bad input"));
    }

    #[tokio::test]
    async fn test_panic_is_absorbed() {
        let scheduler = scheduler();
        let id = scheduler
            .register(ChainDefinition::new("panicky").max_retries(0))
            .unwrap();
        let task: Arc<dyn ChainTask> = Arc::new(|_p: ChainProgress| async {
            if true {
                panic!("kaboom");
            }
            Ok::<Value, ExecutionError>(Value::Null)
        });
        let outcome = scheduler
            .dispatch(&id, task)
            .await
            .unwrap()
            .handle()
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.status, ChainStatus::Failed);
        assert!(outcome.error.unwrap().contains("kaboom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retries() {
        let scheduler = scheduler();
        let id = scheduler
            .register(ChainDefinition::new("flaky").backoff_table(vec![Duration::from_secs(10)]))
            .unwrap();
        let task: Arc<dyn ChainTask> =
            Arc::new(|_p: ChainProgress| async { Err::<Value, _>(ExecutionError::failed("nope")) });
        let handle = scheduler.dispatch(&id, task).await.unwrap().handle().unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.status(&id), Some(ChainStatus::Retrying));

        assert!(scheduler.cancel(&id).await.unwrap());
        tokio::time::sleep(Duration::from_secs(30)).await;

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, ChainStatus::Cancelled);
        assert_eq!(outcome.retry_count, 0);
        assert_eq!(scheduler.recent_completed(10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_paused_finalizes() {
        let scheduler = scheduler();
        let id = scheduler.register(ChainDefinition::new("slow")).unwrap();
        let task: Arc<dyn ChainTask> = Arc::new(|_p: ChainProgress| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, ExecutionError>(Value::Null)
        });
        let handle = scheduler.dispatch(&id, task).await.unwrap().handle().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(scheduler.pause(&id).await.unwrap());
        assert_eq!(scheduler.status(&id), Some(ChainStatus::Paused));

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, ChainStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_while_paused_attempt_runs_is_busy() {
        let scheduler = scheduler();
        let id = scheduler.register(ChainDefinition::new("slow")).unwrap();
        let running = Arc::new(AtomicU64::new(0));
        let peak = Arc::new(AtomicU64::new(0));
        let task: Arc<dyn ChainTask> = {
            let (running, peak) = (running.clone(), peak.clone());
            Arc::new(move |_p: ChainProgress| {
                let (running, peak) = (running.clone(), peak.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ExecutionError>(Value::Null)
                }
            })
        };
        let handle = scheduler.dispatch(&id, task.clone()).await.unwrap().handle().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(scheduler.pause(&id).await.unwrap());

        let again = scheduler.dispatch(&id, task).await.unwrap();
        assert!(matches!(again, Dispatch::Busy(ChainStatus::Paused)));

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, ChainStatus::Success);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_pool_shutdown_fails_chain() {
        let config = EngineConfig::development();
        let pool = Arc::new(WorkerPool::new(1));
        let scheduler = ChainScheduler::new(
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(StatsAggregator::new()),
            pool.clone(),
        );
        let id = scheduler
            .register(ChainDefinition::new("flaky").backoff_table(vec![Duration::from_secs(10)]))
            .unwrap();
        let task: Arc<dyn ChainTask> =
            Arc::new(|_p: ChainProgress| async { Err::<Value, _>(ExecutionError::failed("nope")) });
        let handle = scheduler.dispatch(&id, task).await.unwrap().handle().unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(scheduler.status(&id), Some(ChainStatus::Retrying));
        pool.shutdown(Duration::from_secs(1)).await;

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, ChainStatus::Failed);
        assert_eq!(outcome.retry_count, 0);
        assert!(outcome.error.unwrap().contains("retry not submitted"));
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_pending_chain_without_task() {
        let scheduler = scheduler();
        let id = scheduler.register(ChainDefinition::new("idle")).unwrap();
        assert!(scheduler.pause(&id).await.unwrap());
        assert!(!scheduler.pause(&id).await.unwrap());
        assert!(!scheduler.resume(&id).await.unwrap());
        assert_eq!(scheduler.status(&id), Some(ChainStatus::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reporting() {
        let scheduler = scheduler();
        let id = scheduler.register(ChainDefinition::new("steps")).unwrap();
        let task: Arc<dyn ChainTask> = Arc::new(|progress: ChainProgress| async move {
            progress.report(40, "download");
            progress.set_progress(20);
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ExecutionError>(Value::Null)
        });
        scheduler.dispatch(&id, task).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let view = scheduler.context(&id).unwrap();
        assert_eq!(view.progress, 40);
        assert_eq!(view.current_step.as_deref(), Some("download"));
    }

    #[tokio::test]
    async fn test_prune_keeps_unpersisted_records() {
        let store = Arc::new(MemoryStateStore::new());
        let scheduler = scheduler_with(store.clone());

        store.set_failing(true);
        let first = scheduler.register(ChainDefinition::new("a")).unwrap();
        scheduler.cancel(&first).await.unwrap();
        store.set_failing(false);
        for name in ["b", "c"] {
            let id = scheduler.register(ChainDefinition::new(name)).unwrap();
            scheduler.cancel(&id).await.unwrap();
        }

        // Front record is not durable yet, nothing can be evicted
        assert_eq!(scheduler.prune_history(1), 0);
        assert_eq!(scheduler.buffered_len(), 3);
        assert_eq!(scheduler.history(&first).await.unwrap().len(), 1);

        assert_eq!(scheduler.flush_pending_history().await, 1);
        assert_eq!(scheduler.prune_history(1), 2);
        assert_eq!(scheduler.buffered_len(), 1);
        assert_eq!(store.get_history(&first).await.unwrap().len(), 1);
    }
}
