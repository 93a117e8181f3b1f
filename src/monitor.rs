//! Background monitor: timeout sweep, snapshot persistence and history
//! maintenance on a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::scheduler::ChainScheduler;
use crate::storage::StateStore;

const NEVER_WRITTEN: u64 = u64::MAX;

/// What one monitor pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub expired: usize,
    pub snapshot_written: bool,
    pub history_flushed: usize,
    pub pruned: usize,
}

struct MonitorHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

pub struct ExecutionMonitor {
    scheduler: Arc<ChainScheduler>,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
    state: Mutex<Option<MonitorHandle>>,
    last_snapshot_revision: AtomicU64,
}

impl ExecutionMonitor {
    pub fn new(
        scheduler: Arc<ChainScheduler>,
        store: Arc<dyn StateStore>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            store,
            config,
            state: Mutex::new(None),
            last_snapshot_revision: AtomicU64::new(NEVER_WRITTEN),
        })
    }

    /// Start the background loop. Returns false if it is already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return false;
        }
        let (shutdown, shutdown_rx) = oneshot::channel();
        let monitor = self.clone();
        let join = tokio::spawn(async move { monitor.run(shutdown_rx).await });
        *state = Some(MonitorHandle { shutdown, join });
        info!(
            interval_secs = self.config.monitor_interval.as_secs_f64(),
            timeout_secs = self.config.execution_timeout.as_secs(),
            "Execution monitor started"
        );
        true
    }

    /// Stop the loop and wait for it up to the configured stop timeout.
    /// Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let handle = match self.state.lock().await.take() {
            Some(handle) => handle,
            None => return false,
        };
        let _ = handle.shutdown.send(());
        let mut join = handle.join;
        if tokio::time::timeout(self.config.stop_timeout, &mut join)
            .await
            .is_err()
        {
            warn!("Monitor loop did not stop in time, aborting");
            join.abort();
        }
        info!("Execution monitor stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Run one pass immediately
    pub async fn tick(&self) -> TickReport {
        let expired = self
            .scheduler
            .expire_overdue(self.config.execution_timeout)
            .await;

        let revision = self.scheduler.revision();
        let unchanged = self.last_snapshot_revision.load(Ordering::Acquire) == revision;
        let snapshot_written = if self.config.snapshot_on_change_only && unchanged {
            false
        } else {
            let snapshot = self.scheduler.snapshot();
            match self.store.write_snapshot(&snapshot).await {
                Ok(()) => {
                    self.last_snapshot_revision.store(revision, Ordering::Release);
                    true
                }
                Err(e) => {
                    warn!(error = %e, chains = snapshot.len(), "Snapshot write failed");
                    false
                }
            }
        };

        let history_flushed = self.scheduler.flush_pending_history().await;
        let pruned = self.scheduler.prune_history(self.config.history_capacity);

        let report = TickReport {
            expired,
            snapshot_written,
            history_flushed,
            pruned,
        };
        debug!(?report, active = self.scheduler.active_count(), "Monitor tick");
        report
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.monitor_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if report.expired > 0 {
                        info!(expired = report.expired, "Cancelled overdue chains");
                    }
                }
            }
        }
        debug!("Monitor loop exited");
    }
}
