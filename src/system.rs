use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::chain::context::ChainHandle;
use crate::chain::events::ChainEvent;
use crate::chain::model::{ChainDefinition, ChainId, ChainStatus, ChainView};
use crate::chain::task::ChainTask;
use crate::core::config::EngineConfig;
use crate::core::errors::{ChainError, Result};
use crate::monitor::{ExecutionMonitor, TickReport};
use crate::recovery::{DurabilityMode, Recovery, RecoveryConfig, RecoveryStats};
use crate::scheduler::{ChainScheduler, Dispatch, PoolStats, WorkerPool};
use crate::stats::{StatsAggregator, StatsSnapshot};
use crate::storage::{HistoryRecord, MemoryStateStore, SledStateStore, StateStore};

const DEFAULT_SNAPSHOT_FILE: &str = "active_chains.json";

/// Point-in-time status for dashboards and other collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub active_chains: Vec<ChainView>,
    pub completed_count: u64,
    pub stats: StatsSnapshot,
    pub pool: PoolStats,
    pub monitor_running: bool,
}

/// Owns every engine component and their lifecycle
pub struct ChainSystem {
    scheduler: Arc<ChainScheduler>,
    monitor: Arc<ExecutionMonitor>,
    pool: Arc<WorkerPool>,
    store: Arc<dyn StateStore>,
    stats: Arc<StatsAggregator>,
    config: EngineConfig,
    recovery_stats: RwLock<RecoveryStats>,
    shutdown_flag: AtomicBool,
}

impl ChainSystem {
    pub fn builder() -> ChainSystemBuilder {
        ChainSystemBuilder::new()
    }

    /// Start the execution monitor. Workers are already running.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown_flag.load(Ordering::Acquire) {
            return Err(ChainError::SystemShutdown);
        }
        if self.monitor.start().await {
            info!(max_concurrency = self.config.max_concurrency, "Chain system started");
        }
        Ok(())
    }

    /// Stop the monitor, write a final snapshot, stop the workers and flush
    /// the store
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_flag.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Initiating shutdown");

        self.monitor.stop().await;
        let report = self.monitor.tick().await;
        if !report.snapshot_written {
            warn!("Final snapshot was not written");
        }
        self.pool.shutdown(self.config.stop_timeout).await;
        self.store.flush().await?;

        info!("Shutdown complete");
        Ok(())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    pub fn register(&self, definition: ChainDefinition) -> Result<ChainId> {
        self.ensure_running()?;
        self.scheduler.register(definition)
    }

    pub async fn dispatch(&self, chain_id: &str, task: impl ChainTask) -> Result<Dispatch> {
        self.ensure_running()?;
        self.scheduler.dispatch(chain_id, Arc::new(task)).await
    }

    /// Dispatch with a task that is already shared
    pub async fn dispatch_shared(&self, chain_id: &str, task: Arc<dyn ChainTask>) -> Result<Dispatch> {
        self.ensure_running()?;
        self.scheduler.dispatch(chain_id, task).await
    }

    pub async fn pause(&self, chain_id: &str) -> Result<bool> {
        self.scheduler.pause(chain_id).await
    }

    pub async fn resume(&self, chain_id: &str) -> Result<bool> {
        self.ensure_running()?;
        self.scheduler.resume(chain_id).await
    }

    pub async fn cancel(&self, chain_id: &str) -> Result<bool> {
        self.scheduler.cancel(chain_id).await
    }

    pub fn status(&self, chain_id: &str) -> Option<ChainStatus> {
        self.scheduler.status(chain_id)
    }

    pub fn context(&self, chain_id: &str) -> Option<ChainView> {
        self.scheduler.context(chain_id)
    }

    /// Outcome handle for an active chain
    pub fn watch(&self, chain_id: &str) -> Option<ChainHandle> {
        self.scheduler.watch(chain_id)
    }

    pub async fn get_system_status(&self) -> SystemStatus {
        SystemStatus {
            active_chains: self.scheduler.active(),
            completed_count: self.scheduler.completed_count(),
            stats: self.stats.snapshot(),
            pool: self.scheduler.pool_stats(),
            monitor_running: self.monitor.is_running().await,
        }
    }

    pub fn subscribe(&self) -> async_broadcast::Receiver<ChainEvent> {
        self.scheduler.events().subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn history(&self, chain_id: &str) -> Result<Vec<HistoryRecord>> {
        self.scheduler.history(chain_id).await
    }

    /// Most recent durable history records, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        self.store.list_recent(limit).await
    }

    pub fn dependency_dot(&self) -> String {
        self.scheduler.dependency_dot()
    }

    pub async fn recovery_stats(&self) -> RecoveryStats {
        self.recovery_stats.read().await.clone()
    }

    /// Run one monitor pass now
    pub async fn run_monitor_tick(&self) -> TickReport {
        self.monitor.tick().await
    }

    /// Restore chains from the stored snapshot
    pub async fn recover(&self, durability: DurabilityMode) -> Result<RecoveryStats> {
        let recovery = Recovery::new(
            self.scheduler.clone(),
            self.store.clone(),
            RecoveryConfig {
                durability,
                auto_recover: false,
            },
        );
        let stats = recovery.recover().await?;
        *self.recovery_stats.write().await = stats.clone();
        Ok(stats)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown_flag.load(Ordering::Acquire) {
            return Err(ChainError::SystemShutdown);
        }
        Ok(())
    }
}

/// Builder for ChainSystem
pub struct ChainSystemBuilder {
    config: Option<EngineConfig>,
    store: Option<Arc<dyn StateStore>>,
    recovery: RecoveryConfig,
}

impl ChainSystemBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            recovery: RecoveryConfig::default(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use this store instead of one derived from the configuration
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.recovery.durability = mode;
        self
    }

    /// Restore from the last snapshot during `build` (default true)
    pub fn recover(mut self, enabled: bool) -> Self {
        self.recovery.auto_recover = enabled;
        self
    }

    /// Build all components; must be called inside a tokio runtime
    pub async fn build(self) -> Result<ChainSystem> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => Self::store_from_config(&config)?,
        };

        let stats = Arc::new(StatsAggregator::new());
        let pool = Arc::new(WorkerPool::new(config.max_concurrency));
        let scheduler = ChainScheduler::new(config.clone(), store.clone(), stats.clone(), pool.clone());
        let monitor = ExecutionMonitor::new(scheduler.clone(), store.clone(), config.clone());

        let recovery_stats = if self.recovery.auto_recover {
            Recovery::new(scheduler.clone(), store.clone(), self.recovery)
                .recover()
                .await?
        } else {
            RecoveryStats::default()
        };

        info!(
            max_concurrency = config.max_concurrency,
            restored = recovery_stats.restored,
            "Chain system built"
        );

        Ok(ChainSystem {
            scheduler,
            monitor,
            pool,
            store,
            stats,
            config,
            recovery_stats: RwLock::new(recovery_stats),
            shutdown_flag: AtomicBool::new(false),
        })
    }

    fn store_from_config(config: &EngineConfig) -> Result<Arc<dyn StateStore>> {
        match &config.history_path {
            Some(history_path) => {
                let snapshot_path = config
                    .snapshot_path
                    .clone()
                    .unwrap_or_else(|| history_path.join(DEFAULT_SNAPSHOT_FILE));
                Ok(Arc::new(SledStateStore::open(history_path, snapshot_path)?))
            }
            None => {
                warn!("No history_path configured, chain state will not survive restarts");
                Ok(Arc::new(MemoryStateStore::new()))
            }
        }
    }
}

impl Default for ChainSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::task::ChainProgress;
    use crate::core::errors::ExecutionError;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_with_defaults() {
        let system = ChainSystem::builder()
            .config(EngineConfig::development())
            .build()
            .await
            .unwrap();
        system.start().await.unwrap();
        let status = system.get_system_status().await;
        assert!(status.monitor_running);
        assert_eq!(status.pool.concurrency, 3);
        assert!(status.active_chains.is_empty());
        system.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_work_after_shutdown() {
        let system = ChainSystem::builder().build().await.unwrap();
        system.shutdown().await.unwrap();
        assert!(system.is_shutdown());
        assert!(matches!(
            system.register(ChainDefinition::new("late")),
            Err(ChainError::SystemShutdown)
        ));
        assert!(matches!(system.start().await, Err(ChainError::SystemShutdown)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrency: 0,
            ..EngineConfig::default()
        };
        assert!(ChainSystem::builder().config(config).build().await.is_err());
    }

    #[tokio::test]
    async fn test_sled_store_from_config_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            history_path: Some(dir.path().join("history")),
            ..EngineConfig::development()
        };

        {
            let system = ChainSystem::builder()
                .config(config.clone())
                .build()
                .await
                .unwrap();
            let done = system
                .register(ChainDefinition::new("done").with_id("done"))
                .unwrap();
            system
                .register(ChainDefinition::new("waiting").with_id("waiting"))
                .unwrap();
            let outcome = system
                .dispatch(&done, |_p: ChainProgress| async {
                    Ok::<Value, ExecutionError>(json!(1))
                })
                .await
                .unwrap()
                .handle()
                .unwrap()
                .wait()
                .await
                .unwrap();
            assert!(outcome.is_success());
            system.shutdown().await.unwrap();
        }

        // Let finished tasks drop their handles on the sled lock
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let system = ChainSystem::builder().config(config).build().await.unwrap();
        assert_eq!(system.recovery_stats().await.restored, 1);
        assert_eq!(system.status("waiting"), Some(ChainStatus::Pending));
        assert_eq!(system.history("done").await.unwrap().len(), 1);
        assert_eq!(system.recent(10).await.unwrap()[0].chain_id, "done");
        system.shutdown().await.unwrap();
    }
}
