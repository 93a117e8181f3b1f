use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::model::{ChainStatus, ChainView};
use crate::core::errors::Result;
use crate::scheduler::ChainScheduler;
use crate::storage::{ActiveSnapshot, StateStore};

/// How chains caught in flight by a restart are brought back
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityMode {
    /// Chains come back PENDING and the caller dispatches them again (default)
    #[default]
    BestEffort,
    /// Chains that were running come back PAUSED and need a manual resume
    AtMostOnce,
}

/// Recovery configuration
#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub durability: DurabilityMode,
    /// Whether to restore automatically when the system is built
    pub auto_recover: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::BestEffort,
            auto_recover: true,
        }
    }
}

/// Statistics from a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total_found: usize,
    pub restored: usize,
    /// Restored as PAUSED because they were in flight
    pub paused: usize,
    /// Terminal or already-active entries
    pub skipped: usize,
}

enum RecoveryOutcome {
    Restored,
    Paused,
    Skipped,
}

/// Rebuilds active chains from the last snapshot after a restart
pub struct Recovery {
    scheduler: Arc<ChainScheduler>,
    store: Arc<dyn StateStore>,
    config: RecoveryConfig,
}

impl Recovery {
    pub fn new(
        scheduler: Arc<ChainScheduler>,
        store: Arc<dyn StateStore>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            scheduler,
            store,
            config,
        }
    }

    /// Read the stored snapshot and restore it
    pub async fn recover(&self) -> Result<RecoveryStats> {
        match self.store.read_snapshot().await? {
            Some(snapshot) => Ok(self.restore(snapshot)),
            None => {
                info!("No snapshot found, nothing to recover");
                Ok(RecoveryStats::default())
            }
        }
    }

    /// Re-create the snapshot's chains in the active set
    pub fn restore(&self, snapshot: ActiveSnapshot) -> RecoveryStats {
        let mut stats = RecoveryStats::default();
        stats.total_found = snapshot.len();
        info!(
            chains = snapshot.len(),
            taken_at = ?snapshot.taken_at,
            mode = ?self.config.durability,
            "Recovering chains from snapshot"
        );

        for view in snapshot.chains.into_values() {
            match self.recover_chain(view) {
                RecoveryOutcome::Restored => stats.restored += 1,
                RecoveryOutcome::Paused => {
                    stats.restored += 1;
                    stats.paused += 1;
                }
                RecoveryOutcome::Skipped => stats.skipped += 1,
            }
        }

        info!(
            restored = stats.restored,
            paused = stats.paused,
            skipped = stats.skipped,
            "Recovery completed"
        );
        stats
    }

    fn recover_chain(&self, mut view: ChainView) -> RecoveryOutcome {
        let chain_id = view.chain_id.clone();
        if view.status.is_terminal() {
            debug!(chain_id = %chain_id, status = %view.status, "Skipping terminal snapshot entry");
            return RecoveryOutcome::Skipped;
        }

        let (status, outcome) = match (view.status, self.config.durability) {
            (ChainStatus::Paused, _) => (ChainStatus::Paused, RecoveryOutcome::Restored),
            (ChainStatus::Pending, _) => (ChainStatus::Pending, RecoveryOutcome::Restored),
            (_, DurabilityMode::BestEffort) => (ChainStatus::Pending, RecoveryOutcome::Restored),
            (_, DurabilityMode::AtMostOnce) => {
                view.metrics.last_error = Some(
                    "in flight during restart; resume manually to run again".to_string(),
                );
                (ChainStatus::Paused, RecoveryOutcome::Paused)
            }
        };

        if !self.scheduler.restore(view, status) {
            warn!(chain_id = %chain_id, "Chain already active, snapshot entry skipped");
            return RecoveryOutcome::Skipped;
        }
        debug!(chain_id = %chain_id, %status, "Chain restored");
        outcome
    }
}
