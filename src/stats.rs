//! Execution statistics
//!
//! Only SUCCESS and FAILED terminations count as executions; cancelled
//! chains are tallied separately.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::warn;

use crate::chain::model::ChainStatus;

/// Per chain-name performance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainPerformance {
    pub executions: u64,
    pub successes: u64,
    pub total_duration: Duration,
    pub avg_duration: Duration,
    /// Percentage, 0-100
    pub success_rate: f64,
}

/// Owned copy of the aggregated statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total_executed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    /// Percentage, 0-100
    pub average_success_rate: f64,
    pub per_chain: BTreeMap<String, ChainPerformance>,
}

#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: RwLock<StatsSnapshot>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one terminal outcome. Non-terminal statuses are ignored.
    pub fn record(&self, name: &str, status: ChainStatus, duration: Duration) {
        let mut stats = match self.inner.write() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };

        match status {
            ChainStatus::Success | ChainStatus::Failed => {}
            ChainStatus::Cancelled => {
                stats.total_cancelled += 1;
                return;
            }
            other => {
                warn!(status = %other, "Ignoring non-terminal status in stats");
                return;
            }
        }

        let succeeded = status == ChainStatus::Success;
        stats.total_executed += 1;
        if succeeded {
            stats.total_succeeded += 1;
        } else {
            stats.total_failed += 1;
        }
        stats.average_success_rate = rate(stats.total_succeeded, stats.total_executed);

        let entry = stats.per_chain.entry(name.to_string()).or_default();
        entry.executions += 1;
        if succeeded {
            entry.successes += 1;
        }
        entry.total_duration += duration;
        entry.avg_duration = entry.total_duration / entry.executions as u32;
        entry.success_rate = rate(entry.successes, entry.executions);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        match self.inner.read() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_not_counted_as_executed() {
        let stats = StatsAggregator::new();
        stats.record("ingest", ChainStatus::Success, Duration::from_secs(2));
        stats.record("ingest", ChainStatus::Failed, Duration::from_secs(4));
        stats.record("ingest", ChainStatus::Cancelled, Duration::from_secs(9));
        stats.record("report", ChainStatus::Success, Duration::from_secs(1));

        let snap = stats.snapshot();
        assert_eq!(snap.total_executed, 3);
        assert_eq!(snap.total_succeeded, 2);
        assert_eq!(snap.total_failed, 1);
        assert_eq!(snap.total_cancelled, 1);
        assert_eq!(snap.total_executed, snap.total_succeeded + snap.total_failed);
        assert!((snap.average_success_rate - 66.666).abs() < 0.01);

        let ingest = &snap.per_chain["ingest"];
        assert_eq!(ingest.executions, 2);
        assert_eq!(ingest.successes, 1);
        assert_eq!(ingest.total_duration, Duration::from_secs(6));
        assert_eq!(ingest.avg_duration, Duration::from_secs(3));
        assert_eq!(ingest.success_rate, 50.0);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let stats = StatsAggregator::new();
        let before = stats.snapshot();
        stats.record("a", ChainStatus::Success, Duration::ZERO);
        assert_eq!(before.total_executed, 0);
        assert_eq!(stats.snapshot().total_executed, 1);
        assert_eq!(stats.snapshot().average_success_rate, 100.0);
    }

    #[test]
    fn test_non_terminal_ignored() {
        let stats = StatsAggregator::new();
        stats.record("a", ChainStatus::Running, Duration::ZERO);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
