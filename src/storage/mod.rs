//! Storage layer for chainwatch
//!
//! Active chains are persisted as a snapshot that is overwritten on every
//! monitor tick; terminal chains go to an append-only history.

pub mod memory_store;
pub mod sled_store;
pub mod snapshot;

pub use memory_store::MemoryStateStore;
pub use sled_store::SledStateStore;
pub use snapshot::SnapshotFile;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::chain::model::{ChainId, ChainStatus, ChainView, Priority};
use crate::core::errors::Result;

/// Persisted view of all active chains at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub chains: BTreeMap<ChainId, ChainView>,
}

impl ActiveSnapshot {
    pub fn new(views: impl IntoIterator<Item = ChainView>) -> Self {
        Self {
            taken_at: Some(Utc::now()),
            chains: views
                .into_iter()
                .map(|view| (view.chain_id.clone(), view))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// Completed execution of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub chain_id: ChainId,
    pub name: String,
    pub task_id: Option<String>,
    pub status: ChainStatus,
    pub priority: Priority,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub retry_count: u32,
    pub error: Option<String>,
    /// Full metrics plus last progress and step
    pub metrics: Value,
}

/// Persistence backend for snapshots and history
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Replace the stored snapshot
    async fn write_snapshot(&self, snapshot: &ActiveSnapshot) -> Result<()>;

    /// Last stored snapshot, if any
    async fn read_snapshot(&self) -> Result<Option<ActiveSnapshot>>;

    /// Append a terminal record
    async fn append_history(&self, record: &HistoryRecord) -> Result<()>;

    /// All records for a chain in append order
    async fn get_history(&self, chain_id: &str) -> Result<Vec<HistoryRecord>>;

    /// Up to `limit` most recent records, newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>>;

    async fn flush(&self) -> Result<()>;
}
