use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use crate::core::errors::{ChainError, Result};
use crate::storage::{ActiveSnapshot, HistoryRecord, StateStore};

/// In-process store without durability.
///
/// `set_failing(true)` makes every write fail, which lets callers exercise
/// the persistence retry path.
#[derive(Default)]
pub struct MemoryStateStore {
    snapshot: RwLock<Option<ActiveSnapshot>>,
    history: RwLock<Vec<HistoryRecord>>,
    failing: AtomicBool,
    snapshot_writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful snapshot writes
    pub fn snapshot_writes(&self) -> usize {
        self.snapshot_writes.load(Ordering::SeqCst)
    }

    pub fn history_len(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChainError::persistence("store unavailable"));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::persistence("memory store lock poisoned")
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn write_snapshot(&self, snapshot: &ActiveSnapshot) -> Result<()> {
        self.check()?;
        *self.snapshot.write().map_err(poisoned)? = Some(snapshot.clone());
        self.snapshot_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<ActiveSnapshot>> {
        Ok(self.snapshot.read().map_err(poisoned)?.clone())
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        self.check()?;
        self.history.write().map_err(poisoned)?.push(record.clone());
        Ok(())
    }

    async fn get_history(&self, chain_id: &str) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .history
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|r| r.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        Ok(self
            .history
            .read()
            .map_err(poisoned)?
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        self.check()
    }
}
