use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::core::errors::{ChainError, Result};
use crate::storage::{ActiveSnapshot, HistoryRecord, SnapshotFile, StateStore};

const HISTORY_TREE: &str = "chain_history";
const HISTORY_INDEX_TREE: &str = "chain_history_by_chain";

/// Durable store: sled for history, a JSON file for the snapshot.
///
/// History keys are ids from `Db::generate_id` encoded big-endian, so tree
/// order is append order. The index tree maps `chain_id 0x00 key` to the
/// history key.
pub struct SledStateStore {
    db: Db,
    history: Tree,
    index: Tree,
    snapshot: SnapshotFile,
}

impl SledStateStore {
    pub fn open(history_path: impl AsRef<Path>, snapshot_path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(history_path.as_ref())?;
        Self::with_db(db, snapshot_path)
    }

    pub fn with_db(db: Db, snapshot_path: impl AsRef<Path>) -> Result<Self> {
        let history = db.open_tree(HISTORY_TREE)?;
        let index = db.open_tree(HISTORY_INDEX_TREE)?;
        info!(
            records = history.len(),
            snapshot = %snapshot_path.as_ref().display(),
            "Opened chain state store"
        );
        Ok(Self {
            db,
            history,
            index,
            snapshot: SnapshotFile::new(snapshot_path.as_ref()),
        })
    }

    fn index_prefix(chain_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(chain_id.len() + 1);
        prefix.extend_from_slice(chain_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn decode(bytes: &[u8]) -> Result<HistoryRecord> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[async_trait]
impl StateStore for SledStateStore {
    async fn write_snapshot(&self, snapshot: &ActiveSnapshot) -> Result<()> {
        self.snapshot.write(snapshot).await
    }

    async fn read_snapshot(&self) -> Result<Option<ActiveSnapshot>> {
        self.snapshot.read().await
    }

    async fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        let key = self.db.generate_id()?.to_be_bytes();
        let value = serde_json::to_vec(record)?;

        let mut index_key = Self::index_prefix(&record.chain_id);
        index_key.extend_from_slice(&key);

        self.history.insert(key, value)?;
        self.index.insert(index_key, &key[..])?;
        debug!(chain_id = %record.chain_id, status = %record.status, "History record appended");
        Ok(())
    }

    async fn get_history(&self, chain_id: &str) -> Result<Vec<HistoryRecord>> {
        let mut records = Vec::new();
        for entry in self.index.scan_prefix(Self::index_prefix(chain_id)) {
            let (_, key) = entry?;
            match self.history.get(&key)? {
                Some(bytes) => records.push(Self::decode(&bytes)?),
                None => warn!(chain_id = %chain_id, "Dangling history index entry"),
            }
        }
        Ok(records)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        self.history
            .iter()
            .rev()
            .take(limit)
            .map(|entry| {
                let (_, bytes) = entry?;
                Self::decode(&bytes)
            })
            .collect()
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| ChainError::persistence(format!("flush failed: {}", e)))?;
        Ok(())
    }
}
