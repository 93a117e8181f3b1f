use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::errors::Result;
use crate::storage::ActiveSnapshot;

/// JSON snapshot file replaced atomically on every write
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write to a sibling temp file, then rename over the target so readers
    /// never observe a partial file
    pub async fn write(&self, snapshot: &ActiveSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let payload = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, payload).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), chains = snapshot.len(), "Snapshot written");
        Ok(())
    }

    /// `None` when no snapshot has been written yet
    pub async fn read(&self) -> Result<Option<ActiveSnapshot>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
