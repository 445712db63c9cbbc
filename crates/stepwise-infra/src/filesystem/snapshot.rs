//! Content-addressed snapshot directory.
//!
//! Snapshots live at `{root}/snapshots/{hex[0..2]}/{hex}.json`. Since the
//! address is the hash of the content, an existing file is never rewritten.

use std::path::PathBuf;

use stepwise_core::durable::snapshot::{SnapshotError, SnapshotStore};
use stepwise_types::ids::SnapshotRef;

use super::write_atomic_new;

/// Filesystem implementation of `SnapshotStore`.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    /// Create a store rooted at the data directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, snapshot_ref: &SnapshotRef) -> PathBuf {
        let hex = snapshot_ref.hex();
        self.root
            .join("snapshots")
            .join(&hex[..2])
            .join(format!("{hex}.json"))
    }
}

impl SnapshotStore for FileSnapshotStore {
    async fn put(&self, snapshot_ref: &SnapshotRef, bytes: &[u8]) -> Result<(), SnapshotError> {
        let path = self.path_for(snapshot_ref);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        let created = write_atomic_new(&path, bytes)
            .await
            .map_err(|e| SnapshotError::Storage(format!("{}: {e}", path.display())))?;
        tracing::debug!(snapshot_ref = %snapshot_ref, created, "snapshot stored");
        Ok(())
    }

    async fn get(&self, snapshot_ref: &SnapshotRef) -> Result<Option<Vec<u8>>, SnapshotError> {
        let path = self.path_for(snapshot_ref);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(SnapshotError::Storage(format!("{}: {err}", path.display()))),
        }
    }
}
