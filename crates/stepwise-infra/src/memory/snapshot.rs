use dashmap::DashMap;
use stepwise_core::durable::snapshot::{SnapshotError, SnapshotStore};
use stepwise_types::ids::SnapshotRef;

/// `DashMap`-backed content-addressed store.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    blobs: DashMap<SnapshotRef, Vec<u8>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    async fn put(&self, snapshot_ref: &SnapshotRef, bytes: &[u8]) -> Result<(), SnapshotError> {
        self.blobs
            .entry(snapshot_ref.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    async fn get(&self, snapshot_ref: &SnapshotRef) -> Result<Option<Vec<u8>>, SnapshotError> {
        Ok(self.blobs.get(snapshot_ref).map(|entry| entry.value().clone()))
    }
}
