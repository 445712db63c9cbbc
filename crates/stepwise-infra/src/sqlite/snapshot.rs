//! SQLite content-addressed snapshot store.

use chrono::Utc;
use sqlx::Row;
use stepwise_core::durable::snapshot::{SnapshotError, SnapshotStore};
use stepwise_types::ids::SnapshotRef;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SnapshotStore`.
#[derive(Debug, Clone)]
pub struct SqliteSnapshotStore {
    pool: DatabasePool,
}

impl SqliteSnapshotStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    async fn put(&self, snapshot_ref: &SnapshotRef, bytes: &[u8]) -> Result<(), SnapshotError> {
        sqlx::query("INSERT OR IGNORE INTO snapshots (snapshot_ref, content, created_at) VALUES (?, ?, ?)")
            .bind(snapshot_ref.as_str())
            .bind(bytes)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, snapshot_ref: &SnapshotRef) -> Result<Option<Vec<u8>>, SnapshotError> {
        let row = sqlx::query("SELECT content FROM snapshots WHERE snapshot_ref = ?")
            .bind(snapshot_ref.as_str())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| SnapshotError::Storage(e.to_string()))?;

        row.map(|row| row.try_get::<Vec<u8>, _>("content"))
            .transpose()
            .map_err(|e| SnapshotError::Storage(e.to_string()))
    }
}
