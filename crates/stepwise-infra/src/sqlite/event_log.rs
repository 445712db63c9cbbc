//! SQLite session event log.
//!
//! Implements `SessionEventLog` from `stepwise-core`. A batch is written in a
//! single writer transaction; the unique `(session_id, dedupe_key)` index
//! backs up the dedupe rules applied by `prepare_append`.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepwise_core::durable::lock::SessionLockWitness;
use stepwise_core::durable::log::{
    prepare_append, verify_sequence, AppendOutcome, AppendPlan, EventLogError, SessionEventLog, SessionLog,
};
use stepwise_types::event::{SessionEvent, SessionEventData};
use stepwise_types::ids::{SessionId, SnapshotRef};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `SessionEventLog`.
#[derive(Debug, Clone)]
pub struct SqliteEventLog {
    pool: DatabasePool,
}

impl SqliteEventLog {
    /// Create a new log backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct EventRow {
    event_index: i64,
    dedupe_key: String,
    data: String,
    recorded_at: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_index: row.try_get("event_index")?,
            dedupe_key: row.try_get("dedupe_key")?,
            data: row.try_get("data")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_event(self, session_id: &SessionId) -> Result<SessionEvent, EventLogError> {
        let corrupt = |message: String| EventLogError::Corrupt {
            session_id: session_id.clone(),
            message,
        };
        let data: SessionEventData = serde_json::from_str(&self.data)
            .map_err(|e| corrupt(format!("event {}: invalid data JSON: {e}", self.event_index)))?;
        let recorded_at = parse_datetime(&self.recorded_at)
            .map_err(|e| corrupt(format!("event {}: {e}", self.event_index)))?;
        let event_index =
            u64::try_from(self.event_index).map_err(|_| corrupt(format!("negative event index {}", self.event_index)))?;
        Ok(SessionEvent {
            event_index,
            session_id: session_id.clone(),
            dedupe_key: self.dedupe_key,
            recorded_at,
            data,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid datetime: {e}"))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn query_err(e: sqlx::Error) -> EventLogError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("UNIQUE") {
            return EventLogError::Storage(format!("concurrent append detected: {}", db_err.message()));
        }
    }
    EventLogError::Storage(e.to_string())
}

impl SessionEventLog for SqliteEventLog {
    async fn append(
        &self,
        session_id: &SessionId,
        witness: &SessionLockWitness,
        plan: AppendPlan,
    ) -> Result<AppendOutcome, EventLogError> {
        witness.ensure_covers(session_id)?;

        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let key_rows = sqlx::query("SELECT dedupe_key FROM session_events WHERE session_id = ?")
            .bind(session_id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(query_err)?;
        let keys = key_rows
            .iter()
            .map(|row| row.try_get::<String, _>("dedupe_key"))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(query_err)?;

        let pin_rows = sqlx::query("SELECT snapshot_ref FROM session_snapshot_pins WHERE session_id = ?")
            .bind(session_id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(query_err)?;
        let mut pins = BTreeSet::new();
        for row in &pin_rows {
            let raw: String = row.try_get("snapshot_ref").map_err(query_err)?;
            let pin = SnapshotRef::parse(&raw).map_err(|e| EventLogError::Corrupt {
                session_id: session_id.clone(),
                message: format!("invalid pinned snapshot ref: {e}"),
            })?;
            pins.insert(pin);
        }

        let prepared = prepare_append(session_id, &keys, &pins, keys.len() as u64, &plan, Utc::now())?;
        if prepared.events.is_empty() {
            // Nothing to write; dropping the transaction rolls it back.
            return Ok(prepared.outcome);
        }

        for event in &prepared.events {
            let data = serde_json::to_string(&event.data).map_err(|e| EventLogError::Serialization(e.to_string()))?;
            sqlx::query(
                "INSERT INTO session_events (session_id, event_index, dedupe_key, kind, data, recorded_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(session_id.as_str())
            .bind(event.event_index as i64)
            .bind(&event.dedupe_key)
            .bind(event.data.kind())
            .bind(data)
            .bind(format_datetime(&event.recorded_at))
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        }

        for pin in &plan.snapshot_pins {
            sqlx::query("INSERT OR IGNORE INTO session_snapshot_pins (session_id, snapshot_ref) VALUES (?, ?)")
                .bind(session_id.as_str())
                .bind(pin.as_str())
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
        }

        // The lease may have lapsed while the batch was being written.
        witness.ensure_covers(session_id)?;
        tx.commit().await.map_err(query_err)?;

        tracing::debug!(
            session_id = %session_id,
            events = prepared.outcome.appended.len(),
            "events committed"
        );
        Ok(prepared.outcome)
    }

    async fn load_log(&self, session_id: &SessionId) -> Result<SessionLog, EventLogError> {
        // One read transaction, so events and pins come from the same commit.
        let mut tx = self.pool.reader.begin().await.map_err(query_err)?;
        let rows = sqlx::query(
            "SELECT event_index, dedupe_key, data, recorded_at
             FROM session_events WHERE session_id = ? ORDER BY event_index",
        )
        .bind(session_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(query_err)?;

        let mut log = SessionLog::default();
        for row in &rows {
            let event_row = EventRow::from_row(row).map_err(query_err)?;
            log.events.push(event_row.into_event(session_id)?);
        }

        let pin_rows = sqlx::query("SELECT snapshot_ref FROM session_snapshot_pins WHERE session_id = ?")
            .bind(session_id.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(query_err)?;
        for row in &pin_rows {
            let raw: String = row.try_get("snapshot_ref").map_err(query_err)?;
            let pin = SnapshotRef::parse(&raw).map_err(|e| EventLogError::Corrupt {
                session_id: session_id.clone(),
                message: format!("invalid pinned snapshot ref: {e}"),
            })?;
            log.snapshot_pins.insert(pin);
        }

        tx.commit().await.map_err(query_err)?;

        verify_sequence(session_id, &log.events)?;
        Ok(log)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, EventLogError> {
        let rows = sqlx::query("SELECT DISTINCT session_id FROM session_events ORDER BY session_id")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let raw: String = row.try_get("session_id").map_err(query_err)?;
            match SessionId::parse(&raw) {
                Ok(id) => ids.push(id),
                Err(err) => tracing::warn!(session_id = %raw, error = %err, "skipping malformed session id"),
            }
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InProcessLockManager;
    use std::time::Duration;
    use stepwise_core::durable::lock::SessionLockManager;

    async fn test_log() -> (tempfile::TempDir, SqliteEventLog) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::open_in(dir.path()).await.unwrap();
        (dir, SqliteEventLog::new(pool))
    }

    fn created() -> SessionEventData {
        SessionEventData::SessionCreated {
            workflow_id: "demo".into(),
        }
    }

    fn preferences() -> SessionEventData {
        SessionEventData::PreferencesChanged {
            preferences: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_append_load_and_dedupe() {
        let (_dir, log) = test_log().await;
        let locks = InProcessLockManager::new();
        let session = SessionId::generate();
        let witness = locks.acquire(&session, Duration::from_secs(1)).await.unwrap();

        let first = log
            .append(&session, &witness, AppendPlan::new().event("session", created()).event("prefs:0", preferences()))
            .await
            .unwrap();
        assert_eq!(first.appended, vec![0, 1]);

        let second = log
            .append(&session, &witness, AppendPlan::new().event("prefs:0", preferences()).event("prefs:1", preferences()))
            .await
            .unwrap();
        assert_eq!(second.appended, vec![2]);
        assert_eq!(second.deduplicated, vec!["prefs:0".to_string()]);

        let loaded = log.load_log(&session).await.unwrap();
        let kinds: Vec<&str> = loaded.events.iter().map(|e| e.data.kind()).collect();
        assert_eq!(kinds, vec!["session_created", "preferences_changed", "preferences_changed"]);
        assert_eq!(log.list_sessions().await.unwrap(), vec![session]);
    }

    #[tokio::test]
    async fn test_invalid_plan_writes_nothing() {
        let (_dir, log) = test_log().await;
        let locks = InProcessLockManager::new();
        let session = SessionId::generate();
        let witness = locks.acquire(&session, Duration::from_secs(1)).await.unwrap();

        let err = log
            .append(&session, &witness, AppendPlan::new().event("dup", created()).event("dup", preferences()))
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::InvalidPlan(_)));
        assert!(log.load_log(&session).await.unwrap().events.is_empty());
    }
}
