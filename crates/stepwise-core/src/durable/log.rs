//! Session event log port and the append rules every adapter shares.
//!
//! The log is append-only and ordered. `append` requires a lock witness and
//! is idempotent per dedupe key: events whose key is already present are
//! skipped and reported as deduplicated, the rest are appended together or
//! not at all. [`prepare_append`] implements those rules once so the file,
//! SQLite and in-memory adapters cannot drift apart.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stepwise_types::event::{NewSessionEvent, SessionEvent, SessionEventData};
use stepwise_types::ids::{SessionId, SnapshotRef};
use thiserror::Error;

use super::lock::{LockError, SessionLockWitness};
use super::projection::{ProjectionError, SessionTruth};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A batch of events to append, plus the snapshots they reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendPlan {
    pub events: Vec<NewSessionEvent>,
    /// Snapshots that must stay reachable from this session.
    pub snapshot_pins: Vec<SnapshotRef>,
}

impl AppendPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(mut self, dedupe_key: impl Into<String>, data: SessionEventData) -> Self {
        self.events.push(NewSessionEvent::new(dedupe_key, data));
        self
    }

    pub fn pin(mut self, snapshot_ref: SnapshotRef) -> Self {
        if !self.snapshot_pins.contains(&snapshot_ref) {
            self.snapshot_pins.push(snapshot_ref);
        }
        self
    }
}

/// What an append actually did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOutcome {
    /// Indices assigned to newly written events, in order.
    pub appended: Vec<u64>,
    /// Dedupe keys that were already present and therefore skipped.
    pub deduplicated: Vec<String>,
}

impl AppendOutcome {
    /// True when every event was a replay of an earlier append.
    pub fn is_replay(&self) -> bool {
        self.appended.is_empty()
    }
}

/// A session's raw durable record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    pub events: Vec<SessionEvent>,
    pub snapshot_pins: BTreeSet<SnapshotRef>,
}

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("invalid append plan: {0}")]
    InvalidPlan(String),

    #[error("event log storage error: {0}")]
    Storage(String),

    #[error("corrupt event log for session {session_id}: {message}")]
    Corrupt { session_id: SessionId, message: String },

    #[error("event serialization error: {0}")]
    Serialization(String),
}

impl From<ProjectionError> for EventLogError {
    fn from(err: ProjectionError) -> Self {
        EventLogError::Corrupt {
            session_id: err.session_id.clone(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Append-only, per-session event storage.
pub trait SessionEventLog: Send + Sync {
    /// Append a batch to `session_id`'s log. `witness` must be a healthy
    /// lease on that same session. All-or-nothing.
    fn append(
        &self,
        session_id: &SessionId,
        witness: &SessionLockWitness,
        plan: AppendPlan,
    ) -> impl std::future::Future<Output = Result<AppendOutcome, EventLogError>> + Send;

    /// Load the ordered events and pins. An unknown session loads as empty.
    fn load_log(
        &self,
        session_id: &SessionId,
    ) -> impl std::future::Future<Output = Result<SessionLog, EventLogError>> + Send;

    /// Every session with at least one event.
    fn list_sessions(&self) -> impl std::future::Future<Output = Result<Vec<SessionId>, EventLogError>> + Send;

    /// Load and fold a session's events into its current truth.
    fn load(
        &self,
        session_id: &SessionId,
    ) -> impl std::future::Future<Output = Result<SessionTruth, EventLogError>> + Send {
        async move {
            let log = self.load_log(session_id).await?;
            Ok(SessionTruth::project(session_id, &log)?)
        }
    }
}

// ---------------------------------------------------------------------------
// Shared append rules
// ---------------------------------------------------------------------------

/// Events ready to be written plus the outcome to report.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedAppend {
    pub events: Vec<SessionEvent>,
    pub outcome: AppendOutcome,
}

/// Validate `plan` and assign indices to the events not already present.
///
/// - every dedupe key is non-empty and unique within the batch
/// - every `node_created` references a pinned snapshot (in this batch or an
///   earlier one)
/// - events whose key is in `existing_keys` are skipped
pub fn prepare_append(
    session_id: &SessionId,
    existing_keys: &HashSet<String>,
    existing_pins: &BTreeSet<SnapshotRef>,
    next_index: u64,
    plan: &AppendPlan,
    now: DateTime<Utc>,
) -> Result<PreparedAppend, EventLogError> {
    let mut seen = HashSet::new();
    for event in &plan.events {
        if event.dedupe_key.is_empty() {
            return Err(EventLogError::InvalidPlan("empty dedupe key".to_string()));
        }
        if !seen.insert(event.dedupe_key.as_str()) {
            return Err(EventLogError::InvalidPlan(format!(
                "dedupe key '{}' appears twice in one batch",
                event.dedupe_key
            )));
        }
        if let SessionEventData::NodeCreated { snapshot_ref, node_id, .. } = &event.data {
            if !plan.snapshot_pins.contains(snapshot_ref) && !existing_pins.contains(snapshot_ref) {
                return Err(EventLogError::InvalidPlan(format!(
                    "node {node_id} references unpinned snapshot {snapshot_ref}"
                )));
            }
        }
    }

    let mut outcome = AppendOutcome::default();
    let mut events = Vec::new();
    let mut index = next_index;
    for event in &plan.events {
        if existing_keys.contains(&event.dedupe_key) {
            outcome.deduplicated.push(event.dedupe_key.clone());
            continue;
        }
        events.push(SessionEvent {
            event_index: index,
            session_id: session_id.clone(),
            dedupe_key: event.dedupe_key.clone(),
            recorded_at: now,
            data: event.data.clone(),
        });
        outcome.appended.push(index);
        index += 1;
    }

    if !outcome.deduplicated.is_empty() {
        tracing::debug!(
            session_id = %session_id,
            deduplicated = outcome.deduplicated.len(),
            appended = outcome.appended.len(),
            "append deduplicated"
        );
    }
    Ok(PreparedAppend { events, outcome })
}

/// Check that loaded events are gap-free and belong to `session_id`.
pub fn verify_sequence(session_id: &SessionId, events: &[SessionEvent]) -> Result<(), EventLogError> {
    for (expected, event) in events.iter().enumerate() {
        if event.event_index != expected as u64 {
            return Err(EventLogError::Corrupt {
                session_id: session_id.clone(),
                message: format!("expected event index {expected}, found {}", event.event_index),
            });
        }
        if &event.session_id != session_id {
            return Err(EventLogError::Corrupt {
                session_id: session_id.clone(),
                message: format!("event {} belongs to session {}", event.event_index, event.session_id),
            });
        }
    }
    Ok(())
}
