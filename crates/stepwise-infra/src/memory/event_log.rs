use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;
use stepwise_core::durable::lock::SessionLockWitness;
use stepwise_core::durable::log::{
    prepare_append, AppendOutcome, AppendPlan, EventLogError, SessionEventLog, SessionLog,
};
use stepwise_types::ids::SessionId;

/// `DashMap`-backed event log.
///
/// A batch is applied while holding the session's shard entry, so readers
/// observe it entirely or not at all.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    sessions: DashMap<SessionId, SessionLog>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events recorded for a session.
    pub fn event_count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .get(session_id)
            .map_or(0, |log| log.events.len())
    }
}

impl SessionEventLog for MemoryEventLog {
    async fn append(
        &self,
        session_id: &SessionId,
        witness: &SessionLockWitness,
        plan: AppendPlan,
    ) -> Result<AppendOutcome, EventLogError> {
        witness.ensure_covers(session_id)?;

        let mut log = self.sessions.entry(session_id.clone()).or_default();
        let keys: HashSet<String> = log.events.iter().map(|e| e.dedupe_key.clone()).collect();
        let next_index = log.events.len() as u64;
        let prepared = prepare_append(session_id, &keys, &log.snapshot_pins, next_index, &plan, Utc::now())?;
        if !prepared.events.is_empty() {
            log.events.extend(prepared.events);
            log.snapshot_pins.extend(plan.snapshot_pins);
        }
        Ok(prepared.outcome)
    }

    async fn load_log(&self, session_id: &SessionId) -> Result<SessionLog, EventLogError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, EventLogError> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().events.is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
