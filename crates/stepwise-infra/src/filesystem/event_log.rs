//! Segment-file session event log.
//!
//! Each successful append publishes exactly one segment file named after the
//! index of its first event. A segment carries the events and the snapshot
//! pins of one batch, so a batch becomes visible all at once or not at all.
//! Segments are created without clobbering: two writers racing for the same
//! index cannot both succeed.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stepwise_core::durable::lock::SessionLockWitness;
use stepwise_core::durable::log::{
    prepare_append, verify_sequence, AppendOutcome, AppendPlan, EventLogError, SessionEventLog, SessionLog,
};
use stepwise_types::event::SessionEvent;
use stepwise_types::ids::{SessionId, SnapshotRef};

use super::write_atomic_new;

#[derive(Debug, Serialize, Deserialize)]
struct Segment {
    events: Vec<SessionEvent>,
    #[serde(default)]
    snapshot_pins: Vec<SnapshotRef>,
}

/// Event log stored under `{root}/sessions/{session_id}/events/`.
#[derive(Debug, Clone)]
pub struct FileEventLog {
    root: PathBuf,
}

impl FileEventLog {
    /// Create a log rooted at the data directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn events_dir(&self, session_id: &SessionId) -> PathBuf {
        self.sessions_dir().join(session_id.as_str()).join("events")
    }

    fn segment_path(&self, session_id: &SessionId, first_index: u64) -> PathBuf {
        self.events_dir(session_id).join(format!("{first_index:020}.json"))
    }

    async fn segment_files(dir: &Path) -> Result<Vec<PathBuf>, EventLogError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage(dir, err)),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage(dir, e))? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // skip staging files
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }
            files.push(entry.path());
        }
        // zero-padded names sort by first event index
        files.sort();
        Ok(files)
    }
}

fn storage(path: &Path, err: std::io::Error) -> EventLogError {
    EventLogError::Storage(format!("{}: {err}", path.display()))
}

impl SessionEventLog for FileEventLog {
    async fn append(
        &self,
        session_id: &SessionId,
        witness: &SessionLockWitness,
        plan: AppendPlan,
    ) -> Result<AppendOutcome, EventLogError> {
        witness.ensure_covers(session_id)?;

        let log = self.load_log(session_id).await?;
        let keys: HashSet<String> = log.events.iter().map(|e| e.dedupe_key.clone()).collect();
        let next_index = log.events.len() as u64;
        let prepared = prepare_append(session_id, &keys, &log.snapshot_pins, next_index, &plan, Utc::now())?;
        if prepared.events.is_empty() {
            return Ok(prepared.outcome);
        }

        let segment = Segment {
            events: prepared.events,
            snapshot_pins: plan
                .snapshot_pins
                .into_iter()
                .filter(|pin| !log.snapshot_pins.contains(pin))
                .collect(),
        };
        let bytes = serde_json::to_vec(&segment).map_err(|e| EventLogError::Serialization(e.to_string()))?;
        let path = self.segment_path(session_id, next_index);

        // The lease may have lapsed while the log was being read.
        witness.ensure_covers(session_id)?;
        let created = write_atomic_new(&path, &bytes).await.map_err(|e| storage(&path, e))?;
        if !created {
            return Err(EventLogError::Storage(format!(
                "segment {} already exists; another writer appended concurrently",
                path.display()
            )));
        }

        tracing::debug!(
            session_id = %session_id,
            first_index = next_index,
            events = prepared.outcome.appended.len(),
            "segment written"
        );
        Ok(prepared.outcome)
    }

    async fn load_log(&self, session_id: &SessionId) -> Result<SessionLog, EventLogError> {
        let mut log = SessionLog::default();
        for path in Self::segment_files(&self.events_dir(session_id)).await? {
            let bytes = tokio::fs::read(&path).await.map_err(|e| storage(&path, e))?;
            let segment: Segment = serde_json::from_slice(&bytes).map_err(|e| EventLogError::Corrupt {
                session_id: session_id.clone(),
                message: format!("unreadable segment {}: {e}", path.display()),
            })?;
            log.events.extend(segment.events);
            log.snapshot_pins.extend(segment.snapshot_pins);
        }
        verify_sequence(session_id, &log.events)?;
        Ok(log)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, EventLogError> {
        let dir = self.sessions_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(storage(&dir, err)),
        };

        let mut ids = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| storage(&dir, e))? {
            let name = entry.file_name();
            match SessionId::parse(&name.to_string_lossy()) {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(err) => {
                    tracing::warn!(entry = %name.to_string_lossy(), error = %err, "ignoring unexpected entry in sessions directory");
                }
            }
        }
        Ok(ids.into_iter().collect())
    }
}
