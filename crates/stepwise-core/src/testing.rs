//! In-process fakes for the core ports, used by unit tests only.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use stepwise_types::error::RepositoryError;
use stepwise_types::ids::{SessionId, SnapshotRef};
use stepwise_types::workflow::{OutputContract, WorkflowDefinition, WorkflowSummary};

use crate::durable::lock::{LockError, LockLease, SessionLockManager, SessionLockWitness};
use crate::durable::log::{prepare_append, AppendOutcome, AppendPlan, EventLogError, SessionEventLog, SessionLog};
use crate::durable::snapshot::{SnapshotError, SnapshotStore};
use crate::repository::workflow::WorkflowReader;
use crate::service::crypto::{CryptoPort, SHA256_LEN};
use crate::service::validator::{OutputValidator, ValidationIssue, ValidationReport};

// ---------------------------------------------------------------------------
// Crypto
// ---------------------------------------------------------------------------

/// Deterministic, non-cryptographic stand-in for SHA-256 and HMAC.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeCrypto;

fn fnv(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64 ^ seed.wrapping_mul(0x0100_0000_01b3);
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl CryptoPort for FakeCrypto {
    fn sha256(&self, bytes: &[u8]) -> [u8; SHA256_LEN] {
        let mut out = [0u8; SHA256_LEN];
        for (i, chunk) in out.chunks_mut(8).enumerate() {
            chunk.copy_from_slice(&fnv(i as u64 + 1, bytes).to_le_bytes());
        }
        out
    }

    fn hmac_sha256(&self, key: &[u8], message: &[u8]) -> [u8; SHA256_LEN] {
        let mut input = Vec::with_capacity(key.len() + 1 + message.len());
        input.extend_from_slice(key);
        input.push(0);
        input.extend_from_slice(message);
        self.sha256(&input)
    }

    fn verify_hmac_sha256(&self, key: &[u8], message: &[u8], tag: &[u8]) -> bool {
        self.hmac_sha256(key, message).as_slice() == tag
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemorySnapshots {
    blobs: Mutex<HashMap<SnapshotRef, Vec<u8>>>,
}

impl SnapshotStore for MemorySnapshots {
    async fn put(&self, snapshot_ref: &SnapshotRef, bytes: &[u8]) -> Result<(), SnapshotError> {
        self.blobs
            .lock()
            .unwrap()
            .entry(snapshot_ref.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    async fn get(&self, snapshot_ref: &SnapshotRef) -> Result<Option<Vec<u8>>, SnapshotError> {
        Ok(self.blobs.lock().unwrap().get(snapshot_ref).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    sessions: Mutex<HashMap<SessionId, SessionLog>>,
}

impl MemoryLog {
    pub fn event_count(&self, session_id: &SessionId) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map_or(0, |log| log.events.len())
    }
}

impl SessionEventLog for MemoryLog {
    async fn append(
        &self,
        session_id: &SessionId,
        witness: &SessionLockWitness,
        plan: AppendPlan,
    ) -> Result<AppendOutcome, EventLogError> {
        witness.ensure_covers(session_id)?;

        let mut sessions = self.sessions.lock().unwrap();
        let log = sessions.entry(session_id.clone()).or_default();
        let keys: HashSet<String> = log.events.iter().map(|e| e.dedupe_key.clone()).collect();
        let prepared = prepare_append(
            session_id,
            &keys,
            &log.snapshot_pins,
            log.events.len() as u64,
            &plan,
            Utc::now(),
        )?;
        log.events.extend(prepared.events);
        log.snapshot_pins.extend(plan.snapshot_pins);
        Ok(prepared.outcome)
    }

    async fn load_log(&self, session_id: &SessionId) -> Result<SessionLog, EventLogError> {
        Ok(self.sessions.lock().unwrap().get(session_id).cloned().unwrap_or_default())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionId>, EventLogError> {
        let mut ids: Vec<SessionId> = self.sessions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FlagLease(Arc<AtomicBool>);

impl LockLease for FlagLease {
    fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Grants every lock immediately; `set_healthy(false)` poisons new and
/// outstanding leases.
#[derive(Debug)]
pub struct FakeLocks {
    healthy: Arc<AtomicBool>,
}

impl Default for FakeLocks {
    fn default() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl FakeLocks {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

impl SessionLockManager for FakeLocks {
    async fn acquire(&self, session_id: &SessionId, _timeout: Duration) -> Result<SessionLockWitness, LockError> {
        Ok(SessionLockWitness::new(
            session_id.clone(),
            "fake-lease",
            Box::new(FlagLease(Arc::clone(&self.healthy))),
        ))
    }
}

// ---------------------------------------------------------------------------
// Reader and validator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeWorkflows {
    definitions: Mutex<HashMap<String, WorkflowDefinition>>,
}

impl FakeWorkflows {
    pub fn with(definition: WorkflowDefinition) -> Self {
        let reader = Self::default();
        reader.insert(definition);
        reader
    }

    pub fn insert(&self, definition: WorkflowDefinition) {
        self.definitions
            .lock()
            .unwrap()
            .insert(definition.id.clone(), definition);
    }
}

impl WorkflowReader for FakeWorkflows {
    async fn get_workflow_by_id(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.lock().unwrap().get(id).cloned())
    }

    async fn list_summaries(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let mut summaries: Vec<WorkflowSummary> =
            self.definitions.lock().unwrap().values().map(WorkflowSummary::from).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }
}

/// Requires every contract field to be present and non-null.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldsValidator;

impl OutputValidator for FieldsValidator {
    fn validate(&self, output: &Value, contract: &OutputContract, _context: Option<&Value>) -> ValidationReport {
        let issues: Vec<ValidationIssue> = contract
            .required_fields
            .iter()
            .filter(|field| output.get(field.as_str()).is_none_or(Value::is_null))
            .map(|field| ValidationIssue {
                message: format!("missing field '{field}'"),
                field: Some(field.clone()),
            })
            .collect();
        ValidationReport {
            valid: issues.is_empty(),
            issues,
            ..ValidationReport::default()
        }
    }
}
