//! Session event log types.
//!
//! A session's durable truth is an append-only, ordered list of
//! `SessionEvent`s. Events are never mutated or deleted; current state is
//! always derived by folding the list. Each event carries a dedupe key that
//! is unique within the session, which is what makes appends idempotent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AttemptId, NodeId, RunId, SessionId, SnapshotRef, WorkflowHash, WorkflowHashRef};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    /// Monotonically increasing, starting at 0, gap-free within a session.
    pub event_index: u64,
    pub session_id: SessionId,
    /// Unique within the session.
    pub dedupe_key: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: SessionEventData,
}

/// An event the caller wants appended; the log assigns index and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSessionEvent {
    pub dedupe_key: String,
    #[serde(flatten)]
    pub data: SessionEventData,
}

impl NewSessionEvent {
    pub fn new(dedupe_key: impl Into<String>, data: SessionEventData) -> Self {
        Self {
            dedupe_key: dedupe_key.into(),
            data,
        }
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SessionEventData {
    SessionCreated {
        workflow_id: String,
    },
    RunStarted {
        run_id: RunId,
        workflow_id: String,
        workflow_hash: WorkflowHash,
        workflow_hash_ref: WorkflowHashRef,
    },
    NodeCreated {
        run_id: RunId,
        node_id: NodeId,
        node_kind: NodeKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_node_id: Option<NodeId>,
        snapshot_ref: SnapshotRef,
    },
    AdvanceRecorded {
        run_id: RunId,
        from_node_id: NodeId,
        attempt_id: AttemptId,
        outcome: AdvanceOutcome,
    },
    EdgeCreated {
        run_id: RunId,
        from_node_id: NodeId,
        to_node_id: NodeId,
        cause: EdgeCause,
    },
    PreferencesChanged {
        preferences: ExecutionPreferences,
    },
    GapRecorded {
        run_id: RunId,
        node_id: NodeId,
        gap: GapRecord,
    },
    BlockedAttempt {
        run_id: RunId,
        from_node_id: NodeId,
        attempt_id: AttemptId,
        blocked_node_id: NodeId,
        blockers: Vec<Blocker>,
    },
}

impl SessionEventData {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEventData::SessionCreated { .. } => "session_created",
            SessionEventData::RunStarted { .. } => "run_started",
            SessionEventData::NodeCreated { .. } => "node_created",
            SessionEventData::AdvanceRecorded { .. } => "advance_recorded",
            SessionEventData::EdgeCreated { .. } => "edge_created",
            SessionEventData::PreferencesChanged { .. } => "preferences_changed",
            SessionEventData::GapRecorded { .. } => "gap_recorded",
            SessionEventData::BlockedAttempt { .. } => "blocked_attempt",
        }
    }
}

// ---------------------------------------------------------------------------
// Graph vocabulary
// ---------------------------------------------------------------------------

/// What a node in the execution graph represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A resolved interpreter state (pending step or completion).
    Step,
    /// A rejected advance; never becomes a run tip.
    BlockedAttempt,
    /// A client-requested checkpoint sharing its parent's snapshot.
    Checkpoint,
}

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCause {
    /// Advance from a node that had no advance children yet.
    NormalAdvance,
    /// Advance from a node that already had an advance child (a fork).
    NonTipAdvance,
    /// Checkpoint recorded on a node; does not affect tip status.
    CheckpointCreated,
}

impl EdgeCause {
    /// Whether this edge counts as an advance for tip/fork purposes.
    pub fn is_advance(self) -> bool {
        matches!(self, EdgeCause::NormalAdvance | EdgeCause::NonTipAdvance)
    }
}

/// Recorded result of one advance attempt, used for idempotent replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    Advanced { to_node_id: NodeId },
    Blocked { blocked_node_id: NodeId },
}

// ---------------------------------------------------------------------------
// Preferences
// ---------------------------------------------------------------------------

/// How the engine reacts to output-contract violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Autonomy {
    /// Return a `blocked` outcome and do not advance.
    #[default]
    Guided,
    /// Record a gap and advance anyway.
    NeverStop,
}

/// Per-session execution preferences, pinned via `preferences_changed`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionPreferences {
    #[serde(default)]
    pub autonomy: Autonomy,
}

// ---------------------------------------------------------------------------
// Blockers and gaps
// ---------------------------------------------------------------------------

/// Machine-readable reason an advance was blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockerCode {
    /// The step has an output contract and no output was supplied.
    MissingRequiredOutput,
    /// Output was supplied but the validator rejected it.
    InvalidRequiredOutput,
}

/// Points into the contract that was violated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockerPointer {
    pub step_id: String,
    pub contract_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub code: BlockerCode,
    pub message: String,
    pub pointer: BlockerPointer,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

/// A contract violation accepted under the never-stop policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRecord {
    pub step_instance_key: String,
    pub blockers: Vec<Blocker>,
}
