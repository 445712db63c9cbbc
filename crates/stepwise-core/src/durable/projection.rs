//! Session truth: the pure fold of a session's event log.
//!
//! Current state is never stored; it is always derived by replaying the
//! ordered events. The fold is deterministic and rejects logs that reference
//! runs or nodes that were never created.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use stepwise_types::event::{
    AdvanceOutcome, Blocker, EdgeCause, ExecutionPreferences, GapRecord, NodeKind, SessionEvent,
    SessionEventData,
};
use stepwise_types::ids::{AttemptId, NodeId, RunId, SessionId, SnapshotRef, WorkflowHash, WorkflowHashRef};
use thiserror::Error;

use super::log::SessionLog;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("inconsistent event {event_index}: {message}")]
pub struct ProjectionError {
    pub session_id: SessionId,
    pub event_index: u64,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunTruth {
    pub run_id: RunId,
    pub workflow_id: String,
    pub workflow_hash: WorkflowHash,
    pub workflow_hash_ref: WorkflowHashRef,
    pub root_node_id: Option<NodeId>,
    /// Most recently created step node of the run.
    pub tip_node_id: Option<NodeId>,
    pub node_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub kind: NodeKind,
    pub parent_node_id: Option<NodeId>,
    pub snapshot_ref: SnapshotRef,
    pub dedupe_key: String,
    pub event_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeRecord {
    pub run_id: RunId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub cause: EdgeCause,
    pub event_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdvanceRecord {
    pub run_id: RunId,
    pub from_node_id: NodeId,
    pub attempt_id: AttemptId,
    pub outcome: AdvanceOutcome,
    pub event_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockedAttemptRecord {
    pub run_id: RunId,
    pub from_node_id: NodeId,
    pub attempt_id: AttemptId,
    pub blocked_node_id: NodeId,
    pub blockers: Vec<Blocker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GapEntry {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub gap: GapRecord,
    pub event_index: u64,
}

// ---------------------------------------------------------------------------
// SessionTruth
// ---------------------------------------------------------------------------

/// Everything known about a session, derived from its log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionTruth {
    pub session_id: SessionId,
    pub workflow_id: Option<String>,
    /// Index the next appended event will receive.
    pub next_event_index: u64,
    pub preferences: ExecutionPreferences,
    pub runs: BTreeMap<RunId, RunTruth>,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    pub edges: Vec<EdgeRecord>,
    pub advances: Vec<AdvanceRecord>,
    pub blocked_attempts: Vec<BlockedAttemptRecord>,
    pub gaps: Vec<GapEntry>,
    pub snapshot_pins: BTreeSet<SnapshotRef>,
    #[serde(skip)]
    pub dedupe_keys: HashSet<String>,
}

impl SessionTruth {
    pub fn empty(session_id: &SessionId) -> Self {
        Self {
            session_id: session_id.clone(),
            workflow_id: None,
            next_event_index: 0,
            preferences: ExecutionPreferences::default(),
            runs: BTreeMap::new(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            advances: Vec::new(),
            blocked_attempts: Vec::new(),
            gaps: Vec::new(),
            snapshot_pins: BTreeSet::new(),
            dedupe_keys: HashSet::new(),
        }
    }

    /// Fold a loaded log into truth.
    pub fn project(session_id: &SessionId, log: &SessionLog) -> Result<Self, ProjectionError> {
        let mut truth = Self::empty(session_id);
        for event in &log.events {
            truth.apply(event)?;
        }
        truth.snapshot_pins = log.snapshot_pins.clone();
        Ok(truth)
    }

    fn apply(&mut self, event: &SessionEvent) -> Result<(), ProjectionError> {
        let session_id = self.session_id.clone();
        let event_index = event.event_index;
        let fail = move |message: String| ProjectionError {
            session_id: session_id.clone(),
            event_index,
            message,
        };

        match &event.data {
            SessionEventData::SessionCreated { workflow_id } => {
                self.workflow_id = Some(workflow_id.clone());
            }
            SessionEventData::RunStarted {
                run_id,
                workflow_id,
                workflow_hash,
                workflow_hash_ref,
            } => {
                if self.runs.contains_key(run_id) {
                    return Err(fail(format!("run {run_id} started twice")));
                }
                self.runs.insert(
                    run_id.clone(),
                    RunTruth {
                        run_id: run_id.clone(),
                        workflow_id: workflow_id.clone(),
                        workflow_hash: workflow_hash.clone(),
                        workflow_hash_ref: workflow_hash_ref.clone(),
                        root_node_id: None,
                        tip_node_id: None,
                        node_count: 0,
                    },
                );
            }
            SessionEventData::NodeCreated {
                run_id,
                node_id,
                node_kind,
                parent_node_id,
                snapshot_ref,
            } => {
                if self.nodes.contains_key(node_id) {
                    return Err(fail(format!("node {node_id} created twice")));
                }
                if let Some(parent) = parent_node_id {
                    if !self.nodes.contains_key(parent) {
                        return Err(fail(format!("node {node_id} has unknown parent {parent}")));
                    }
                }
                let run = self
                    .runs
                    .get_mut(run_id)
                    .ok_or_else(|| fail(format!("node {node_id} belongs to unknown run {run_id}")))?;
                run.node_count += 1;
                if *node_kind == NodeKind::Step {
                    if run.root_node_id.is_none() {
                        run.root_node_id = Some(node_id.clone());
                    }
                    run.tip_node_id = Some(node_id.clone());
                }
                self.nodes.insert(
                    node_id.clone(),
                    NodeRecord {
                        node_id: node_id.clone(),
                        run_id: run_id.clone(),
                        kind: *node_kind,
                        parent_node_id: parent_node_id.clone(),
                        snapshot_ref: snapshot_ref.clone(),
                        dedupe_key: event.dedupe_key.clone(),
                        event_index: event.event_index,
                    },
                );
            }
            SessionEventData::EdgeCreated {
                run_id,
                from_node_id,
                to_node_id,
                cause,
            } => {
                for node in [from_node_id, to_node_id] {
                    if !self.nodes.contains_key(node) {
                        return Err(fail(format!("edge references unknown node {node}")));
                    }
                }
                self.edges.push(EdgeRecord {
                    run_id: run_id.clone(),
                    from_node_id: from_node_id.clone(),
                    to_node_id: to_node_id.clone(),
                    cause: *cause,
                    event_index: event.event_index,
                });
            }
            SessionEventData::AdvanceRecorded {
                run_id,
                from_node_id,
                attempt_id,
                outcome,
            } => {
                if !self.nodes.contains_key(from_node_id) {
                    return Err(fail(format!("advance from unknown node {from_node_id}")));
                }
                self.advances.push(AdvanceRecord {
                    run_id: run_id.clone(),
                    from_node_id: from_node_id.clone(),
                    attempt_id: attempt_id.clone(),
                    outcome: outcome.clone(),
                    event_index: event.event_index,
                });
            }
            SessionEventData::PreferencesChanged { preferences } => {
                self.preferences = preferences.clone();
            }
            SessionEventData::GapRecorded { run_id, node_id, gap } => {
                self.gaps.push(GapEntry {
                    run_id: run_id.clone(),
                    node_id: node_id.clone(),
                    gap: gap.clone(),
                    event_index: event.event_index,
                });
            }
            SessionEventData::BlockedAttempt {
                run_id,
                from_node_id,
                attempt_id,
                blocked_node_id,
                blockers,
            } => {
                self.blocked_attempts.push(BlockedAttemptRecord {
                    run_id: run_id.clone(),
                    from_node_id: from_node_id.clone(),
                    attempt_id: attempt_id.clone(),
                    blocked_node_id: blocked_node_id.clone(),
                    blockers: blockers.clone(),
                });
            }
        }

        self.dedupe_keys.insert(event.dedupe_key.clone());
        self.next_event_index = event.event_index + 1;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Whether the session has any events at all.
    pub fn exists(&self) -> bool {
        self.next_event_index > 0
    }

    pub fn run(&self, run_id: &RunId) -> Option<&RunTruth> {
        self.runs.get(run_id)
    }

    pub fn node(&self, node_id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn contains_key(&self, dedupe_key: &str) -> bool {
        self.dedupe_keys.contains(dedupe_key)
    }

    pub fn node_by_dedupe_key(&self, dedupe_key: &str) -> Option<&NodeRecord> {
        self.nodes.values().find(|node| node.dedupe_key == dedupe_key)
    }

    /// Edges leaving `node_id`, in log order.
    pub fn children(&self, node_id: &NodeId) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.iter().filter(move |edge| &edge.from_node_id == node_id)
    }

    /// Whether `node_id` already has an advance child, making any further
    /// advance from it a fork. Checkpoint edges do not count.
    pub fn has_advance_children(&self, node_id: &NodeId) -> bool {
        self.children(node_id).any(|edge| edge.cause.is_advance())
    }

    /// Advance attempts recorded from `node_id`, in log order.
    pub fn advances_from(&self, node_id: &NodeId) -> impl Iterator<Item = &AdvanceRecord> {
        self.advances.iter().filter(move |rec| &rec.from_node_id == node_id)
    }

    /// Number of advance attempts recorded from `node_id`.
    pub fn advance_count(&self, node_id: &NodeId) -> u32 {
        self.advances_from(node_id).count() as u32
    }

    /// The recorded outcome of one attempt and its position among the
    /// node's attempts.
    pub fn recorded_advance(&self, node_id: &NodeId, attempt_id: &AttemptId) -> Option<(u32, &AdvanceRecord)> {
        self.advances_from(node_id)
            .enumerate()
            .find(|(_, rec)| &rec.attempt_id == attempt_id)
            .map(|(i, rec)| (i as u32, rec))
    }

    pub fn blocked_attempt(&self, node_id: &NodeId, attempt_id: &AttemptId) -> Option<&BlockedAttemptRecord> {
        self.blocked_attempts
            .iter()
            .find(|rec| &rec.from_node_id == node_id && &rec.attempt_id == attempt_id)
    }

    /// Step nodes of `run_id` without advance children.
    pub fn tips(&self, run_id: &RunId) -> Vec<&NodeId> {
        self.nodes
            .values()
            .filter(|node| &node.run_id == run_id && node.kind == NodeKind::Step)
            .filter(|node| !self.has_advance_children(&node.node_id))
            .map(|node| &node.node_id)
            .collect()
    }

    /// Number of `preferences_changed` events seen.
    pub fn preference_changes(&self) -> usize {
        self.dedupe_keys.iter().filter(|key| key.starts_with("prefs:")).count()
    }
}
