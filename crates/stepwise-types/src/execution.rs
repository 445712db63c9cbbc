//! Interpreter state types.
//!
//! `ExecutionState` is immutable and produced only by the step-resolution
//! interpreter. Because a step id repeats across loop iterations, each
//! occurrence is identified by a `StepInstanceId` whose canonical string form
//! (`StepInstanceKey`) is what the completed set stores.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Step instances
// ---------------------------------------------------------------------------

/// One enclosing loop iteration on the path to a step instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoopPathEntry {
    pub loop_id: String,
    pub iteration: u32,
}

/// Identity of one occurrence of a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepInstanceId {
    pub step_id: String,
    /// Outermost loop first; empty for top-level steps.
    #[serde(default)]
    pub loop_path: Vec<LoopPathEntry>,
}

impl StepInstanceId {
    pub fn top_level(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            loop_path: Vec::new(),
        }
    }

    /// Canonical key: `loopId@iter/loopId@iter::stepId`, or `stepId` alone.
    pub fn key(&self) -> StepInstanceKey {
        if self.loop_path.is_empty() {
            return StepInstanceKey(self.step_id.clone());
        }
        let path = self
            .loop_path
            .iter()
            .map(|entry| format!("{}@{}", entry.loop_id, entry.iteration))
            .collect::<Vec<_>>()
            .join("/");
        StepInstanceKey(format!("{path}::{}", self.step_id))
    }
}

/// Canonical string form of a [`StepInstanceId`].
///
/// Two instances are the same step occurrence iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepInstanceKey(String);

impl StepInstanceKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Loop frames
// ---------------------------------------------------------------------------

/// Position inside an active loop.
///
/// Invariant: `iteration < max_iterations` of the loop for every frame on
/// the stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopFrame {
    pub loop_id: String,
    /// 0-based iteration number.
    pub iteration: u32,
    /// 0-based index of the body step currently being resolved.
    pub body_index: usize,
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Progress of one run through a compiled workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionState {
    /// No steps attempted yet.
    Init,
    /// At least one step resolved.
    Running {
        completed: BTreeSet<StepInstanceKey>,
        /// Outermost loop first.
        loop_stack: Vec<LoopFrame>,
        /// When present, the client must complete exactly this instance
        /// before progress continues.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pending_step: Option<StepInstanceId>,
    },
    /// Terminal.
    Complete,
}

impl ExecutionState {
    pub fn is_complete(&self) -> bool {
        matches!(self, ExecutionState::Complete)
    }

    pub fn pending_step(&self) -> Option<&StepInstanceId> {
        match self {
            ExecutionState::Running { pending_step, .. } => pending_step.as_ref(),
            _ => None,
        }
    }

    /// Number of completed step instances.
    pub fn completed_count(&self) -> usize {
        match self {
            ExecutionState::Running { completed, .. } => completed.len(),
            _ => 0,
        }
    }
}

/// The only input event the interpreter accepts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StepCompleted { step_instance_id: StepInstanceId },
}

impl WorkflowEvent {
    pub fn step_completed(step_instance_id: StepInstanceId) -> Self {
        WorkflowEvent::StepCompleted { step_instance_id }
    }
}
