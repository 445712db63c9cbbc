//! Request and response shapes of the engine operations.
//!
//! Responses carry only data that is a function of durable truth at the
//! responding node, so a replayed `continue` serializes byte-identically to
//! the original.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stepwise_types::event::{Blocker, ExecutionPreferences};
use stepwise_types::execution::StepInstanceId;
use stepwise_types::ids::{NodeId, RunId, SessionId};

use crate::workflow::interpreter::PendingStep;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub workflow_id: String,
    /// Initial execution context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    /// Preferences pinned for the session; engine defaults otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<ExecutionPreferences>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinueRequest {
    pub state_token: String,
    /// Present to advance; absent to rehydrate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
    /// The step instance the caller believes it completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_step: Option<StepInstanceId>,
    /// Output reported for the completed step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Context updates merged before resolving the next step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    /// Free-text note from the user; logged, never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRequest {
    pub checkpoint_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesRequest {
    pub state_token: String,
    pub preferences: ExecutionPreferences,
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Position of a client after `start` or a successful `continue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub state_token: String,
    /// Absent once the workflow is complete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_token: Option<String>,
    pub checkpoint_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStep>,
    pub is_complete: bool,
}

/// An advance rejected by an output contract under the guided policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedResponse {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub blocked_node_id: NodeId,
    pub blockers: Vec<Blocker>,
    /// Unchanged state token for the node that stays current.
    pub state_token: String,
    /// Ack token authorising the next attempt from the same node.
    pub retry_ack_token: String,
    pub checkpoint_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingStep>,
}

/// Result of `continue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContinueOutcome {
    Ok(StepResponse),
    Blocked(BlockedResponse),
}

impl ContinueOutcome {
    pub fn is_blocked(&self) -> bool {
        matches!(self, ContinueOutcome::Blocked(_))
    }

    pub fn step(&self) -> Option<&StepResponse> {
        match self {
            ContinueOutcome::Ok(step) => Some(step),
            ContinueOutcome::Blocked(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointResponse {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
    pub checkpoint_node_id: NodeId,
    /// State token of the checkpointed node, for resuming from it.
    pub state_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesResponse {
    pub session_id: SessionId,
    pub preferences: ExecutionPreferences,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continue_outcome_is_kind_tagged() {
        let outcome = ContinueOutcome::Ok(StepResponse {
            session_id: SessionId::from_bytes([1; 16]),
            run_id: RunId::from_bytes([2; 16]),
            node_id: NodeId::from_bytes([3; 16]),
            state_token: "st1x".into(),
            ack_token: None,
            checkpoint_token: "chk1x".into(),
            pending: None,
            is_complete: true,
        });
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["kind"], "ok");
        assert_eq!(value["is_complete"], true);
        assert!(value.get("ack_token").is_none());
        assert!(!outcome.is_blocked());
    }

    #[test]
    fn continue_request_defaults() {
        let request: ContinueRequest = serde_json::from_str(r#"{ "state_token": "st1x" }"#).unwrap();
        assert!(request.ack_token.is_none());
        assert!(request.completed_step.is_none());
    }
}
