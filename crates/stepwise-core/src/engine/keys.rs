//! Deterministic dedupe keys and attempt ids.
//!
//! Every event the engine appends carries a dedupe key derived only from
//! ids already fixed by the request, so a retried call produces the same
//! keys and the log skips it.

use stepwise_types::ids::{AttemptId, NodeId, RunId, SessionId, ID_BYTES};

use crate::service::crypto::CryptoPort;

const ATTEMPT_DOMAIN: &[u8] = b"attempt";

/// The attempt id authorised for the `ordinal`-th advance from `node_id`.
///
/// `attempt_` + base32(sha256("attempt" || node bytes || ordinal as u32 LE)[..16]).
pub fn derive_attempt_id<C: CryptoPort + ?Sized>(crypto: &C, node_id: &NodeId, ordinal: u32) -> AttemptId {
    let mut input = Vec::with_capacity(ATTEMPT_DOMAIN.len() + ID_BYTES + 4);
    input.extend_from_slice(ATTEMPT_DOMAIN);
    input.extend_from_slice(&node_id.to_bytes());
    input.extend_from_slice(&ordinal.to_le_bytes());
    let digest = crypto.sha256(&input);

    let mut bytes = [0u8; ID_BYTES];
    bytes.copy_from_slice(&digest[..ID_BYTES]);
    AttemptId::from_bytes(bytes)
}

pub fn session_created(session_id: &SessionId) -> String {
    format!("session_created:{session_id}")
}

pub fn run_started(session_id: &SessionId, run_id: &RunId) -> String {
    format!("run_started:{session_id}:{run_id}")
}

pub fn node_created(session_id: &SessionId, node_id: &NodeId) -> String {
    format!("node_created:{session_id}:{node_id}")
}

pub fn edge_created(session_id: &SessionId, from: &NodeId, to: &NodeId) -> String {
    format!("edge_created:{session_id}:{from}:{to}")
}

pub fn advance_recorded(session_id: &SessionId, node_id: &NodeId, attempt_id: &AttemptId) -> String {
    format!("advance_recorded:{session_id}:{node_id}:{attempt_id}")
}

pub fn blocked_attempt(session_id: &SessionId, node_id: &NodeId, attempt_id: &AttemptId) -> String {
    format!("blocked_attempt:{session_id}:{node_id}:{attempt_id}")
}

pub fn gap_recorded(session_id: &SessionId, node_id: &NodeId, attempt_id: &AttemptId) -> String {
    format!("gap_recorded:{session_id}:{node_id}:{attempt_id}")
}

/// Key of the checkpoint node recorded for one checkpoint token.
pub fn checkpoint(session_id: &SessionId, node_id: &NodeId, attempt_id: &AttemptId) -> String {
    format!("checkpoint:{session_id}:{node_id}:{attempt_id}")
}

pub fn checkpoint_edge(session_id: &SessionId, node_id: &NodeId, attempt_id: &AttemptId) -> String {
    format!("checkpoint_edge:{session_id}:{node_id}:{attempt_id}")
}

/// `ordinal` counts earlier preference changes in the session.
pub fn preferences_changed(session_id: &SessionId, ordinal: usize) -> String {
    format!("prefs:{session_id}:{ordinal}")
}
