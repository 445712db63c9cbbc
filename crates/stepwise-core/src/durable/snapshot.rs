//! Content-addressed execution snapshots.
//!
//! A snapshot is the interpreter state plus the execution context at one
//! node. It is serialized as canonical JSON and addressed by the SHA-256 of
//! those bytes, so identical states share storage and every read can be
//! integrity-checked against its address.

use serde::{Deserialize, Serialize};
use stepwise_types::execution::ExecutionState;
use stepwise_types::ids::SnapshotRef;
use thiserror::Error;

use crate::service::crypto::CryptoPort;
use crate::workflow::compiler::canonical_json;
use crate::workflow::context::ExecutionContext;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub version: u32,
    pub state: ExecutionState,
    #[serde(default)]
    pub context: ExecutionContext,
}

impl ExecutionSnapshot {
    pub fn new(state: ExecutionState, context: ExecutionContext) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            state,
            context,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot {0} not found")]
    NotFound(SnapshotRef),

    #[error("snapshot integrity check failed: expected {expected}, content hashes to {actual}")]
    IntegrityMismatch {
        expected: SnapshotRef,
        actual: SnapshotRef,
    },

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot serialization error: {0}")]
    Serialization(String),

    #[error("snapshot storage error: {0}")]
    Storage(String),
}

/// Byte-level content-addressed store.
///
/// `put` is idempotent: writing bytes under an address that already exists
/// is a no-op.
pub trait SnapshotStore: Send + Sync {
    fn put(
        &self,
        snapshot_ref: &SnapshotRef,
        bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<(), SnapshotError>> + Send;

    fn get(
        &self,
        snapshot_ref: &SnapshotRef,
    ) -> impl std::future::Future<Output = Result<Option<Vec<u8>>, SnapshotError>> + Send;
}

/// Serialize a snapshot canonically and compute its address.
pub fn encode_snapshot<C: CryptoPort + ?Sized>(
    crypto: &C,
    snapshot: &ExecutionSnapshot,
) -> Result<(SnapshotRef, Vec<u8>), SnapshotError> {
    let value = serde_json::to_value(snapshot).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
    let bytes = canonical_json(&value).into_bytes();
    let snapshot_ref = SnapshotRef::from_digest(crypto.sha256(&bytes));
    Ok((snapshot_ref, bytes))
}

/// Verify bytes against their address and deserialize them.
pub fn decode_snapshot<C: CryptoPort + ?Sized>(
    crypto: &C,
    expected: &SnapshotRef,
    bytes: &[u8],
) -> Result<ExecutionSnapshot, SnapshotError> {
    let actual = SnapshotRef::from_digest(crypto.sha256(bytes));
    if &actual != expected {
        return Err(SnapshotError::IntegrityMismatch {
            expected: expected.clone(),
            actual,
        });
    }
    let snapshot: ExecutionSnapshot =
        serde_json::from_slice(bytes).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(SnapshotError::UnsupportedVersion(snapshot.version));
    }
    Ok(snapshot)
}

/// Encode and store a snapshot, returning its address.
pub async fn put_snapshot<S, C>(store: &S, crypto: &C, snapshot: &ExecutionSnapshot) -> Result<SnapshotRef, SnapshotError>
where
    S: SnapshotStore + ?Sized,
    C: CryptoPort + ?Sized,
{
    let (snapshot_ref, bytes) = encode_snapshot(crypto, snapshot)?;
    store.put(&snapshot_ref, &bytes).await?;
    Ok(snapshot_ref)
}

/// Load and verify a snapshot. Missing snapshots are an error.
pub async fn load_snapshot<S, C>(store: &S, crypto: &C, snapshot_ref: &SnapshotRef) -> Result<ExecutionSnapshot, SnapshotError>
where
    S: SnapshotStore + ?Sized,
    C: CryptoPort + ?Sized,
{
    let bytes = store
        .get(snapshot_ref)
        .await?
        .ok_or_else(|| SnapshotError::NotFound(snapshot_ref.clone()))?;
    decode_snapshot(crypto, snapshot_ref, &bytes)
}
