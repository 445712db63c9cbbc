//! Capability token payloads.
//!
//! Tokens are the only state a client holds between calls. All three kinds
//! share one 66-byte little-endian layout:
//!
//! | bytes  | field                                         |
//! |--------|-----------------------------------------------|
//! | 0      | version (always 1)                            |
//! | 1      | kind discriminator                            |
//! | 2..18  | session id                                    |
//! | 18..34 | run id                                        |
//! | 34..50 | node id                                       |
//! | 50..66 | workflow hash ref (state) or attempt id (ack/checkpoint) |
//!
//! Packing, signing and the string envelope live in `stepwise-core`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AttemptId, NodeId, RunId, SessionId, WorkflowHashRef};

/// Current payload version.
pub const TOKEN_VERSION: u8 = 1;

/// Exact payload length in bytes.
pub const TOKEN_PAYLOAD_LEN: usize = 66;

/// HMAC-SHA256 tag length in bytes.
pub const TOKEN_SIGNATURE_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    State,
    Ack,
    Checkpoint,
}

impl TokenKind {
    pub fn discriminator(self) -> u8 {
        match self {
            TokenKind::State => 0,
            TokenKind::Ack => 1,
            TokenKind::Checkpoint => 2,
        }
    }

    pub fn from_discriminator(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TokenKind::State),
            1 => Some(TokenKind::Ack),
            2 => Some(TokenKind::Checkpoint),
            _ => None,
        }
    }

    /// Human-readable prefix of the string envelope.
    pub fn envelope_prefix(self) -> &'static str {
        match self {
            TokenKind::State => "st1",
            TokenKind::Ack => "ack1",
            TokenKind::Checkpoint => "chk1",
        }
    }
}

/// Scope shared by every token kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenScope {
    pub session_id: SessionId,
    pub run_id: RunId,
    pub node_id: NodeId,
}

/// Decoded payload of a state token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateTokenPayload {
    pub scope: TokenScope,
    pub workflow_hash_ref: WorkflowHashRef,
}

/// Decoded payload of an ack or checkpoint token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptTokenPayload {
    pub scope: TokenScope,
    pub attempt_id: AttemptId,
}

/// Any decoded payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenPayload {
    State(StateTokenPayload),
    Ack(AttemptTokenPayload),
    Checkpoint(AttemptTokenPayload),
}

impl TokenPayload {
    pub fn kind(&self) -> TokenKind {
        match self {
            TokenPayload::State(_) => TokenKind::State,
            TokenPayload::Ack(_) => TokenKind::Ack,
            TokenPayload::Checkpoint(_) => TokenKind::Checkpoint,
        }
    }

    pub fn scope(&self) -> &TokenScope {
        match self {
            TokenPayload::State(p) => &p.scope,
            TokenPayload::Ack(p) | TokenPayload::Checkpoint(p) => &p.scope,
        }
    }
}

/// Structured token failures; one variant per cause.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token envelope is malformed: {0}")]
    InvalidEnvelope(String),

    #[error("token payload must be {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("unsupported token version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown token kind discriminator {0}")]
    UnknownKind(u8),

    #[error("expected a {expected:?} token, got {actual:?}")]
    KindMismatch { expected: TokenKind, actual: TokenKind },

    #[error("token signature does not verify")]
    SignatureMismatch,

    #[error("token scope mismatch on '{field}'")]
    ScopeMismatch { field: &'static str },
}

impl TokenError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::InvalidEnvelope(_) => "TOKEN_INVALID_FORMAT",
            TokenError::BadLength { .. } => "TOKEN_BAD_LENGTH",
            TokenError::UnsupportedVersion(_) => "TOKEN_UNSUPPORTED_VERSION",
            TokenError::UnknownKind(_) => "TOKEN_UNKNOWN_KIND",
            TokenError::KindMismatch { .. } => "TOKEN_KIND_MISMATCH",
            TokenError::SignatureMismatch => "TOKEN_BAD_SIGNATURE",
            TokenError::ScopeMismatch { .. } => "TOKEN_SCOPE_MISMATCH",
        }
    }
}
