//! Branded identifiers for the durable execution core.
//!
//! Every id is an opaque string `<prefix>_<26 lowercase base32 chars>` backed
//! by exactly 16 bytes. The prefixes are part of the wire contract and the
//! binary form is what token payloads carry, so each type can only be built
//! through a validating constructor and always round-trips:
//! `SessionId::from_bytes(id.to_bytes()) == id`.
//!
//! Content digests (`WorkflowHash`, `SnapshotRef`) use a different form,
//! `sha256:<64 lowercase hex>`, because they carry a full 32-byte digest.

use std::fmt;
use std::str::FromStr;

use data_encoding::Encoding;
use data_encoding_macro::new_encoding;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lowercase RFC 4648 base32 without padding, used for id bodies and token
/// strings. Non-zero trailing bits are rejected, so every byte string has
/// exactly one accepted text form.
pub const BASE32_LOWER: Encoding = new_encoding! {
    symbols: "abcdefghijklmnopqrstuvwxyz234567",
};

/// Number of bytes behind every branded id.
pub const ID_BYTES: usize = 16;

/// Length of the base32 body of a branded id.
pub const ID_BODY_LEN: usize = 26;

/// Number of bytes in a SHA-256 digest.
pub const DIGEST_BYTES: usize = 32;

/// Errors raised while parsing ids and digests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("expected id prefix '{expected}', got '{actual}'")]
    WrongPrefix { expected: String, actual: String },

    #[error("id body must be {ID_BODY_LEN} chars of [a-z2-7], got '{0}'")]
    InvalidBody(String),

    #[error("invalid content digest: {0}")]
    InvalidDigest(String),
}

impl IdError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            IdError::WrongPrefix { .. } => "ID_WRONG_PREFIX",
            IdError::InvalidBody(_) => "ID_INVALID_FORMAT",
            IdError::InvalidDigest(_) => "DIGEST_INVALID_FORMAT",
        }
    }
}

/// Validate the `<prefix><body>` form and decode the body to bytes.
fn decode_branded(prefix: &str, value: &str) -> Result<[u8; ID_BYTES], IdError> {
    let body = value.strip_prefix(prefix).ok_or_else(|| IdError::WrongPrefix {
        expected: prefix.to_string(),
        actual: value
            .split_once('_')
            .map(|(p, _)| format!("{p}_"))
            .unwrap_or_else(|| value.to_string()),
    })?;

    if body.len() != ID_BODY_LEN {
        return Err(IdError::InvalidBody(body.to_string()));
    }

    let decoded = BASE32_LOWER
        .decode(body.as_bytes())
        .map_err(|_| IdError::InvalidBody(body.to_string()))?;
    decoded
        .try_into()
        .map_err(|_| IdError::InvalidBody(body.to_string()))
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name {
            text: String,
            bytes: [u8; ID_BYTES],
        }

        impl $name {
            /// Wire prefix, including the trailing underscore.
            pub const PREFIX: &'static str = $prefix;

            /// Parse and validate the string form.
            pub fn parse(value: &str) -> Result<Self, IdError> {
                let bytes = decode_branded(Self::PREFIX, value)?;
                Ok(Self {
                    text: value.to_string(),
                    bytes,
                })
            }

            /// Build from the fixed 16-byte binary form.
            pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
                Self {
                    text: format!("{}{}", Self::PREFIX, BASE32_LOWER.encode(&bytes)),
                    bytes,
                }
            }

            /// Generate a fresh, time-sortable id (UUID v7 entropy).
            pub fn generate() -> Self {
                Self::from_bytes(*Uuid::now_v7().as_bytes())
            }

            /// The fixed 16-byte binary form.
            pub fn to_bytes(&self) -> [u8; ID_BYTES] {
                self.bytes
            }

            pub fn as_str(&self) -> &str {
                &self.text
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.text)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.text)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.text
            }
        }
    };
}

branded_id!(
    /// Identifies one execution session (one event log).
    SessionId,
    "sess_"
);
branded_id!(
    /// Identifies one run of a workflow inside a session.
    RunId,
    "run_"
);
branded_id!(
    /// Identifies one point in a run's execution graph.
    NodeId,
    "node_"
);
branded_id!(
    /// Identifies one authorised attempt to advance (or checkpoint) a node.
    AttemptId,
    "attempt_"
);
branded_id!(
    /// Short reference to a [`WorkflowHash`]: the first 16 digest bytes.
    WorkflowHashRef,
    "wf_"
);

/// Parse `sha256:<64 hex>` into raw digest bytes.
fn decode_digest(value: &str) -> Result<[u8; DIGEST_BYTES], IdError> {
    let body = value
        .strip_prefix("sha256:")
        .ok_or_else(|| IdError::InvalidDigest(value.to_string()))?;
    if body.len() != DIGEST_BYTES * 2 || body.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(IdError::InvalidDigest(value.to_string()));
    }
    let mut digest = [0u8; DIGEST_BYTES];
    hex::decode_to_slice(body, &mut digest).map_err(|e| IdError::InvalidDigest(format!("{value}: {e}")))?;
    Ok(digest)
}

macro_rules! digest_ref {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Build from a raw SHA-256 digest.
            pub fn from_digest(digest: [u8; DIGEST_BYTES]) -> Self {
                Self(format!("sha256:{}", hex::encode(digest)))
            }

            /// Parse and validate the `sha256:<hex>` form.
            pub fn parse(value: &str) -> Result<Self, IdError> {
                decode_digest(value)?;
                Ok(Self(value.to_string()))
            }

            /// Raw digest bytes.
            pub fn digest(&self) -> [u8; DIGEST_BYTES] {
                decode_digest(&self.0).unwrap_or([0u8; DIGEST_BYTES])
            }

            /// Lowercase hex of the digest (no algorithm prefix).
            pub fn hex(&self) -> &str {
                &self.0["sha256:".len()..]
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.0
            }
        }
    };
}

digest_ref!(
    /// Content hash of a compiled workflow's canonical definition.
    WorkflowHash
);
digest_ref!(
    /// Content address of a serialized execution snapshot.
    SnapshotRef
);

impl WorkflowHash {
    /// Derive the short reference carried inside state tokens.
    ///
    /// The reference is the first 16 bytes of the digest, so two workflows
    /// share a reference only if their hashes share a 128-bit prefix.
    pub fn to_ref(&self) -> WorkflowHashRef {
        let digest = self.digest();
        let mut short = [0u8; ID_BYTES];
        short.copy_from_slice(&digest[..ID_BYTES]);
        WorkflowHashRef::from_bytes(short)
    }
}
