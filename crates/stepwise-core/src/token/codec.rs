//! Fixed-layout binary codec for token payloads.
//!
//! See [`stepwise_types::token`] for the 66-byte layout. Packing takes
//! branded ids, whose prefix and base32 body are validated when they are
//! parsed, so a payload that reaches [`pack`] cannot carry a malformed id.

use stepwise_types::ids::{AttemptId, NodeId, RunId, SessionId, WorkflowHashRef, ID_BYTES};
use stepwise_types::token::{
    AttemptTokenPayload, StateTokenPayload, TokenError, TokenKind, TokenPayload, TokenScope,
    TOKEN_PAYLOAD_LEN, TOKEN_VERSION,
};

const SESSION_OFFSET: usize = 2;
const RUN_OFFSET: usize = SESSION_OFFSET + ID_BYTES;
const NODE_OFFSET: usize = RUN_OFFSET + ID_BYTES;
const TAIL_OFFSET: usize = NODE_OFFSET + ID_BYTES;

/// Encode a payload into its 66-byte binary form.
pub fn pack(payload: &TokenPayload) -> [u8; TOKEN_PAYLOAD_LEN] {
    let scope = payload.scope();
    let tail = match payload {
        TokenPayload::State(p) => p.workflow_hash_ref.to_bytes(),
        TokenPayload::Ack(p) | TokenPayload::Checkpoint(p) => p.attempt_id.to_bytes(),
    };

    let mut out = [0u8; TOKEN_PAYLOAD_LEN];
    out[0] = TOKEN_VERSION;
    out[1] = payload.kind().discriminator();
    out[SESSION_OFFSET..RUN_OFFSET].copy_from_slice(&scope.session_id.to_bytes());
    out[RUN_OFFSET..NODE_OFFSET].copy_from_slice(&scope.run_id.to_bytes());
    out[NODE_OFFSET..TAIL_OFFSET].copy_from_slice(&scope.node_id.to_bytes());
    out[TAIL_OFFSET..TOKEN_PAYLOAD_LEN].copy_from_slice(&tail);
    out
}

/// Decode a binary payload, validating length, version and kind.
pub fn unpack(bytes: &[u8]) -> Result<TokenPayload, TokenError> {
    if bytes.len() != TOKEN_PAYLOAD_LEN {
        return Err(TokenError::BadLength {
            expected: TOKEN_PAYLOAD_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != TOKEN_VERSION {
        return Err(TokenError::UnsupportedVersion(bytes[0]));
    }
    let kind = TokenKind::from_discriminator(bytes[1]).ok_or(TokenError::UnknownKind(bytes[1]))?;

    let scope = TokenScope {
        session_id: SessionId::from_bytes(id_bytes(bytes, SESSION_OFFSET)),
        run_id: RunId::from_bytes(id_bytes(bytes, RUN_OFFSET)),
        node_id: NodeId::from_bytes(id_bytes(bytes, NODE_OFFSET)),
    };
    let tail = id_bytes(bytes, TAIL_OFFSET);

    Ok(match kind {
        TokenKind::State => TokenPayload::State(StateTokenPayload {
            scope,
            workflow_hash_ref: WorkflowHashRef::from_bytes(tail),
        }),
        TokenKind::Ack => TokenPayload::Ack(AttemptTokenPayload {
            scope,
            attempt_id: AttemptId::from_bytes(tail),
        }),
        TokenKind::Checkpoint => TokenPayload::Checkpoint(AttemptTokenPayload {
            scope,
            attempt_id: AttemptId::from_bytes(tail),
        }),
    })
}

fn id_bytes(bytes: &[u8], offset: usize) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    out.copy_from_slice(&bytes[offset..offset + ID_BYTES]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scope(seed: u8) -> TokenScope {
        TokenScope {
            session_id: SessionId::from_bytes([seed; 16]),
            run_id: RunId::from_bytes([seed.wrapping_add(1); 16]),
            node_id: NodeId::from_bytes([seed.wrapping_add(2); 16]),
        }
    }

    #[test]
    fn layout_is_fixed() {
        let payload = TokenPayload::Ack(AttemptTokenPayload {
            scope: scope(7),
            attempt_id: AttemptId::from_bytes([0xab; 16]),
        });
        let bytes = pack(&payload);
        assert_eq!(bytes.len(), 66);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], 1);
        assert_eq!(&bytes[2..18], &[7u8; 16]);
        assert_eq!(&bytes[18..34], &[8u8; 16]);
        assert_eq!(&bytes[34..50], &[9u8; 16]);
        assert_eq!(&bytes[50..66], &[0xab; 16]);
    }

    #[test]
    fn unpack_rejects_bad_length() {
        assert_eq!(
            unpack(&[1u8; 65]).unwrap_err(),
            TokenError::BadLength { expected: 66, actual: 65 }
        );
    }

    #[test]
    fn unpack_rejects_bad_version_and_kind() {
        let mut bytes = pack(&TokenPayload::State(StateTokenPayload {
            scope: scope(1),
            workflow_hash_ref: WorkflowHashRef::from_bytes([3; 16]),
        }));
        bytes[0] = 2;
        assert_eq!(unpack(&bytes).unwrap_err(), TokenError::UnsupportedVersion(2));

        bytes[0] = 1;
        bytes[1] = 9;
        assert_eq!(unpack(&bytes).unwrap_err(), TokenError::UnknownKind(9));
    }

    #[test]
    fn only_validated_ids_reach_the_payload() {
        assert_eq!(
            RunId::parse("node_aaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap_err().code(),
            "ID_WRONG_PREFIX"
        );
        assert_eq!(
            NodeId::parse("node_aaaaaaaaaaaaaaaaaaaaaaaaa8").unwrap_err().code(),
            "ID_INVALID_FORMAT"
        );

        let payload = TokenPayload::State(StateTokenPayload {
            scope: TokenScope {
                session_id: SessionId::parse("sess_aaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap(),
                run_id: RunId::parse("run_77777777777777777777777774").unwrap(),
                node_id: NodeId::parse("node_aeaqcaibaeaqcaibaeaqcaibae").unwrap(),
            },
            workflow_hash_ref: WorkflowHashRef::parse("wf_aaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap(),
        });
        let bytes = pack(&payload);
        assert_eq!(&bytes[2..18], &[0u8; 16]);
        assert_eq!(&bytes[18..34], &[0xffu8; 16]);
        assert_eq!(&bytes[34..50], &[0x01u8; 16]);
        assert_eq!(unpack(&bytes).unwrap(), payload);
    }

    proptest! {
        #[test]
        fn pack_unpack_roundtrip(
            s in any::<[u8; 16]>(),
            r in any::<[u8; 16]>(),
            n in any::<[u8; 16]>(),
            t in any::<[u8; 16]>(),
            kind in 0u8..3,
        ) {
            let scope = TokenScope {
                session_id: SessionId::from_bytes(s),
                run_id: RunId::from_bytes(r),
                node_id: NodeId::from_bytes(n),
            };
            let payload = match kind {
                0 => TokenPayload::State(StateTokenPayload { scope, workflow_hash_ref: WorkflowHashRef::from_bytes(t) }),
                1 => TokenPayload::Ack(AttemptTokenPayload { scope, attempt_id: AttemptId::from_bytes(t) }),
                _ => TokenPayload::Checkpoint(AttemptTokenPayload { scope, attempt_id: AttemptId::from_bytes(t) }),
            };
            prop_assert_eq!(unpack(&pack(&payload)).unwrap(), payload);
        }
    }
}
