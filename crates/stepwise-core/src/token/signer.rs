//! Token signing, verification and the string envelope.
//!
//! Envelope: `<prefix><base32(payload || hmac_sha256(payload))>`, where the
//! prefix is `st1`, `ack1` or `chk1`. The base32 alphabet has no `1`, so the
//! prefix always ends at the first `1`. Verification checks the tag against
//! every key of the keyring before the payload is decoded or trusted.

use std::sync::Arc;

use stepwise_types::ids::BASE32_LOWER;
use stepwise_types::token::{
    AttemptTokenPayload, StateTokenPayload, TokenError, TokenKind, TokenPayload,
    TOKEN_PAYLOAD_LEN, TOKEN_SIGNATURE_LEN,
};

use super::codec::{pack, unpack};
use super::keyring::Keyring;
use crate::service::crypto::CryptoPort;

/// Mints and verifies token strings.
pub struct TokenSigner<C: CryptoPort> {
    crypto: Arc<C>,
    keyring: Keyring,
}

impl<C: CryptoPort> TokenSigner<C> {
    pub fn new(crypto: Arc<C>, keyring: Keyring) -> Self {
        Self { crypto, keyring }
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Sign `payload` with the current key and wrap it in its envelope.
    pub fn sign(&self, payload: &TokenPayload) -> String {
        let bytes = pack(payload);
        let tag = self.crypto.hmac_sha256(self.keyring.current().secret(), &bytes);

        let mut signed = Vec::with_capacity(TOKEN_PAYLOAD_LEN + TOKEN_SIGNATURE_LEN);
        signed.extend_from_slice(&bytes);
        signed.extend_from_slice(&tag);
        format!("{}{}", payload.kind().envelope_prefix(), BASE32_LOWER.encode(&signed))
    }

    /// Verify a token of any kind and decode its payload.
    pub fn verify(&self, token: &str) -> Result<TokenPayload, TokenError> {
        let (envelope_kind, body) = split_envelope(token)?;
        let signed = BASE32_LOWER
            .decode(body.as_bytes())
            .map_err(|e| TokenError::InvalidEnvelope(format!("token body is not valid base32: {e}")))?;

        let expected_len = TOKEN_PAYLOAD_LEN + TOKEN_SIGNATURE_LEN;
        if signed.len() != expected_len {
            return Err(TokenError::BadLength {
                expected: TOKEN_PAYLOAD_LEN,
                actual: signed.len().saturating_sub(TOKEN_SIGNATURE_LEN),
            });
        }
        let (payload_bytes, tag) = signed.split_at(TOKEN_PAYLOAD_LEN);

        let trusted = self
            .keyring
            .verification_keys()
            .any(|key| self.crypto.verify_hmac_sha256(key.secret(), payload_bytes, tag));
        if !trusted {
            tracing::debug!(kind = ?envelope_kind, "token signature rejected");
            return Err(TokenError::SignatureMismatch);
        }

        let payload = unpack(payload_bytes)?;
        if payload.kind() != envelope_kind {
            return Err(TokenError::KindMismatch {
                expected: envelope_kind,
                actual: payload.kind(),
            });
        }
        Ok(payload)
    }

    /// Verify a token that must be a state token.
    pub fn verify_state(&self, token: &str) -> Result<StateTokenPayload, TokenError> {
        match self.verify(token)? {
            TokenPayload::State(payload) => Ok(payload),
            other => Err(TokenError::KindMismatch {
                expected: TokenKind::State,
                actual: other.kind(),
            }),
        }
    }

    /// Verify a token that must be an ack token.
    pub fn verify_ack(&self, token: &str) -> Result<AttemptTokenPayload, TokenError> {
        match self.verify(token)? {
            TokenPayload::Ack(payload) => Ok(payload),
            other => Err(TokenError::KindMismatch {
                expected: TokenKind::Ack,
                actual: other.kind(),
            }),
        }
    }

    /// Verify a token that must be a checkpoint token.
    pub fn verify_checkpoint(&self, token: &str) -> Result<AttemptTokenPayload, TokenError> {
        match self.verify(token)? {
            TokenPayload::Checkpoint(payload) => Ok(payload),
            other => Err(TokenError::KindMismatch {
                expected: TokenKind::Checkpoint,
                actual: other.kind(),
            }),
        }
    }
}

/// Tokens are compared byte for byte; surrounding whitespace is a malformed
/// envelope, not something to repair.
fn split_envelope(token: &str) -> Result<(TokenKind, &str), TokenError> {
    let split = token
        .find('1')
        .ok_or_else(|| TokenError::InvalidEnvelope("missing token prefix".to_string()))?;
    let (prefix, body) = token.split_at(split + 1);
    let kind = [TokenKind::State, TokenKind::Ack, TokenKind::Checkpoint]
        .into_iter()
        .find(|kind| kind.envelope_prefix() == prefix)
        .ok_or_else(|| TokenError::InvalidEnvelope(format!("unknown token prefix '{prefix}'")))?;
    if body.is_empty() {
        return Err(TokenError::InvalidEnvelope("empty token body".to_string()));
    }
    Ok((kind, body))
}

/// Check that an ack or checkpoint token was minted for the same
/// session, run and node as the state token it accompanies.
pub fn assert_token_scope_matches_state(
    state: &StateTokenPayload,
    attempt: &AttemptTokenPayload,
) -> Result<(), TokenError> {
    if state.scope.session_id != attempt.scope.session_id {
        return Err(TokenError::ScopeMismatch { field: "session_id" });
    }
    if state.scope.run_id != attempt.scope.run_id {
        return Err(TokenError::ScopeMismatch { field: "run_id" });
    }
    if state.scope.node_id != attempt.scope.node_id {
        return Err(TokenError::ScopeMismatch { field: "node_id" });
    }
    Ok(())
}
