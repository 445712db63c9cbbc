//! Token signing keys.
//!
//! Tokens are signed with the current key and verified against the current
//! key and every previous key, so rotating the keyring does not invalidate
//! tokens already held by clients.

use std::fmt;

/// Minimum secret length accepted for HMAC-SHA256 signing.
pub const MIN_SECRET_LEN: usize = 32;

/// One HMAC key and its id.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    key_id: String,
    secret: Vec<u8>,
}

impl SigningKey {
    pub fn new(key_id: impl Into<String>, secret: Vec<u8>) -> Self {
        Self {
            key_id: key_id.into(),
            secret,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The current signing key plus retired keys still accepted for
/// verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    current: SigningKey,
    previous: Vec<SigningKey>,
}

impl Keyring {
    pub fn new(current: SigningKey) -> Self {
        Self {
            current,
            previous: Vec::new(),
        }
    }

    pub fn with_previous(mut self, previous: Vec<SigningKey>) -> Self {
        self.previous = previous;
        self
    }

    pub fn current(&self) -> &SigningKey {
        &self.current
    }

    pub fn previous(&self) -> &[SigningKey] {
        &self.previous
    }

    /// Every key accepted for verification, current first.
    pub fn verification_keys(&self) -> impl Iterator<Item = &SigningKey> {
        std::iter::once(&self.current).chain(self.previous.iter())
    }

    /// Make `next` the signing key; the old current key is kept for
    /// verification, newest first.
    pub fn rotate(mut self, next: SigningKey) -> Self {
        let retired = std::mem::replace(&mut self.current, next);
        self.previous.insert(0, retired);
        self
    }
}
