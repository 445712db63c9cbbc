//! Cryptographic port.
//!
//! Defined in stepwise-core so the engine can content-address snapshots and
//! sign tokens without coupling to a specific crypto crate. The
//! `Sha256Crypto` adapter lives in stepwise-infra.

/// SHA-256 digest length.
pub const SHA256_LEN: usize = 32;

/// Hashing and message authentication.
pub trait CryptoPort: Send + Sync {
    /// SHA-256 of `bytes`.
    fn sha256(&self, bytes: &[u8]) -> [u8; SHA256_LEN];

    /// HMAC-SHA256 tag of `message` under `key`.
    fn hmac_sha256(&self, key: &[u8], message: &[u8]) -> [u8; SHA256_LEN];

    /// Verify an HMAC-SHA256 tag. Implementations must compare in constant
    /// time.
    fn verify_hmac_sha256(&self, key: &[u8], message: &[u8], tag: &[u8]) -> bool;
}
