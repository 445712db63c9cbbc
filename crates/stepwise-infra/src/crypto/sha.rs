//! SHA-256 content addressing and HMAC-SHA256 token signing.
//!
//! Implements the `CryptoPort` trait from `stepwise-core` using the `sha2`
//! and `hmac` crates (RustCrypto ecosystem).

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use stepwise_core::service::crypto::{CryptoPort, SHA256_LEN};

type HmacSha256 = Hmac<Sha256>;

/// RustCrypto implementation of `CryptoPort`.
#[derive(Debug, Clone, Copy)]
pub struct Sha256Crypto;

impl Sha256Crypto {
    /// Create a new crypto adapter.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Sha256Crypto {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoPort for Sha256Crypto {
    fn sha256(&self, bytes: &[u8]) -> [u8; SHA256_LEN] {
        Sha256::digest(bytes).into()
    }

    fn hmac_sha256(&self, key: &[u8], message: &[u8]) -> [u8; SHA256_LEN] {
        // HMAC accepts keys of any length, so construction cannot fail.
        match HmacSha256::new_from_slice(key) {
            Ok(mut mac) => {
                mac.update(message);
                mac.finalize().into_bytes().into()
            }
            Err(_) => [0u8; SHA256_LEN],
        }
    }

    fn verify_hmac_sha256(&self, key: &[u8], message: &[u8], tag: &[u8]) -> bool {
        let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
            return false;
        };
        mac.update(message);
        // verify_slice compares in constant time
        mac.verify_slice(tag).is_ok()
    }
}
