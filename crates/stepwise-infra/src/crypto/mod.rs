//! Cryptographic adapters for Stepwise.
//!
//! - `sha` -- SHA-256 / HMAC-SHA256 implementation of `CryptoPort`
//! - `keyring_file` -- on-disk token signing keyring, generated on first use

pub mod keyring_file;
pub mod sha;

pub use keyring_file::{KeyringError, KeyringFile};
pub use sha::Sha256Crypto;
