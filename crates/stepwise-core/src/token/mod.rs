//! Capability tokens: binary codec, keyring, signing and scope checks.

pub mod codec;
pub mod keyring;
pub mod signer;

pub use keyring::{Keyring, SigningKey};
pub use signer::{assert_token_scope_matches_state, TokenSigner};
