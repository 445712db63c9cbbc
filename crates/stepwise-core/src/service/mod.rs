//! Service ports consumed by the engine.
//!
//! - `crypto` -- SHA-256 and HMAC-SHA256 primitives
//! - `validator` -- output-contract validation

pub mod crypto;
pub mod validator;
