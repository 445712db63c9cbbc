//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the ports defined in `stepwise-core`:
//! SHA-256/HMAC crypto and the keyring file, filesystem and SQLite event logs
//! and snapshot stores, in-memory stores, per-session lock managers, workflow
//! readers, the required-fields output validator and config loading.

pub mod config;
pub mod crypto;
pub mod filesystem;
pub mod lock;
pub mod memory;
pub mod sqlite;
pub mod validator;
pub mod workflow;
