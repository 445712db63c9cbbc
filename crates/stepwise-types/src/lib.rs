//! Shared domain types for the Stepwise durable workflow engine.
//!
//! Workflow definitions, interpreter state, branded identifiers, session
//! events, token payloads and their error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror and
//! the text codecs.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod ids;
pub mod token;
pub mod workflow;
