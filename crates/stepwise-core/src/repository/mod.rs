//! Repository trait definitions (ports).
//!
//! Read-side storage interfaces implemented by `stepwise-infra`. The core
//! crate never depends on a specific storage technology.

pub mod workflow;
