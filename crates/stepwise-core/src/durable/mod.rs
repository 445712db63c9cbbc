//! Durable execution: event log, snapshots, session lock and truth folding.
//!
//! - `lock` -- per-session lock witness and lock-manager port
//! - `log` -- event log port and the shared append/dedupe rules
//! - `snapshot` -- content-addressed snapshot encoding and store port
//! - `projection` -- `SessionTruth`, the pure fold of a session's events

pub mod lock;
pub mod log;
pub mod projection;
pub mod snapshot;
