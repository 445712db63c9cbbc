//! Process-memory adapters, for tests and throwaway sessions.

pub mod event_log;
pub mod snapshot;

pub use event_log::MemoryEventLog;
pub use snapshot::MemorySnapshotStore;
