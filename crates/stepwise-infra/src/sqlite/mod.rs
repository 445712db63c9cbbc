//! SQLite adapters.
//!
//! - `pool` -- split reader/writer pools in WAL mode, migrations on open
//! - `event_log` -- transactional event log with a unique dedupe index
//! - `snapshot` -- content-addressed snapshot table

pub mod event_log;
pub mod pool;
pub mod snapshot;

pub use event_log::SqliteEventLog;
pub use pool::DatabasePool;
pub use snapshot::SqliteSnapshotStore;
