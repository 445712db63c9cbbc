//! Per-session lock managers.
//!
//! - `in_process` -- `DashMap` of async mutexes; one process, many tasks
//! - `file` -- lease files under `{data_dir}/locks/`; many processes

pub mod file;
pub mod in_process;

pub use file::LockFileManager;
pub use in_process::InProcessLockManager;

/// Fresh lease identifier.
fn new_lease_id() -> String {
    format!("lease_{}", uuid::Uuid::now_v7().simple())
}
