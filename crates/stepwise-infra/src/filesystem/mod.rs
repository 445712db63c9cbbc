//! Filesystem adapters for Stepwise.
//!
//! Durable bytes are never written in place: every file is staged as a
//! sibling temp file, synced, then moved into its final name. Readers
//! therefore see either the old state or the new one, never a torn write.
//!
//! Data directory layout:
//! ```text
//! {data_dir}/
//!   config.toml
//!   keys/keyring.json
//!   sessions/{session_id}/events/{first_event_index:020}.json
//!   snapshots/{hex[0..2]}/{hex}.json
//!   workflows/*.json|*.yaml|*.yml
//! ```

pub mod event_log;
pub mod snapshot;

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

pub use event_log::FileEventLog;
pub use snapshot::FileSnapshotStore;

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `STEPWISE_DATA_DIR` environment variable
/// 2. `~/.stepwise`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPWISE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".stepwise");
    }

    // Last resort: current directory
    PathBuf::from(".stepwise")
}

/// Sibling temp path for staging `path`.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::now_v7().simple()))
}

/// Write `bytes` to a synced staging file next to `path`.
async fn stage(path: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;
    tokio::fs::create_dir_all(parent).await?;

    let staged = staging_path(path);
    let mut file = tokio::fs::File::create(&staged).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(staged)
}

/// Atomically replace `path` with `bytes` (temp file + rename).
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let staged = stage(path, bytes).await?;
    if let Err(err) = tokio::fs::rename(&staged, path).await {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(err);
    }
    Ok(())
}

/// Atomically create `path` with `bytes` unless it already exists.
///
/// Returns `false` when another writer got there first; the existing file
/// is left untouched.
pub async fn write_atomic_new(path: &Path, bytes: &[u8]) -> io::Result<bool> {
    let staged = stage(path, bytes).await?;
    // hard_link fails with AlreadyExists instead of clobbering
    let result = tokio::fs::hard_link(&staged, path).await;
    let _ = tokio::fs::remove_file(&staged).await;
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");

        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_write_atomic_new_never_clobbers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");

        assert!(write_atomic_new(&path, b"first").await.unwrap());
        assert!(!write_atomic_new(&path, b"second").await.unwrap());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_no_staging_files_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.json");
        write_atomic(&path, b"x").await.unwrap();
        write_atomic_new(&path, b"y").await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["file.json".to_string()]);
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var("STEPWISE_DATA_DIR", "/tmp/test-stepwise");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-stepwise"));
        unsafe {
            std::env::remove_var("STEPWISE_DATA_DIR");
        }
    }
}
