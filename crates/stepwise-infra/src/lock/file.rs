//! Lease files for cross-process session locking.
//!
//! A lock is the file `{root}/locks/{session_id}.lock`, created with
//! `create_new` and holding the owner's lease id. The lease stays healthy
//! while the file exists and still names its owner; if another process
//! breaks a stale lock and takes it over, the original lease turns unhealthy
//! and its next append is refused.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use stepwise_core::durable::lock::{LockError, LockLease, SessionLockManager, SessionLockWitness};
use stepwise_types::ids::SessionId;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use super::new_lease_id;

/// Delay between attempts while a lock is held elsewhere.
const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Default age after which an abandoned lock file may be broken.
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct FileLease {
    path: PathBuf,
    lease_id: String,
}

impl FileLease {
    fn owns_file(&self) -> bool {
        std::fs::read_to_string(&self.path).is_ok_and(|content| content == self.lease_id)
    }
}

impl LockLease for FileLease {
    fn is_healthy(&self) -> bool {
        self.owns_file()
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        if self.owns_file() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to release lock file");
            }
        }
    }
}

/// Lock manager backed by lease files.
#[derive(Debug, Clone)]
pub struct LockFileManager {
    dir: PathBuf,
    stale_after: Duration,
}

impl LockFileManager {
    /// Locks live in `{data_dir}/locks/`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: data_dir.into().join("locks"),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Break lock files whose last modification is older than `stale_after`.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn lock_path(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.lock", session_id.as_str()))
    }

    async fn try_create(&self, path: &Path, lease_id: &str) -> std::io::Result<bool> {
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err),
        };
        file.write_all(lease_id.as_bytes()).await?;
        file.sync_all().await?;
        Ok(true)
    }

    /// The lease id in the lock file, if the file has not been touched for
    /// `stale_after`.
    async fn stale_lease(&self, path: &Path) -> std::io::Result<Option<String>> {
        let modified = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.modified()?,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err),
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age < self.stale_after {
            return Ok(None);
        }
        match tokio::fs::read_to_string(path).await {
            Ok(lease_id) => Ok(Some(lease_id)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Break the lock file only if it still holds `stale_lease_id`.
    ///
    /// The file is first renamed to a unique tombstone, so a lock created
    /// after the staleness check is never deleted: if the tombstone holds a
    /// different lease it is linked back into place.
    async fn break_stale(&self, path: &Path, session_id: &SessionId, stale_lease_id: &str) -> std::io::Result<()> {
        let tombstone = self.dir.join(format!("{}.{}.stale", session_id.as_str(), new_lease_id()));
        match tokio::fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        }

        let taken = tokio::fs::read_to_string(&tombstone).await?;
        if taken == stale_lease_id {
            tracing::warn!(session_id = %session_id, lease_id = %stale_lease_id, "broke stale session lock");
        } else {
            match tokio::fs::hard_link(&tombstone, path).await {
                Ok(()) => {}
                // A third process locked in the gap; the lease we displaced
                // reads as unhealthy from now on.
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    tracing::warn!(session_id = %session_id, lease_id = %taken, "lock renewed while breaking it");
                }
                Err(err) => return Err(err),
            }
        }
        tokio::fs::remove_file(&tombstone).await
    }
}

impl SessionLockManager for LockFileManager {
    async fn acquire(&self, session_id: &SessionId, timeout: Duration) -> Result<SessionLockWitness, LockError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| LockError::Io(e.to_string()))?;

        let path = self.lock_path(session_id);
        let lease_id = new_lease_id();
        let deadline = Instant::now() + timeout;

        loop {
            if self
                .try_create(&path, &lease_id)
                .await
                .map_err(|e| LockError::Io(e.to_string()))?
            {
                tracing::trace!(session_id = %session_id, lease_id = %lease_id, "lock file acquired");
                return Ok(SessionLockWitness::new(
                    session_id.clone(),
                    lease_id.clone(),
                    Box::new(FileLease { path, lease_id }),
                ));
            }

            let stale = self.stale_lease(&path).await.map_err(|e| LockError::Io(e.to_string()))?;
            if let Some(stale_lease_id) = stale {
                self.break_stale(&path, session_id, &stale_lease_id)
                    .await
                    .map_err(|e| LockError::Io(e.to_string()))?;
            }

            if Instant::now() >= deadline {
                return Err(LockError::Timeout {
                    session_id: session_id.clone(),
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }
}
