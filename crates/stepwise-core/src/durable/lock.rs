//! Per-session single-writer lock.
//!
//! Appending to a session's event log requires a [`SessionLockWitness`]: proof
//! that the caller currently holds the session's lock. A witness wraps a live
//! lease from a [`SessionLockManager`]; it cannot be built from a session id
//! alone, and the log re-checks the lease's health on every append. Dropping
//! the witness releases the lock.

use std::fmt;
use std::time::Duration;

use stepwise_types::ids::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms}ms waiting for the lock on session {session_id}")]
    Timeout { session_id: SessionId, waited_ms: u64 },

    #[error("lock on session {session_id} is no longer healthy; rehydrate and retry")]
    Unhealthy { session_id: SessionId },

    #[error("lock witness is for session {actual}, not {expected}")]
    WrongSession {
        expected: SessionId,
        actual: SessionId,
    },

    #[error("lock I/O error: {0}")]
    Io(String),
}

/// A live lock lease held by a lock manager.
pub trait LockLease: Send + Sync + fmt::Debug {
    /// Whether the lease is still exclusively held.
    fn is_healthy(&self) -> bool;
}

/// Proof that the per-session lock is held.
#[derive(Debug)]
pub struct SessionLockWitness {
    session_id: SessionId,
    lease_id: String,
    lease: Box<dyn LockLease>,
}

impl SessionLockWitness {
    /// Wrap a lease. Called by lock managers only.
    pub fn new(session_id: SessionId, lease_id: impl Into<String>, lease: Box<dyn LockLease>) -> Self {
        Self {
            session_id,
            lease_id: lease_id.into(),
            lease,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub fn is_healthy(&self) -> bool {
        self.lease.is_healthy()
    }

    /// Fail unless this witness is healthy and covers `session_id`.
    pub fn ensure_covers(&self, session_id: &SessionId) -> Result<(), LockError> {
        if &self.session_id != session_id {
            return Err(LockError::WrongSession {
                expected: session_id.clone(),
                actual: self.session_id.clone(),
            });
        }
        if !self.is_healthy() {
            return Err(LockError::Unhealthy {
                session_id: session_id.clone(),
            });
        }
        Ok(())
    }
}

/// Hands out per-session lock witnesses.
///
/// Sessions are independent: acquiring one session's lock never waits on
/// another's.
pub trait SessionLockManager: Send + Sync {
    fn acquire(
        &self,
        session_id: &SessionId,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<SessionLockWitness, LockError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct FlagLease(Arc<AtomicBool>);

    impl LockLease for FlagLease {
        fn is_healthy(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn witness_checks_session_and_health() {
        let flag = Arc::new(AtomicBool::new(true));
        let session = SessionId::from_bytes([1; 16]);
        let witness = SessionLockWitness::new(session.clone(), "lease-1", Box::new(FlagLease(flag.clone())));

        assert!(witness.ensure_covers(&session).is_ok());
        assert!(matches!(
            witness.ensure_covers(&SessionId::from_bytes([2; 16])),
            Err(LockError::WrongSession { .. })
        ));

        flag.store(false, Ordering::SeqCst);
        assert!(matches!(
            witness.ensure_covers(&session),
            Err(LockError::Unhealthy { .. })
        ));
    }
}
