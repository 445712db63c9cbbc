use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use stepwise_core::durable::lock::{LockError, LockLease, SessionLockManager, SessionLockWitness};
use stepwise_types::ids::SessionId;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::new_lease_id;

type LockRegistry = DashMap<SessionId, Arc<Mutex<()>>>;

/// Lease that lives as long as the mutex guard it owns.
#[derive(Debug)]
struct GuardLease {
    guard: Option<OwnedMutexGuard<()>>,
    session_id: SessionId,
    registry: Arc<LockRegistry>,
}

impl LockLease for GuardLease {
    fn is_healthy(&self) -> bool {
        self.guard.is_some()
    }
}

impl Drop for GuardLease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone of the mutex, so a count of one means
        // the registry is the last reference.
        self.registry
            .remove_if(&self.session_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// One async mutex per session, created on first use and dropped again once
/// nobody holds or waits for it.
///
/// Sessions never contend with each other: the registry is only touched to
/// fetch the session's mutex, and waiting happens on that mutex alone.
#[derive(Debug, Clone, Default)]
pub struct InProcessLockManager {
    locks: Arc<LockRegistry>,
}

impl InProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionLockManager for InProcessLockManager {
    async fn acquire(&self, session_id: &SessionId, timeout: Duration) -> Result<SessionLockWitness, LockError> {
        let mutex = Arc::clone(
            self.locks
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        let acquired = tokio::time::timeout(timeout, mutex.lock_owned()).await;
        let Ok(guard) = acquired else {
            self.locks
                .remove_if(session_id, |_, mutex| Arc::strong_count(mutex) == 1);
            return Err(LockError::Timeout {
                session_id: session_id.clone(),
                waited_ms: timeout.as_millis() as u64,
            });
        };

        let lease_id = new_lease_id();
        tracing::trace!(session_id = %session_id, lease_id = %lease_id, "session lock acquired");
        Ok(SessionLockWitness::new(
            session_id.clone(),
            lease_id,
            Box::new(GuardLease {
                guard: Some(guard),
                session_id: session_id.clone(),
                registry: Arc::clone(&self.locks),
            }),
        ))
    }
}
