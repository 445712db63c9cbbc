//! Process-wide bounded cache of compiled workflows.
//!
//! Keyed by workflow id; each entry remembers the content hash it was
//! compiled from, so an edited definition recompiles instead of serving a
//! stale model. Eviction is FIFO by insertion. Correctness never depends on
//! a hit.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use stepwise_types::error::DomainError;
use stepwise_types::ids::WorkflowHash;
use stepwise_types::workflow::WorkflowDefinition;

use super::compiler::{self, CompiledWorkflow};

/// Default number of compiled workflows kept in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 128;

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, (WorkflowHash, Arc<CompiledWorkflow>)>,
    order: VecDeque<String>,
}

/// Bounded FIFO cache, injected into the engine rather than held globally.
#[derive(Debug)]
pub struct CompiledWorkflowCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl CompiledWorkflowCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        // A panic while holding the lock cannot leave the map inconsistent
        // with `order` in a way that breaks lookups.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the compiled form of `definition`, compiling on a miss.
    ///
    /// Compilation happens outside the lock; a concurrent miss for the same
    /// workflow may compile twice, which is harmless.
    pub fn get_or_compile(
        &self,
        definition: &WorkflowDefinition,
        hash: &WorkflowHash,
    ) -> Result<Arc<CompiledWorkflow>, DomainError> {
        if let Some((cached_hash, compiled)) = self.lock().entries.get(&definition.id) {
            if cached_hash == hash {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(compiled));
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let compiled = Arc::new(compiler::compile(definition)?);
        self.insert(definition.id.clone(), hash.clone(), Arc::clone(&compiled));

        let stats = self.stats();
        tracing::debug!(
            workflow_id = %definition.id,
            steps = compiled.step_count(),
            cached = stats.len,
            hits = stats.hits,
            misses = stats.misses,
            "compiled workflow"
        );
        Ok(compiled)
    }

    fn insert(&self, workflow_id: String, hash: WorkflowHash, compiled: Arc<CompiledWorkflow>) {
        let mut inner = self.lock();
        if inner.entries.insert(workflow_id.clone(), (hash, compiled)).is_none() {
            inner.order.push_back(workflow_id);
        }
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            tracing::debug!(workflow_id = %oldest, "evicted compiled workflow");
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            len: self.lock().entries.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for CompiledWorkflowCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
