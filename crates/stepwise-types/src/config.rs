//! Engine configuration types.
//!
//! `EngineConfig` represents `config.toml` in the data directory. Every field
//! has a default so an empty or missing file yields a working engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::event::Autonomy;

/// Top-level configuration for the engine and its adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the process-wide compiled-workflow cache.
    #[serde(default = "default_compiled_cache_capacity")]
    pub compiled_cache_capacity: usize,

    /// Durable storage backend for event logs and snapshots.
    #[serde(default)]
    pub storage: StorageBackend,

    /// Directory of workflow definition files. Relative to the data
    /// directory when not absolute; defaults to `workflows/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows_dir: Option<PathBuf>,

    /// Autonomy pinned for new sessions unless the caller overrides it.
    #[serde(default)]
    pub default_autonomy: Autonomy,

    /// How long to wait for a per-session lock before giving up.
    #[serde(default = "default_lock_acquire_timeout_ms")]
    pub lock_acquire_timeout_ms: u64,

    /// Upper bound on the serialized execution context.
    #[serde(default = "default_max_context_bytes")]
    pub max_context_bytes: usize,
}

fn default_compiled_cache_capacity() -> usize {
    128
}

fn default_lock_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_max_context_bytes() -> usize {
    256 * 1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compiled_cache_capacity: default_compiled_cache_capacity(),
            storage: StorageBackend::default(),
            workflows_dir: None,
            default_autonomy: Autonomy::default(),
            lock_acquire_timeout_ms: default_lock_acquire_timeout_ms(),
            max_context_bytes: default_max_context_bytes(),
        }
    }
}

/// Where event logs and snapshots are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Segment files and a content-addressed snapshot directory.
    #[default]
    File,
    /// A single SQLite database in the data directory.
    Sqlite,
    /// Process memory only (tests, demos).
    Memory,
}
