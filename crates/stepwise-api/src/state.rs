//! Application state wiring the engine to concrete adapters.
//!
//! The engine is generic over its ports; `AppState` pins it to the infra
//! implementations selected by `config.toml`. Workflows always come from the
//! workflows directory and are signed with the on-disk keyring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stepwise_core::durable::lock::SessionLockManager;
use stepwise_core::durable::log::SessionEventLog;
use stepwise_core::durable::projection::SessionTruth;
use stepwise_core::durable::snapshot::SnapshotStore;
use stepwise_core::engine::{
    CheckpointRequest, CheckpointResponse, ContinueOutcome, ContinueRequest, EngineError, EngineOptions,
    EnginePorts, ExecutionEngine, PreferencesRequest, PreferencesResponse, StartRequest, StepResponse,
};
use stepwise_core::workflow::cache::CompiledWorkflowCache;
use stepwise_core::workflow::condition::ConditionExplanation;
use stepwise_infra::config::{load_engine_config, resolve_workflows_dir};
use stepwise_infra::crypto::{KeyringFile, Sha256Crypto};
use stepwise_infra::filesystem::{resolve_data_dir, FileEventLog, FileSnapshotStore};
use stepwise_infra::lock::{InProcessLockManager, LockFileManager};
use stepwise_infra::memory::{MemoryEventLog, MemorySnapshotStore};
use stepwise_infra::sqlite::{DatabasePool, SqliteEventLog, SqliteSnapshotStore};
use stepwise_infra::validator::RequiredFieldsValidator;
use stepwise_infra::workflow::DirectoryWorkflowReader;
use stepwise_types::config::{EngineConfig, StorageBackend};
use stepwise_types::ids::SessionId;
use stepwise_types::workflow::WorkflowSummary;

/// Engine over segment files and the snapshot directory.
pub type FileEngine = ExecutionEngine<
    DirectoryWorkflowReader,
    FileEventLog,
    FileSnapshotStore,
    LockFileManager,
    Sha256Crypto,
    RequiredFieldsValidator,
>;

pub type SqliteEngine = ExecutionEngine<
    DirectoryWorkflowReader,
    SqliteEventLog,
    SqliteSnapshotStore,
    LockFileManager,
    Sha256Crypto,
    RequiredFieldsValidator,
>;

pub type MemoryEngine = ExecutionEngine<
    DirectoryWorkflowReader,
    MemoryEventLog,
    MemorySnapshotStore,
    InProcessLockManager,
    Sha256Crypto,
    RequiredFieldsValidator,
>;

/// The engine pinned to the configured storage backend.
pub enum AppEngine {
    File(FileEngine),
    Sqlite(SqliteEngine),
    Memory(MemoryEngine),
}

macro_rules! dispatch {
    ($engine:expr, $bound:ident => $call:expr) => {
        match $engine {
            AppEngine::File($bound) => $call,
            AppEngine::Sqlite($bound) => $call,
            AppEngine::Memory($bound) => $call,
        }
    };
}

impl AppEngine {
    pub async fn start(&self, request: StartRequest) -> Result<StepResponse, EngineError> {
        dispatch!(self, engine => engine.start(request).await)
    }

    pub async fn continue_workflow(&self, request: ContinueRequest) -> Result<ContinueOutcome, EngineError> {
        dispatch!(self, engine => engine.continue_workflow(request).await)
    }

    pub async fn checkpoint(&self, request: CheckpointRequest) -> Result<CheckpointResponse, EngineError> {
        dispatch!(self, engine => engine.checkpoint(request).await)
    }

    pub async fn set_preferences(&self, request: PreferencesRequest) -> Result<PreferencesResponse, EngineError> {
        dispatch!(self, engine => engine.set_preferences(request).await)
    }

    pub async fn inspect(&self, session_id: &SessionId) -> Result<SessionTruth, EngineError> {
        dispatch!(self, engine => engine.inspect(session_id).await)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionId>, EngineError> {
        dispatch!(self, engine => engine.list_sessions().await)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        dispatch!(self, engine => engine.list_workflows().await)
    }

    pub async fn explain_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        context: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<ConditionExplanation, EngineError> {
        dispatch!(self, engine => engine.explain_step(workflow_id, step_id, context).await)
    }
}

/// Shared application state for CLI commands.
pub struct AppState {
    pub engine: AppEngine,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
    pub workflows_dir: PathBuf,
    pub keyring: KeyringFile,
}

impl AppState {
    /// Resolve the data directory, load config and keyring, wire the engine.
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_engine_config(&data_dir).await;
        let workflows_dir = resolve_workflows_dir(&config, &data_dir);
        let keyring = KeyringFile::in_data_dir(&data_dir);
        let engine = build_engine(&config, &data_dir, &workflows_dir, &keyring).await?;

        tracing::debug!(
            data_dir = %data_dir.display(),
            storage = ?config.storage,
            workflows_dir = %workflows_dir.display(),
            "app state initialized"
        );

        Ok(Self {
            engine,
            config,
            data_dir,
            workflows_dir,
            keyring,
        })
    }
}

async fn build_engine(
    config: &EngineConfig,
    data_dir: &Path,
    workflows_dir: &Path,
    keyring: &KeyringFile,
) -> anyhow::Result<AppEngine> {
    let keys = keyring.load_or_create().await?;
    let cache = Arc::new(CompiledWorkflowCache::new(config.compiled_cache_capacity));
    let options = EngineOptions::from(config);
    let reader = Arc::new(DirectoryWorkflowReader::new(workflows_dir));

    let engine = match config.storage {
        StorageBackend::File => AppEngine::File(ExecutionEngine::new(
            ports(
                reader,
                FileEventLog::new(data_dir),
                FileSnapshotStore::new(data_dir),
                LockFileManager::new(data_dir),
            ),
            keys,
            cache,
            options,
        )),
        StorageBackend::Sqlite => {
            let pool = DatabasePool::open_in(data_dir).await?;
            AppEngine::Sqlite(ExecutionEngine::new(
                ports(
                    reader,
                    SqliteEventLog::new(pool.clone()),
                    SqliteSnapshotStore::new(pool),
                    LockFileManager::new(data_dir),
                ),
                keys,
                cache,
                options,
            ))
        }
        StorageBackend::Memory => {
            tracing::warn!("memory storage selected; sessions end with this process");
            AppEngine::Memory(ExecutionEngine::new(
                ports(
                    reader,
                    MemoryEventLog::new(),
                    MemorySnapshotStore::new(),
                    InProcessLockManager::new(),
                ),
                keys,
                cache,
                options,
            ))
        }
    };
    Ok(engine)
}

fn ports<L, S, M>(
    workflows: Arc<DirectoryWorkflowReader>,
    log: L,
    snapshots: S,
    locks: M,
) -> EnginePorts<DirectoryWorkflowReader, L, S, M, Sha256Crypto, RequiredFieldsValidator>
where
    L: SessionEventLog,
    S: SnapshotStore,
    M: SessionLockManager,
{
    EnginePorts {
        workflows,
        log: Arc::new(log),
        snapshots: Arc::new(snapshots),
        locks: Arc::new(locks),
        crypto: Arc::new(Sha256Crypto::new()),
        validator: Arc::new(RequiredFieldsValidator::new()),
    }
}
