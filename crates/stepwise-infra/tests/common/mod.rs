//! Shared wiring for the end-to-end scenarios: real adapters, temp data dirs.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use stepwise_core::durable::lock::SessionLockManager;
use stepwise_core::durable::log::SessionEventLog;
use stepwise_core::durable::snapshot::SnapshotStore;
use stepwise_core::engine::{
    ContinueOutcome, ContinueRequest, EngineOptions, EnginePorts, ExecutionEngine, StartRequest, StepResponse,
};
use stepwise_core::repository::workflow::WorkflowReader;
use stepwise_core::service::crypto::CryptoPort;
use stepwise_core::service::validator::OutputValidator;
use stepwise_core::workflow::cache::CompiledWorkflowCache;
use stepwise_infra::crypto::{KeyringFile, Sha256Crypto};
use stepwise_infra::filesystem::{FileEventLog, FileSnapshotStore};
use stepwise_infra::lock::{InProcessLockManager, LockFileManager};
use stepwise_infra::sqlite::{DatabasePool, SqliteEventLog, SqliteSnapshotStore};
use stepwise_infra::validator::RequiredFieldsValidator;
use stepwise_infra::workflow::{DirectoryWorkflowReader, MemoryWorkflowReader};
use stepwise_types::execution::StepInstanceId;
use stepwise_types::workflow::WorkflowDefinition;

pub type FileEngine = ExecutionEngine<
    DirectoryWorkflowReader,
    FileEventLog,
    FileSnapshotStore,
    InProcessLockManager,
    Sha256Crypto,
    RequiredFieldsValidator,
>;

pub type SqliteEngine = ExecutionEngine<
    MemoryWorkflowReader,
    SqliteEventLog,
    SqliteSnapshotStore,
    LockFileManager,
    Sha256Crypto,
    RequiredFieldsValidator,
>;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn for_loop(count: u64, max_iterations: u32) -> Value {
    json!({
        "id": "passes",
        "name": "Passes",
        "steps": [{
            "id": "review",
            "title": "Review passes",
            "loop": { "type": "for", "count": count, "max_iterations": max_iterations },
            "body": [{ "id": "pass", "title": "Pass", "prompt": "Pass {{currentIteration}}" }]
        }]
    })
}

pub fn linear() -> Value {
    json!({
        "id": "linear",
        "name": "Linear",
        "steps": [
            { "id": "a", "title": "A", "prompt": "do a" },
            { "id": "b", "title": "B", "prompt": "do b" },
            { "id": "c", "title": "C", "prompt": "do c" }
        ]
    })
}

pub fn with_contract() -> Value {
    json!({
        "id": "contracted",
        "name": "Contracted",
        "steps": [
            {
                "id": "plan",
                "title": "Plan",
                "prompt": "Write a plan",
                "output_contract": { "contract_ref": "plan.v1", "required_fields": ["summary"] }
            },
            { "id": "build", "title": "Build", "prompt": "Build it" }
        ]
    })
}

pub fn definition(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

/// Write definitions as JSON files under `{data_dir}/workflows/`.
pub async fn write_workflows(data_dir: &Path, definitions: &[Value]) {
    let dir = data_dir.join("workflows");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    for value in definitions {
        let id = value["id"].as_str().unwrap();
        tokio::fs::write(dir.join(format!("{id}.json")), serde_json::to_vec_pretty(value).unwrap())
            .await
            .unwrap();
    }
}

// ---------------------------------------------------------------------------
// Engines
// ---------------------------------------------------------------------------

/// File storage, directory reader, on-disk keyring. Reopening the same
/// `data_dir` simulates a process restart.
pub async fn file_engine(data_dir: &Path) -> FileEngine {
    let keyring = KeyringFile::in_data_dir(data_dir).load_or_create().await.unwrap();
    ExecutionEngine::new(
        EnginePorts {
            workflows: Arc::new(DirectoryWorkflowReader::new(data_dir.join("workflows"))),
            log: Arc::new(FileEventLog::new(data_dir)),
            snapshots: Arc::new(FileSnapshotStore::new(data_dir)),
            locks: Arc::new(InProcessLockManager::new()),
            crypto: Arc::new(Sha256Crypto::new()),
            validator: Arc::new(RequiredFieldsValidator::new()),
        },
        keyring,
        Arc::new(CompiledWorkflowCache::new(16)),
        EngineOptions::default(),
    )
}

/// SQLite storage, lock files, in-memory reader.
pub async fn sqlite_engine(data_dir: &Path, definitions: &[Value]) -> SqliteEngine {
    let pool = DatabasePool::open_in(data_dir).await.unwrap();
    let keyring = KeyringFile::in_data_dir(data_dir).load_or_create().await.unwrap();
    let reader = MemoryWorkflowReader::with_definitions(definitions.iter().cloned().map(definition));
    ExecutionEngine::new(
        EnginePorts {
            workflows: Arc::new(reader),
            log: Arc::new(SqliteEventLog::new(pool.clone())),
            snapshots: Arc::new(SqliteSnapshotStore::new(pool)),
            locks: Arc::new(LockFileManager::new(data_dir)),
            crypto: Arc::new(Sha256Crypto::new()),
            validator: Arc::new(RequiredFieldsValidator::new()),
        },
        keyring,
        Arc::new(CompiledWorkflowCache::new(16)),
        EngineOptions::default(),
    )
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

pub async fn start<R, L, S, M, C, V>(engine: &ExecutionEngine<R, L, S, M, C, V>, workflow_id: &str) -> StepResponse
where
    R: WorkflowReader,
    L: SessionEventLog,
    S: SnapshotStore,
    M: SessionLockManager,
    C: CryptoPort,
    V: OutputValidator,
{
    engine
        .start(StartRequest {
            workflow_id: workflow_id.to_string(),
            ..StartRequest::default()
        })
        .await
        .unwrap()
}

pub fn pending_id(step: &StepResponse) -> StepInstanceId {
    step.pending.as_ref().unwrap().step_instance_id.clone()
}

pub fn advance_request(step: &StepResponse, output: Option<Value>) -> ContinueRequest {
    ContinueRequest {
        state_token: step.state_token.clone(),
        ack_token: step.ack_token.clone(),
        completed_step: Some(pending_id(step)),
        output,
        ..ContinueRequest::default()
    }
}

pub async fn advance<R, L, S, M, C, V>(engine: &ExecutionEngine<R, L, S, M, C, V>, step: &StepResponse) -> StepResponse
where
    R: WorkflowReader,
    L: SessionEventLog,
    S: SnapshotStore,
    M: SessionLockManager,
    C: CryptoPort,
    V: OutputValidator,
{
    match engine.continue_workflow(advance_request(step, None)).await.unwrap() {
        ContinueOutcome::Ok(next) => next,
        ContinueOutcome::Blocked(blocked) => panic!("unexpected block: {blocked:?}"),
    }
}

pub async fn rehydrate<R, L, S, M, C, V>(engine: &ExecutionEngine<R, L, S, M, C, V>, state_token: &str) -> StepResponse
where
    R: WorkflowReader,
    L: SessionEventLog,
    S: SnapshotStore,
    M: SessionLockManager,
    C: CryptoPort,
    V: OutputValidator,
{
    engine
        .continue_workflow(ContinueRequest {
            state_token: state_token.to_string(),
            ..ContinueRequest::default()
        })
        .await
        .unwrap()
        .step()
        .cloned()
        .unwrap()
}
