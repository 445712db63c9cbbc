//! End-to-end scenarios over the SQLite backend with lock files.

mod common;

use common::*;
use stepwise_core::engine::{ContinueOutcome, StartRequest};
use stepwise_types::event::{Autonomy, BlockerCode, ExecutionPreferences};
use tempfile::tempdir;

#[tokio::test]
async fn for_loop_clamps_to_max_iterations() {
    let dir = tempdir().unwrap();
    let engine = sqlite_engine(dir.path(), &[for_loop(5, 2)]).await;

    let mut step = start(&engine, "passes").await;
    let mut keys = Vec::new();
    while !step.is_complete {
        keys.push(step.pending.as_ref().unwrap().step_instance_key.as_str().to_string());
        step = advance(&engine, &step).await;
    }
    assert_eq!(keys, vec!["review@0::pass", "review@1::pass"]);
}

#[tokio::test]
async fn concurrent_identical_continues_record_one_advance() {
    let dir = tempdir().unwrap();
    let engine = sqlite_engine(dir.path(), &[linear()]).await;
    let first = start(&engine, "linear").await;

    let (a, b) = tokio::join!(
        engine.continue_workflow(advance_request(&first, None)),
        engine.continue_workflow(advance_request(&first, None)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());

    let truth = engine.inspect(&first.session_id).await.unwrap();
    assert_eq!(truth.advances.len(), 1);
    assert_eq!(truth.children(&first.node_id).count(), 1);
}

#[tokio::test]
async fn never_stop_records_gap_in_sqlite() {
    let dir = tempdir().unwrap();
    let engine = sqlite_engine(dir.path(), &[with_contract()]).await;
    let first = engine
        .start(StartRequest {
            workflow_id: "contracted".into(),
            preferences: Some(ExecutionPreferences {
                autonomy: Autonomy::NeverStop,
            }),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    let outcome = engine.continue_workflow(advance_request(&first, None)).await.unwrap();
    let ContinueOutcome::Ok(next) = outcome else {
        panic!("never-stop must not block");
    };
    assert_eq!(next.pending.as_ref().unwrap().step_instance_key.as_str(), "build");

    let truth = engine.inspect(&first.session_id).await.unwrap();
    assert_eq!(truth.gaps.len(), 1);
    assert_eq!(truth.gaps[0].gap.blockers[0].code, BlockerCode::MissingRequiredOutput);
}

#[tokio::test]
async fn checkpoint_round_trips_through_sqlite() {
    let dir = tempdir().unwrap();
    let engine = sqlite_engine(dir.path(), &[linear()]).await;
    let first = start(&engine, "linear").await;

    let checkpoint = engine
        .checkpoint(stepwise_core::engine::CheckpointRequest {
            checkpoint_token: first.checkpoint_token.clone(),
        })
        .await
        .unwrap();
    assert_eq!(checkpoint.node_id, first.node_id);

    // Reopen the database: the checkpoint is durable and idempotent.
    let reopened = sqlite_engine(dir.path(), &[linear()]).await;
    let again = reopened
        .checkpoint(stepwise_core::engine::CheckpointRequest {
            checkpoint_token: first.checkpoint_token.clone(),
        })
        .await
        .unwrap();
    assert_eq!(again, checkpoint);

    let next = advance(&reopened, &first).await;
    assert_eq!(next.pending.as_ref().unwrap().step_instance_key.as_str(), "b");
}

#[tokio::test]
async fn unknown_session_is_reported() {
    let dir = tempdir().unwrap();
    let engine = sqlite_engine(dir.path(), &[linear()]).await;
    let err = engine
        .inspect(&stepwise_types::ids::SessionId::generate())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");
}
