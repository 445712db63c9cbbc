use std::sync::Arc;

use serde_json::{json, Value};
use stepwise_types::event::{Autonomy, BlockerCode, EdgeCause, ExecutionPreferences};
use stepwise_types::execution::StepInstanceId;
use stepwise_types::workflow::WorkflowDefinition;

use super::*;
use crate::testing::{FakeCrypto, FakeLocks, FakeWorkflows, FieldsValidator, MemoryLog, MemorySnapshots};
use crate::token::SigningKey;

type TestEngine = ExecutionEngine<FakeWorkflows, MemoryLog, MemorySnapshots, FakeLocks, FakeCrypto, FieldsValidator>;

struct Harness {
    engine: TestEngine,
    log: Arc<MemoryLog>,
    workflows: Arc<FakeWorkflows>,
    locks: Arc<FakeLocks>,
}

fn harness(definition: Value) -> Harness {
    let workflows = Arc::new(FakeWorkflows::with(workflow(definition)));
    let log = Arc::new(MemoryLog::default());
    let locks = Arc::new(FakeLocks::default());
    let engine = ExecutionEngine::new(
        EnginePorts {
            workflows: Arc::clone(&workflows),
            log: Arc::clone(&log),
            snapshots: Arc::new(MemorySnapshots::default()),
            locks: Arc::clone(&locks),
            crypto: Arc::new(FakeCrypto),
            validator: Arc::new(FieldsValidator),
        },
        Keyring::new(SigningKey::new("test", vec![7; 32])),
        Arc::new(CompiledWorkflowCache::new(8)),
        EngineOptions::default(),
    );
    Harness {
        engine,
        log,
        workflows,
        locks,
    }
}

fn workflow(value: Value) -> WorkflowDefinition {
    serde_json::from_value(value).unwrap()
}

fn for_loop(count: u64, max_iterations: u32) -> Value {
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

fn linear() -> Value {
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

fn with_contract() -> Value {
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

async fn start(h: &Harness, workflow_id: &str) -> StepResponse {
    h.engine
        .start(StartRequest {
            workflow_id: workflow_id.to_string(),
            ..StartRequest::default()
        })
        .await
        .unwrap()
}

fn pending_id(step: &StepResponse) -> StepInstanceId {
    step.pending.as_ref().unwrap().step_instance_id.clone()
}

fn advance_request(step: &StepResponse, output: Option<Value>) -> ContinueRequest {
    ContinueRequest {
        state_token: step.state_token.clone(),
        ack_token: step.ack_token.clone(),
        completed_step: Some(pending_id(step)),
        output,
        ..ContinueRequest::default()
    }
}

async fn advance(h: &Harness, step: &StepResponse) -> StepResponse {
    match h.engine.continue_workflow(advance_request(step, None)).await.unwrap() {
        ContinueOutcome::Ok(next) => next,
        ContinueOutcome::Blocked(blocked) => panic!("unexpected block: {blocked:?}"),
    }
}

async fn rehydrate(h: &Harness, state_token: &str) -> StepResponse {
    let outcome = h
        .engine
        .continue_workflow(ContinueRequest {
            state_token: state_token.to_string(),
            ..ContinueRequest::default()
        })
        .await
        .unwrap();
    outcome.step().cloned().unwrap()
}

// ---------------------------------------------------------------------------
// start / continue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn for_loop_runs_each_iteration_then_completes() {
    let h = harness(for_loop(2, 10));
    let first = start(&h, "passes").await;
    assert!(first.state_token.starts_with("st1"));
    assert!(first.ack_token.as_deref().unwrap().starts_with("ack1"));
    assert!(first.checkpoint_token.starts_with("chk1"));
    let pending = first.pending.clone().unwrap();
    assert_eq!(pending.step_instance_key.as_str(), "review@0::pass");
    assert_eq!(pending.prompt, "Pass 0");

    let second = advance(&h, &first).await;
    assert_eq!(pending_id(&second).loop_path[0].iteration, 1);
    assert_eq!(second.pending.as_ref().unwrap().step_instance_key.as_str(), "review@1::pass");

    let done = advance(&h, &second).await;
    assert!(done.is_complete);
    assert!(done.pending.is_none());
    assert!(done.ack_token.is_none());
}

#[tokio::test]
async fn for_loop_count_is_clamped_to_max_iterations() {
    let h = harness(for_loop(5, 2));
    let mut step = start(&h, "passes").await;
    let mut iterations = 0;
    while !step.is_complete {
        iterations += 1;
        step = advance(&h, &step).await;
    }
    assert_eq!(iterations, 2);
}

#[tokio::test]
async fn mismatched_completion_claim_is_rejected_without_writes() {
    let h = harness(linear());
    let first = start(&h, "linear").await;
    let before = h.log.event_count(&first.session_id);

    let mut request = advance_request(&first, None);
    request.completed_step = Some(StepInstanceId::top_level("b"));
    let err = h.engine.continue_workflow(request).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
    assert_eq!(h.log.event_count(&first.session_id), before);
}

#[tokio::test]
async fn continue_twice_with_same_tokens_is_byte_identical() {
    let h = harness(linear());
    let first = start(&h, "linear").await;

    let original = h.engine.continue_workflow(advance_request(&first, None)).await.unwrap();
    let events = h.log.event_count(&first.session_id);
    let replayed = h.engine.continue_workflow(advance_request(&first, None)).await.unwrap();

    assert_eq!(
        serde_json::to_string(&original).unwrap(),
        serde_json::to_string(&replayed).unwrap()
    );
    assert_eq!(h.log.event_count(&first.session_id), events);
}

#[tokio::test]
async fn rehydrate_reissues_the_same_tokens() {
    let h = harness(linear());
    let first = start(&h, "linear").await;
    let again = rehydrate(&h, &first.state_token).await;
    assert_eq!(again, first);
}

#[tokio::test]
async fn advancing_from_a_stale_node_forks() {
    let h = harness(linear());
    let root = start(&h, "linear").await;
    let child = advance(&h, &root).await;

    let stale = rehydrate(&h, &root.state_token).await;
    assert_ne!(stale.ack_token, root.ack_token);
    let sibling = advance(&h, &stale).await;
    assert_ne!(sibling.node_id, child.node_id);
    assert_eq!(
        sibling.pending.as_ref().unwrap().step_instance_key,
        child.pending.as_ref().unwrap().step_instance_key
    );

    let truth = h.engine.inspect(&root.session_id).await.unwrap();
    let causes: Vec<EdgeCause> = truth.children(&root.node_id).map(|e| e.cause).collect();
    assert_eq!(causes, vec![EdgeCause::NormalAdvance, EdgeCause::NonTipAdvance]);
    let tips = truth.tips(&root.run_id);
    assert!(tips.contains(&&child.node_id) && tips.contains(&&sibling.node_id));

    // The original attempt still replays to the first child.
    let replayed = advance(&h, &root).await;
    assert_eq!(replayed.node_id, child.node_id);
}

#[tokio::test]
async fn completed_node_rejects_an_earlier_ack() {
    let h = harness(json!({
        "id": "one",
        "name": "One",
        "steps": [{ "id": "only", "title": "Only", "prompt": "x" }]
    }));
    let first = start(&h, "one").await;
    let done = advance(&h, &first).await;
    assert!(done.is_complete);

    let stale_ack = ContinueRequest {
        state_token: done.state_token.clone(),
        ack_token: first.ack_token.clone(),
        ..ContinueRequest::default()
    };
    let err = h.engine.continue_workflow(stale_ack).await.unwrap_err();
    assert_eq!(err.code(), "TOKEN_SCOPE_MISMATCH");

    let rehydrated = rehydrate(&h, &done.state_token).await;
    assert!(rehydrated.is_complete);
}

#[tokio::test]
async fn context_updates_flow_into_prompts() {
    let h = harness(json!({
        "id": "ctx",
        "name": "Ctx",
        "steps": [
            { "id": "ask", "title": "Ask", "prompt": "Ask" },
            { "id": "greet", "title": "Greet", "prompt": "Hello {{user.name}}" },
            { "id": "skip", "title": "Skip", "prompt": "x", "run_condition": { "var": "debug", "equals": true } }
        ]
    }));
    let first = start(&h, "ctx").await;
    let mut request = advance_request(&first, None);
    request.context = Some(json!({ "user": { "name": "Ada" } }).as_object().cloned().unwrap());
    let ContinueOutcome::Ok(second) = h.engine.continue_workflow(request).await.unwrap() else {
        panic!("expected ok");
    };
    assert_eq!(second.pending.as_ref().unwrap().prompt, "Hello Ada");

    let done = advance(&h, &second).await;
    assert!(done.is_complete, "ineligible step must be skipped");
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn guided_mode_blocks_missing_output() {
    let h = harness(with_contract());
    let first = start(&h, "contracted").await;

    let outcome = h.engine.continue_workflow(advance_request(&first, None)).await.unwrap();
    let ContinueOutcome::Blocked(blocked) = &outcome else {
        panic!("expected blocked, got {outcome:?}");
    };
    assert_eq!(blocked.blockers[0].code, BlockerCode::MissingRequiredOutput);
    assert_eq!(blocked.blockers[0].pointer.contract_ref, "plan.v1");
    assert_eq!(blocked.state_token, first.state_token);
    assert_eq!(blocked.pending, first.pending);

    let truth = h.engine.inspect(&first.session_id).await.unwrap();
    assert_eq!(truth.blocked_attempts.len(), 1);
    assert_eq!(truth.children(&first.node_id).count(), 0);
    assert_eq!(truth.tips(&first.run_id), vec![&first.node_id]);

    // Same tokens replay the same block.
    let replayed = h.engine.continue_workflow(advance_request(&first, None)).await.unwrap();
    assert_eq!(
        serde_json::to_string(&outcome).unwrap(),
        serde_json::to_string(&replayed).unwrap()
    );

    // The retry ack advances once the output satisfies the contract.
    let retry = ContinueRequest {
        ack_token: Some(blocked.retry_ack_token.clone()),
        ..advance_request(&first, Some(json!({ "summary": "ship it" })))
    };
    let ContinueOutcome::Ok(next) = h.engine.continue_workflow(retry).await.unwrap() else {
        panic!("expected ok after retry");
    };
    assert_eq!(next.pending.as_ref().unwrap().step_instance_key.as_str(), "build");
}

#[tokio::test]
async fn invalid_output_points_at_the_field() {
    let h = harness(with_contract());
    let first = start(&h, "contracted").await;
    let outcome = h
        .engine
        .continue_workflow(advance_request(&first, Some(json!({ "notes": "x" }))))
        .await
        .unwrap();
    let ContinueOutcome::Blocked(blocked) = outcome else {
        panic!("expected blocked");
    };
    assert_eq!(blocked.blockers[0].code, BlockerCode::InvalidRequiredOutput);
    assert_eq!(blocked.blockers[0].pointer.field.as_deref(), Some("summary"));
}

#[tokio::test]
async fn never_stop_records_a_gap_and_advances() {
    let h = harness(with_contract());
    let first = h
        .engine
        .start(StartRequest {
            workflow_id: "contracted".into(),
            preferences: Some(ExecutionPreferences {
                autonomy: Autonomy::NeverStop,
            }),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    let next = advance(&h, &first).await;
    assert_eq!(next.pending.as_ref().unwrap().step_instance_key.as_str(), "build");

    let truth = h.engine.inspect(&first.session_id).await.unwrap();
    assert_eq!(truth.gaps.len(), 1);
    assert_eq!(truth.gaps[0].gap.step_instance_key, "plan");
    assert_eq!(truth.gaps[0].gap.blockers[0].code, BlockerCode::MissingRequiredOutput);
}

#[tokio::test]
async fn preferences_apply_to_later_advances() {
    let h = harness(with_contract());
    let first = start(&h, "contracted").await;

    let changed = h
        .engine
        .set_preferences(PreferencesRequest {
            state_token: first.state_token.clone(),
            preferences: ExecutionPreferences {
                autonomy: Autonomy::NeverStop,
            },
        })
        .await
        .unwrap();
    assert_eq!(changed.preferences.autonomy, Autonomy::NeverStop);

    let next = advance(&h, &first).await;
    assert!(!next.is_complete);
    let truth = h.engine.inspect(&first.session_id).await.unwrap();
    assert_eq!(truth.preferences.autonomy, Autonomy::NeverStop);
    assert_eq!(truth.preference_changes(), 2);
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn checkpoint_is_idempotent_and_keeps_tip() {
    let h = harness(linear());
    let first = start(&h, "linear").await;
    let request = CheckpointRequest {
        checkpoint_token: first.checkpoint_token.clone(),
    };

    let recorded = h.engine.checkpoint(request.clone()).await.unwrap();
    let again = h.engine.checkpoint(request).await.unwrap();
    assert_eq!(recorded, again);
    assert_eq!(recorded.state_token, first.state_token);

    let truth = h.engine.inspect(&first.session_id).await.unwrap();
    assert_eq!(truth.node(&recorded.checkpoint_node_id).unwrap().kind, NodeKind::Checkpoint);
    assert!(!truth.has_advance_children(&first.node_id));

    // Advancing after a checkpoint is a normal advance.
    advance(&h, &first).await;
    let truth = h.engine.inspect(&first.session_id).await.unwrap();
    assert!(truth.edges.iter().all(|e| e.cause != EdgeCause::NonTipAdvance));
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tokens_are_checked_before_anything_else() {
    let h = harness(linear());
    let a = start(&h, "linear").await;
    let b = start(&h, "linear").await;

    let err = rehydrate_err(&h, a.ack_token.as_deref().unwrap()).await;
    assert_eq!(err.code(), "TOKEN_KIND_MISMATCH");

    let crossed = ContinueRequest {
        ack_token: b.ack_token.clone(),
        ..advance_request(&a, None)
    };
    let err = h.engine.continue_workflow(crossed).await.unwrap_err();
    assert_eq!(err.code(), "TOKEN_SCOPE_MISMATCH");

    let foreign = TokenSigner::new(
        Arc::new(FakeCrypto),
        Keyring::new(SigningKey::new("other", vec![9; 32])),
    );
    let forged = foreign.sign(&h.engine.signer.verify(&a.state_token).unwrap());
    assert_eq!(rehydrate_err(&h, &forged).await.code(), "TOKEN_BAD_SIGNATURE");
}

async fn rehydrate_err(h: &Harness, state_token: &str) -> EngineError {
    h.engine
        .continue_workflow(ContinueRequest {
            state_token: state_token.to_string(),
            ..ContinueRequest::default()
        })
        .await
        .unwrap_err()
}

#[tokio::test]
async fn unhealthy_lock_is_retryable_and_writes_nothing() {
    let h = harness(linear());
    let first = start(&h, "linear").await;
    let before = h.log.event_count(&first.session_id);

    h.locks.set_healthy(false);
    let err = h.engine.continue_workflow(advance_request(&first, None)).await.unwrap_err();
    assert_eq!(err.code(), "LOCK_UNHEALTHY");
    assert!(err.is_retryable());
    assert_eq!(h.log.event_count(&first.session_id), before);

    h.locks.set_healthy(true);
    assert!(!advance(&h, &first).await.is_complete);
}

#[tokio::test]
async fn edited_workflow_is_detected() {
    let h = harness(linear());
    let first = start(&h, "linear").await;

    let mut edited = workflow(linear());
    edited.name = "Linear v2".to_string();
    h.workflows.insert(edited);

    let err = rehydrate_err(&h, &first.state_token).await;
    assert_eq!(err.code(), "WORKFLOW_HASH_MISMATCH");
}

#[tokio::test]
async fn unknown_workflow_and_session() {
    let h = harness(linear());
    let err = h
        .engine
        .start(StartRequest {
            workflow_id: "missing".into(),
            ..StartRequest::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "WORKFLOW_NOT_FOUND");

    let err = h.engine.inspect(&SessionId::generate()).await.unwrap_err();
    assert_eq!(err.code(), "SESSION_NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Read-only operations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn explain_step_traces_the_run_condition() {
    let h = harness(json!({
        "id": "cond",
        "name": "Cond",
        "steps": [
            { "id": "deep", "title": "Deep", "prompt": "x", "run_condition": { "var": "mode", "equals": "Thorough" } }
        ]
    }));
    let context = json!({ "mode": "thorough" }).as_object().cloned();
    let explanation = h.engine.explain_step("cond", "deep", context).await.unwrap();
    assert!(explanation.result);
    assert!(explanation.trace.is_some());

    let err = h.engine.explain_step("cond", "nope", None).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test]
async fn listings() {
    let h = harness(linear());
    let first = start(&h, "linear").await;
    assert_eq!(h.engine.list_sessions().await.unwrap(), vec![first.session_id]);
    let workflows = h.engine.list_workflows().await.unwrap();
    assert_eq!(workflows[0].id, "linear");
}
