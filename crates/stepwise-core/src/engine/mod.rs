//! Execution engine: the per-session gate and fork detector.
//!
//! Every mutating call has the same shape: verify tokens, rehydrate the
//! node's snapshot, run the interpreter, then take the session lock, re-read
//! truth and append the resulting events as one batch. Nothing is written
//! before the lock is held, and a call that fails leaves truth unchanged
//! apart from content-addressed snapshots, which are harmless to orphan.
//!
//! Replays are answered from truth alone: the outcome of an attempt is
//! recorded under its deterministic dedupe key, and responses are built only
//! from ids and snapshots, so the same `(state token, ack token)` pair always
//! serializes to the same bytes.

pub mod error;
pub mod keys;
pub mod response;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::error::{DomainError, RepositoryError};
use stepwise_types::event::{
    AdvanceOutcome, Autonomy, Blocker, BlockerCode, BlockerPointer, EdgeCause, ExecutionPreferences, GapRecord,
    NodeKind, SessionEventData,
};
use stepwise_types::execution::{ExecutionState, StepInstanceId, WorkflowEvent};
use stepwise_types::ids::{NodeId, RunId, SessionId, WorkflowHash, WorkflowHashRef};
use stepwise_types::token::{AttemptTokenPayload, StateTokenPayload, TokenError, TokenPayload, TokenScope};
use stepwise_types::workflow::WorkflowSummary;

use crate::durable::lock::{SessionLockManager, SessionLockWitness};
use crate::durable::log::{AppendPlan, EventLogError, SessionEventLog};
use crate::durable::projection::{AdvanceRecord, NodeRecord, RunTruth, SessionTruth};
use crate::durable::snapshot::{load_snapshot, put_snapshot, ExecutionSnapshot, SnapshotStore};
use crate::repository::workflow::WorkflowReader;
use crate::service::crypto::CryptoPort;
use crate::service::validator::OutputValidator;
use crate::token::{assert_token_scope_matches_state, Keyring, TokenSigner};
use crate::workflow::cache::CompiledWorkflowCache;
use crate::workflow::compiler::{canonical_definition_bytes, CompiledWorkflow};
use crate::workflow::condition::{explain, ConditionExplanation};
use crate::workflow::context::ExecutionContext;
use crate::workflow::interpreter::{self, Resolution};

pub use error::{EngineError, ErrorBody};
pub use response::{
    BlockedResponse, CheckpointRequest, CheckpointResponse, ContinueOutcome, ContinueRequest, PreferencesRequest,
    PreferencesResponse, StartRequest, StepResponse,
};

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Tunables taken from [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    pub lock_timeout: Duration,
    pub max_context_bytes: usize,
    pub default_autonomy: Autonomy,
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            lock_timeout: Duration::from_millis(config.lock_acquire_timeout_ms),
            max_context_bytes: config.max_context_bytes,
            default_autonomy: config.default_autonomy,
        }
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// The collaborators the engine drives.
pub struct EnginePorts<R, L, S, M, C, V> {
    pub workflows: Arc<R>,
    pub log: Arc<L>,
    pub snapshots: Arc<S>,
    pub locks: Arc<M>,
    pub crypto: Arc<C>,
    pub validator: Arc<V>,
}

/// Orchestrates start, continue, checkpoint and preference changes over
/// the durable ports.
///
/// Generic over every port so stepwise-core never depends on
/// stepwise-infra.
pub struct ExecutionEngine<R, L, S, M, C, V>
where
    R: WorkflowReader,
    L: SessionEventLog,
    S: SnapshotStore,
    M: SessionLockManager,
    C: CryptoPort,
    V: OutputValidator,
{
    workflows: Arc<R>,
    log: Arc<L>,
    snapshots: Arc<S>,
    locks: Arc<M>,
    crypto: Arc<C>,
    validator: Arc<V>,
    signer: TokenSigner<C>,
    cache: Arc<CompiledWorkflowCache>,
    options: EngineOptions,
}

/// A verified position: the node a state token points at, with everything
/// needed to resolve from it.
struct Position {
    truth: SessionTruth,
    node: NodeRecord,
    workflow: Arc<CompiledWorkflow>,
    snapshot: ExecutionSnapshot,
}

/// Ids shared by every token minted for one node.
struct NodeAddress<'a> {
    session_id: &'a SessionId,
    run_id: &'a RunId,
    node_id: &'a NodeId,
    workflow_hash_ref: &'a WorkflowHashRef,
}

impl<R, L, S, M, C, V> ExecutionEngine<R, L, S, M, C, V>
where
    R: WorkflowReader,
    L: SessionEventLog,
    S: SnapshotStore,
    M: SessionLockManager,
    C: CryptoPort,
    V: OutputValidator,
{
    pub fn new(
        ports: EnginePorts<R, L, S, M, C, V>,
        keyring: Keyring,
        cache: Arc<CompiledWorkflowCache>,
        options: EngineOptions,
    ) -> Self {
        let signer = TokenSigner::new(Arc::clone(&ports.crypto), keyring);
        Self {
            workflows: ports.workflows,
            log: ports.log,
            snapshots: ports.snapshots,
            locks: ports.locks,
            crypto: ports.crypto,
            validator: ports.validator,
            signer,
            cache,
            options,
        }
    }

    // -----------------------------------------------------------------------
    // start
    // -----------------------------------------------------------------------

    /// Create a session, start a run and resolve its first step.
    pub async fn start(&self, request: StartRequest) -> Result<StepResponse, EngineError> {
        let (workflow, hash) = self.load_workflow(&request.workflow_id).await?;
        let context = match request.context {
            Some(map) => ExecutionContext::from_value(Value::Object(map), self.options.max_context_bytes)?,
            None => ExecutionContext::new(),
        };

        let resolution = interpreter::next(&workflow, &ExecutionState::Init, &context)?;
        let snapshot_ref = put_snapshot(
            &*self.snapshots,
            &*self.crypto,
            &ExecutionSnapshot::new(resolution.state.clone(), context),
        )
        .await?;

        let session_id = SessionId::generate();
        let run_id = RunId::generate();
        let node_id = NodeId::generate();
        let hash_ref = hash.to_ref();
        let preferences = request.preferences.unwrap_or(ExecutionPreferences {
            autonomy: self.options.default_autonomy,
        });

        let plan = AppendPlan::new()
            .event(
                keys::session_created(&session_id),
                SessionEventData::SessionCreated {
                    workflow_id: workflow.id().to_string(),
                },
            )
            .event(
                keys::preferences_changed(&session_id, 0),
                SessionEventData::PreferencesChanged { preferences },
            )
            .event(
                keys::run_started(&session_id, &run_id),
                SessionEventData::RunStarted {
                    run_id: run_id.clone(),
                    workflow_id: workflow.id().to_string(),
                    workflow_hash: hash.clone(),
                    workflow_hash_ref: hash_ref.clone(),
                },
            )
            .event(
                keys::node_created(&session_id, &node_id),
                SessionEventData::NodeCreated {
                    run_id: run_id.clone(),
                    node_id: node_id.clone(),
                    node_kind: NodeKind::Step,
                    parent_node_id: None,
                    snapshot_ref: snapshot_ref.clone(),
                },
            )
            .pin(snapshot_ref);

        let witness = self.lock(&session_id).await?;
        self.log.append(&session_id, &witness, plan).await?;
        drop(witness);

        tracing::info!(
            session_id = %session_id,
            run_id = %run_id,
            node_id = %node_id,
            workflow_id = %workflow.id(),
            "session started"
        );

        let address = NodeAddress {
            session_id: &session_id,
            run_id: &run_id,
            node_id: &node_id,
            workflow_hash_ref: &hash_ref,
        };
        Ok(self.step_response(&address, resolution, 0))
    }

    // -----------------------------------------------------------------------
    // continue
    // -----------------------------------------------------------------------

    /// Rehydrate (no ack token) or advance (with ack token) from the node a
    /// state token points at.
    pub async fn continue_workflow(&self, request: ContinueRequest) -> Result<ContinueOutcome, EngineError> {
        let state = self.signer.verify_state(&request.state_token)?;
        let position = self.position(&state).await?;

        let Some(ack_token) = request.ack_token.as_deref() else {
            return self.rehydrate(&state, &position);
        };

        let ack = self.signer.verify_ack(ack_token)?;
        assert_token_scope_matches_state(&state, &ack)?;

        if let Some((ordinal, record)) = position.truth.recorded_advance(&position.node.node_id, &ack.attempt_id) {
            return self.replay(&state, &position, &position.truth, ordinal, record).await;
        }

        if let Some(intent) = request.intent.as_deref() {
            tracing::debug!(session_id = %state.scope.session_id, intent, "continue intent");
        }

        let pending = position.snapshot.state.pending_step().cloned().ok_or_else(|| {
            DomainError::invalid_state("workflow is complete; there is no pending step to continue")
        })?;
        if let Some(claimed) = &request.completed_step {
            // Rejects the claim with the interpreter's own mismatch error.
            interpreter::apply_event(&position.snapshot.state, &WorkflowEvent::step_completed(claimed.clone()))?;
        }

        let context = match &request.context {
            Some(update) => position.snapshot.context.merge(update, self.options.max_context_bytes)?,
            None => position.snapshot.context.clone(),
        };

        let blockers = self.check_contract(&position.workflow, &pending, request.output.as_ref(), &context);
        if !blockers.is_empty() && position.truth.preferences.autonomy == Autonomy::Guided {
            return self.block(&state, &position, &ack, blockers).await;
        }

        let gap = (!blockers.is_empty()).then(|| GapRecord {
            step_instance_key: pending.key().to_string(),
            blockers,
        });
        self.advance(&state, &position, &ack, &pending, context, gap).await
    }

    fn rehydrate(&self, state: &StateTokenPayload, position: &Position) -> Result<ContinueOutcome, EngineError> {
        let resolution = interpreter::next(&position.workflow, &position.snapshot.state, &position.snapshot.context)?;
        let ordinal = position.truth.advance_count(&position.node.node_id);
        tracing::debug!(
            session_id = %state.scope.session_id,
            node_id = %position.node.node_id,
            ordinal,
            "rehydrated"
        );
        Ok(ContinueOutcome::Ok(
            self.step_response(&address_of(state), resolution, ordinal),
        ))
    }

    /// Answer an attempt whose outcome is already recorded.
    async fn replay(
        &self,
        state: &StateTokenPayload,
        position: &Position,
        truth: &SessionTruth,
        ordinal: u32,
        record: &AdvanceRecord,
    ) -> Result<ContinueOutcome, EngineError> {
        tracing::info!(
            session_id = %state.scope.session_id,
            node_id = %record.from_node_id,
            attempt_id = %record.attempt_id,
            "replaying recorded advance"
        );
        match &record.outcome {
            AdvanceOutcome::Advanced { to_node_id } => {
                let target = truth
                    .node(to_node_id)
                    .ok_or_else(|| corrupt(&state.scope.session_id, format!("advance target {to_node_id} is missing")))?;
                let snapshot = load_snapshot(&*self.snapshots, &*self.crypto, &target.snapshot_ref).await?;
                let resolution = interpreter::next(&position.workflow, &snapshot.state, &snapshot.context)?;
                let address = NodeAddress {
                    node_id: to_node_id,
                    ..address_of(state)
                };
                Ok(ContinueOutcome::Ok(self.step_response(&address, resolution, 0)))
            }
            AdvanceOutcome::Blocked { blocked_node_id } => {
                let blockers = truth
                    .blocked_attempt(&record.from_node_id, &record.attempt_id)
                    .map(|rec| rec.blockers.clone())
                    .unwrap_or_default();
                self.blocked_response(state, position, blocked_node_id.clone(), blockers, ordinal)
                    .map(ContinueOutcome::Blocked)
            }
        }
    }

    /// Record a rejected attempt without advancing.
    async fn block(
        &self,
        state: &StateTokenPayload,
        position: &Position,
        ack: &AttemptTokenPayload,
        blockers: Vec<Blocker>,
    ) -> Result<ContinueOutcome, EngineError> {
        let session_id = &state.scope.session_id;
        let node_id = &position.node.node_id;

        let witness = self.lock(session_id).await?;
        let truth = self.log.load(session_id).await?;
        if let Some((ordinal, record)) = truth.recorded_advance(node_id, &ack.attempt_id) {
            drop(witness);
            return self.replay(state, position, &truth, ordinal, record).await;
        }

        let ordinal = truth.advance_count(node_id);
        let blocked_node_id = NodeId::generate();
        let plan = AppendPlan::new()
            .event(
                keys::node_created(session_id, &blocked_node_id),
                SessionEventData::NodeCreated {
                    run_id: state.scope.run_id.clone(),
                    node_id: blocked_node_id.clone(),
                    node_kind: NodeKind::BlockedAttempt,
                    parent_node_id: Some(node_id.clone()),
                    snapshot_ref: position.node.snapshot_ref.clone(),
                },
            )
            .event(
                keys::blocked_attempt(session_id, node_id, &ack.attempt_id),
                SessionEventData::BlockedAttempt {
                    run_id: state.scope.run_id.clone(),
                    from_node_id: node_id.clone(),
                    attempt_id: ack.attempt_id.clone(),
                    blocked_node_id: blocked_node_id.clone(),
                    blockers: blockers.clone(),
                },
            )
            .event(
                keys::advance_recorded(session_id, node_id, &ack.attempt_id),
                SessionEventData::AdvanceRecorded {
                    run_id: state.scope.run_id.clone(),
                    from_node_id: node_id.clone(),
                    attempt_id: ack.attempt_id.clone(),
                    outcome: AdvanceOutcome::Blocked {
                        blocked_node_id: blocked_node_id.clone(),
                    },
                },
            )
            .pin(position.node.snapshot_ref.clone());
        self.log.append(session_id, &witness, plan).await?;
        drop(witness);

        tracing::debug!(
            session_id = %session_id,
            node_id = %node_id,
            attempt_id = %ack.attempt_id,
            blockers = blockers.len(),
            "advance blocked by output contract"
        );
        self.blocked_response(state, position, blocked_node_id, blockers, ordinal)
            .map(ContinueOutcome::Blocked)
    }

    /// Apply the completion, resolve the next step and append the new node.
    async fn advance(
        &self,
        state: &StateTokenPayload,
        position: &Position,
        ack: &AttemptTokenPayload,
        pending: &StepInstanceId,
        context: ExecutionContext,
        gap: Option<GapRecord>,
    ) -> Result<ContinueOutcome, EngineError> {
        let session_id = &state.scope.session_id;
        let run_id = &state.scope.run_id;
        let from = &position.node.node_id;

        let event = WorkflowEvent::step_completed(pending.clone());
        let resolution = interpreter::resolve(&position.workflow, &position.snapshot.state, Some(&event), &context)?;
        let snapshot_ref = put_snapshot(
            &*self.snapshots,
            &*self.crypto,
            &ExecutionSnapshot::new(resolution.state.clone(), context),
        )
        .await?;

        let witness = self.lock(session_id).await?;
        let truth = self.log.load(session_id).await?;
        if let Some((ordinal, record)) = truth.recorded_advance(from, &ack.attempt_id) {
            drop(witness);
            return self.replay(state, position, &truth, ordinal, record).await;
        }

        let cause = if truth.has_advance_children(from) {
            EdgeCause::NonTipAdvance
        } else {
            EdgeCause::NormalAdvance
        };
        let to = NodeId::generate();

        let mut plan = AppendPlan::new()
            .event(
                keys::node_created(session_id, &to),
                SessionEventData::NodeCreated {
                    run_id: run_id.clone(),
                    node_id: to.clone(),
                    node_kind: NodeKind::Step,
                    parent_node_id: Some(from.clone()),
                    snapshot_ref: snapshot_ref.clone(),
                },
            )
            .event(
                keys::edge_created(session_id, from, &to),
                SessionEventData::EdgeCreated {
                    run_id: run_id.clone(),
                    from_node_id: from.clone(),
                    to_node_id: to.clone(),
                    cause,
                },
            )
            .pin(snapshot_ref);
        if let Some(gap) = gap {
            tracing::debug!(
                session_id = %session_id,
                node_id = %from,
                step = %gap.step_instance_key,
                "recording contract gap"
            );
            plan = plan.event(
                keys::gap_recorded(session_id, from, &ack.attempt_id),
                SessionEventData::GapRecorded {
                    run_id: run_id.clone(),
                    node_id: from.clone(),
                    gap,
                },
            );
        }
        plan = plan.event(
            keys::advance_recorded(session_id, from, &ack.attempt_id),
            SessionEventData::AdvanceRecorded {
                run_id: run_id.clone(),
                from_node_id: from.clone(),
                attempt_id: ack.attempt_id.clone(),
                outcome: AdvanceOutcome::Advanced { to_node_id: to.clone() },
            },
        );

        self.log.append(session_id, &witness, plan).await?;
        drop(witness);

        if cause == EdgeCause::NonTipAdvance {
            tracing::info!(
                session_id = %session_id,
                run_id = %run_id,
                from_node_id = %from,
                to_node_id = %to,
                "fork: advanced from a non-tip node"
            );
        } else {
            tracing::debug!(session_id = %session_id, from_node_id = %from, to_node_id = %to, "advanced");
        }

        let address = NodeAddress {
            node_id: &to,
            ..address_of(state)
        };
        Ok(ContinueOutcome::Ok(self.step_response(&address, resolution, 0)))
    }

    // -----------------------------------------------------------------------
    // checkpoint
    // -----------------------------------------------------------------------

    /// Record a checkpoint node on the node a checkpoint token points at.
    /// Idempotent per token.
    pub async fn checkpoint(&self, request: CheckpointRequest) -> Result<CheckpointResponse, EngineError> {
        let token = self.signer.verify_checkpoint(&request.checkpoint_token)?;
        let scope = &token.scope;
        let session_id = &scope.session_id;
        let dedupe_key = keys::checkpoint(session_id, &scope.node_id, &token.attempt_id);

        let truth = self.load_existing(session_id).await?;
        let (run, node) = step_node(&truth, &scope.run_id, &scope.node_id)?;
        if let Some(existing) = truth.node_by_dedupe_key(&dedupe_key) {
            tracing::info!(session_id = %session_id, node_id = %existing.node_id, "replaying recorded checkpoint");
            return Ok(self.checkpoint_response(&token, run, existing.node_id.clone()));
        }
        let snapshot_ref = node.snapshot_ref.clone();

        let witness = self.lock(session_id).await?;
        let truth = self.log.load(session_id).await?;
        if let Some(existing) = truth.node_by_dedupe_key(&dedupe_key) {
            return Ok(self.checkpoint_response(&token, run, existing.node_id.clone()));
        }

        let checkpoint_node_id = NodeId::generate();
        let plan = AppendPlan::new()
            .event(
                dedupe_key,
                SessionEventData::NodeCreated {
                    run_id: scope.run_id.clone(),
                    node_id: checkpoint_node_id.clone(),
                    node_kind: NodeKind::Checkpoint,
                    parent_node_id: Some(scope.node_id.clone()),
                    snapshot_ref: snapshot_ref.clone(),
                },
            )
            .event(
                keys::checkpoint_edge(session_id, &scope.node_id, &token.attempt_id),
                SessionEventData::EdgeCreated {
                    run_id: scope.run_id.clone(),
                    from_node_id: scope.node_id.clone(),
                    to_node_id: checkpoint_node_id.clone(),
                    cause: EdgeCause::CheckpointCreated,
                },
            )
            .pin(snapshot_ref);
        self.log.append(session_id, &witness, plan).await?;
        drop(witness);

        tracing::debug!(
            session_id = %session_id,
            node_id = %scope.node_id,
            checkpoint_node_id = %checkpoint_node_id,
            "checkpoint recorded"
        );
        Ok(self.checkpoint_response(&token, run, checkpoint_node_id))
    }

    fn checkpoint_response(
        &self,
        token: &AttemptTokenPayload,
        run: &RunTruth,
        checkpoint_node_id: NodeId,
    ) -> CheckpointResponse {
        let state_token = self.signer.sign(&TokenPayload::State(StateTokenPayload {
            scope: token.scope.clone(),
            workflow_hash_ref: run.workflow_hash_ref.clone(),
        }));
        CheckpointResponse {
            session_id: token.scope.session_id.clone(),
            run_id: token.scope.run_id.clone(),
            node_id: token.scope.node_id.clone(),
            checkpoint_node_id,
            state_token,
        }
    }

    // -----------------------------------------------------------------------
    // preferences
    // -----------------------------------------------------------------------

    /// Pin new execution preferences for the session a state token belongs
    /// to. Applies to every later advance.
    pub async fn set_preferences(&self, request: PreferencesRequest) -> Result<PreferencesResponse, EngineError> {
        let state = self.signer.verify_state(&request.state_token)?;
        let session_id = &state.scope.session_id;
        let truth = self.load_existing(session_id).await?;
        let (run, _) = step_node(&truth, &state.scope.run_id, &state.scope.node_id)?;
        if run.workflow_hash_ref != state.workflow_hash_ref {
            return Err(TokenError::ScopeMismatch {
                field: "workflow_hash_ref",
            }
            .into());
        }

        let witness = self.lock(session_id).await?;
        let truth = self.log.load(session_id).await?;
        if truth.preferences != request.preferences {
            let plan = AppendPlan::new().event(
                keys::preferences_changed(session_id, truth.preference_changes()),
                SessionEventData::PreferencesChanged {
                    preferences: request.preferences.clone(),
                },
            );
            self.log.append(session_id, &witness, plan).await?;
            tracing::debug!(session_id = %session_id, autonomy = ?request.preferences.autonomy, "preferences changed");
        }
        drop(witness);

        Ok(PreferencesResponse {
            session_id: session_id.clone(),
            preferences: request.preferences,
        })
    }

    // -----------------------------------------------------------------------
    // Read-only operations
    // -----------------------------------------------------------------------

    /// The projected truth of a session.
    pub async fn inspect(&self, session_id: &SessionId) -> Result<SessionTruth, EngineError> {
        self.load_existing(session_id).await
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionId>, EngineError> {
        Ok(self.log.list_sessions().await?)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        Ok(self.workflows.list_summaries().await?)
    }

    /// Explain how a step's run condition evaluates against `context`.
    pub async fn explain_step(
        &self,
        workflow_id: &str,
        step_id: &str,
        context: Option<serde_json::Map<String, Value>>,
    ) -> Result<ConditionExplanation, EngineError> {
        let (workflow, _) = self.load_workflow(workflow_id).await?;
        let step = workflow
            .step(step_id)
            .ok_or_else(|| DomainError::invalid_state(format!("workflow '{workflow_id}' has no step '{step_id}'")))?;
        let context = ExecutionContext::from_value(
            context.map(Value::Object).unwrap_or(Value::Null),
            self.options.max_context_bytes,
        )?;
        Ok(explain(step.run_condition(), context.variables()))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn lock(&self, session_id: &SessionId) -> Result<SessionLockWitness, EngineError> {
        Ok(self.locks.acquire(session_id, self.options.lock_timeout).await?)
    }

    async fn load_existing(&self, session_id: &SessionId) -> Result<SessionTruth, EngineError> {
        let truth = self.log.load(session_id).await?;
        if !truth.exists() {
            return Err(EngineError::SessionNotFound(session_id.clone()));
        }
        Ok(truth)
    }

    /// Read, hash and compile a workflow definition.
    async fn load_workflow(&self, workflow_id: &str) -> Result<(Arc<CompiledWorkflow>, WorkflowHash), EngineError> {
        let definition = self
            .workflows
            .get_workflow_by_id(workflow_id)
            .await?
            .ok_or_else(|| DomainError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        let bytes = canonical_definition_bytes(&definition).map_err(|e| RepositoryError::Parse {
            source_name: workflow_id.to_string(),
            message: e.to_string(),
        })?;
        let hash = WorkflowHash::from_digest(self.crypto.sha256(&bytes));
        let compiled = self.cache.get_or_compile(&definition, &hash)?;
        Ok((compiled, hash))
    }

    /// Resolve a verified state token to its node, workflow and snapshot.
    async fn position(&self, state: &StateTokenPayload) -> Result<Position, EngineError> {
        let scope = &state.scope;
        let truth = self.load_existing(&scope.session_id).await?;
        let (run, node) = step_node(&truth, &scope.run_id, &scope.node_id)?;
        if run.workflow_hash_ref != state.workflow_hash_ref {
            return Err(TokenError::ScopeMismatch {
                field: "workflow_hash_ref",
            }
            .into());
        }

        let (workflow, hash) = self.load_workflow(&run.workflow_id).await?;
        if hash != run.workflow_hash {
            tracing::warn!(
                session_id = %scope.session_id,
                workflow_id = %run.workflow_id,
                "workflow definition changed since the run started"
            );
            return Err(EngineError::WorkflowChanged {
                workflow_id: run.workflow_id.clone(),
            });
        }

        let snapshot = load_snapshot(&*self.snapshots, &*self.crypto, &node.snapshot_ref).await?;
        let node = node.clone();
        Ok(Position {
            truth,
            node,
            workflow,
            snapshot,
        })
    }

    /// Contract violations of `output` for the pending step, if any.
    fn check_contract(
        &self,
        workflow: &CompiledWorkflow,
        pending: &StepInstanceId,
        output: Option<&Value>,
        context: &ExecutionContext,
    ) -> Vec<Blocker> {
        let Some(contract) = workflow
            .prompt_step(&pending.step_id)
            .and_then(|step| step.output_contract.as_ref())
        else {
            return Vec::new();
        };
        let pointer = |field: Option<String>| BlockerPointer {
            step_id: pending.step_id.clone(),
            contract_ref: contract.contract_ref.clone(),
            field,
        };

        let Some(output) = output else {
            return vec![Blocker {
                code: BlockerCode::MissingRequiredOutput,
                message: format!(
                    "step '{}' requires output satisfying contract '{}'",
                    pending.step_id, contract.contract_ref
                ),
                pointer: pointer(None),
                suggestions: Vec::new(),
            }];
        };

        let context_value = Value::Object(context.variables().clone());
        let report = self.validator.validate(output, contract, Some(&context_value));
        if report.valid {
            return Vec::new();
        }
        if report.issues.is_empty() {
            return vec![Blocker {
                code: BlockerCode::InvalidRequiredOutput,
                message: format!("output does not satisfy contract '{}'", contract.contract_ref),
                pointer: pointer(None),
                suggestions: report.suggestions,
            }];
        }
        report
            .issues
            .into_iter()
            .map(|issue| Blocker {
                code: BlockerCode::InvalidRequiredOutput,
                message: issue.message,
                pointer: pointer(issue.field),
                suggestions: report.suggestions.clone(),
            })
            .collect()
    }

    fn sign_state(&self, address: &NodeAddress<'_>) -> String {
        self.signer.sign(&TokenPayload::State(StateTokenPayload {
            scope: address.scope(),
            workflow_hash_ref: address.workflow_hash_ref.clone(),
        }))
    }

    fn attempt_tokens(&self, address: &NodeAddress<'_>, ordinal: u32) -> (String, String) {
        let attempt = AttemptTokenPayload {
            scope: address.scope(),
            attempt_id: keys::derive_attempt_id(&*self.crypto, address.node_id, ordinal),
        };
        let ack = self.signer.sign(&TokenPayload::Ack(attempt.clone()));
        let checkpoint = self.signer.sign(&TokenPayload::Checkpoint(attempt));
        (ack, checkpoint)
    }

    fn step_response(&self, address: &NodeAddress<'_>, resolution: Resolution, ordinal: u32) -> StepResponse {
        let is_complete = resolution.is_complete();
        let (ack_token, checkpoint_token) = self.attempt_tokens(address, ordinal);
        StepResponse {
            session_id: address.session_id.clone(),
            run_id: address.run_id.clone(),
            node_id: address.node_id.clone(),
            state_token: self.sign_state(address),
            ack_token: (!is_complete).then_some(ack_token),
            checkpoint_token,
            pending: resolution.pending,
            is_complete,
        }
    }

    /// The `ordinal`-th attempt from the node was blocked; the retry is
    /// authorised as attempt `ordinal + 1`.
    fn blocked_response(
        &self,
        state: &StateTokenPayload,
        position: &Position,
        blocked_node_id: NodeId,
        blockers: Vec<Blocker>,
        ordinal: u32,
    ) -> Result<BlockedResponse, EngineError> {
        let address = address_of(state);
        let resolution = interpreter::next(&position.workflow, &position.snapshot.state, &position.snapshot.context)?;
        let (retry_ack_token, checkpoint_token) = self.attempt_tokens(&address, ordinal + 1);
        Ok(BlockedResponse {
            session_id: state.scope.session_id.clone(),
            run_id: state.scope.run_id.clone(),
            node_id: state.scope.node_id.clone(),
            blocked_node_id,
            blockers,
            state_token: self.sign_state(&address),
            retry_ack_token,
            checkpoint_token,
            pending: resolution.pending,
        })
    }
}

impl NodeAddress<'_> {
    fn scope(&self) -> TokenScope {
        TokenScope {
            session_id: self.session_id.clone(),
            run_id: self.run_id.clone(),
            node_id: self.node_id.clone(),
        }
    }
}

fn address_of(state: &StateTokenPayload) -> NodeAddress<'_> {
    NodeAddress {
        session_id: &state.scope.session_id,
        run_id: &state.scope.run_id,
        node_id: &state.scope.node_id,
        workflow_hash_ref: &state.workflow_hash_ref,
    }
}

/// The run and step node a token scope names.
fn step_node<'t>(
    truth: &'t SessionTruth,
    run_id: &RunId,
    node_id: &NodeId,
) -> Result<(&'t RunTruth, &'t NodeRecord), EngineError> {
    let run = truth
        .run(run_id)
        .ok_or_else(|| DomainError::invalid_state(format!("run {run_id} does not exist in this session")))?;
    let node = truth
        .node(node_id)
        .filter(|node| &node.run_id == run_id)
        .ok_or_else(|| DomainError::invalid_state(format!("node {node_id} does not exist in run {run_id}")))?;
    if node.kind != NodeKind::Step {
        return Err(DomainError::invalid_state(format!("node {node_id} is not a step node")).into());
    }
    Ok((run, node))
}

fn corrupt(session_id: &SessionId, message: String) -> EngineError {
    EngineError::EventLog(EventLogError::Corrupt {
        session_id: session_id.clone(),
        message,
    })
}

#[cfg(test)]
mod tests;
