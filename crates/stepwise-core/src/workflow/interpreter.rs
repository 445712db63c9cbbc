//! Step-resolution interpreter.
//!
//! Given a compiled workflow, the prior [`ExecutionState`], an optional
//! `step_completed` event and the execution context, produce the next pending
//! step (or completion) and the new state. Pure and deterministic: no I/O,
//! no clocks, no randomness.
//!
//! Resolution order at any position:
//! 1. inside a loop, scan the current iteration's body from `body_index`,
//!    skipping completed and ineligible steps;
//! 2. when the body is exhausted, decide whether the loop runs another
//!    iteration (bounded by `max_iterations` and the loop's own target);
//! 3. when the loop is done, pop its frame, mark the loop step completed in
//!    the enclosing scope and keep resolving there;
//! 4. outside any loop, scan forward from just after the last completed
//!    top-level step.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::error::DomainError;
use stepwise_types::execution::{
    ExecutionState, LoopFrame, LoopPathEntry, StepInstanceId, StepInstanceKey, WorkflowEvent,
};
use stepwise_types::workflow::{LoopCount, LoopKind, OutputContract};

use super::compiler::{CompiledLoop, CompiledStep, CompiledWorkflow};
use super::condition::{self, ConditionContext};
use super::context::{render_template, ExecutionContext};

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// The step the client must perform next, rendered for presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStep {
    pub step_instance_id: StepInstanceId,
    pub step_instance_key: StepInstanceKey,
    pub title: String,
    /// Prompt with `{{...}}` placeholders rendered.
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub guidance: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contract: Option<OutputContract>,
}

/// Result of one interpreter call.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: ExecutionState,
    /// `None` exactly when `state` is `Complete`.
    pub pending: Option<PendingStep>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Apply a completion event to a state.
///
/// The event must reference exactly the pending step instance; anything else
/// is an `invalid_state` error and the input state is untouched.
pub fn apply_event(state: &ExecutionState, event: &WorkflowEvent) -> Result<ExecutionState, DomainError> {
    let WorkflowEvent::StepCompleted { step_instance_id } = event;
    match state {
        ExecutionState::Init => Err(DomainError::invalid_state(format!(
            "cannot complete '{}' before the workflow has started",
            step_instance_id.key()
        ))),
        ExecutionState::Complete => Err(DomainError::invalid_state(format!(
            "cannot complete '{}': workflow is already complete",
            step_instance_id.key()
        ))),
        ExecutionState::Running {
            completed,
            loop_stack,
            pending_step,
        } => match pending_step {
            Some(pending) if pending == step_instance_id => {
                let mut completed = completed.clone();
                completed.insert(pending.key());
                Ok(ExecutionState::Running {
                    completed,
                    loop_stack: loop_stack.clone(),
                    pending_step: None,
                })
            }
            Some(pending) => Err(DomainError::invalid_state(format!(
                "completed step '{}' does not match pending step '{}'",
                step_instance_id.key(),
                pending.key()
            ))),
            None => Err(DomainError::invalid_state(format!(
                "no step is pending; cannot complete '{}'",
                step_instance_id.key()
            ))),
        },
    }
}

/// Resolve the next pending step from `state`.
///
/// A state that already has a pending step resolves to that same step.
pub fn next(
    workflow: &CompiledWorkflow,
    state: &ExecutionState,
    context: &ExecutionContext,
) -> Result<Resolution, DomainError> {
    let (completed, loop_stack) = match state {
        ExecutionState::Complete => {
            return Ok(Resolution {
                state: ExecutionState::Complete,
                pending: None,
            });
        }
        ExecutionState::Init => (BTreeSet::new(), Vec::new()),
        ExecutionState::Running {
            loop_stack,
            pending_step: Some(pending),
            ..
        } => {
            let projected = context.project(&loop_vars(workflow, loop_stack, context)?);
            let pending = render_pending(workflow, pending, &projected)?;
            return Ok(Resolution {
                state: state.clone(),
                pending: Some(pending),
            });
        }
        ExecutionState::Running {
            completed,
            loop_stack,
            pending_step: None,
        } => (completed.clone(), loop_stack.clone()),
    };

    let mut cursor = Cursor {
        workflow,
        context,
        completed,
        stack: loop_stack,
    };
    match cursor.resolve()? {
        Some(instance) => {
            let projected = context.project(&loop_vars(workflow, &cursor.stack, context)?);
            let pending = render_pending(workflow, &instance, &projected)?;
            Ok(Resolution {
                state: ExecutionState::Running {
                    completed: cursor.completed,
                    loop_stack: cursor.stack,
                    pending_step: Some(instance),
                },
                pending: Some(pending),
            })
        }
        None => Ok(Resolution {
            state: ExecutionState::Complete,
            pending: None,
        }),
    }
}

/// Apply an optional completion event, then resolve the next step.
pub fn resolve(
    workflow: &CompiledWorkflow,
    state: &ExecutionState,
    event: Option<&WorkflowEvent>,
    context: &ExecutionContext,
) -> Result<Resolution, DomainError> {
    match event {
        Some(event) => {
            let applied = apply_event(state, event)?;
            next(workflow, &applied, context)
        }
        None => next(workflow, state, context),
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    workflow: &'a CompiledWorkflow,
    context: &'a ExecutionContext,
    completed: BTreeSet<StepInstanceKey>,
    stack: Vec<LoopFrame>,
}

impl<'a> Cursor<'a> {
    fn resolve(&mut self) -> Result<Option<StepInstanceId>, DomainError> {
        loop {
            if self.stack.is_empty() {
                return self.resolve_top_level();
            }
            if let Some(instance) = self.resolve_in_loop()? {
                return Ok(Some(instance));
            }
        }
    }

    /// Scan the top-level sequence forward. Returns the pending instance, or
    /// `None` when the workflow is complete. Entering a loop returns to the
    /// caller with the new frame pushed.
    fn resolve_top_level(&mut self) -> Result<Option<StepInstanceId>, DomainError> {
        let workflow = self.workflow;
        let sequence = workflow.sequence();
        let start = sequence
            .iter()
            .rposition(|id| self.completed.contains(&StepInstanceId::top_level(id.as_str()).key()))
            .map_or(0, |i| i + 1);

        for step_id in &sequence[start..] {
            let instance = StepInstanceId::top_level(step_id.as_str());
            match self.consider(&instance)? {
                Step::Pending => return Ok(Some(instance)),
                Step::EnteredLoop => return self.resolve(),
                Step::Skipped => {}
            }
        }
        Ok(None)
    }

    /// Work on the innermost frame. Returns `Some` for a pending step, `None`
    /// when the stack changed and resolution should continue.
    fn resolve_in_loop(&mut self) -> Result<Option<StepInstanceId>, DomainError> {
        let depth = self.stack.len() - 1;
        let loop_id = self.stack[depth].loop_id.clone();
        let lp = self.loop_def(&loop_id)?;

        while self.stack[depth].body_index < lp.body.len() {
            let step_id = &lp.body[self.stack[depth].body_index];
            let instance = StepInstanceId {
                step_id: step_id.clone(),
                loop_path: self.loop_path(),
            };
            match self.consider(&instance)? {
                Step::Pending => return Ok(Some(instance)),
                Step::EnteredLoop => return Ok(None),
                Step::Skipped => self.stack[depth].body_index += 1,
            }
        }

        // Body exhausted for this iteration.
        let next_iteration = self.stack[depth].iteration + 1;
        let enclosing = &self.stack[..depth];
        if self.should_iterate(lp, next_iteration, enclosing)? {
            let frame = &mut self.stack[depth];
            frame.iteration = next_iteration;
            frame.body_index = 0;
            tracing::trace!(loop_id = %loop_id, iteration = next_iteration, "loop iteration");
        } else {
            self.stack.pop();
            let loop_instance = StepInstanceId {
                step_id: loop_id.clone(),
                loop_path: self.loop_path(),
            };
            self.completed.insert(loop_instance.key());
            tracing::trace!(loop_id = %loop_id, iterations = next_iteration, "loop exited");
        }
        Ok(None)
    }

    /// Decide what to do with one step instance at the current position.
    fn consider(&mut self, instance: &StepInstanceId) -> Result<Step, DomainError> {
        if self.completed.contains(&instance.key()) {
            return Ok(Step::Skipped);
        }
        let workflow = self.workflow;
        let step = workflow.step(&instance.step_id).ok_or_else(|| {
            DomainError::invalid_state(format!("unknown step '{}'", instance.step_id))
        })?;

        let projected = self
            .context
            .project(&loop_vars(self.workflow, &self.stack, self.context)?);
        if !condition::evaluate(step.run_condition(), &projected) {
            tracing::trace!(step = %instance.key(), "run_condition not met, skipping");
            return Ok(Step::Skipped);
        }

        match step {
            CompiledStep::Prompt(_) => Ok(Step::Pending),
            CompiledStep::Loop(lp) => {
                if self.should_iterate(lp, 0, &self.stack.clone())? {
                    self.stack.push(LoopFrame {
                        loop_id: lp.id.clone(),
                        iteration: 0,
                        body_index: 0,
                    });
                    Ok(Step::EnteredLoop)
                } else {
                    // Zero iterations: the loop is done without running.
                    self.completed.insert(instance.key());
                    Ok(Step::Skipped)
                }
            }
        }
    }

    /// Whether `lp` should run iteration `iteration`, given the frames that
    /// enclose it.
    fn should_iterate(
        &self,
        lp: &CompiledLoop,
        iteration: u32,
        enclosing: &[LoopFrame],
    ) -> Result<bool, DomainError> {
        let config = &lp.config;
        let max = config.max_iterations;

        let mut vars = loop_vars(self.workflow, enclosing, self.context)?;
        vars.push((config.index_var().to_string(), Value::from(iteration)));
        let projected = self.context.project(&vars);

        match config.kind {
            LoopKind::For => {
                let target = for_count(lp, &projected)?;
                Ok(iteration < max && u64::from(iteration) < target)
            }
            LoopKind::ForEach => {
                let items = for_each_items(lp, &projected)?;
                Ok(iteration < max && (iteration as usize) < items.len())
            }
            LoopKind::While | LoopKind::Until => {
                let holds = condition::evaluate(config.condition.as_ref(), &projected);
                let wants_more = if config.kind == LoopKind::While { holds } else { !holds };
                if wants_more && iteration >= max {
                    return Err(DomainError::MaxIterationsExceeded {
                        loop_id: lp.id.clone(),
                        max_iterations: max,
                    });
                }
                Ok(wants_more)
            }
        }
    }

    fn loop_def(&self, loop_id: &str) -> Result<&'a CompiledLoop, DomainError> {
        self.workflow
            .loop_step(loop_id)
            .ok_or_else(|| DomainError::invalid_loop(loop_id, "loop frame references an unknown loop"))
    }

    fn loop_path(&self) -> Vec<LoopPathEntry> {
        self.stack
            .iter()
            .map(|frame| LoopPathEntry {
                loop_id: frame.loop_id.clone(),
                iteration: frame.iteration,
            })
            .collect()
    }
}

enum Step {
    Pending,
    EnteredLoop,
    Skipped,
}

// ---------------------------------------------------------------------------
// Loop helpers
// ---------------------------------------------------------------------------

/// Loop variables contributed by `frames`, outermost first so inner loops
/// shadow outer ones.
fn loop_vars(
    workflow: &CompiledWorkflow,
    frames: &[LoopFrame],
    context: &ExecutionContext,
) -> Result<Vec<(String, Value)>, DomainError> {
    let mut vars = Vec::new();
    for frame in frames {
        let lp = workflow.loop_step(&frame.loop_id).ok_or_else(|| {
            DomainError::invalid_loop(&frame.loop_id, "loop frame references an unknown loop")
        })?;
        vars.push((lp.config.index_var().to_string(), Value::from(frame.iteration)));
        if lp.config.kind == LoopKind::ForEach {
            let projected = context.project(&vars);
            if let Ok(items) = for_each_items(lp, &projected) {
                if let Some(item) = items.get(frame.iteration as usize) {
                    vars.push((lp.config.item_var().to_string(), item.clone()));
                }
            }
        }
    }
    Ok(vars)
}

fn for_count(lp: &CompiledLoop, context: &ConditionContext) -> Result<u64, DomainError> {
    match &lp.config.count {
        Some(LoopCount::Literal(n)) => Ok(*n),
        Some(LoopCount::Variable(name)) => match condition::lookup(context, name) {
            Value::Null => Err(DomainError::MissingContext {
                message: format!("loop '{}' count variable '{name}' is not set", lp.id),
            }),
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .ok_or_else(|| DomainError::invalid_loop(&lp.id, format!("count '{name}' is negative"))),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| DomainError::invalid_loop(&lp.id, format!("count '{name}' is not a number"))),
            _ => Err(DomainError::invalid_loop(&lp.id, format!("count '{name}' is not a number"))),
        },
        None => Err(DomainError::invalid_loop(&lp.id, "for loop has no count")),
    }
}

fn for_each_items(lp: &CompiledLoop, context: &ConditionContext) -> Result<Vec<Value>, DomainError> {
    let name = lp.config.items.as_deref().unwrap_or_default();
    match condition::lookup(context, name) {
        Value::Array(items) => Ok(items),
        Value::Null => Err(DomainError::MissingContext {
            message: format!("loop '{}' items variable '{name}' is not set", lp.id),
        }),
        _ => Err(DomainError::invalid_loop(&lp.id, format!("items '{name}' is not an array"))),
    }
}

fn render_pending(
    workflow: &CompiledWorkflow,
    instance: &StepInstanceId,
    context: &ConditionContext,
) -> Result<PendingStep, DomainError> {
    let step = workflow.prompt_step(&instance.step_id).ok_or_else(|| {
        DomainError::invalid_state(format!("pending step '{}' is not a prompt step", instance.step_id))
    })?;
    Ok(PendingStep {
        step_instance_id: instance.clone(),
        step_instance_key: instance.key(),
        title: step.title.clone(),
        prompt: render_template(&step.prompt, context),
        guidance: step.guidance.clone().unwrap_or_default(),
        output_contract: step.output_contract.clone(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::compiler::compile;
    use proptest::prelude::*;
    use serde_json::json;
    use stepwise_types::workflow::WorkflowDefinition;

    fn workflow(steps: Value) -> CompiledWorkflow {
        let def: WorkflowDefinition =
            serde_json::from_value(json!({ "id": "wf", "name": "WF", "steps": steps })).unwrap();
        compile(&def).unwrap()
    }

    fn ctx(value: Value) -> ExecutionContext {
        ExecutionContext::from_value(value, 1 << 20).unwrap()
    }

    fn prompt(id: &str) -> Value {
        json!({ "id": id, "title": id, "prompt": format!("do {id}") })
    }

    /// Drive a workflow to completion, returning every pending key in order.
    fn run_to_end(wf: &CompiledWorkflow, context: &ExecutionContext) -> Result<Vec<String>, DomainError> {
        let mut keys = Vec::new();
        let mut resolution = next(wf, &ExecutionState::Init, context)?;
        while let Some(pending) = resolution.pending.clone() {
            keys.push(pending.step_instance_key.to_string());
            assert!(keys.len() < 100, "runaway workflow");
            let event = WorkflowEvent::step_completed(pending.step_instance_id);
            resolution = resolve(wf, &resolution.state, Some(&event), context)?;
        }
        assert!(resolution.is_complete());
        Ok(keys)
    }

    #[test]
    fn sequential_steps_then_complete() {
        let wf = workflow(json!([prompt("a"), prompt("b")]));
        assert_eq!(run_to_end(&wf, &ctx(json!({}))).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn empty_workflow_completes_immediately() {
        let wf = workflow(json!([]));
        let resolution = next(&wf, &ExecutionState::Init, &ctx(json!({}))).unwrap();
        assert!(resolution.is_complete());
        assert!(resolution.pending.is_none());
    }

    #[test]
    fn run_conditions_skip_steps() {
        let wf = workflow(json!([
            { "id": "a", "title": "A", "run_condition": { "var": "mode", "equals": "deep" } },
            prompt("b"),
            { "id": "c", "title": "C", "run_condition": { "var": "mode", "equals": "quick" } }
        ]));
        assert_eq!(run_to_end(&wf, &ctx(json!({ "mode": "Quick" }))).unwrap(), vec!["b", "c"]);
        assert_eq!(run_to_end(&wf, &ctx(json!({ "mode": "deep" }))).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn for_loop_single_step_body() {
        let wf = workflow(json!([
            { "id": "l", "title": "L", "loop": { "type": "for", "count": 2, "max_iterations": 10 }, "body": "work" },
            prompt("work")
        ]));
        let context = ctx(json!({}));
        let first = next(&wf, &ExecutionState::Init, &context).unwrap();
        let pending = first.pending.clone().unwrap();
        assert_eq!(
            pending.step_instance_id.loop_path,
            vec![LoopPathEntry { loop_id: "l".into(), iteration: 0 }]
        );

        let second = resolve(
            &wf,
            &first.state,
            Some(&WorkflowEvent::step_completed(pending.step_instance_id)),
            &context,
        )
        .unwrap();
        let pending = second.pending.clone().unwrap();
        assert_eq!(
            pending.step_instance_id.loop_path,
            vec![LoopPathEntry { loop_id: "l".into(), iteration: 1 }]
        );

        let done = resolve(
            &wf,
            &second.state,
            Some(&WorkflowEvent::step_completed(pending.step_instance_id)),
            &context,
        )
        .unwrap();
        assert!(done.is_complete());
        assert!(done.pending.is_none());
    }

    #[test]
    fn for_loop_is_clamped_to_max_iterations() {
        let wf = workflow(json!([
            { "id": "l", "title": "L", "loop": { "type": "for", "count": 5, "max_iterations": 2 }, "body": [ prompt("w") ] },
            prompt("after")
        ]));
        assert_eq!(
            run_to_end(&wf, &ctx(json!({}))).unwrap(),
            vec!["l@0::w", "l@1::w", "after"]
        );
    }

    #[test]
    fn multi_step_body_increments_after_whole_body() {
        let wf = workflow(json!([
            { "id": "l", "title": "L", "loop": { "type": "for", "count": 2, "max_iterations": 3 },
              "body": [ prompt("x"), prompt("y") ] }
        ]));
        assert_eq!(
            run_to_end(&wf, &ctx(json!({}))).unwrap(),
            vec!["l@0::x", "l@0::y", "l@1::x", "l@1::y"]
        );
    }

    #[test]
    fn for_count_from_context_variable() {
        let wf = workflow(json!([
            { "id": "l", "title": "L", "loop": { "type": "for", "count": "rounds", "max_iterations": 9 }, "body": [ prompt("w") ] }
        ]));
        assert_eq!(run_to_end(&wf, &ctx(json!({ "rounds": "3" }))).unwrap().len(), 3);
        let err = run_to_end(&wf, &ctx(json!({}))).unwrap_err();
        assert_eq!(err.code(), "MISSING_CONTEXT");
    }

    #[test]
    fn for_each_projects_item_and_index() {
        let wf = workflow(json!([
            { "id": "files", "title": "Files",
              "loop": { "type": "for_each", "items": "paths", "item_var": "path", "max_iterations": 10 },
              "body": [ { "id": "review", "title": "Review", "prompt": "Review {{path}} ({{currentIteration}})" } ] }
        ]));
        let context = ctx(json!({ "paths": ["a.rs", "b.rs"] }));
        let first = next(&wf, &ExecutionState::Init, &context).unwrap();
        assert_eq!(first.pending.as_ref().unwrap().prompt, "Review a.rs (0)");

        let event = WorkflowEvent::step_completed(first.pending.unwrap().step_instance_id);
        let second = resolve(&wf, &first.state, Some(&event), &context).unwrap();
        assert_eq!(second.pending.as_ref().unwrap().prompt, "Review b.rs (1)");
        assert_eq!(run_to_end(&wf, &context).unwrap().len(), 2);
    }

    #[test]
    fn empty_for_each_skips_loop() {
        let wf = workflow(json!([
            { "id": "l", "title": "L", "loop": { "type": "for_each", "items": "xs", "max_iterations": 3 }, "body": [ prompt("w") ] },
            prompt("after")
        ]));
        assert_eq!(run_to_end(&wf, &ctx(json!({ "xs": [] }))).unwrap(), vec!["after"]);
    }

    #[test]
    fn while_loop_uses_iteration_variable() {
        let wf = workflow(json!([
            { "id": "l", "title": "L",
              "loop": { "type": "while", "condition": { "var": "currentIteration", "lt": 2 }, "max_iterations": 5 },
              "body": [ prompt("w") ] }
        ]));
        assert_eq!(run_to_end(&wf, &ctx(json!({}))).unwrap(), vec!["l@0::w", "l@1::w"]);
    }

    #[test]
    fn until_loop_stops_when_condition_holds() {
        let wf = workflow(json!([
            { "id": "l", "title": "L",
              "loop": { "type": "until", "condition": { "var": "currentIteration", "gte": 1 }, "max_iterations": 5 },
              "body": [ prompt("w") ] }
        ]));
        assert_eq!(run_to_end(&wf, &ctx(json!({}))).unwrap(), vec!["l@0::w"]);
    }

    #[test]
    fn unbounded_while_hits_max_iterations() {
        let wf = workflow(json!([
            { "id": "l", "title": "L",
              "loop": { "type": "while", "condition": { "var": "keepGoing" }, "max_iterations": 2 },
              "body": [ prompt("w") ] }
        ]));
        let err = run_to_end(&wf, &ctx(json!({ "keepGoing": true }))).unwrap_err();
        assert_eq!(
            err,
            DomainError::MaxIterationsExceeded { loop_id: "l".into(), max_iterations: 2 }
        );
    }

    #[test]
    fn nested_loops_build_full_paths() {
        let wf = workflow(json!([
            { "id": "outer", "title": "O", "loop": { "type": "for", "count": 2, "max_iterations": 2 },
              "body": [
                { "id": "inner", "title": "I", "loop": { "type": "for", "count": 2, "max_iterations": 2 },
                  "body": [ prompt("s") ] }
              ] },
            prompt("end")
        ]));
        assert_eq!(
            run_to_end(&wf, &ctx(json!({}))).unwrap(),
            vec![
                "outer@0/inner@0::s",
                "outer@0/inner@1::s",
                "outer@1/inner@0::s",
                "outer@1/inner@1::s",
                "end"
            ]
        );
    }

    #[test]
    fn body_conditions_see_loop_variables() {
        let wf = workflow(json!([
            { "id": "l", "title": "L", "loop": { "type": "for", "count": 3, "max_iterations": 3 },
              "body": [
                prompt("always"),
                { "id": "odd", "title": "Odd", "run_condition": { "var": "currentIteration", "equals": 1 } }
              ] }
        ]));
        assert_eq!(
            run_to_end(&wf, &ctx(json!({}))).unwrap(),
            vec!["l@0::always", "l@1::always", "l@1::odd", "l@2::always"]
        );
    }

    #[test]
    fn mismatched_event_is_invalid_state() {
        let wf = workflow(json!([prompt("a"), prompt("b")]));
        let context = ctx(json!({}));
        let first = next(&wf, &ExecutionState::Init, &context).unwrap();
        let wrong = WorkflowEvent::step_completed(StepInstanceId::top_level("b"));
        let err = resolve(&wf, &first.state, Some(&wrong), &context).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");

        let err = apply_event(&ExecutionState::Init, &wrong).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        let err = apply_event(&ExecutionState::Complete, &wrong).unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[test]
    fn next_on_pending_state_is_stable() {
        let wf = workflow(json!([prompt("a")]));
        let context = ctx(json!({}));
        let first = next(&wf, &ExecutionState::Init, &context).unwrap();
        let again = next(&wf, &first.state, &context).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn frames_never_reach_max_iterations() {
        let wf = workflow(json!([
            { "id": "l", "title": "L", "loop": { "type": "for", "count": 50, "max_iterations": 3 }, "body": [ prompt("w") ] }
        ]));
        let context = ctx(json!({}));
        let mut resolution = next(&wf, &ExecutionState::Init, &context).unwrap();
        while let Some(pending) = resolution.pending.clone() {
            if let ExecutionState::Running { loop_stack, .. } = &resolution.state {
                assert!(loop_stack.iter().all(|frame| frame.iteration < 3));
            }
            let event = WorkflowEvent::step_completed(pending.step_instance_id);
            resolution = resolve(&wf, &resolution.state, Some(&event), &context).unwrap();
        }
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(count in 0u64..6, max in 1u32..6, mode in "[a-c]") {
            let wf = workflow(json!([
                { "id": "pre", "title": "P", "run_condition": { "var": "mode", "equals": "a" } },
                { "id": "l", "title": "L", "loop": { "type": "for", "count": count, "max_iterations": max },
                  "body": [ prompt("x"), { "id": "y", "title": "Y", "run_condition": { "var": "mode", "not_equals": "b" } } ] },
                prompt("post")
            ]));
            let context = ctx(json!({ "mode": mode.clone() }));
            let first = run_to_end(&wf, &context).unwrap();
            let second = run_to_end(&wf, &context).unwrap();
            prop_assert_eq!(&first, &second);
            let loop_steps = first.iter().filter(|k| k.starts_with("l@")).count() as u64;
            let per_iteration = if mode == "b" { 1 } else { 2 };
            prop_assert_eq!(loop_steps, count.min(u64::from(max)) * per_iteration);
        }
    }
}
