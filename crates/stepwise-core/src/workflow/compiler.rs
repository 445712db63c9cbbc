//! Workflow compilation: structural validation and indexing.
//!
//! `compile` turns an authored [`WorkflowDefinition`] into a
//! [`CompiledWorkflow`]: every step indexed by id, every loop body resolved
//! to an ordered list of step ids, and every condition checked for shape.
//! Compilation is pure; callers memoize through
//! [`CompiledWorkflowCache`](super::cache::CompiledWorkflowCache).

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use stepwise_types::error::DomainError;
use stepwise_types::workflow::{
    LoopBody, LoopConfig, LoopCount, LoopKind, PromptStepDefinition, StepDefinition,
    WorkflowDefinition,
};

use super::condition;

// ---------------------------------------------------------------------------
// Compiled model
// ---------------------------------------------------------------------------

/// A loop step with its body resolved to step ids.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledLoop {
    pub id: String,
    pub title: String,
    pub config: LoopConfig,
    /// Body step ids in execution order.
    pub body: Vec<String>,
    pub run_condition: Option<Value>,
}

/// Any indexed step.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledStep {
    Prompt(PromptStepDefinition),
    Loop(CompiledLoop),
}

impl CompiledStep {
    pub fn id(&self) -> &str {
        match self {
            CompiledStep::Prompt(step) => &step.id,
            CompiledStep::Loop(step) => &step.id,
        }
    }

    pub fn run_condition(&self) -> Option<&Value> {
        match self {
            CompiledStep::Prompt(step) => step.run_condition.as_ref(),
            CompiledStep::Loop(step) => step.run_condition.as_ref(),
        }
    }
}

/// Validated, indexed form of a workflow definition.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledWorkflow {
    definition: WorkflowDefinition,
    /// Top-level sequence, excluding steps claimed as loop bodies.
    sequence: Vec<String>,
    steps: HashMap<String, CompiledStep>,
}

impl CompiledWorkflow {
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Top-level step ids in execution order.
    pub fn sequence(&self) -> &[String] {
        &self.sequence
    }

    pub fn step(&self, step_id: &str) -> Option<&CompiledStep> {
        self.steps.get(step_id)
    }

    pub fn prompt_step(&self, step_id: &str) -> Option<&PromptStepDefinition> {
        match self.steps.get(step_id) {
            Some(CompiledStep::Prompt(step)) => Some(step),
            _ => None,
        }
    }

    pub fn loop_step(&self, loop_id: &str) -> Option<&CompiledLoop> {
        match self.steps.get(loop_id) {
            Some(CompiledStep::Loop(step)) => Some(step),
            _ => None,
        }
    }

    /// Number of indexed steps, loop bodies included.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

// ---------------------------------------------------------------------------
// compile
// ---------------------------------------------------------------------------

/// Validate and index a workflow definition.
pub fn compile(definition: &WorkflowDefinition) -> Result<CompiledWorkflow, DomainError> {
    if definition.id.trim().is_empty() {
        return Err(DomainError::invalid_state("workflow id must not be empty"));
    }

    let mut steps: HashMap<String, CompiledStep> = HashMap::new();
    let top_level_ids: Vec<String> = definition.steps.iter().map(|s| s.id().to_string()).collect();
    for step in &definition.steps {
        index_step(step, &mut steps)?;
    }

    // Referenced bodies must name top-level steps; those steps leave the
    // top-level sequence and run only inside their loop.
    let top_level: HashSet<&str> = top_level_ids.iter().map(String::as_str).collect();
    let mut claimed: HashSet<String> = HashSet::new();
    for step in steps.values() {
        if let CompiledStep::Loop(lp) = step {
            if let Some(LoopBody::Reference(target)) = reference_body(definition, &lp.id) {
                if target == &lp.id {
                    return Err(DomainError::invalid_loop(&lp.id, "loop body references the loop itself"));
                }
                if !top_level.contains(target.as_str()) {
                    return Err(DomainError::invalid_loop(
                        &lp.id,
                        format!("body references unknown top-level step '{target}'"),
                    ));
                }
                claimed.insert(target.clone());
            }
        }
    }

    detect_reference_cycles(&steps)?;

    let sequence: Vec<String> = top_level_ids
        .into_iter()
        .filter(|id| !claimed.contains(id))
        .collect();

    tracing::debug!(
        workflow_id = %definition.id,
        steps = steps.len(),
        top_level = sequence.len(),
        "workflow compiled"
    );

    Ok(CompiledWorkflow {
        definition: definition.clone(),
        sequence,
        steps,
    })
}

fn index_step(step: &StepDefinition, steps: &mut HashMap<String, CompiledStep>) -> Result<(), DomainError> {
    let id = step.id();
    if id.trim().is_empty() {
        return Err(DomainError::invalid_state("step id must not be empty"));
    }
    if steps.contains_key(id) {
        return Err(DomainError::invalid_state(format!("duplicate step id '{id}'")));
    }
    if let Some(cond) = step.run_condition() {
        condition::validate(cond, &format!("run_condition of step '{id}'"))?;
    }

    match step {
        StepDefinition::Prompt(prompt) => {
            steps.insert(id.to_string(), CompiledStep::Prompt(prompt.clone()));
        }
        StepDefinition::Loop(lp) => {
            validate_loop_config(&lp.id, &lp.loop_config)?;
            let body = match &lp.body {
                LoopBody::Reference(target) => vec![target.clone()],
                LoopBody::Inline(inline) => {
                    if inline.is_empty() {
                        return Err(DomainError::invalid_loop(&lp.id, "loop body is empty"));
                    }
                    inline.iter().map(|s| s.id().to_string()).collect()
                }
            };
            // Register the loop before its inline children so a child
            // reusing the loop's id is reported as a duplicate.
            steps.insert(
                id.to_string(),
                CompiledStep::Loop(CompiledLoop {
                    id: lp.id.clone(),
                    title: lp.title.clone(),
                    config: lp.loop_config.clone(),
                    body,
                    run_condition: lp.run_condition.clone(),
                }),
            );
            if let LoopBody::Inline(inline) = &lp.body {
                for child in inline {
                    index_step(child, steps)?;
                }
            }
        }
    }
    Ok(())
}

fn validate_loop_config(loop_id: &str, config: &LoopConfig) -> Result<(), DomainError> {
    if config.max_iterations == 0 {
        return Err(DomainError::invalid_loop(loop_id, "max_iterations must be at least 1"));
    }
    match config.kind {
        LoopKind::While | LoopKind::Until => {
            let cond = config
                .condition
                .as_ref()
                .ok_or_else(|| DomainError::invalid_loop(loop_id, "while/until loops need a condition"))?;
            condition::validate(cond, &format!("condition of loop '{loop_id}'"))?;
        }
        LoopKind::For => match &config.count {
            None => return Err(DomainError::invalid_loop(loop_id, "for loops need a count")),
            Some(LoopCount::Variable(name)) if name.trim().is_empty() => {
                return Err(DomainError::invalid_loop(loop_id, "count variable name is empty"));
            }
            Some(_) => {}
        },
        LoopKind::ForEach => {
            if config.items.as_deref().is_none_or(|s| s.trim().is_empty()) {
                return Err(DomainError::invalid_loop(loop_id, "for_each loops need an items variable"));
            }
        }
    }
    Ok(())
}

/// Find the authored body of a loop anywhere in the definition.
fn reference_body<'a>(definition: &'a WorkflowDefinition, loop_id: &str) -> Option<&'a LoopBody> {
    fn find<'a>(steps: &'a [StepDefinition], loop_id: &str) -> Option<&'a LoopBody> {
        for step in steps {
            if let StepDefinition::Loop(lp) = step {
                if lp.id == loop_id {
                    return Some(&lp.body);
                }
                if let LoopBody::Inline(inline) = &lp.body {
                    if let Some(found) = find(inline, loop_id) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }
    find(&definition.steps, loop_id)
}

/// Reject loops that (transitively) contain themselves through references.
fn detect_reference_cycles(steps: &HashMap<String, CompiledStep>) -> Result<(), DomainError> {
    fn visit(
        loop_id: &str,
        steps: &HashMap<String, CompiledStep>,
        stack: &mut Vec<String>,
        done: &mut HashSet<String>,
    ) -> Result<(), DomainError> {
        if done.contains(loop_id) {
            return Ok(());
        }
        if stack.iter().any(|id| id == loop_id) {
            return Err(DomainError::invalid_loop(
                loop_id,
                format!("loop nesting cycle: {} -> {loop_id}", stack.join(" -> ")),
            ));
        }
        stack.push(loop_id.to_string());
        if let Some(CompiledStep::Loop(lp)) = steps.get(loop_id) {
            for child in &lp.body {
                if matches!(steps.get(child), Some(CompiledStep::Loop(_))) {
                    visit(child, steps, stack, done)?;
                }
            }
        }
        stack.pop();
        done.insert(loop_id.to_string());
        Ok(())
    }

    let mut done = HashSet::new();
    let mut loop_ids: Vec<&String> = steps
        .iter()
        .filter(|(_, step)| matches!(step, CompiledStep::Loop(_)))
        .map(|(id, _)| id)
        .collect();
    loop_ids.sort();
    for id in loop_ids {
        visit(id, steps, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

/// Serialize a value as canonical JSON: object keys sorted, no whitespace.
///
/// Used for workflow hashes and snapshot addresses, so the bytes must never
/// depend on map iteration order. `serde_json::to_vec` only sorts while the
/// `preserve_order` feature is off, and any crate in the dependency graph can
/// turn it on; sorting here keeps the hashes stable either way. Scalars and
/// key strings use serde_json's own compact formatting.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical bytes of a workflow definition, the input of its content hash.
pub fn canonical_definition_bytes(definition: &WorkflowDefinition) -> Result<Vec<u8>, serde_json::Error> {
    let value = serde_json::to_value(definition)?;
    Ok(canonical_json(&value).into_bytes())
}
