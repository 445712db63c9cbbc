//! Workflow definition types.
//!
//! A workflow is an ordered list of steps. A step is either a prompt step (a
//! unit of work the agent performs and reports back on) or a loop step whose
//! body is repeated under a bounded iteration policy. Definitions are loaded
//! by an external reader (files, memory) and compiled once per content hash.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A workflow definition as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow id (e.g. "bug-investigation").
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Semantic version string (e.g. "1.0.0").
    #[serde(default = "default_version")]
    pub version: String,
    /// Top-level steps in execution order.
    pub steps: Vec<StepDefinition>,
    /// Free-form metadata, ignored by the engine.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// One step in a workflow: either a loop or a prompt step.
///
/// Untagged so authors write loops as ordinary steps with a `loop` block and
/// a `body`. Serde tries `Loop` first; a step without a `loop` field falls
/// through to `Prompt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepDefinition {
    Loop(LoopStepDefinition),
    Prompt(PromptStepDefinition),
}

impl StepDefinition {
    pub fn id(&self) -> &str {
        match self {
            StepDefinition::Loop(step) => &step.id,
            StepDefinition::Prompt(step) => &step.id,
        }
    }

    pub fn run_condition(&self) -> Option<&Value> {
        match self {
            StepDefinition::Loop(step) => step.run_condition.as_ref(),
            StepDefinition::Prompt(step) => step.run_condition.as_ref(),
        }
    }
}

/// A unit of work handed to the agent.
///
/// Unknown fields are rejected so a malformed loop step (which would
/// otherwise fall through the untagged enum) surfaces as a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptStepDefinition {
    /// Unique within the workflow (including inline loop bodies).
    pub id: String,
    pub title: String,
    /// Instructions for the agent. `{{name}}` placeholders are rendered from
    /// the execution context.
    #[serde(default)]
    pub prompt: String,
    /// Condition DSL object; absent means always eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<Value>,
    /// Required shape of the agent's reported output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_contract: Option<OutputContract>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<Vec<String>>,
}

/// A step that repeats a body of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStepDefinition {
    pub id: String,
    pub title: String,
    #[serde(rename = "loop")]
    pub loop_config: LoopConfig,
    pub body: LoopBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_condition: Option<Value>,
}

/// Iteration policy of a loop step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(rename = "type")]
    pub kind: LoopKind,
    /// Continue/stop condition for `while` and `until` loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
    /// Iteration target for `for` loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<LoopCount>,
    /// Context variable holding the array iterated by `for_each` loops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
    /// Context variable receiving the current item (`for_each` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    /// Context variable receiving the 0-based iteration number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_var: Option<String>,
    /// Hard upper bound on iterations. Must be at least 1.
    pub max_iterations: u32,
}

/// Default context variable for the iteration number.
pub const DEFAULT_INDEX_VAR: &str = "currentIteration";

/// Default context variable for the current `for_each` item.
pub const DEFAULT_ITEM_VAR: &str = "currentItem";

impl LoopConfig {
    pub fn index_var(&self) -> &str {
        self.index_var.as_deref().unwrap_or(DEFAULT_INDEX_VAR)
    }

    pub fn item_var(&self) -> &str {
        self.item_var.as_deref().unwrap_or(DEFAULT_ITEM_VAR)
    }
}

/// The kind of loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    /// Repeat while `condition` holds.
    While,
    /// Repeat until `condition` holds.
    Until,
    /// Repeat `count` times.
    For,
    /// Repeat once per element of the `items` array.
    ForEach,
}

/// Iteration target for a `for` loop: a literal or a context variable name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopCount {
    Literal(u64),
    Variable(String),
}

/// The body of a loop step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopBody {
    /// Id of a top-level step; that step then only runs inside the loop.
    Reference(String),
    /// Steps declared inline, run in order on every iteration.
    Inline(Vec<StepDefinition>),
}

/// Output contract attached to a prompt step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputContract {
    /// Stable reference used in blocker pointers (e.g. "plan-output.v1").
    pub contract_ref: String,
    /// Fields that must be present (and non-empty) in the reported output.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Extra criteria forwarded verbatim to the output validator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<Value>,
}

/// Listing entry returned by workflow readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: String,
}

impl From<&WorkflowDefinition> for WorkflowSummary {
    fn from(def: &WorkflowDefinition) -> Self {
        Self {
            id: def.id.clone(),
            name: def.name.clone(),
            description: def.description.clone(),
            version: def.version.clone(),
        }
    }
}
