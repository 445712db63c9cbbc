//! Execution context with loop-variable projection and template rendering.
//!
//! `ExecutionContext` is the caller-supplied variable map that flows through a
//! run. It is persisted inside every snapshot, merged on each `continue`, and
//! bounded in size so a misbehaving client cannot grow durable state without
//! limit.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::condition::{self, ConditionContext};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default upper bound on the serialized context (256 KiB).
pub const DEFAULT_MAX_CONTEXT_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context size ({size} bytes) exceeds maximum ({max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("context must be a JSON object")]
    NotAnObject,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Variables visible to conditions and prompt templates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    variables: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from a JSON object, enforcing `max_bytes`.
    pub fn from_value(value: Value, max_bytes: usize) -> Result<Self, ContextError> {
        let variables = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(ContextError::NotAnObject),
        };
        let ctx = Self { variables };
        ctx.check_size(max_bytes)?;
        Ok(ctx)
    }

    /// Shallow merge: keys from `update` replace existing keys.
    ///
    /// The merged context must stay within `max_bytes`; on failure `self` is
    /// left untouched.
    pub fn merge(&self, update: &Map<String, Value>, max_bytes: usize) -> Result<Self, ContextError> {
        let mut merged = self.clone();
        for (key, value) in update {
            merged.variables.insert(key.clone(), value.clone());
        }
        merged.check_size(max_bytes)?;
        Ok(merged)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Serialized size in bytes.
    pub fn total_size(&self) -> usize {
        serde_json::to_string(&self.variables)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn check_size(&self, max_bytes: usize) -> Result<(), ContextError> {
        let size = self.total_size();
        if size > max_bytes {
            tracing::warn!(size, max = max_bytes, "execution context exceeds size limit");
            return Err(ContextError::TooLarge {
                size,
                max: max_bytes,
            });
        }
        Ok(())
    }

    /// Copy of the variables with loop variables layered on top.
    pub fn project(&self, loop_vars: &[(String, Value)]) -> ConditionContext {
        let mut projected = self.variables.clone();
        for (name, value) in loop_vars {
            projected.insert(name.clone(), value.clone());
        }
        projected
    }
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Render `{{name}}` and `{{a.b}}` placeholders from `context`.
///
/// Whitespace inside the braces is ignored. References that resolve to
/// nothing (or to `null`) are left verbatim.
pub fn render_template(template: &str, context: &ConditionContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);

        let name = after_open[..end].trim();
        let value = if name.is_empty() {
            Value::Null
        } else {
            condition::lookup(context, name)
        };
        if value.is_null() {
            out.push_str(&rest[start..start + 2 + end + 2]);
        } else {
            out.push_str(&value_to_string(&value));
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Convert a JSON value to a display string for template rendering.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Objects and arrays render as compact JSON.
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> ExecutionContext {
        ExecutionContext::from_value(value, DEFAULT_MAX_CONTEXT_BYTES).unwrap()
    }

    #[test]
    fn merge_is_shallow_and_caller_wins() {
        let base = ctx(json!({ "mode": "quick", "repo": { "lang": "go" } }));
        let update = json!({ "mode": "deep", "extra": 1 });
        let merged = base
            .merge(update.as_object().unwrap(), DEFAULT_MAX_CONTEXT_BYTES)
            .unwrap();

        assert_eq!(merged.get("mode"), Some(&json!("deep")));
        assert_eq!(merged.get("extra"), Some(&json!(1)));
        assert_eq!(merged.get("repo"), Some(&json!({ "lang": "go" })));
        assert_eq!(base.get("mode"), Some(&json!("quick")));
    }

    #[test]
    fn size_limit_is_enforced() {
        let base = ExecutionContext::new();
        let big = json!({ "blob": "x".repeat(200) });
        let err = base.merge(big.as_object().unwrap(), 64).unwrap_err();
        assert!(matches!(err, ContextError::TooLarge { max: 64, .. }));
    }

    #[test]
    fn non_object_context_is_rejected() {
        assert_eq!(
            ExecutionContext::from_value(json!([1, 2]), 1024).unwrap_err(),
            ContextError::NotAnObject
        );
        assert!(ExecutionContext::from_value(Value::Null, 1024).unwrap().is_empty());
    }

    #[test]
    fn projection_layers_loop_vars() {
        let base = ctx(json!({ "currentIteration": 9, "name": "a" }));
        let projected = base.project(&[("currentIteration".to_string(), json!(0))]);
        assert_eq!(projected["currentIteration"], json!(0));
        assert_eq!(projected["name"], json!("a"));
        assert_eq!(base.get("currentIteration"), Some(&json!(9)));
    }

    #[test]
    fn render_substitutes_known_references() {
        let vars = ctx(json!({ "file": "main.rs", "repo": { "lang": "Rust" }, "n": 3 }));
        let rendered = render_template(
            "Fix {{file}} ({{ repo.lang }}), attempt {{n}}",
            vars.variables(),
        );
        assert_eq!(rendered, "Fix main.rs (Rust), attempt 3");
    }

    #[test]
    fn render_leaves_unknown_references_verbatim() {
        let vars = ctx(json!({ "a": "x" }));
        assert_eq!(
            render_template("{{a}} {{missing}} {{ }} {{unterminated", vars.variables()),
            "x {{missing}} {{ }} {{unterminated"
        );
    }

    #[test]
    fn render_objects_as_json() {
        let vars = ctx(json!({ "item": { "id": 1 } }));
        assert_eq!(render_template("{{item}}", vars.variables()), r#"{"id":1}"#);
    }
}
