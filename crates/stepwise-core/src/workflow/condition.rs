//! Condition DSL evaluator for `run_condition` and loop conditions.
//!
//! Conditions are JSON objects:
//!
//! ```json
//! { "and": [ { "var": "mode", "equals": "deep" },
//!            { "not": { "var": "skipTests" } },
//!            { "var": "fileCount", "gt": 10 } ] }
//! ```
//!
//! `var` alone is a truthiness check; `var` may carry at most one operator
//! (`equals`, `not_equals`, `gt`, `gte`, `lt`, `lte`, `contains`,
//! `startsWith`, `endsWith`, `matches`). `and`/`or`/`not` compose.
//!
//! Evaluation is total and fails closed: any internal error, including an
//! invalid regex, yields `false`. [`explain`] runs the very same evaluation
//! and records a trace, so diagnostics can never disagree with routing.

use regex::RegexBuilder;
use serde::Serialize;
use serde_json::{Map, Value};
use stepwise_types::error::DomainError;

/// Context map conditions are evaluated against.
pub type ConditionContext = Map<String, Value>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Internal evaluation failures. Never escapes [`evaluate`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("unknown condition shape: {0}")]
    UnknownShape(String),

    #[error("'var' must be a non-empty string")]
    InvalidVar,

    #[error("'var' accepts at most one operator, got {0:?}")]
    MultipleOperators(Vec<String>),

    #[error("'{0}' expects an array of conditions")]
    ExpectedArray(&'static str),

    #[error("invalid regex '{pattern}': {message}")]
    InvalidRegex { pattern: String, message: String },

    #[error("operand of '{operator}' must be {expected}")]
    BadOperand {
        operator: &'static str,
        expected: &'static str,
    },
}

// ---------------------------------------------------------------------------
// Parsed form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Operator {
    Truthy,
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

impl Operator {
    fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "contains" => Operator::Contains,
            "startsWith" => Operator::StartsWith,
            "endsWith" => Operator::EndsWith,
            "matches" => Operator::Matches,
            _ => return None,
        })
    }

    fn key(self) -> &'static str {
        match self {
            Operator::Truthy => "var",
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Contains => "contains",
            Operator::StartsWith => "startsWith",
            Operator::EndsWith => "endsWith",
            Operator::Matches => "matches",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ConditionNode {
    Always,
    And(Vec<ConditionNode>),
    Or(Vec<ConditionNode>),
    Not(Box<ConditionNode>),
    Var {
        name: String,
        operator: Operator,
        operand: Value,
    },
}

fn parse(node: &Value) -> Result<ConditionNode, ConditionError> {
    let obj = match node {
        Value::Null => return Ok(ConditionNode::Always),
        Value::Object(obj) if obj.is_empty() => return Ok(ConditionNode::Always),
        Value::Object(obj) => obj,
        other => return Err(ConditionError::UnknownShape(other.to_string())),
    };

    for key in ["and", "or"] {
        if let Some(children) = obj.get(key) {
            if obj.len() != 1 {
                return Err(ConditionError::UnknownShape(node.to_string()));
            }
            let items = children
                .as_array()
                .ok_or(ConditionError::ExpectedArray(key))?;
            let parsed = items.iter().map(parse).collect::<Result<Vec<_>, _>>()?;
            return Ok(if key == "and" {
                ConditionNode::And(parsed)
            } else {
                ConditionNode::Or(parsed)
            });
        }
    }

    if let Some(child) = obj.get("not") {
        if obj.len() != 1 {
            return Err(ConditionError::UnknownShape(node.to_string()));
        }
        return Ok(ConditionNode::Not(Box::new(parse(child)?)));
    }

    let Some(var) = obj.get("var") else {
        return Err(ConditionError::UnknownShape(node.to_string()));
    };
    let name = var
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or(ConditionError::InvalidVar)?
        .to_string();

    let operator_keys: Vec<&String> = obj.keys().filter(|k| k.as_str() != "var").collect();
    match operator_keys.as_slice() {
        [] => Ok(ConditionNode::Var {
            name,
            operator: Operator::Truthy,
            operand: Value::Null,
        }),
        [key] => {
            let operator = Operator::from_key(key)
                .ok_or_else(|| ConditionError::UnknownShape(node.to_string()))?;
            Ok(ConditionNode::Var {
                name,
                operator,
                operand: obj.get(key.as_str()).cloned().unwrap_or(Value::Null),
            })
        }
        many => Err(ConditionError::MultipleOperators(
            many.iter().map(|k| k.to_string()).collect(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Trace
// ---------------------------------------------------------------------------

/// One evaluated node of a condition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionTrace {
    /// `and`, `or`, `not`, `always`, or the operator key of a `var` test.
    pub node: String,
    pub result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ConditionTrace>,
}

/// Result of [`explain`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionExplanation {
    pub result: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<ConditionTrace>,
    /// Set when evaluation failed closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Evaluate a condition. A missing, null or empty condition is eligible.
pub fn evaluate(condition: Option<&Value>, context: &ConditionContext) -> bool {
    explain(condition, context).result
}

/// Evaluate a condition and return a trace of every evaluated node.
pub fn explain(condition: Option<&Value>, context: &ConditionContext) -> ConditionExplanation {
    let Some(condition) = condition else {
        return ConditionExplanation {
            result: true,
            trace: None,
            error: None,
        };
    };

    match parse(condition).and_then(|node| eval_node(&node, context)) {
        Ok(trace) => ConditionExplanation {
            result: trace.result,
            trace: Some(trace),
            error: None,
        },
        Err(err) => {
            tracing::debug!(error = %err, "condition evaluation failed closed");
            ConditionExplanation {
                result: false,
                trace: None,
                error: Some(err.to_string()),
            }
        }
    }
}

/// Reject malformed condition data before it can ever be evaluated.
///
/// Stricter than evaluation: operands must have the type their operator
/// needs and `matches` patterns must compile. `location` names the owning
/// step or loop in the returned error.
pub fn validate(condition: &Value, location: &str) -> Result<(), DomainError> {
    let to_domain = |err: ConditionError| DomainError::ConditionEvalFailed {
        location: location.to_string(),
        message: err.to_string(),
    };
    let node = parse(condition).map_err(to_domain)?;
    validate_operands(&node).map_err(to_domain)
}

fn validate_operands(node: &ConditionNode) -> Result<(), ConditionError> {
    match node {
        ConditionNode::Always => Ok(()),
        ConditionNode::And(children) | ConditionNode::Or(children) => {
            children.iter().try_for_each(validate_operands)
        }
        ConditionNode::Not(child) => validate_operands(child),
        ConditionNode::Var {
            operator, operand, ..
        } => match operator {
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                if operand.is_number() {
                    Ok(())
                } else {
                    Err(ConditionError::BadOperand {
                        operator: operator.key(),
                        expected: "a number",
                    })
                }
            }
            Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
                if operand.is_string() {
                    Ok(())
                } else {
                    Err(ConditionError::BadOperand {
                        operator: operator.key(),
                        expected: "a string",
                    })
                }
            }
            Operator::Matches => {
                let pattern = operand.as_str().ok_or(ConditionError::BadOperand {
                    operator: "matches",
                    expected: "a regex string",
                })?;
                compile_regex(pattern).map(|_| ())
            }
            Operator::Truthy | Operator::Equals | Operator::NotEquals => Ok(()),
        },
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval_node(node: &ConditionNode, context: &ConditionContext) -> Result<ConditionTrace, ConditionError> {
    match node {
        ConditionNode::Always => Ok(composite("always", true, Vec::new())),
        ConditionNode::And(children) => {
            let mut traces = Vec::with_capacity(children.len());
            for child in children {
                let trace = eval_node(child, context)?;
                let passed = trace.result;
                traces.push(trace);
                if !passed {
                    return Ok(composite("and", false, traces));
                }
            }
            Ok(composite("and", true, traces))
        }
        ConditionNode::Or(children) => {
            let mut traces = Vec::with_capacity(children.len());
            for child in children {
                let trace = eval_node(child, context)?;
                let passed = trace.result;
                traces.push(trace);
                if passed {
                    return Ok(composite("or", true, traces));
                }
            }
            Ok(composite("or", false, traces))
        }
        ConditionNode::Not(child) => {
            let trace = eval_node(child, context)?;
            Ok(composite("not", !trace.result, vec![trace]))
        }
        ConditionNode::Var {
            name,
            operator,
            operand,
        } => {
            let actual = lookup(context, name);
            let result = apply_operator(*operator, &actual, operand)?;
            Ok(ConditionTrace {
                node: operator.key().to_string(),
                result,
                var: Some(name.clone()),
                actual: Some(actual),
                expected: (*operator != Operator::Truthy).then(|| operand.clone()),
                children: Vec::new(),
            })
        }
    }
}

fn composite(node: &str, result: bool, children: Vec<ConditionTrace>) -> ConditionTrace {
    ConditionTrace {
        node: node.to_string(),
        result,
        var: None,
        actual: None,
        expected: None,
        children,
    }
}

fn apply_operator(operator: Operator, actual: &Value, operand: &Value) -> Result<bool, ConditionError> {
    Ok(match operator {
        Operator::Truthy => is_truthy(actual),
        Operator::Equals => lenient_equals(actual, operand),
        Operator::NotEquals => !lenient_equals(actual, operand),
        Operator::Gt => compare_numbers(actual, operand, |a, b| a > b),
        Operator::Gte => compare_numbers(actual, operand, |a, b| a >= b),
        Operator::Lt => compare_numbers(actual, operand, |a, b| a < b),
        Operator::Lte => compare_numbers(actual, operand, |a, b| a <= b),
        Operator::Contains => compare_strings(actual, operand, |a, b| a.contains(b)),
        Operator::StartsWith => compare_strings(actual, operand, |a, b| a.starts_with(b)),
        Operator::EndsWith => compare_strings(actual, operand, |a, b| a.ends_with(b)),
        Operator::Matches => {
            let pattern = operand.as_str().ok_or(ConditionError::BadOperand {
                operator: "matches",
                expected: "a regex string",
            })?;
            let regex = compile_regex(pattern)?;
            actual.as_str().is_some_and(|s| regex.is_match(s))
        }
    })
}

fn compile_regex(pattern: &str) -> Result<regex::Regex, ConditionError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ConditionError::InvalidRegex {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

fn compare_numbers(actual: &Value, operand: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), operand.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn compare_strings(actual: &Value, operand: &Value, cmp: impl Fn(&str, &str) -> bool) -> bool {
    match (actual.as_str(), operand.as_str()) {
        (Some(a), Some(b)) => cmp(&normalize(a), &normalize(b)),
        _ => false,
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Resolve a variable: an exact key first, then a dotted path.
///
/// Missing variables resolve to `null`.
pub fn lookup(context: &ConditionContext, name: &str) -> Value {
    if let Some(value) = context.get(name) {
        return value.clone();
    }
    let mut segments = name.split('.');
    let Some(first) = segments.next() else {
        return Value::Null;
    };
    let mut current = match context.get(first) {
        Some(value) => value,
        None => return Value::Null,
    };
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// JavaScript-like truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

const TRUE_WORDS: [&str; 3] = ["true", "1", "yes"];
const FALSE_WORDS: [&str; 3] = ["false", "0", "no"];

/// Lenient equality used by `equals` / `not_equals`.
///
/// - null matches null (a missing variable is null)
/// - strings compare case-insensitively after trimming
/// - string vs number compares numerically when the string parses
/// - string vs boolean matches `true/1/yes` and `false/0/no`
/// - numbers compare by value (`10 == 10.0`)
/// - anything else is strict equality
pub fn lenient_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(x), Value::String(y)) => normalize(x) == normalize(y),
        (Value::String(s), Value::Number(n)) | (Value::Number(n), Value::String(s)) => {
            match (s.trim().parse::<f64>(), n.as_f64()) {
                (Ok(parsed), Some(number)) => parsed == number,
                _ => false,
            }
        }
        (Value::String(s), Value::Bool(flag)) | (Value::Bool(flag), Value::String(s)) => {
            let word = normalize(s);
            let words = if *flag { &TRUE_WORDS } else { &FALSE_WORDS };
            words.contains(&word.as_str())
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
