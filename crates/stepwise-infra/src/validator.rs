//! Required-fields output validator.
//!
//! Implements `OutputValidator` from `stepwise-core`. A contract's
//! `required_fields` are dotted paths into the reported output (`summary`,
//! `plan.steps`); each must resolve to a non-empty value. The optional
//! `criteria.types` object additionally pins a JSON type per path:
//!
//! ```json
//! { "types": { "summary": "string", "plan.steps": "array" } }
//! ```

use serde_json::Value;
use stepwise_core::service::validator::{OutputValidator, ValidationIssue, ValidationReport};
use stepwise_types::workflow::OutputContract;

/// Checks presence, non-emptiness and optional JSON types of output fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequiredFieldsValidator;

impl RequiredFieldsValidator {
    pub fn new() -> Self {
        Self
    }
}

fn lookup<'a>(output: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(output, |value, segment| value.get(segment))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl OutputValidator for RequiredFieldsValidator {
    fn validate(&self, output: &Value, contract: &OutputContract, _context: Option<&Value>) -> ValidationReport {
        let mut report = ValidationReport::ok();

        if !output.is_object() {
            report.issues.push(ValidationIssue {
                message: format!("output must be a JSON object, got {}", type_name(output)),
                field: None,
            });
            report.valid = false;
            return report;
        }

        for field in &contract.required_fields {
            match lookup(output, field) {
                None => {
                    report.issues.push(ValidationIssue {
                        message: format!("missing required field '{field}'"),
                        field: Some(field.clone()),
                    });
                    report.suggestions.push(format!("Add '{field}' to the reported output"));
                }
                Some(value) if is_empty(value) => {
                    report.issues.push(ValidationIssue {
                        message: format!("required field '{field}' is empty"),
                        field: Some(field.clone()),
                    });
                    report.suggestions.push(format!("Provide a non-empty value for '{field}'"));
                }
                Some(_) => {}
            }
        }

        if let Some(criteria) = &contract.criteria {
            check_types(output, criteria, &mut report);
            if let Some(map) = criteria.as_object() {
                for key in map.keys().filter(|key| key.as_str() != "types") {
                    report.warnings.push(format!("unknown criteria key '{key}' ignored"));
                }
            }
        }

        report.valid = report.issues.is_empty();
        report
    }
}

fn check_types(output: &Value, criteria: &Value, report: &mut ValidationReport) {
    let Some(types) = criteria.get("types").and_then(Value::as_object) else {
        return;
    };
    for (field, expected) in types {
        let Some(expected) = expected.as_str() else {
            report.warnings.push(format!("type for '{field}' must be a string"));
            continue;
        };
        // Absence is reported by the required-fields check.
        let Some(value) = lookup(output, field) else {
            continue;
        };
        let actual = type_name(value);
        if actual != expected {
            report.issues.push(ValidationIssue {
                message: format!("field '{field}' must be {expected}, got {actual}"),
                field: Some(field.clone()),
            });
        }
    }
}
