//! Output-contract validation port.
//!
//! The engine asks a validator whether the output an agent reported for a
//! step satisfies that step's contract. Validation is pure: no side effects,
//! no I/O.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepwise_types::workflow::OutputContract;

/// One problem found in an output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub message: String,
    /// Offending field, when the issue is field-specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Result of validating one output against one contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self {
            valid: true,
            ..Self::default()
        }
    }
}

/// Validates reported step output.
pub trait OutputValidator: Send + Sync {
    /// Validate `output` against `contract`. `context` is the execution
    /// context the step ran under, for contracts that reference it.
    fn validate(&self, output: &Value, contract: &OutputContract, context: Option<&Value>) -> ValidationReport;
}
