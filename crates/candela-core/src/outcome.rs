use serde_json::{Value, json};

use crate::error::CoreError;

/// Issue severity used in operation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl IssueSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "information",
        }
    }
}

/// Builder for operation-outcome trees with one or more issues.
#[derive(Debug, Default)]
pub struct OperationOutcomeBuilder {
    issues: Vec<Value>,
}

impl OperationOutcomeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(
        mut self,
        severity: IssueSeverity,
        code: &str,
        diagnostics: impl Into<String>,
    ) -> Self {
        self.issues.push(json!({
            "severity": severity.as_str(),
            "code": code,
            "diagnostics": diagnostics.into(),
        }));
        self
    }

    pub fn build(self) -> Value {
        json!({
            "resourceType": "OperationOutcome",
            "issue": self.issues,
        })
    }
}

/// Outcome with a single issue, the common dispatcher shape.
pub fn single_issue(severity: IssueSeverity, code: &str, diagnostics: impl Into<String>) -> Value {
    OperationOutcomeBuilder::new()
        .issue(severity, code, diagnostics)
        .build()
}

/// Outcome describing a core error.
pub fn outcome_for_error(error: &CoreError) -> Value {
    single_issue(
        IssueSeverity::Error,
        error.kind().issue_code(),
        error.to_string(),
    )
}

/// Informational "all ok" outcome used for successful deletes.
pub fn outcome_ok(diagnostics: impl Into<String>) -> Value {
    single_issue(IssueSeverity::Information, "informational", diagnostics)
}
