use std::fmt;

use thiserror::Error;

/// Main error type for the Rampart risk engine
#[derive(Error, Debug)]
pub enum RiskError {
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(#[from] ConfigValidationError),

    #[error("Insufficient data: {0}")]
    InsufficientData(#[from] InsufficientDataError),

    #[error("Rule evaluation error: {0}")]
    RuleEvaluation(#[from] RuleEvaluationError),

    #[error("Sink dispatch error: {0}")]
    SinkDispatch(#[from] SinkDispatchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A single policy field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Rejected policy or rule configuration. Lists every violated field, not
/// just the first one encountered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("policy '{policy}' rejected: {}", join_violations(.violations))]
pub struct ConfigValidationError {
    pub policy: String,
    pub violations: Vec<FieldViolation>,
}

impl ConfigValidationError {
    pub fn new(policy: impl Into<String>, violations: Vec<FieldViolation>) -> Self {
        Self {
            policy: policy.into(),
            violations,
        }
    }

    /// Returns true if `field` is among the violated fields.
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fewer samples than a metric requires. Callers degrade to a neutral value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("need {required} samples, have {available}")]
pub struct InsufficientDataError {
    pub required: usize,
    pub available: usize,
}

/// A single rule could not be evaluated. Never aborts the remaining rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("rule '{rule}' failed to evaluate: {message}")]
pub struct RuleEvaluationError {
    pub rule: String,
    pub message: String,
}

impl RuleEvaluationError {
    pub fn new(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            message: message.into(),
        }
    }
}

/// Notification dispatch failures. Never propagated to the order path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkDispatchError {
    #[error("violation queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("violation queue disconnected")]
    Disconnected,

    #[error("notifier failed: {message}")]
    NotifierFailed { message: String },
}

/// Result type alias for Rampart operations
pub type RiskResult<T> = Result<T, RiskError>;
