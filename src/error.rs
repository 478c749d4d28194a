//! Engine Error Types
//!
//! A single error enum shared by every component. Variants follow the
//! failure taxonomy of the engine: resolution, admission and
//! synchronization errors are distinct so callers can map them onto
//! state failure types.

use crate::workflow::status::ExecutionStatus;
use crate::workflow::step_data::StepKind;
use crate::workflow::validator::ValidationError;

/// Errors raised by the workflow engine and its primitives.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Admission error for resource '{resource}': {message}")]
    Admission { resource: String, message: String },

    #[error("Synchronization error: {0}")]
    Synchronization(String),

    #[error("Workflow validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Unknown state '{state}' in machine '{machine}'")]
    UnknownState { machine: String, state: String },

    #[error("Unknown state machine: {0}")]
    UnknownMachine(String),

    #[error("Unknown state execution instance: {0}")]
    UnknownInstance(String),

    #[error("Unknown workflow execution: {0}")]
    UnknownExecution(String),

    #[error("Unknown resource constraint: {0}")]
    UnknownConstraint(String),

    #[error("Invalid status transition for '{instance}': {from} -> {to}")]
    InvalidTransition {
        instance: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("Barrier '{0}' has already been released")]
    BarrierReleased(String),

    #[error("No step executor registered for {0}")]
    NoExecutor(StepKind),

    #[error("Step executor failed: {0}")]
    Executor(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_joins_messages() {
        let err = EngineError::Validation(vec![
            ValidationError::EmptyMachine("root".to_string()),
            ValidationError::DuplicateStateName("deploy".to_string()),
        ]);
        let message = err.to_string();
        assert!(message.contains("root"));
        assert!(message.contains("deploy"));
        assert!(message.contains("; "));
    }

    #[test]
    fn test_admission_error_display() {
        let err = EngineError::Admission {
            resource: "cluster-x".to_string(),
            message: "requested 3 units but capacity is 1".to_string(),
        };
        assert!(err.to_string().contains("cluster-x"));
    }
}
