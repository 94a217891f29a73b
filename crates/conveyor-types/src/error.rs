//! Error taxonomy for steps, runs and the context store.
//!
//! - `ContextError`: a typed read or write against the context failed.
//! - `StepError`: a single step failed, timed out or was cancelled.
//! - `WorkflowError`: the terminal outcome of a run (or a build).
//!
//! All three are `Clone` so a failure can be both reported to listeners and
//! stashed in the context for an error handler.

use std::time::Duration;

use thiserror::Error;

/// Errors from typed reads and writes on the workflow context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context value '{key}' not found")]
    Missing { key: String },

    #[error("context value '{key}' is not a valid {expected}: {message}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
        message: String,
    },

    #[error("context value '{key}' could not be serialized: {message}")]
    Serialize { key: String, message: String },
}

/// Failure of a single step execution.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The step body reported a failure. `kind` is a short machine-readable
    /// category that retry filters match against.
    #[error("{kind}: {message}")]
    Failed { kind: String, message: String },

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("step cancelled")]
    Cancelled,

    #[error("nested workflow failed: {0}")]
    Nested(Box<WorkflowError>),
}

impl StepError {
    /// Failure with an explicit kind.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Failure with the generic `step` kind.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("step", message)
    }

    /// Category used by kind-filtered retry policies.
    pub fn kind(&self) -> &str {
        match self {
            Self::Failed { kind, .. } => kind,
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Nested(_) => "workflow",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Nested(inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

impl From<ContextError> for StepError {
    fn from(err: ContextError) -> Self {
        Self::new("context", err.to_string())
    }
}

impl From<WorkflowError> for StepError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::Cancelled => Self::Cancelled,
            other => Self::Nested(Box::new(other)),
        }
    }
}

/// A compensation that raised an error while unwinding a failed run.
#[derive(Debug, Clone, Error)]
#[error("'{step}': {error}")]
pub struct CompensationFailure {
    pub step: String,
    pub error: StepError,
}

/// Terminal failure of a workflow build or run.
#[derive(Debug, Clone, Error)]
pub enum WorkflowError {
    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("invalid workflow configuration: {0}")]
    Configuration(String),

    #[error("step '{step}' (#{index}) failed: {source}")]
    StepFailed {
        step: String,
        index: usize,
        source: StepError,
    },

    #[error("workflow timed out after {0:?}")]
    Timeout(Duration),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("{} forked branch(es) failed: {}", .failures.len(), join_errors(.failures))]
    ForkFailed { failures: Vec<WorkflowError> },

    #[error("forked branch panicked: {0}")]
    BranchPanicked(String),

    /// Compensation is best-effort: every completed step is unwound even if
    /// one of them fails, and all failures are kept next to the original.
    #[error("{original}; compensation failed for {}", join_errors(.failures))]
    CompensationFailed {
        original: Box<WorkflowError>,
        failures: Vec<CompensationFailure>,
    },

    #[error("finalizer failed: {0}")]
    FinalizerFailed(StepError),

    #[error("error handler failed: {0}")]
    ErrorHandlerFailed(StepError),
}

impl WorkflowError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The error that started the failure, looking through compensation.
    pub fn root(&self) -> &WorkflowError {
        match self {
            Self::CompensationFailed { original, .. } => original.root(),
            other => other,
        }
    }
}

fn join_errors<E: std::fmt::Display>(errors: &[E]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_kind() {
        assert_eq!(StepError::new("io", "disk full").kind(), "io");
        assert_eq!(StepError::msg("boom").kind(), "step");
        assert_eq!(StepError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(StepError::Cancelled.kind(), "cancelled");
    }

    #[test]
    fn test_context_error_converts_to_context_kind() {
        let err: StepError = ContextError::Missing {
            key: "answer".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "context");
        assert!(err.to_string().contains("answer"));
    }

    #[test]
    fn test_cancelled_workflow_maps_to_cancelled_step() {
        let err: StepError = WorkflowError::Cancelled.into();
        assert!(matches!(err, StepError::Cancelled));

        let err: StepError = WorkflowError::EmptyWorkflow.into();
        assert!(matches!(err, StepError::Nested(_)));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_fork_failed_message_lists_branches() {
        let err = WorkflowError::ForkFailed {
            failures: vec![
                WorkflowError::Configuration("a".into()),
                WorkflowError::BranchPanicked("b".into()),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 forked branch(es) failed"));
        assert!(msg.contains("panicked: b"));
    }

    #[test]
    fn test_compensation_failed_keeps_original() {
        let original = WorkflowError::StepFailed {
            step: "Charge".into(),
            index: 2,
            source: StepError::msg("declined"),
        };
        let err = WorkflowError::CompensationFailed {
            original: Box::new(original),
            failures: vec![CompensationFailure {
                step: "Reserve".into(),
                error: StepError::msg("already released"),
            }],
        };

        assert!(matches!(err.root(), WorkflowError::StepFailed { index: 2, .. }));
        let msg = err.to_string();
        assert!(msg.contains("declined"));
        assert!(msg.contains("'Reserve': step: already released"));
    }
}
