use thiserror::Error;

use crate::capability::Capability;
use crate::state_machine::Step;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Project not initialized. Run `gatework init` first.")]
    NotInitialized,

    #[error("Project already initialized at {0}")]
    AlreadyInitialized(String),

    #[error("Work item not found: {0}")]
    ItemNotFound(String),

    #[error("No executor declares the `{0}` capability")]
    MissingCapability(Capability),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Revision conflict on {document}: expected {expected}, found {found}")]
    RevisionConflict {
        document: String,
        expected: u64,
        found: u64,
    },

    #[error("Retry ceiling exceeded in {step} after {attempts} attempts: {reason}")]
    RetryCeilingExceeded {
        step: Step,
        attempts: u32,
        reason: String,
    },

    #[error("Verification environment failed to start: {0}")]
    Environment(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Whether this error ends the whole session rather than a single item.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Environment(_)
                | PipelineError::RetryCeilingExceeded { .. }
                | PipelineError::RevisionConflict { .. }
                | PipelineError::Invariant(_)
        )
    }
}

/// Failure reported by a task executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The environment the capability needs could not be started. Never retried.
    #[error("environment failure: {0}")]
    Environment(String),

    /// The invocation ran but produced no usable result.
    #[error("execution failed: {0}")]
    Failed(String),

    /// The executor does not provide the requested capability.
    #[error("capability `{0}` is not supported by this executor")]
    Unsupported(Capability),

    #[error("invocation timed out after {0}s")]
    Timeout(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_ceiling_display() {
        let err = PipelineError::RetryCeilingExceeded {
            step: Step::PreVerify,
            attempts: 3,
            reason: "regression in login".into(),
        };
        assert_eq!(
            err.to_string(),
            "Retry ceiling exceeded in PRE_VERIFY after 3 attempts: regression in login"
        );
        assert!(err.is_session_fatal());
    }

    #[test]
    fn item_level_errors_are_not_session_fatal() {
        assert!(!PipelineError::ItemNotFound("F-1".into()).is_session_fatal());
        assert!(PipelineError::Environment("port in use".into()).is_session_fatal());
    }

    #[test]
    fn executor_error_display() {
        let err = ExecutorError::Unsupported(Capability::Notify);
        assert_eq!(
            err.to_string(),
            "capability `notify` is not supported by this executor"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
        assert_send_sync::<ExecutorError>();
    }
}
