use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`TaskforgeError`].
pub type TaskforgeResult<T> = Result<T, TaskforgeError>;

/// Top-level error type for the taskforge engine.
///
/// The first six variants are the error classes the engine reasons about when
/// deciding whether to requeue, surface or hand a failure to the swarm workflow.
#[derive(Error, Debug)]
pub enum TaskforgeError {
    /// No worker available, pool at its ceiling, or the queue is full.
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Unmet, unknown, failed or cyclic dependency.
    #[error("Dependency error: {0}")]
    Dependency(String),

    /// A worker raised while executing a task.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A task or workflow phase exceeded its time budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// No worker kind cleared the consensus threshold.
    #[error("Consensus failure: {0}")]
    Consensus(String),

    /// A recovery strategy exhausted its attempts.
    #[error("Recovery failure: {0}")]
    Recovery(String),

    /// Execution stopped because cancellation was requested.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Unknown task, worker kind, workspace or workflow run.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A status change that the task state machine does not allow.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// State the task was in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// Configuration parsing or validation failed.
    #[error("Config error: {0}")]
    Config(String),

    /// Provisioning or reclaiming an isolated workspace failed.
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializable classification of a [`TaskforgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`TaskforgeError::Capacity`].
    Capacity,
    /// See [`TaskforgeError::Dependency`].
    Dependency,
    /// See [`TaskforgeError::Execution`].
    Execution,
    /// See [`TaskforgeError::Timeout`].
    Timeout,
    /// See [`TaskforgeError::Consensus`].
    ConsensusFailure,
    /// See [`TaskforgeError::Recovery`].
    RecoveryFailure,
    /// See [`TaskforgeError::Cancelled`].
    Cancelled,
    /// Anything else: lookups, configuration, I/O.
    Internal,
}

impl TaskforgeError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskforgeError::Capacity(_) => ErrorKind::Capacity,
            TaskforgeError::Dependency(_) => ErrorKind::Dependency,
            TaskforgeError::Execution(_) => ErrorKind::Execution,
            TaskforgeError::Timeout(_) => ErrorKind::Timeout,
            TaskforgeError::Consensus(_) => ErrorKind::ConsensusFailure,
            TaskforgeError::Recovery(_) => ErrorKind::RecoveryFailure,
            TaskforgeError::Cancelled(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Capacity and dependency errors are handled locally by requeueing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TaskforgeError::Capacity(_) | TaskforgeError::Dependency(_)
        )
    }

    /// Execution and timeout errors may be handed to the swarm workflow.
    pub fn is_healable(&self) -> bool {
        matches!(
            self,
            TaskforgeError::Execution(_) | TaskforgeError::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            TaskforgeError::Capacity("queue full".into()).kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            TaskforgeError::Consensus("none".into()).kind(),
            ErrorKind::ConsensusFailure
        );
        assert_eq!(
            TaskforgeError::NotFound("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_recoverable_classes() {
        assert!(TaskforgeError::Capacity("x".into()).is_recoverable());
        assert!(TaskforgeError::Dependency("x".into()).is_recoverable());
        assert!(!TaskforgeError::Execution("x".into()).is_recoverable());
        assert!(TaskforgeError::Timeout("x".into()).is_healable());
        assert!(!TaskforgeError::Cancelled("x".into()).is_healable());
    }

    #[test]
    fn test_display_carries_reason() {
        let err = TaskforgeError::InvalidTransition {
            from: "completed".into(),
            to: "in_progress".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition from completed to in_progress"
        );
    }
}
