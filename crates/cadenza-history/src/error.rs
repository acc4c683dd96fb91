// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for cadenza-history.
//!
//! [`HistoryError`] is the single error type returned by every engine
//! operation. Each variant maps to a stable string code so callers on the
//! other side of a transport can branch on it without parsing messages.

use crate::persistence::PersistenceError;

/// Result type using HistoryError
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors returned by history engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum HistoryError {
    /// The workflow run does not exist.
    #[error("workflow execution '{workflow_id}' (run '{run_id}') not found")]
    WorkflowNotFound {
        /// Workflow id of the missing run.
        workflow_id: String,
        /// Run id of the missing run (empty when the current run was requested).
        run_id: String,
    },

    /// A pending decision, activity, timer or child does not exist.
    #[error("{entity} not found: {details}")]
    EntityNotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// Lookup details.
        details: String,
    },

    /// A run with the same workflow id is already running (or the reuse
    /// policy rejects starting a new one).
    #[error("workflow '{workflow_id}' already started with run '{run_id}'")]
    WorkflowAlreadyStarted {
        /// The workflow id.
        workflow_id: String,
        /// The run currently owning the workflow id.
        run_id: String,
        /// Request id that started the existing run.
        start_request_id: String,
    },

    /// A decision or activity task was already started by another poller.
    #[error("task with scheduled event {scheduled_event_id} already started")]
    TaskAlreadyStarted {
        /// Scheduled event id of the task.
        scheduled_event_id: i64,
    },

    /// Optimistic concurrency rejection that survived internal retries.
    #[error("conflicting update: {details}")]
    Conflict {
        /// What conflicted.
        details: String,
    },

    /// The request is incompatible with the current execution state.
    #[error("invalid state: {details}")]
    InvalidState {
        /// Explanation.
        details: String,
    },

    /// The run is already closed.
    #[error("workflow execution already completed")]
    WorkflowCompleted,

    /// Input validation failed.
    #[error("bad request for '{field}': {message}")]
    BadRequest {
        /// The offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// The caller deadline expired while the call was suspended.
    #[error("operation '{operation}' timed out")]
    Timeout {
        /// Operation name.
        operation: &'static str,
    },

    /// The caller canceled the call.
    #[error("operation '{operation}' was canceled")]
    Canceled {
        /// Operation name.
        operation: &'static str,
    },

    /// Replicated history could not be reconciled with the local one.
    #[error("replication conflict: {details}")]
    ReplicationConflict {
        /// Explanation.
        details: String,
    },

    /// Replicated events cannot be applied until a missing range is resent.
    #[error(
        "retry task for '{workflow_id}' (run '{run_id}'): missing events after ({start_event_id}, {start_version}) before ({end_event_id}, {end_version})"
    )]
    RetryTask {
        /// Domain of the run.
        domain_id: String,
        /// Workflow id of the run.
        workflow_id: String,
        /// Run id of the run.
        run_id: String,
        /// Last event id known locally on the common branch (exclusive).
        start_event_id: i64,
        /// Version of `start_event_id`.
        start_version: i64,
        /// First event id of the rejected batch (exclusive).
        end_event_id: i64,
        /// Version of `end_event_id`.
        end_version: i64,
    },

    /// The domain is active in another cluster.
    #[error("domain '{domain_id}' is active in '{active_cluster}', not in '{current_cluster}'")]
    DomainNotActive {
        /// The domain.
        domain_id: String,
        /// Local cluster name.
        current_cluster: String,
        /// Cluster owning the domain.
        active_cluster: String,
    },

    /// The caller observed a history branch that is no longer current.
    #[error("current branch changed: {details}")]
    CurrentBranchChanged {
        /// Explanation.
        details: String,
    },

    /// A per-execution limit was hit.
    #[error("limit exceeded: {details}")]
    LimitExceeded {
        /// Which limit.
        details: String,
    },

    /// The query could not be answered.
    #[error("query failed: {details}")]
    QueryFailed {
        /// Reason.
        details: String,
    },

    /// This host does not own the shard.
    #[error("shard {shard_id} is not owned by this host")]
    ShardNotOwned {
        /// The shard.
        shard_id: i32,
    },

    /// The engine for the shard is not serving.
    #[error("history engine for shard {shard_id} is stopped")]
    EngineStopped {
        /// The shard.
        shard_id: i32,
    },

    /// A store operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl HistoryError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound { .. } => "WORKFLOW_NOT_FOUND",
            Self::EntityNotFound { .. } => "ENTITY_NOT_FOUND",
            Self::WorkflowAlreadyStarted { .. } => "WORKFLOW_ALREADY_STARTED",
            Self::TaskAlreadyStarted { .. } => "TASK_ALREADY_STARTED",
            Self::Conflict { .. } => "CONFLICT",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::WorkflowCompleted => "WORKFLOW_COMPLETED",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Canceled { .. } => "CANCELED",
            Self::ReplicationConflict { .. } => "REPLICATION_CONFLICT",
            Self::RetryTask { .. } => "RETRY_TASK",
            Self::DomainNotActive { .. } => "DOMAIN_NOT_ACTIVE",
            Self::CurrentBranchChanged { .. } => "CURRENT_BRANCH_CHANGED",
            Self::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Self::QueryFailed { .. } => "QUERY_FAILED",
            Self::ShardNotOwned { .. } => "SHARD_NOT_OWNED",
            Self::EngineStopped { .. } => "ENGINE_STOPPED",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the same request may succeed if simply retried.
    ///
    /// `Timeout` is retryable, `Canceled` is not: the caller gave up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. }
                | Self::Timeout { .. }
                | Self::RetryTask { .. }
                | Self::ShardNotOwned { .. }
                | Self::EngineStopped { .. }
                | Self::Database { .. }
        )
    }

    pub(crate) fn bad_request(field: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn entity_not_found(entity: &'static str, details: impl Into<String>) -> Self {
        Self::EntityNotFound {
            entity,
            details: details.into(),
        }
    }

    pub(crate) fn conflict(details: impl Into<String>) -> Self {
        Self::Conflict {
            details: details.into(),
        }
    }

    pub(crate) fn invalid_state(details: impl Into<String>) -> Self {
        Self::InvalidState {
            details: details.into(),
        }
    }
}

impl From<PersistenceError> for HistoryError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::ConditionFailed(details) => HistoryError::Conflict { details },
            PersistenceError::CurrentWorkflowConditionFailed(details) => {
                HistoryError::Conflict { details }
            }
            PersistenceError::WorkflowAlreadyStarted(current) => {
                HistoryError::WorkflowAlreadyStarted {
                    workflow_id: current.workflow_id,
                    run_id: current.run_id,
                    start_request_id: current.create_request_id,
                }
            }
            PersistenceError::ShardOwnershipLost { shard_id, .. } => {
                HistoryError::ShardNotOwned { shard_id }
            }
            PersistenceError::HistoryGap {
                branch_token,
                expected,
                actual,
            } => HistoryError::Conflict {
                details: format!(
                    "history branch {} expects event {} but got {}",
                    branch_token, expected, actual
                ),
            },
            PersistenceError::NotFound(details) => HistoryError::EntityNotFound {
                entity: "record",
                details,
            },
            PersistenceError::Database { operation, details } => {
                HistoryError::Database { operation, details }
            }
        }
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        HistoryError::Database {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::CurrentExecution;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                HistoryError::WorkflowNotFound {
                    workflow_id: "wf".to_string(),
                    run_id: "run".to_string(),
                },
                "WORKFLOW_NOT_FOUND",
            ),
            (
                HistoryError::TaskAlreadyStarted {
                    scheduled_event_id: 2,
                },
                "TASK_ALREADY_STARTED",
            ),
            (HistoryError::conflict("stale"), "CONFLICT"),
            (HistoryError::WorkflowCompleted, "WORKFLOW_COMPLETED"),
            (
                HistoryError::Timeout {
                    operation: "poll_mutable_state",
                },
                "TIMEOUT",
            ),
            (
                HistoryError::Canceled {
                    operation: "poll_mutable_state",
                },
                "CANCELED",
            ),
            (HistoryError::ShardNotOwned { shard_id: 3 }, "SHARD_NOT_OWNED"),
            (HistoryError::EngineStopped { shard_id: 3 }, "ENGINE_STOPPED"),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty(), "Message should not be empty");
        }
    }

    #[test]
    fn test_timeout_and_cancel_are_distinguishable() {
        let timeout = HistoryError::Timeout { operation: "query" };
        let canceled = HistoryError::Canceled { operation: "query" };

        assert!(timeout.is_retryable());
        assert!(!canceled.is_retryable());
        assert_ne!(timeout.error_code(), canceled.error_code());
    }

    #[test]
    fn test_terminal_errors_not_retryable() {
        assert!(!HistoryError::WorkflowCompleted.is_retryable());
        assert!(!HistoryError::bad_request("workflow_id", "empty").is_retryable());
        assert!(!HistoryError::entity_not_found("activity", "5").is_retryable());
        assert!(HistoryError::conflict("x").is_retryable());
    }

    #[test]
    fn test_from_persistence_error() {
        let err: HistoryError = PersistenceError::ConditionFailed("db_version".into()).into();
        assert!(matches!(err, HistoryError::Conflict { .. }));

        let err: HistoryError = PersistenceError::ShardOwnershipLost {
            shard_id: 7,
            details: "range changed".into(),
        }
        .into();
        assert_eq!(err, HistoryError::ShardNotOwned { shard_id: 7 });

        let err: HistoryError = PersistenceError::WorkflowAlreadyStarted(Box::new(CurrentExecution {
            workflow_id: "wf".into(),
            run_id: "run-1".into(),
            create_request_id: "req-1".into(),
            ..Default::default()
        }))
        .into();
        assert_eq!(
            err,
            HistoryError::WorkflowAlreadyStarted {
                workflow_id: "wf".into(),
                run_id: "run-1".into(),
                start_request_id: "req-1".into(),
            }
        );
    }

    #[test]
    fn test_display() {
        let err = HistoryError::bad_request("workflow_id", "must not be empty");
        assert_eq!(
            err.to_string(),
            "bad request for 'workflow_id': must not be empty"
        );
    }
}
