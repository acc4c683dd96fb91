// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer, timer and replication tasks.
//!
//! Tasks are written in the same transaction as the mutable-state change
//! that produced them. Each carries a shard-unique, increasing `task_id`;
//! consumers must tolerate duplicate delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{TimeoutType, WorkflowKey};

/// Task queue a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskCategory {
    /// Immediate work: dispatch tasks, start children, record visibility.
    Transfer,
    /// Durable alarms.
    Timer,
    /// Cross-cluster shipping.
    Replication,
}

impl TaskCategory {
    /// Stable numeric id used by SQL backends.
    pub fn as_i32(self) -> i32 {
        match self {
            TaskCategory::Transfer => 1,
            TaskCategory::Timer => 2,
            TaskCategory::Replication => 3,
        }
    }

    /// All categories.
    pub const ALL: [TaskCategory; 3] = [
        TaskCategory::Transfer,
        TaskCategory::Timer,
        TaskCategory::Replication,
    ];
}

/// What a task asks its processor to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskKind {
    // ------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------
    /// Dispatch a decision task to matching.
    DecisionTask {
        /// Task list to dispatch to.
        task_list: String,
        /// Scheduled event id.
        schedule_id: i64,
    },
    /// Dispatch an activity task to matching.
    ActivityTask {
        /// Activity domain.
        domain_id: String,
        /// Task list to dispatch to.
        task_list: String,
        /// Scheduled event id.
        schedule_id: i64,
    },
    /// Run closed: notify the parent, record closed visibility.
    CloseExecution,
    /// Create a child run.
    StartChildExecution {
        /// Child domain.
        target_domain_id: String,
        /// Child workflow id.
        target_workflow_id: String,
        /// Initiated event id.
        initiated_id: i64,
    },
    /// Signal another run.
    SignalExecution {
        /// Target domain.
        target_domain_id: String,
        /// Target workflow id.
        target_workflow_id: String,
        /// Target run id, empty for current.
        target_run_id: String,
        /// Initiated event id.
        initiated_id: i64,
    },
    /// Record an open visibility row.
    RecordWorkflowStarted,
    /// Refresh the visibility row's search attributes.
    UpsertWorkflowSearchAttributes,

    // ------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------
    /// Decision timeout.
    DecisionTimeout {
        /// Scheduled event id.
        schedule_id: i64,
        /// Attempt the timer belongs to.
        attempt: i64,
        /// Which timeout.
        timeout_type: TimeoutType,
    },
    /// Activity timeout.
    ActivityTimeout {
        /// Scheduled event id.
        schedule_id: i64,
        /// Attempt the timer belongs to.
        attempt: i32,
        /// Which timeout.
        timeout_type: TimeoutType,
    },
    /// User timer.
    UserTimer {
        /// Started event id.
        started_id: i64,
    },
    /// Run timeout.
    WorkflowTimeout,
    /// Activity retry backoff elapsed.
    ActivityRetryTimer {
        /// Scheduled event id.
        schedule_id: i64,
        /// Attempt to dispatch.
        attempt: i32,
    },
    /// First decision backoff elapsed.
    WorkflowBackoffTimer,
    /// Retention elapsed: delete the closed run.
    DeleteHistoryEvent,

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------
    /// Ship a committed event batch.
    HistoryReplication {
        /// First event id of the batch.
        first_event_id: i64,
        /// Next event id after the batch.
        next_event_id: i64,
        /// Branch the batch was written to.
        branch_token: String,
        /// Successor run created in the same transaction.
        new_run_id: Option<String>,
    },
    /// Ship activity progress.
    SyncActivity {
        /// Scheduled event id.
        schedule_id: i64,
    },
}

impl TaskKind {
    /// Queue this task belongs to.
    pub fn category(&self) -> TaskCategory {
        match self {
            TaskKind::DecisionTask { .. }
            | TaskKind::ActivityTask { .. }
            | TaskKind::CloseExecution
            | TaskKind::StartChildExecution { .. }
            | TaskKind::SignalExecution { .. }
            | TaskKind::RecordWorkflowStarted
            | TaskKind::UpsertWorkflowSearchAttributes => TaskCategory::Transfer,
            TaskKind::DecisionTimeout { .. }
            | TaskKind::ActivityTimeout { .. }
            | TaskKind::UserTimer { .. }
            | TaskKind::WorkflowTimeout
            | TaskKind::ActivityRetryTimer { .. }
            | TaskKind::WorkflowBackoffTimer
            | TaskKind::DeleteHistoryEvent => TaskCategory::Timer,
            TaskKind::HistoryReplication { .. } | TaskKind::SyncActivity { .. } => {
                TaskCategory::Replication
            }
        }
    }
}

/// A task generated by a state transition, not yet assigned an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    /// When the task becomes due; `None` means immediately.
    pub visibility_time: Option<DateTime<Utc>>,
    /// Payload.
    pub kind: TaskKind,
}

impl PendingTask {
    /// A task due immediately.
    pub fn now(kind: TaskKind) -> Self {
        Self {
            visibility_time: None,
            kind,
        }
    }

    /// A task due at `at`.
    pub fn at(at: DateTime<Utc>, kind: TaskKind) -> Self {
        Self {
            visibility_time: Some(at),
            kind,
        }
    }
}

/// A durable task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Run the task belongs to.
    pub key: WorkflowKey,
    /// Shard-unique increasing id.
    pub task_id: i64,
    /// When the task becomes due.
    pub visibility_time: DateTime<Utc>,
    /// Failover version of the transaction that wrote it.
    pub version: i64,
    /// Payload.
    pub kind: TaskKind,
}

impl Task {
    /// Queue this task belongs to.
    pub fn category(&self) -> TaskCategory {
        self.kind.category()
    }
}
