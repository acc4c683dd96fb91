// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution store interface and backends.
//!
//! The engine consumes storage only through [`ExecutionStore`]: the shard
//! record, one mutable-state row per run guarded by an optimistic
//! `db_version`, the current-run pointer per workflow id, append-only
//! history branches, the task queues and the replication DLQ.
//!
//! Every write that touches a run is checked against the shard's `range_id`
//! so a host that lost the shard cannot write behind the new owner's back.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryExecutionStore;
pub use self::sqlite::SqliteExecutionStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::HistoryEvent;
use crate::replication::ReplicationTaskInfo;
use crate::state::MutableState;
use crate::tasks::{Task, TaskCategory};
use crate::types::{CloseStatus, WorkflowKey, WorkflowState};

/// Errors returned by execution stores.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    /// A conditional write lost: the stored `db_version` moved.
    #[error("condition failed: {0}")]
    ConditionFailed(String),

    /// The current-run pointer did not match the expected run.
    #[error("current workflow condition failed: {0}")]
    CurrentWorkflowConditionFailed(String),

    /// A brand-new run was created for a workflow id that has a current run.
    #[error("workflow '{}' already has current run '{}'", .0.workflow_id, .0.run_id)]
    WorkflowAlreadyStarted(Box<CurrentExecution>),

    /// The shard's `range_id` moved: another host owns it now.
    #[error("shard {shard_id} ownership lost: {details}")]
    ShardOwnershipLost {
        /// Shard id.
        shard_id: i32,
        /// What was observed.
        details: String,
    },

    /// Events did not start right after the branch's last event.
    #[error("history branch {branch_token} expects event {expected}, got {actual}")]
    HistoryGap {
        /// Branch written to.
        branch_token: String,
        /// Next event id the branch expects.
        expected: i64,
        /// First event id of the batch.
        actual: i64,
    },

    /// Record not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend failure.
    #[error("database error during {operation}: {details}")]
    Database {
        /// Operation that failed.
        operation: String,
        /// Backend message.
        details: String,
    },
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        PersistenceError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Database {
            operation: "serialize".to_string(),
            details: err.to_string(),
        }
    }
}

/// Durable shard record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Shard id.
    pub shard_id: i32,
    /// Host that last acquired the shard.
    pub owner: String,
    /// Ownership epoch; task ids are allocated from `range_id << bits`.
    pub range_id: i64,
    /// Highest replication task id acknowledged by any polling cluster.
    pub replication_ack_level: i64,
    /// Replication ack level per polling cluster.
    pub cluster_replication_level: BTreeMap<String, i64>,
    /// Last reported clock per remote cluster.
    pub remote_cluster_times: BTreeMap<String, DateTime<Utc>>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

/// Current-run pointer of a workflow id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentExecution {
    /// Workflow id.
    pub workflow_id: String,
    /// Current run id.
    pub run_id: String,
    /// Dedup id of the request that created the run.
    pub create_request_id: String,
    /// Lifecycle of the run.
    pub state: WorkflowState,
    /// How the run closed.
    pub close_status: CloseStatus,
    /// Version of the run's last event.
    pub last_write_version: i64,
}

impl CurrentExecution {
    /// Pointer describing `ms`.
    pub fn from_state(ms: &MutableState) -> Self {
        Self {
            workflow_id: ms.execution_info.workflow_id.clone(),
            run_id: ms.execution_info.run_id.clone(),
            create_request_id: ms.execution_info.create_request_id.clone(),
            state: ms.execution_info.state,
            close_status: ms.execution_info.close_status,
            last_write_version: ms.last_write_version(),
        }
    }

    /// Whether the run is still open.
    pub fn is_running(&self) -> bool {
        matches!(self.state, WorkflowState::Created | WorkflowState::Running)
    }
}

/// Stored mutable state and its version.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedExecution {
    /// State.
    pub state: MutableState,
    /// Optimistic concurrency counter.
    pub db_version: i64,
}

/// Full state of a run being created.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSnapshot {
    /// State after the transaction.
    pub state: MutableState,
    /// Initial `db_version`.
    pub db_version: i64,
    /// Events to append to the state's current branch.
    pub events: Vec<HistoryEvent>,
    /// Tasks to enqueue.
    pub tasks: Vec<Task>,
}

/// Changes to an existing run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowMutation {
    /// State after the transaction.
    pub state: MutableState,
    /// `db_version` the state was read at; stored as `expected + 1`.
    pub expected_db_version: i64,
    /// Events to append to the state's current branch.
    pub events: Vec<HistoryEvent>,
    /// Tasks to enqueue.
    pub tasks: Vec<Task>,
}

/// How a create interacts with the current-run pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateMode {
    /// No current run may exist.
    BrandNew,
    /// Replace a closed current run.
    WorkflowIdReuse {
        /// Run the pointer must point at.
        previous_run_id: String,
        /// Last write version the pointer must carry.
        previous_last_write_version: i64,
    },
    /// Create without touching the pointer.
    Zombie,
}

/// Create a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateWorkflowRequest {
    /// Shard id.
    pub shard_id: i32,
    /// Range the writer holds.
    pub range_id: i64,
    /// Pointer handling.
    pub mode: CreateMode,
    /// New run.
    pub snapshot: WorkflowSnapshot,
}

/// How an update interacts with the current-run pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    /// The run must be current; the pointer is refreshed, or moved to the
    /// new run when one is created.
    UpdateCurrent,
    /// Leave the pointer alone.
    BypassCurrent,
}

/// Update a run, optionally creating its successor atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateWorkflowRequest {
    /// Shard id.
    pub shard_id: i32,
    /// Range the writer holds.
    pub range_id: i64,
    /// Pointer handling.
    pub mode: UpdateMode,
    /// Changes to the existing run.
    pub mutation: WorkflowMutation,
    /// Successor run.
    pub new_run: Option<WorkflowSnapshot>,
}

/// Durable storage consumed by the history engine.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Load the shard record, creating it with range 0 on first use.
    async fn get_or_create_shard(
        &self,
        shard_id: i32,
        owner: &str,
    ) -> Result<ShardInfo, PersistenceError>;

    /// Write the shard record if its stored range is `previous_range_id`.
    async fn update_shard(
        &self,
        shard: &ShardInfo,
        previous_range_id: i64,
    ) -> Result<(), PersistenceError>;

    /// Create a run with its first events and tasks.
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<(), PersistenceError>;

    /// Load a run.
    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        key: &WorkflowKey,
    ) -> Result<Option<PersistedExecution>, PersistenceError>;

    /// Load the current-run pointer of a workflow id.
    async fn get_current_execution(
        &self,
        shard_id: i32,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<Option<CurrentExecution>, PersistenceError>;

    /// Conditionally update a run.
    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowRequest,
    ) -> Result<(), PersistenceError>;

    /// Append events to a branch. The first event must directly follow the
    /// branch's last one.
    async fn append_history_events(
        &self,
        shard_id: i32,
        branch_token: &str,
        events: &[HistoryEvent],
    ) -> Result<(), PersistenceError>;

    /// Events with `min_event_id <= id < max_event_id`.
    async fn read_history_events(
        &self,
        shard_id: i32,
        branch_token: &str,
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, PersistenceError>;

    /// Create `new_branch` holding events `1..=fork_event_id` of `source_branch`.
    async fn fork_history_branch(
        &self,
        shard_id: i32,
        source_branch: &str,
        fork_event_id: i64,
        new_branch: &str,
    ) -> Result<(), PersistenceError>;

    /// Tasks with `min_task_id < id <= max_task_id`, in id order.
    async fn get_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        min_task_id: i64,
        max_task_id: i64,
        batch_size: usize,
    ) -> Result<Vec<Task>, PersistenceError>;

    /// Timer tasks due in `[min_time, max_time)`, in due order.
    async fn get_timer_tasks(
        &self,
        shard_id: i32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<Task>, PersistenceError>;

    /// Delete tasks with `min_task_id < id <= max_task_id`.
    async fn range_complete_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        min_task_id: i64,
        max_task_id: i64,
    ) -> Result<u64, PersistenceError>;

    /// Park a replication task that could not be applied.
    async fn put_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        task: &ReplicationTaskInfo,
    ) -> Result<(), PersistenceError>;

    /// Parked tasks with `min_task_id < id <= max_task_id`.
    async fn get_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        min_task_id: i64,
        max_task_id: i64,
        page_size: usize,
    ) -> Result<Vec<ReplicationTaskInfo>, PersistenceError>;

    /// Drop parked tasks with `min_task_id < id <= max_task_id`.
    async fn range_delete_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        min_task_id: i64,
        max_task_id: i64,
    ) -> Result<u64, PersistenceError>;

    /// Drop one parked task.
    async fn delete_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        task_id: i64,
    ) -> Result<(), PersistenceError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
