// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-cluster replication.
//!
//! The active cluster writes a replication task in the same transaction as
//! every event batch it commits (and on activity progress). Passive
//! clusters pull those tasks with `get_replication_messages`, receive them
//! hydrated into [`ReplicationTask`]s and apply them through the engine's
//! `replicate_events_v2` and `sync_activity` operations.
//!
//! Tasks that cannot be applied after retries are parked in a per-source
//! DLQ as [`ReplicationTaskInfo`] pointers; merging the DLQ re-hydrates them
//! from the source cluster.

pub mod processor;
pub mod resolver;

pub use self::processor::{ProcessOutcome, ReplicationTaskProcessor, apply_task};
pub use self::resolver::{BranchResolution, incoming_wins, resolve_branch};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::{GetDlqReplicationMessagesRequest, ReplicateEventsV2Request, SyncActivityRequest};
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::tasks::{Task, TaskKind};
use crate::types::WorkflowExecution;

/// Kind of a replication task pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReplicationTaskType {
    /// An event batch.
    #[default]
    History,
    /// Activity progress.
    SyncActivity,
}

/// Pointer form of a replication task, as queued and parked in the DLQ.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationTaskInfo {
    /// Domain of the run.
    pub domain_id: String,
    /// Workflow id of the run.
    pub workflow_id: String,
    /// Run id of the run.
    pub run_id: String,
    /// Source shard task id.
    pub task_id: i64,
    /// What the task carries.
    pub task_type: ReplicationTaskType,
    /// Version of the transaction that produced it.
    pub version: i64,
    /// First event id of the batch.
    pub first_event_id: i64,
    /// Next event id after the batch.
    pub next_event_id: i64,
    /// Scheduled event id, for activity progress.
    pub schedule_id: i64,
    /// Branch the batch was written to.
    pub branch_token: String,
    /// Successor run created with the batch.
    pub new_run_id: Option<String>,
}

impl ReplicationTaskInfo {
    /// Pointer for a queued replication task, `None` for other categories.
    pub fn from_task(task: &Task) -> Option<Self> {
        let base = Self {
            domain_id: task.key.domain_id.clone(),
            workflow_id: task.key.workflow_id.clone(),
            run_id: task.key.run_id.clone(),
            task_id: task.task_id,
            version: task.version,
            ..Self::default()
        };
        match &task.kind {
            TaskKind::HistoryReplication {
                first_event_id,
                next_event_id,
                branch_token,
                new_run_id,
            } => Some(Self {
                task_type: ReplicationTaskType::History,
                first_event_id: *first_event_id,
                next_event_id: *next_event_id,
                branch_token: branch_token.clone(),
                new_run_id: new_run_id.clone(),
                ..base
            }),
            TaskKind::SyncActivity { schedule_id } => Some(Self {
                task_type: ReplicationTaskType::SyncActivity,
                schedule_id: *schedule_id,
                ..base
            }),
            _ => None,
        }
    }

    /// The run the task belongs to.
    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(self.workflow_id.clone(), self.run_id.clone())
    }
}

/// Payload of a hydrated replication task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ReplicationTaskAttributes {
    /// Apply with `replicate_events_v2`.
    History(ReplicateEventsV2Request),
    /// Apply with `sync_activity`.
    SyncActivity(SyncActivityRequest),
}

/// A hydrated, self-contained replication task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Task id on the source shard.
    pub source_task_id: i64,
    /// When the source wrote the task.
    pub creation_time: DateTime<Utc>,
    /// Pointer the task was hydrated from, used for DLQ routing.
    pub info: ReplicationTaskInfo,
    /// What to apply.
    pub attributes: ReplicationTaskAttributes,
}

/// One page of replication tasks for a polling cluster.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplicationMessages {
    /// Hydrated tasks in task id order.
    pub tasks: Vec<ReplicationTask>,
    /// Highest task id covered by this page; pass it back on the next poll.
    pub last_retrieved_message_id: i64,
    /// Whether more tasks are ready.
    pub has_more: bool,
}

/// Client for the history service of a remote cluster.
///
/// Used when merging the DLQ: parked tasks are only pointers and must be
/// re-hydrated by the cluster that produced them.
#[async_trait]
pub trait RemoteClusterClient: Send + Sync {
    /// Hydrate `request.task_infos` on `cluster`.
    async fn get_dlq_replication_messages(
        &self,
        ctx: &CallContext,
        cluster: &str,
        request: GetDlqReplicationMessagesRequest,
    ) -> Result<Vec<ReplicationTask>>;
}

/// Client used when no remote cluster is reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemoteClusters;

#[async_trait]
impl RemoteClusterClient for NoRemoteClusters {
    async fn get_dlq_replication_messages(
        &self,
        _ctx: &CallContext,
        cluster: &str,
        _request: GetDlqReplicationMessagesRequest,
    ) -> Result<Vec<ReplicationTask>> {
        Err(HistoryError::bad_request(
            "source_cluster",
            format!("no client configured for cluster '{}'", cluster),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkflowKey;

    fn task(kind: TaskKind) -> Task {
        Task {
            key: WorkflowKey::new("domain", "wf", "run-1"),
            task_id: 77,
            visibility_time: Utc::now(),
            version: 11,
            kind,
        }
    }

    #[test]
    fn test_info_from_history_task() {
        let info = ReplicationTaskInfo::from_task(&task(TaskKind::HistoryReplication {
            first_event_id: 3,
            next_event_id: 5,
            branch_token: "branch-1".into(),
            new_run_id: None,
        }))
        .unwrap();
        assert_eq!(info.task_type, ReplicationTaskType::History);
        assert_eq!(info.task_id, 77);
        assert_eq!(info.version, 11);
        assert_eq!((info.first_event_id, info.next_event_id), (3, 5));
        assert_eq!(info.execution(), WorkflowExecution::new("wf", "run-1"));
    }

    #[test]
    fn test_info_from_non_replication_task() {
        assert!(ReplicationTaskInfo::from_task(&task(TaskKind::WorkflowTimeout)).is_none());
        let info =
            ReplicationTaskInfo::from_task(&task(TaskKind::SyncActivity { schedule_id: 9 })).unwrap();
        assert_eq!(info.task_type, ReplicationTaskType::SyncActivity);
        assert_eq!(info.schedule_id, 9);
    }
}
