// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow mutable state.
//!
//! [`MutableState`] is the authoritative snapshot of one run. It changes in
//! exactly two ways:
//!
//! - the builder methods (`add_*`) create a new event, apply it, and queue
//!   the tasks it implies; this is how locally driven operations mutate a run
//! - [`MutableState::replay_event`] applies an event produced elsewhere (a
//!   replicated batch, or history being rebuilt after a fork or reset)
//!
//! Both paths share `apply_event`, so a run replayed from its history ends
//! up in the same state as the run that wrote it.
//!
//! Everything produced between [`MutableState::start_transaction`] and
//! [`MutableState::close_transaction`] is collected in an unpersisted
//! transaction and handed to the store as one conditional write.

mod apply;
mod builder;
pub mod retry;
pub mod task_generator;
pub mod version_history;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};
use crate::events::{ActivityTaskScheduledAttributes, HistoryEvent};
use crate::tasks::{PendingTask, TaskKind};
use crate::types::{
    CloseStatus, EMPTY_EVENT_ID, FIRST_EVENT_ID, Memo, ParentExecutionInfo, Payload,
    SearchAttributes, WorkflowExecution, WorkflowKey, WorkflowState,
};

pub use self::version_history::{VersionHistories, VersionHistory, VersionHistoryItem};

/// `from` plus `seconds`, saturating at the latest representable instant.
pub(crate) fn fire_time(from: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    chrono::TimeDelta::try_seconds(seconds)
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Run-level fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionInfo {
    /// Owning domain.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// First run of the continue-as-new chain.
    pub first_execution_run_id: String,
    /// Parent, for child runs.
    pub parent: Option<ParentExecutionInfo>,
    /// Workflow type name.
    pub workflow_type: String,
    /// Normal decision task list.
    pub task_list: String,
    /// Sticky decision task list, if a worker holds the run in its cache.
    pub sticky_task_list: Option<String>,
    /// Schedule-to-start timeout for sticky decisions.
    pub sticky_schedule_to_start_timeout_seconds: i32,
    /// Run timeout.
    pub workflow_timeout_seconds: i32,
    /// Decision timeout.
    pub decision_timeout_seconds: i32,
    /// How long the run is kept after it closes.
    pub retention_seconds: i64,
    /// Lifecycle.
    pub state: WorkflowState,
    /// How the run closed.
    pub close_status: CloseStatus,
    /// Id the next event will get.
    pub next_event_id: i64,
    /// First event id of the last persisted batch.
    pub last_first_event_id: i64,
    /// Started event id of the last completed decision.
    pub last_processed_event_id: i64,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the first decision may run (start time plus backoff).
    pub execution_time: DateTime<Utc>,
    /// When the run closed.
    pub close_time: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub last_updated: DateTime<Utc>,
    /// Dedup id of the request that created the run.
    pub create_request_id: String,
    /// Decision state.
    pub decision: DecisionInfo,
    /// Whether cancellation was requested.
    pub cancel_requested: bool,
    /// Dedup id of the cancel request.
    pub cancel_request_id: String,
    /// Signals received.
    pub signal_count: i64,
    /// Memo.
    pub memo: Memo,
    /// Search attributes.
    pub search_attributes: SearchAttributes,
    /// Closing event, once closed.
    pub completion_event: Option<HistoryEvent>,
}

/// Decision task bookkeeping. `schedule_id == EMPTY_EVENT_ID` means none.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DecisionInfo {
    /// Version of the scheduled event.
    pub version: i64,
    /// Scheduled event id.
    pub schedule_id: i64,
    /// Started event id.
    pub started_id: i64,
    /// Poll request id of the start.
    pub request_id: String,
    /// Start to close timeout.
    pub timeout_seconds: i32,
    /// Consecutive failed attempts.
    pub attempt: i64,
    /// Task list the decision was dispatched to.
    pub task_list: String,
    /// When it was scheduled.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// When it was started.
    pub started_time: Option<DateTime<Utc>>,
}

/// A pending activity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Version of the scheduled event.
    pub version: i64,
    /// Scheduled event id.
    pub schedule_id: i64,
    /// Scheduled event payload.
    pub scheduled: ActivityTaskScheduledAttributes,
    /// When the current attempt was scheduled.
    pub scheduled_time: DateTime<Utc>,
    /// Started event id, `EMPTY_EVENT_ID` until started.
    pub started_id: i64,
    /// When the current attempt started.
    pub started_time: Option<DateTime<Utc>>,
    /// Poll request id of the start.
    pub request_id: String,
    /// Last heartbeat details.
    pub details: Option<Payload>,
    /// Last heartbeat time.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Whether cancellation was requested.
    pub cancel_requested: bool,
    /// Cancel-requested event id.
    pub cancel_request_id: i64,
    /// Attempt, starting at 0.
    pub attempt: i32,
    /// Retry deadline derived from the policy's expiration.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Failure reason of the previous attempt.
    pub last_failure_reason: Option<String>,
    /// Identity of the worker that ran the previous attempt.
    pub last_worker_identity: String,
}

impl ActivityInfo {
    /// Activity id.
    pub fn activity_id(&self) -> &str {
        &self.scheduled.activity_id
    }

    /// Whether a worker holds the current attempt.
    pub fn is_started(&self) -> bool {
        self.started_id != EMPTY_EVENT_ID
    }
}

/// A pending user timer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimerInfo {
    /// Version of the started event.
    pub version: i64,
    /// Timer id.
    pub timer_id: String,
    /// Started event id.
    pub started_id: i64,
    /// When it fires.
    pub expiry_time: DateTime<Utc>,
}

/// A pending child run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    /// Version of the initiated event.
    pub version: i64,
    /// Initiated event id.
    pub initiated_id: i64,
    /// Started event id, `EMPTY_EVENT_ID` until the child exists.
    pub started_id: i64,
    /// Child domain.
    pub domain: String,
    /// Child workflow id.
    pub workflow_id: String,
    /// Child run id, once started.
    pub run_id: String,
    /// Child workflow type.
    pub workflow_type: String,
    /// Dedup id used to create the child.
    pub create_request_id: String,
}

/// A pending outbound signal.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalInfo {
    /// Version of the initiated event.
    pub version: i64,
    /// Initiated event id.
    pub initiated_id: i64,
    /// Dedup id used when delivering.
    pub request_id: String,
    /// Signal name.
    pub signal_name: String,
    /// Target domain.
    pub domain: String,
    /// Target run.
    pub execution: WorkflowExecution,
}

/// Changes accumulated by the open transaction. Never persisted.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct PendingChanges {
    pub(crate) events: Vec<HistoryEvent>,
    pub(crate) tasks: Vec<PendingTask>,
    pub(crate) new_run: Option<Box<MutableState>>,
    pub(crate) replicate: bool,
}

/// Output of [`MutableState::close_transaction`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Events to append to the current branch, in id order.
    pub events: Vec<HistoryEvent>,
    /// Tasks to enqueue.
    pub tasks: Vec<PendingTask>,
    /// Successor run created in the same transaction.
    pub new_run: Option<Box<MutableState>>,
}

impl Transaction {
    /// Whether the transaction writes nothing but state.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.tasks.is_empty() && self.new_run.is_none()
    }
}

/// Authoritative snapshot of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutableState {
    /// Run-level fields.
    pub execution_info: ExecutionInfo,
    /// Pending activities by scheduled event id.
    pub pending_activities: BTreeMap<i64, ActivityInfo>,
    /// Pending timers by timer id.
    pub pending_timers: BTreeMap<String, TimerInfo>,
    /// Pending children by initiated event id.
    pub pending_children: BTreeMap<i64, ChildExecutionInfo>,
    /// Pending outbound signals by initiated event id.
    pub pending_signals: BTreeMap<i64, SignalInfo>,
    /// Request ids of delivered signals.
    pub signal_requested_ids: BTreeSet<String>,
    /// Events waiting for the in-flight decision to finish.
    pub buffered_events: Vec<HistoryEvent>,
    /// Branch bookkeeping.
    pub version_histories: VersionHistories,
    /// Signatures of reapplied events.
    pub reapplied_events: BTreeSet<String>,
    /// Version new events are written with.
    pub current_version: i64,
    #[serde(skip)]
    pub(crate) pending: PendingChanges,
}

impl MutableState {
    /// Empty state for a new run whose history lives on `branch_token`.
    pub fn new(key: &WorkflowKey, branch_token: impl Into<String>, version: i64) -> Self {
        Self {
            execution_info: ExecutionInfo {
                domain_id: key.domain_id.clone(),
                workflow_id: key.workflow_id.clone(),
                run_id: key.run_id.clone(),
                next_event_id: FIRST_EVENT_ID,
                last_first_event_id: FIRST_EVENT_ID,
                ..ExecutionInfo::default()
            },
            pending_activities: BTreeMap::new(),
            pending_timers: BTreeMap::new(),
            pending_children: BTreeMap::new(),
            pending_signals: BTreeMap::new(),
            signal_requested_ids: BTreeSet::new(),
            buffered_events: Vec::new(),
            version_histories: VersionHistories::new(VersionHistory::new(branch_token, Vec::new())),
            reapplied_events: BTreeSet::new(),
            current_version: version,
            pending: PendingChanges::default(),
        }
    }

    /// Identity of the run.
    pub fn key(&self) -> WorkflowKey {
        WorkflowKey::new(
            self.execution_info.domain_id.clone(),
            self.execution_info.workflow_id.clone(),
            self.execution_info.run_id.clone(),
        )
    }

    /// Whether the run is still open.
    pub fn is_running(&self) -> bool {
        matches!(
            self.execution_info.state,
            WorkflowState::Created | WorkflowState::Running
        )
    }

    /// Whether a decision is scheduled or started.
    pub fn has_pending_decision(&self) -> bool {
        self.execution_info.decision.schedule_id != EMPTY_EVENT_ID
    }

    /// Whether a worker is working on a decision.
    pub fn has_inflight_decision(&self) -> bool {
        self.execution_info.decision.started_id != EMPTY_EVENT_ID
    }

    /// Whether events are waiting for the in-flight decision.
    pub fn has_buffered_events(&self) -> bool {
        !self.buffered_events.is_empty()
    }

    /// Id the next event will get.
    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    /// Version of the last event on the current branch.
    pub fn last_write_version(&self) -> i64 {
        self.version_histories
            .current()
            .ok()
            .and_then(|h| h.last_item())
            .map(|item| item.version)
            .unwrap_or(self.current_version)
    }

    /// Branch token of the current branch.
    pub fn current_branch_token(&self) -> Result<String> {
        Ok(self.version_histories.current()?.branch_token.clone())
    }

    /// Pending activity by activity id.
    pub fn activity_by_id(&self, activity_id: &str) -> Option<&ActivityInfo> {
        self.pending_activities
            .values()
            .find(|ai| ai.activity_id() == activity_id)
    }

    /// Open a transaction writing events with `version`.
    ///
    /// `replicate` controls whether replication tasks are generated.
    pub fn start_transaction(&mut self, version: i64, replicate: bool) {
        self.current_version = version;
        self.pending = PendingChanges {
            replicate,
            ..PendingChanges::default()
        };
    }

    /// Close the transaction and hand back what must be persisted.
    ///
    /// Buffered events are flushed here unless a decision is still in
    /// flight.
    pub fn close_transaction(&mut self) -> Result<Transaction> {
        if !self.has_inflight_decision() {
            self.flush_buffered_events()?;
        }

        let mut pending = std::mem::take(&mut self.pending);
        if let Some(first) = pending.events.first() {
            self.execution_info.last_first_event_id = first.event_id;
        }

        if pending.replicate
            && let (Some(first), Some(last)) = (pending.events.first(), pending.events.last())
        {
            pending.tasks.push(PendingTask::now(TaskKind::HistoryReplication {
                first_event_id: first.event_id,
                next_event_id: last.event_id + 1,
                branch_token: self.current_branch_token()?,
                new_run_id: pending
                    .new_run
                    .as_ref()
                    .map(|run| run.execution_info.run_id.clone()),
            }));
        }

        Ok(Transaction {
            events: pending.events,
            tasks: pending.tasks,
            new_run: pending.new_run,
        })
    }

    /// Replay an event produced elsewhere, advancing ids and the current
    /// branch's version history. Tasks are generated as for local events.
    pub fn replay_event(&mut self, event: &HistoryEvent) -> Result<()> {
        if event.event_id != self.execution_info.next_event_id {
            return Err(HistoryError::invalid_state(format!(
                "replayed event {} does not follow next event {}",
                event.event_id, self.execution_info.next_event_id
            )));
        }
        self.current_version = event.version;
        self.apply_event(event)?;
        let tasks = task_generator::tasks_for_event(self, event);
        self.pending.tasks.extend(tasks);
        self.record_event(event.clone())
    }

    /// Rebuild state from a run's full history.
    pub fn rebuild(
        key: &WorkflowKey,
        branch_token: &str,
        events: &[HistoryEvent],
    ) -> Result<Self> {
        let version = events
            .first()
            .map(|e| e.version)
            .ok_or_else(|| HistoryError::invalid_state("cannot rebuild from empty history"))?;
        let mut ms = MutableState::new(key, branch_token, version);
        for event in events {
            ms.replay_event(event)?;
        }
        // Rebuilt runs regenerate their tasks from state instead.
        ms.pending = PendingChanges::default();
        Ok(ms)
    }

    /// Advance next event id and version history for a persisted-id event.
    fn record_event(&mut self, event: HistoryEvent) -> Result<()> {
        self.execution_info.next_event_id = event.event_id + 1;
        self.version_histories
            .current_mut()?
            .add_or_update(event.event_id, event.version)?;
        self.pending.events.push(event);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::events::WorkflowExecutionStartedAttributes;
    use crate::types::TaskList;

    /// A started run with its first decision scheduled, and its history.
    pub(crate) fn started_state_with_history(workflow_id: &str) -> (MutableState, Vec<HistoryEvent>) {
        let key = WorkflowKey::new("domain", workflow_id, "run-1");
        let mut ms = MutableState::new(&key, "branch-1", 1);
        ms.start_transaction(1, false);
        ms.add_workflow_execution_started(WorkflowExecutionStartedAttributes {
            workflow_type: "wf-type".into(),
            task_list: TaskList::normal("tl"),
            execution_start_to_close_timeout_seconds: 3600,
            task_start_to_close_timeout_seconds: 10,
            request_id: "req-1".into(),
            first_execution_run_id: "run-1".into(),
            ..Default::default()
        })
        .unwrap();
        ms.add_decision_task_scheduled().unwrap();
        let txn = ms.close_transaction().unwrap();
        (ms, txn.events)
    }

    /// A started run with its first decision scheduled.
    pub(crate) fn started_state(workflow_id: &str) -> MutableState {
        started_state_with_history(workflow_id).0
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{started_state, started_state_with_history};
    use super::*;
    use crate::events::EventAttributes;

    #[test]
    fn test_started_state_shape() {
        let ms = started_state("wf");
        assert!(ms.is_running());
        assert!(ms.has_pending_decision());
        assert!(!ms.has_inflight_decision());
        assert_eq!(ms.next_event_id(), 3);
        assert_eq!(ms.execution_info.decision.schedule_id, 2);
        assert_eq!(ms.last_write_version(), 1);
        assert_eq!(
            ms.version_histories.current().unwrap().items,
            vec![VersionHistoryItem::new(2, 1)]
        );
    }

    #[test]
    fn test_close_transaction_emits_replication_task() {
        let mut ms = started_state("wf");
        ms.start_transaction(1, true);
        ms.add_workflow_execution_signaled("sig", None, "tester").unwrap();
        let txn = ms.close_transaction().unwrap();

        assert_eq!(txn.events.len(), 1);
        assert_eq!(ms.execution_info.last_first_event_id, 3);
        assert!(txn.tasks.iter().any(|t| matches!(
            t.kind,
            TaskKind::HistoryReplication {
                first_event_id: 3,
                next_event_id: 4,
                ..
            }
        )));
    }

    #[test]
    fn test_rebuild_matches_original() {
        let (mut ms, mut history) = started_state_with_history("wf");
        ms.start_transaction(1, false);
        ms.add_decision_task_started(2, "poll-1", "worker").unwrap();
        history.extend(ms.close_transaction().unwrap().events);

        let rebuilt = MutableState::rebuild(&ms.key(), "branch-1", &history).unwrap();
        assert_eq!(rebuilt.next_event_id(), 4);
        assert!(rebuilt.has_inflight_decision());
        assert_eq!(rebuilt.execution_info.decision.started_id, 3);
        assert_eq!(rebuilt.execution_info.workflow_type, "wf-type");
        assert_eq!(rebuilt.version_histories, ms.version_histories);
        assert!(rebuilt.pending.events.is_empty());
        assert!(matches!(
            history[0].attributes,
            EventAttributes::WorkflowExecutionStarted(_)
        ));
    }

    #[test]
    fn test_replay_rejects_gap() {
        let mut ms = started_state("wf");
        let event = HistoryEvent {
            event_id: 7,
            version: 1,
            task_id: 0,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionSignaled {
                signal_name: "s".into(),
                input: None,
                identity: String::new(),
            },
        };
        assert!(ms.replay_event(&event).is_err());
    }
}
