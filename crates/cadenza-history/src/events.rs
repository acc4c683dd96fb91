// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History events.
//!
//! A run's history is an append-only list of [`HistoryEvent`]s with gap-free,
//! strictly increasing ids. Event payloads are modelled as one enum so state
//! application can match exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    DecisionTaskFailedCause, Memo, ParentExecutionInfo, Payload, RetryPolicy, SearchAttributes,
    TaskList, TimeoutType, WorkflowExecution, WorkflowIdReusePolicy,
};

/// One immutable history fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the run's history, or `BUFFERED_EVENT_ID` while buffered.
    pub event_id: i64,
    /// Failover version of the cluster that wrote the event.
    pub version: i64,
    /// Shard task id of the transaction that persisted the event.
    pub task_id: i64,
    /// Wall-clock time the event was created.
    pub timestamp: DateTime<Utc>,
    /// Typed payload.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// Short type name, for logs and dedup signatures.
    pub fn event_type(&self) -> &'static str {
        self.attributes.event_type()
    }
}

/// Attributes of `WorkflowExecutionStarted`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowExecutionStartedAttributes {
    /// Workflow type name.
    pub workflow_type: String,
    /// Decision task list.
    pub task_list: TaskList,
    /// Workflow input.
    pub input: Option<Payload>,
    /// Run timeout.
    pub execution_start_to_close_timeout_seconds: i32,
    /// Decision timeout.
    pub task_start_to_close_timeout_seconds: i32,
    /// Starting identity.
    pub identity: String,
    /// Parent, for child runs.
    pub parent: Option<ParentExecutionInfo>,
    /// Previous run when started through continue-as-new.
    pub continued_execution_run_id: Option<String>,
    /// First run of the chain.
    pub first_execution_run_id: String,
    /// Delay before the first decision.
    pub first_decision_task_backoff_seconds: i32,
    /// Memo.
    pub memo: Memo,
    /// Search attributes.
    pub search_attributes: SearchAttributes,
    /// Dedup id of the start request.
    pub request_id: String,
}

/// Attributes of `ActivityTaskScheduled`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityTaskScheduledAttributes {
    /// Workflow-unique activity id.
    pub activity_id: String,
    /// Activity type name.
    pub activity_type: String,
    /// Activity task list.
    pub task_list: TaskList,
    /// Activity input.
    pub input: Option<Payload>,
    /// Schedule to close timeout.
    pub schedule_to_close_timeout_seconds: i32,
    /// Schedule to start timeout.
    pub schedule_to_start_timeout_seconds: i32,
    /// Start to close timeout.
    pub start_to_close_timeout_seconds: i32,
    /// Heartbeat timeout, 0 disables.
    pub heartbeat_timeout_seconds: i32,
    /// Decision that scheduled it.
    pub decision_task_completed_event_id: i64,
    /// Retry policy.
    pub retry_policy: Option<RetryPolicy>,
}

/// Attributes of `StartChildWorkflowExecutionInitiated`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StartChildWorkflowExecutionInitiatedAttributes {
    /// Child domain.
    pub domain: String,
    /// Child workflow id.
    pub workflow_id: String,
    /// Child workflow type.
    pub workflow_type: String,
    /// Child task list.
    pub task_list: TaskList,
    /// Child input.
    pub input: Option<Payload>,
    /// Child run timeout.
    pub execution_start_to_close_timeout_seconds: i32,
    /// Child decision timeout.
    pub task_start_to_close_timeout_seconds: i32,
    /// Decision that initiated it.
    pub decision_task_completed_event_id: i64,
    /// Reuse policy for the child id.
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    /// Opaque caller data.
    pub control: Option<Payload>,
}

/// Attributes shared by the child-closed events.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChildWorkflowExecutionClosedAttributes {
    /// Child domain.
    pub domain: String,
    /// Child run.
    pub workflow_execution: WorkflowExecution,
    /// Child workflow type.
    pub workflow_type: String,
    /// Initiated event id in the parent.
    pub initiated_event_id: i64,
    /// Started event id in the parent.
    pub started_event_id: i64,
    /// Result for completed children.
    pub result: Option<Payload>,
    /// Failure reason for failed children.
    pub reason: Option<String>,
    /// Failure or cancellation details.
    pub details: Option<Payload>,
}

/// Attributes of `WorkflowExecutionContinuedAsNew`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowExecutionContinuedAsNewAttributes {
    /// Run id of the successor.
    pub new_execution_run_id: String,
    /// Workflow type of the successor.
    pub workflow_type: String,
    /// Task list of the successor.
    pub task_list: TaskList,
    /// Input of the successor.
    pub input: Option<Payload>,
    /// Run timeout of the successor.
    pub execution_start_to_close_timeout_seconds: i32,
    /// Decision timeout of the successor.
    pub task_start_to_close_timeout_seconds: i32,
    /// Decision that closed this run.
    pub decision_task_completed_event_id: i64,
    /// Delay before the successor's first decision.
    pub backoff_start_interval_seconds: i32,
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventAttributes {
    /// The run started.
    WorkflowExecutionStarted(WorkflowExecutionStartedAttributes),
    /// The run completed.
    WorkflowExecutionCompleted {
        /// Result.
        result: Option<Payload>,
        /// Closing decision.
        decision_task_completed_event_id: i64,
    },
    /// The run failed.
    WorkflowExecutionFailed {
        /// Reason.
        reason: String,
        /// Details.
        details: Option<Payload>,
        /// Closing decision.
        decision_task_completed_event_id: i64,
    },
    /// The run timed out.
    WorkflowExecutionTimedOut {
        /// Which timeout.
        timeout_type: TimeoutType,
    },
    /// The run was terminated.
    WorkflowExecutionTerminated {
        /// Reason.
        reason: String,
        /// Details.
        details: Option<Payload>,
        /// Caller identity.
        identity: String,
    },
    /// The run was canceled by its own decision.
    WorkflowExecutionCanceled {
        /// Closing decision.
        decision_task_completed_event_id: i64,
        /// Details.
        details: Option<Payload>,
    },
    /// The run closed and a successor started.
    WorkflowExecutionContinuedAsNew(WorkflowExecutionContinuedAsNewAttributes),
    /// Cancellation was requested.
    WorkflowExecutionCancelRequested {
        /// Cause.
        cause: String,
        /// Initiated event in the requesting run, if any.
        external_initiated_event_id: Option<i64>,
        /// Requesting run, if any.
        external_workflow_execution: Option<WorkflowExecution>,
        /// Caller identity.
        identity: String,
    },
    /// A signal was delivered.
    WorkflowExecutionSignaled {
        /// Signal name.
        signal_name: String,
        /// Signal input.
        input: Option<Payload>,
        /// Sender identity.
        identity: String,
    },
    /// A decision task was scheduled.
    DecisionTaskScheduled {
        /// Task list it was dispatched to.
        task_list: TaskList,
        /// Start to close timeout.
        start_to_close_timeout_seconds: i32,
        /// Attempt, starting at 0.
        attempt: i64,
    },
    /// A worker picked up the decision task.
    DecisionTaskStarted {
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Worker identity.
        identity: String,
        /// Poll request id.
        request_id: String,
    },
    /// The worker completed the decision task.
    DecisionTaskCompleted {
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Started event id.
        started_event_id: i64,
        /// Worker identity.
        identity: String,
        /// Opaque worker context.
        execution_context: Option<Payload>,
        /// Worker binary checksum.
        binary_checksum: String,
    },
    /// The decision task timed out.
    DecisionTaskTimedOut {
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Started event id.
        started_event_id: i64,
        /// Which timeout.
        timeout_type: TimeoutType,
    },
    /// The decision task failed.
    DecisionTaskFailed {
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Started event id.
        started_event_id: i64,
        /// Cause.
        cause: DecisionTaskFailedCause,
        /// Details.
        details: Option<Payload>,
        /// Worker identity.
        identity: String,
        /// Reset reason, for resets.
        reason: Option<String>,
        /// Run that was reset, for resets.
        base_run_id: Option<String>,
        /// Run created by the reset, for resets.
        new_run_id: Option<String>,
    },
    /// An activity was scheduled.
    ActivityTaskScheduled(ActivityTaskScheduledAttributes),
    /// A worker picked up the activity task.
    ActivityTaskStarted {
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Worker identity.
        identity: String,
        /// Poll request id.
        request_id: String,
        /// Attempt, starting at 0.
        attempt: i32,
    },
    /// The activity completed.
    ActivityTaskCompleted {
        /// Result.
        result: Option<Payload>,
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Started event id.
        started_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// The activity failed for good.
    ActivityTaskFailed {
        /// Reason.
        reason: String,
        /// Details.
        details: Option<Payload>,
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Started event id.
        started_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// The activity timed out for good.
    ActivityTaskTimedOut {
        /// Last heartbeat details.
        details: Option<Payload>,
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Started event id.
        started_event_id: i64,
        /// Which timeout.
        timeout_type: TimeoutType,
    },
    /// Cancellation of an activity was requested.
    ActivityTaskCancelRequested {
        /// Activity id.
        activity_id: String,
        /// Decision that requested it.
        decision_task_completed_event_id: i64,
    },
    /// A cancel request named an unknown activity.
    RequestCancelActivityTaskFailed {
        /// Activity id.
        activity_id: String,
        /// Cause.
        cause: String,
        /// Decision that requested it.
        decision_task_completed_event_id: i64,
    },
    /// The activity acknowledged cancellation.
    ActivityTaskCanceled {
        /// Details.
        details: Option<Payload>,
        /// Cancel request event id.
        latest_cancel_requested_event_id: i64,
        /// Scheduled event id.
        scheduled_event_id: i64,
        /// Started event id, empty if never started.
        started_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// A timer was started.
    TimerStarted {
        /// Workflow-unique timer id.
        timer_id: String,
        /// Delay.
        start_to_fire_timeout_seconds: i64,
        /// Decision that started it.
        decision_task_completed_event_id: i64,
    },
    /// A start-timer decision reused a pending timer id.
    StartTimerFailed {
        /// Timer id.
        timer_id: String,
        /// Cause.
        cause: String,
        /// Decision that requested it.
        decision_task_completed_event_id: i64,
    },
    /// A timer fired.
    TimerFired {
        /// Timer id.
        timer_id: String,
        /// Started event id.
        started_event_id: i64,
    },
    /// A timer was canceled.
    TimerCanceled {
        /// Timer id.
        timer_id: String,
        /// Started event id.
        started_event_id: i64,
        /// Decision that canceled it.
        decision_task_completed_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// A cancel-timer decision named an unknown timer.
    CancelTimerFailed {
        /// Timer id.
        timer_id: String,
        /// Cause.
        cause: String,
        /// Decision that requested it.
        decision_task_completed_event_id: i64,
        /// Worker identity.
        identity: String,
    },
    /// A marker was recorded.
    MarkerRecorded {
        /// Marker name.
        marker_name: String,
        /// Details.
        details: Option<Payload>,
        /// Decision that recorded it.
        decision_task_completed_event_id: i64,
    },
    /// A child start was initiated.
    StartChildWorkflowExecutionInitiated(StartChildWorkflowExecutionInitiatedAttributes),
    /// The child could not be started.
    StartChildWorkflowExecutionFailed {
        /// Child domain.
        domain: String,
        /// Child workflow id.
        workflow_id: String,
        /// Child workflow type.
        workflow_type: String,
        /// Cause.
        cause: String,
        /// Initiated event id.
        initiated_event_id: i64,
        /// Decision that initiated it.
        decision_task_completed_event_id: i64,
    },
    /// The child run was created.
    ChildWorkflowExecutionStarted {
        /// Child domain.
        domain: String,
        /// Initiated event id.
        initiated_event_id: i64,
        /// Child run.
        workflow_execution: WorkflowExecution,
        /// Child workflow type.
        workflow_type: String,
    },
    /// The child completed.
    ChildWorkflowExecutionCompleted(ChildWorkflowExecutionClosedAttributes),
    /// The child failed.
    ChildWorkflowExecutionFailed(ChildWorkflowExecutionClosedAttributes),
    /// The child was canceled.
    ChildWorkflowExecutionCanceled(ChildWorkflowExecutionClosedAttributes),
    /// The child timed out.
    ChildWorkflowExecutionTimedOut(ChildWorkflowExecutionClosedAttributes),
    /// The child was terminated.
    ChildWorkflowExecutionTerminated(ChildWorkflowExecutionClosedAttributes),
    /// A signal to another run was initiated.
    SignalExternalWorkflowExecutionInitiated {
        /// Decision that initiated it.
        decision_task_completed_event_id: i64,
        /// Target domain.
        domain: String,
        /// Target run.
        workflow_execution: WorkflowExecution,
        /// Signal name.
        signal_name: String,
        /// Signal input.
        input: Option<Payload>,
        /// Opaque caller data.
        control: Option<Payload>,
        /// Only deliver to a child of this run.
        child_workflow_only: bool,
    },
    /// Signalling another run failed.
    SignalExternalWorkflowExecutionFailed {
        /// Cause.
        cause: String,
        /// Initiated event id.
        initiated_event_id: i64,
        /// Target domain.
        domain: String,
        /// Target run.
        workflow_execution: WorkflowExecution,
        /// Opaque caller data.
        control: Option<Payload>,
    },
    /// Another run was signalled.
    ExternalWorkflowExecutionSignaled {
        /// Initiated event id.
        initiated_event_id: i64,
        /// Target domain.
        domain: String,
        /// Target run.
        workflow_execution: WorkflowExecution,
        /// Opaque caller data.
        control: Option<Payload>,
    },
    /// Search attributes were upserted.
    UpsertWorkflowSearchAttributes {
        /// Decision that upserted them.
        decision_task_completed_event_id: i64,
        /// Upserted fields.
        search_attributes: SearchAttributes,
    },
}

impl EventAttributes {
    /// Short type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowExecutionStarted(_) => "WorkflowExecutionStarted",
            Self::WorkflowExecutionCompleted { .. } => "WorkflowExecutionCompleted",
            Self::WorkflowExecutionFailed { .. } => "WorkflowExecutionFailed",
            Self::WorkflowExecutionTimedOut { .. } => "WorkflowExecutionTimedOut",
            Self::WorkflowExecutionTerminated { .. } => "WorkflowExecutionTerminated",
            Self::WorkflowExecutionCanceled { .. } => "WorkflowExecutionCanceled",
            Self::WorkflowExecutionContinuedAsNew(_) => "WorkflowExecutionContinuedAsNew",
            Self::WorkflowExecutionCancelRequested { .. } => "WorkflowExecutionCancelRequested",
            Self::WorkflowExecutionSignaled { .. } => "WorkflowExecutionSignaled",
            Self::DecisionTaskScheduled { .. } => "DecisionTaskScheduled",
            Self::DecisionTaskStarted { .. } => "DecisionTaskStarted",
            Self::DecisionTaskCompleted { .. } => "DecisionTaskCompleted",
            Self::DecisionTaskTimedOut { .. } => "DecisionTaskTimedOut",
            Self::DecisionTaskFailed { .. } => "DecisionTaskFailed",
            Self::ActivityTaskScheduled(_) => "ActivityTaskScheduled",
            Self::ActivityTaskStarted { .. } => "ActivityTaskStarted",
            Self::ActivityTaskCompleted { .. } => "ActivityTaskCompleted",
            Self::ActivityTaskFailed { .. } => "ActivityTaskFailed",
            Self::ActivityTaskTimedOut { .. } => "ActivityTaskTimedOut",
            Self::ActivityTaskCancelRequested { .. } => "ActivityTaskCancelRequested",
            Self::RequestCancelActivityTaskFailed { .. } => "RequestCancelActivityTaskFailed",
            Self::ActivityTaskCanceled { .. } => "ActivityTaskCanceled",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::StartTimerFailed { .. } => "StartTimerFailed",
            Self::TimerFired { .. } => "TimerFired",
            Self::TimerCanceled { .. } => "TimerCanceled",
            Self::CancelTimerFailed { .. } => "CancelTimerFailed",
            Self::MarkerRecorded { .. } => "MarkerRecorded",
            Self::StartChildWorkflowExecutionInitiated(_) => "StartChildWorkflowExecutionInitiated",
            Self::StartChildWorkflowExecutionFailed { .. } => "StartChildWorkflowExecutionFailed",
            Self::ChildWorkflowExecutionStarted { .. } => "ChildWorkflowExecutionStarted",
            Self::ChildWorkflowExecutionCompleted(_) => "ChildWorkflowExecutionCompleted",
            Self::ChildWorkflowExecutionFailed(_) => "ChildWorkflowExecutionFailed",
            Self::ChildWorkflowExecutionCanceled(_) => "ChildWorkflowExecutionCanceled",
            Self::ChildWorkflowExecutionTimedOut(_) => "ChildWorkflowExecutionTimedOut",
            Self::ChildWorkflowExecutionTerminated(_) => "ChildWorkflowExecutionTerminated",
            Self::SignalExternalWorkflowExecutionInitiated { .. } => {
                "SignalExternalWorkflowExecutionInitiated"
            }
            Self::SignalExternalWorkflowExecutionFailed { .. } => {
                "SignalExternalWorkflowExecutionFailed"
            }
            Self::ExternalWorkflowExecutionSignaled { .. } => "ExternalWorkflowExecutionSignaled",
            Self::UpsertWorkflowSearchAttributes { .. } => "UpsertWorkflowSearchAttributes",
        }
    }

    /// Whether this event closes the run.
    pub fn is_workflow_close(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionCompleted { .. }
                | Self::WorkflowExecutionFailed { .. }
                | Self::WorkflowExecutionTimedOut { .. }
                | Self::WorkflowExecutionTerminated { .. }
                | Self::WorkflowExecutionCanceled { .. }
                | Self::WorkflowExecutionContinuedAsNew(_)
        )
    }

    /// Whether this event is held back while a decision is in flight.
    ///
    /// Buffered events describe things that happened outside the decision
    /// the worker is working on; they get ids once the decision finishes.
    pub fn is_bufferable(&self) -> bool {
        matches!(
            self,
            Self::WorkflowExecutionSignaled { .. }
                | Self::WorkflowExecutionCancelRequested { .. }
                | Self::ActivityTaskStarted { .. }
                | Self::ActivityTaskCompleted { .. }
                | Self::ActivityTaskFailed { .. }
                | Self::ActivityTaskTimedOut { .. }
                | Self::ActivityTaskCanceled { .. }
                | Self::TimerFired { .. }
                | Self::StartChildWorkflowExecutionFailed { .. }
                | Self::ChildWorkflowExecutionStarted { .. }
                | Self::ChildWorkflowExecutionCompleted(_)
                | Self::ChildWorkflowExecutionFailed(_)
                | Self::ChildWorkflowExecutionCanceled(_)
                | Self::ChildWorkflowExecutionTimedOut(_)
                | Self::ChildWorkflowExecutionTerminated(_)
                | Self::SignalExternalWorkflowExecutionFailed { .. }
                | Self::ExternalWorkflowExecutionSignaled { .. }
        )
    }

    /// Whether this event finishes an in-flight decision.
    pub fn is_decision_close(&self) -> bool {
        matches!(
            self,
            Self::DecisionTaskCompleted { .. }
                | Self::DecisionTaskFailed { .. }
                | Self::DecisionTaskTimedOut { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id: 3,
            version: 1,
            task_id: 100,
            timestamp: Utc::now(),
            attributes,
        }
    }

    #[test]
    fn test_event_json_is_tagged() {
        let e = event(EventAttributes::WorkflowExecutionSignaled {
            signal_name: "ping".into(),
            input: Some(Payload::from_text("hi")),
            identity: "tester".into(),
        });
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["attributes"]["event_type"], "WorkflowExecutionSignaled");
        assert_eq!(json["attributes"]["signal_name"], "ping");

        let back: HistoryEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_classification() {
        let signal = EventAttributes::WorkflowExecutionSignaled {
            signal_name: "s".into(),
            input: None,
            identity: String::new(),
        };
        assert!(signal.is_bufferable());
        assert!(!signal.is_workflow_close());

        let terminated = EventAttributes::WorkflowExecutionTerminated {
            reason: "r".into(),
            details: None,
            identity: String::new(),
        };
        assert!(terminated.is_workflow_close());
        assert!(!terminated.is_bufferable());

        let scheduled = EventAttributes::DecisionTaskScheduled {
            task_list: TaskList::normal("tl"),
            start_to_close_timeout_seconds: 10,
            attempt: 0,
        };
        assert!(!scheduled.is_bufferable());
        assert_eq!(event(scheduled).event_type(), "DecisionTaskScheduled");
    }
}
