// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed requests and responses of the [`Engine`](crate::engine::Engine)
//! surface.
//!
//! These are plain serde structs so a transport can carry them as they are;
//! the engine itself never looks at wire bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{
    ActivityTaskScheduledAttributes, HistoryEvent, StartChildWorkflowExecutionInitiatedAttributes,
    WorkflowExecutionContinuedAsNewAttributes,
};
use crate::state::{VersionHistories, VersionHistoryItem};
use crate::types::{
    CloseStatus, DataBlob, DecisionTaskFailedCause, Memo, ParentExecutionInfo, Payload,
    SearchAttributes, WorkflowExecution, WorkflowIdReusePolicy, WorkflowState,
};

// ============================================================================
// Shared
// ============================================================================

/// Identifies a decision or activity task handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskToken {
    /// Domain of the run.
    pub domain_id: String,
    /// Workflow id of the run.
    pub workflow_id: String,
    /// Run id of the run.
    pub run_id: String,
    /// Scheduled event id of the task.
    pub schedule_id: i64,
    /// Attempt the token was issued for.
    pub schedule_attempt: i64,
    /// Activity id, for activity tasks.
    pub activity_id: Option<String>,
}

impl TaskToken {
    /// The run the token addresses.
    pub fn execution(&self) -> WorkflowExecution {
        WorkflowExecution::new(self.workflow_id.clone(), self.run_id.clone())
    }
}

/// Public view of a run, shared by describe and visibility listings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowExecutionInfo {
    /// The run.
    pub execution: WorkflowExecution,
    /// Workflow type name.
    pub workflow_type: String,
    /// Start time in Unix nanoseconds.
    pub start_time: i64,
    /// Time the first decision could run, in Unix nanoseconds.
    pub execution_time: i64,
    /// Close time in Unix nanoseconds, for closed runs.
    pub close_time: Option<i64>,
    /// How the run closed, for closed runs.
    pub close_status: Option<CloseStatus>,
    /// Number of events.
    pub history_length: i64,
    /// Parent run, for children.
    pub parent: Option<ParentExecutionInfo>,
    /// Memo, if decodable.
    pub memo: Option<Memo>,
    /// Search attributes, JSON encoded per value.
    pub search_attributes: Option<SearchAttributes>,
    /// Decision task list.
    pub task_list: String,
}

/// Unix nanoseconds of `time`, saturating outside the representable range.
pub fn to_unix_nanos(time: DateTime<Utc>) -> i64 {
    time.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Time at `nanos` Unix nanoseconds.
pub fn from_unix_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

// ============================================================================
// Workflow lifecycle
// ============================================================================

/// Start a new run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StartWorkflowExecutionRequest {
    /// Domain.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Workflow type name.
    pub workflow_type: String,
    /// Decision task list.
    pub task_list: String,
    /// Input.
    pub input: Option<Payload>,
    /// Run timeout.
    pub execution_start_to_close_timeout_seconds: i32,
    /// Decision timeout.
    pub task_start_to_close_timeout_seconds: i32,
    /// Caller identity.
    pub identity: String,
    /// Dedup id; retries of the same start return the same run.
    pub request_id: String,
    /// What to do when the workflow id was used before.
    pub workflow_id_reuse_policy: WorkflowIdReusePolicy,
    /// Memo.
    pub memo: Memo,
    /// Search attributes.
    pub search_attributes: SearchAttributes,
    /// Parent run, for children.
    pub parent: Option<ParentExecutionInfo>,
    /// Delay before the first decision.
    pub delay_start_seconds: i32,
}

/// Run created by a start.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StartWorkflowExecutionResponse {
    /// Run id.
    pub run_id: String,
}

/// Read (or wait for) a run's mutable state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetMutableStateRequest {
    /// Domain.
    pub domain_id: String,
    /// Run; an empty run id addresses the current run.
    pub execution: WorkflowExecution,
    /// Next event id the caller already has.
    pub expected_next_event_id: i64,
    /// Branch the caller is reading, if any.
    pub current_branch_token: Option<String>,
}

/// Mutable state summary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GetMutableStateResponse {
    /// Resolved run.
    pub execution: WorkflowExecution,
    /// Workflow type name.
    pub workflow_type: String,
    /// Next event id.
    pub next_event_id: i64,
    /// Started event id of the last completed decision.
    pub previous_started_event_id: i64,
    /// First event id of the last persisted batch.
    pub last_first_event_id: i64,
    /// Normal task list.
    pub task_list: String,
    /// Sticky task list, if set.
    pub sticky_task_list: Option<String>,
    /// Sticky schedule-to-start timeout.
    pub sticky_schedule_to_start_timeout_seconds: i32,
    /// Current branch.
    pub current_branch_token: String,
    /// Whether the run is open.
    pub is_workflow_running: bool,
    /// Lifecycle.
    pub workflow_state: WorkflowState,
    /// How the run closed.
    pub close_status: CloseStatus,
    /// All branches.
    pub version_histories: VersionHistories,
}

/// Same shape as [`GetMutableStateRequest`].
pub type PollMutableStateRequest = GetMutableStateRequest;
/// Same shape as [`GetMutableStateResponse`].
pub type PollMutableStateResponse = GetMutableStateResponse;

/// Dump a run's state for debugging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DescribeMutableStateRequest {
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
}

/// JSON dumps of the cached and stored state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DescribeMutableStateResponse {
    /// Cached copy, if the run is cached.
    pub mutable_state_in_cache: Option<String>,
    /// Stored copy.
    pub mutable_state_in_database: String,
}

/// Describe a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DescribeWorkflowExecutionRequest {
    /// Domain.
    pub domain_id: String,
    /// Run; an empty run id addresses the current run.
    pub execution: WorkflowExecution,
}

/// Configuration fixed at start.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkflowExecutionConfiguration {
    /// Decision task list.
    pub task_list: String,
    /// Run timeout.
    pub execution_start_to_close_timeout_seconds: i32,
    /// Decision timeout.
    pub task_start_to_close_timeout_seconds: i32,
}

/// State of a pending activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingActivityState {
    /// Waiting for a worker.
    Scheduled,
    /// A worker holds it.
    Started,
    /// Cancellation was requested.
    CancelRequested,
}

/// A pending activity, as described.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingActivityInfo {
    /// Activity id.
    pub activity_id: String,
    /// Activity type.
    pub activity_type: String,
    /// State.
    pub state: PendingActivityState,
    /// Last heartbeat details.
    pub heartbeat_details: Option<Payload>,
    /// Last heartbeat time.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Start of the current attempt.
    pub last_started_time: Option<DateTime<Utc>>,
    /// Attempt.
    pub attempt: i32,
    /// Schedule time of the current attempt.
    pub scheduled_time: DateTime<Utc>,
    /// Retry deadline.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Previous attempt's failure reason.
    pub last_failure_reason: Option<String>,
    /// Previous attempt's worker.
    pub last_worker_identity: String,
}

/// A pending child, as described.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PendingChildExecutionInfo {
    /// Child domain.
    pub domain: String,
    /// Child workflow id.
    pub workflow_id: String,
    /// Child run id, once started.
    pub run_id: String,
    /// Child workflow type.
    pub workflow_type: String,
    /// Initiated event id.
    pub initiated_id: i64,
}

/// Describe result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DescribeWorkflowExecutionResponse {
    /// Start configuration.
    pub execution_configuration: WorkflowExecutionConfiguration,
    /// Run summary.
    pub workflow_execution_info: WorkflowExecutionInfo,
    /// Pending activities.
    pub pending_activities: Vec<PendingActivityInfo>,
    /// Pending children.
    pub pending_children: Vec<PendingChildExecutionInfo>,
}

/// Send later decisions of a run back to its normal task list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResetStickyTaskListRequest {
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
}

/// A query to run against a workflow's state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowQuery {
    /// Query type.
    pub query_type: String,
    /// Arguments.
    pub query_args: Option<Payload>,
}

/// When to refuse a query instead of dispatching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryRejectCondition {
    /// Reject when the run is closed.
    NotOpen,
    /// Reject when the run closed other than by completing.
    NotCompletedCleanly,
}

/// Query a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryWorkflowRequest {
    /// Domain.
    pub domain_id: String,
    /// Run; an empty run id addresses the current run.
    pub execution: WorkflowExecution,
    /// Query.
    pub query: WorkflowQuery,
    /// Optional rejection rule.
    pub query_reject_condition: Option<QueryRejectCondition>,
}

/// Why a query was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRejected {
    /// Close status of the run.
    pub close_status: CloseStatus,
}

/// Query result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryWorkflowResponse {
    /// Answer, unless rejected.
    pub query_result: Option<Payload>,
    /// Rejection, if the reject condition matched.
    pub query_rejected: Option<QueryRejected>,
}

/// Deliver a signal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalWorkflowExecutionRequest {
    /// Domain.
    pub domain_id: String,
    /// Run; an empty run id addresses the current run.
    pub execution: WorkflowExecution,
    /// Signal name.
    pub signal_name: String,
    /// Signal input.
    pub input: Option<Payload>,
    /// Sender identity.
    pub identity: String,
    /// Dedup id; empty disables dedup.
    pub request_id: String,
    /// Sending run, when signalled by another workflow.
    pub external_execution: Option<WorkflowExecution>,
    /// Only deliver if the target is a child of `external_execution`.
    pub child_workflow_only: bool,
}

/// Signal a run, starting it first if no run is open.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalWithStartWorkflowExecutionRequest {
    /// Start parameters.
    pub start: StartWorkflowExecutionRequest,
    /// Signal name.
    pub signal_name: String,
    /// Signal input.
    pub signal_input: Option<Payload>,
}

/// Ask a run to cancel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequestCancelWorkflowExecutionRequest {
    /// Domain.
    pub domain_id: String,
    /// Run; an empty run id addresses the current run.
    pub execution: WorkflowExecution,
    /// Caller identity.
    pub identity: String,
    /// Dedup id.
    pub request_id: String,
    /// Cause.
    pub cause: String,
    /// Initiated event id in the requesting run.
    pub external_initiated_event_id: Option<i64>,
    /// Requesting run.
    pub external_execution: Option<WorkflowExecution>,
    /// Only cancel if the target is a child of `external_execution`.
    pub child_workflow_only: bool,
}

/// Terminate a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TerminateWorkflowExecutionRequest {
    /// Domain.
    pub domain_id: String,
    /// Run; an empty run id addresses the current run.
    pub execution: WorkflowExecution,
    /// Reason.
    pub reason: String,
    /// Details.
    pub details: Option<Payload>,
    /// Caller identity.
    pub identity: String,
}

/// Reset a run to a past decision.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResetWorkflowExecutionRequest {
    /// Domain.
    pub domain_id: String,
    /// Run to reset.
    pub execution: WorkflowExecution,
    /// Reason.
    pub reason: String,
    /// Id of a `DecisionTaskCompleted`, `DecisionTaskFailed` or
    /// `DecisionTaskTimedOut` event; the new run branches right before it.
    pub decision_finish_event_id: i64,
    /// Dedup id.
    pub request_id: String,
    /// Caller identity.
    pub identity: String,
}

/// Run created by a reset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResetWorkflowExecutionResponse {
    /// New run id.
    pub run_id: String,
}

/// Forget a signal dedup id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoveSignalMutableStateRequest {
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
    /// Dedup id to forget.
    pub request_id: String,
}

// ============================================================================
// Task execution
// ============================================================================

/// A worker polled a decision task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordDecisionTaskStartedRequest {
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
    /// Scheduled event id of the task.
    pub schedule_id: i64,
    /// Poll request id.
    pub request_id: String,
    /// Worker identity.
    pub identity: String,
}

/// Everything a worker needs to process a decision task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordDecisionTaskStartedResponse {
    /// Workflow type.
    pub workflow_type: String,
    /// Started event id of the last completed decision.
    pub previous_started_event_id: i64,
    /// Scheduled event id.
    pub scheduled_event_id: i64,
    /// Started event id.
    pub started_event_id: i64,
    /// Next event id after the start.
    pub next_event_id: i64,
    /// Attempt.
    pub attempt: i64,
    /// Whether the task came from a sticky task list.
    pub sticky_execution_enabled: bool,
    /// Normal task list of the run.
    pub workflow_execution_task_list: String,
    /// Branch to read history from.
    pub branch_token: String,
    /// When the task was scheduled.
    pub scheduled_timestamp: Option<DateTime<Utc>>,
    /// When the task was started.
    pub started_timestamp: Option<DateTime<Utc>>,
    /// Token the worker answers with.
    pub task_token: TaskToken,
}

/// A worker polled an activity task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordActivityTaskStartedRequest {
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
    /// Scheduled event id of the activity.
    pub schedule_id: i64,
    /// Poll request id.
    pub request_id: String,
    /// Worker identity.
    pub identity: String,
}

/// Everything a worker needs to run an activity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordActivityTaskStartedResponse {
    /// Scheduled event payload.
    pub scheduled: ActivityTaskScheduledAttributes,
    /// When the current attempt started.
    pub started_timestamp: Option<DateTime<Utc>>,
    /// Attempt.
    pub attempt: i32,
    /// When the current attempt was scheduled.
    pub scheduled_timestamp_of_this_attempt: Option<DateTime<Utc>>,
    /// Heartbeat details of the previous attempt.
    pub heartbeat_details: Option<Payload>,
    /// Workflow type.
    pub workflow_type: String,
    /// Workflow domain.
    pub workflow_domain: String,
    /// Token the worker answers with.
    pub task_token: TaskToken,
}

/// A decision made by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision_type")]
pub enum Decision {
    /// Schedule an activity. `decision_task_completed_event_id` is ignored.
    ScheduleActivityTask(ActivityTaskScheduledAttributes),
    /// Cancel a pending activity.
    RequestCancelActivityTask {
        /// Activity id.
        activity_id: String,
    },
    /// Start a timer.
    StartTimer {
        /// Timer id.
        timer_id: String,
        /// Delay.
        start_to_fire_timeout_seconds: i64,
    },
    /// Cancel a pending timer.
    CancelTimer {
        /// Timer id.
        timer_id: String,
    },
    /// Complete the run.
    CompleteWorkflowExecution {
        /// Result.
        result: Option<Payload>,
    },
    /// Fail the run.
    FailWorkflowExecution {
        /// Reason.
        reason: String,
        /// Details.
        details: Option<Payload>,
    },
    /// Cancel the run; only valid after cancellation was requested.
    CancelWorkflowExecution {
        /// Details.
        details: Option<Payload>,
    },
    /// Close the run and start a successor. Run ids are assigned by the
    /// engine.
    ContinueAsNewWorkflowExecution(WorkflowExecutionContinuedAsNewAttributes),
    /// Record a marker.
    RecordMarker {
        /// Marker name.
        marker_name: String,
        /// Details.
        details: Option<Payload>,
    },
    /// Start a child run.
    StartChildWorkflowExecution(StartChildWorkflowExecutionInitiatedAttributes),
    /// Signal another run.
    SignalExternalWorkflowExecution {
        /// Target domain.
        domain: String,
        /// Target run.
        execution: WorkflowExecution,
        /// Signal name.
        signal_name: String,
        /// Signal input.
        input: Option<Payload>,
        /// Opaque caller data.
        control: Option<Payload>,
        /// Only deliver to a child of this run.
        child_workflow_only: bool,
    },
    /// Merge search attributes.
    UpsertWorkflowSearchAttributes {
        /// Fields to merge.
        search_attributes: SearchAttributes,
    },
}

/// Sticky routing requested by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StickyExecutionAttributes {
    /// Worker-specific task list.
    pub worker_task_list: String,
    /// Schedule-to-start timeout on that task list.
    pub schedule_to_start_timeout_seconds: i32,
}

/// A worker finished a decision task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RespondDecisionTaskCompletedRequest {
    /// Token from the started response.
    pub task_token: TaskToken,
    /// Decisions, applied in order.
    pub decisions: Vec<Decision>,
    /// Worker identity.
    pub identity: String,
    /// Opaque worker context.
    pub execution_context: Option<Payload>,
    /// Worker binary checksum.
    pub binary_checksum: String,
    /// Sticky routing for later decisions.
    pub sticky_attributes: Option<StickyExecutionAttributes>,
    /// Start the next decision right away and return it.
    pub return_new_decision_task: bool,
    /// Schedule a decision even without new events.
    pub force_create_new_decision_task: bool,
}

/// Result of completing a decision task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RespondDecisionTaskCompletedResponse {
    /// The next decision, when requested and one was scheduled.
    pub started_response: Option<RecordDecisionTaskStartedResponse>,
}

/// A worker could not process a decision task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondDecisionTaskFailedRequest {
    /// Token from the started response.
    pub task_token: TaskToken,
    /// Cause.
    pub cause: DecisionTaskFailedCause,
    /// Details.
    pub details: Option<Payload>,
    /// Worker identity.
    pub identity: String,
}

/// An activity completed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RespondActivityTaskCompletedRequest {
    /// Token from the started response.
    pub task_token: TaskToken,
    /// Result.
    pub result: Option<Payload>,
    /// Worker identity.
    pub identity: String,
}

/// An activity attempt failed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RespondActivityTaskFailedRequest {
    /// Token from the started response.
    pub task_token: TaskToken,
    /// Reason, matched against non-retriable reasons.
    pub reason: String,
    /// Details.
    pub details: Option<Payload>,
    /// Worker identity.
    pub identity: String,
}

/// An activity acknowledged cancellation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RespondActivityTaskCanceledRequest {
    /// Token from the started response.
    pub task_token: TaskToken,
    /// Details.
    pub details: Option<Payload>,
    /// Worker identity.
    pub identity: String,
}

/// An activity reported progress.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatRequest {
    /// Token from the started response.
    pub task_token: TaskToken,
    /// Progress details.
    pub details: Option<Payload>,
    /// Worker identity.
    pub identity: String,
}

/// Heartbeat acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordActivityTaskHeartbeatResponse {
    /// Whether the workflow asked the activity to cancel.
    pub cancel_requested: bool,
}

/// Schedule a decision task if none is pending.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScheduleDecisionTaskRequest {
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
    /// Whether this is the first decision after a start backoff.
    pub is_first_decision: bool,
}

/// A child run was created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordChildExecutionStartedRequest {
    /// Parent domain.
    pub domain_id: String,
    /// Parent run.
    pub execution: WorkflowExecution,
    /// Initiated event id in the parent.
    pub initiated_id: i64,
    /// Child run.
    pub child_execution: WorkflowExecution,
}

/// A child run closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordChildExecutionCompletedRequest {
    /// Parent domain.
    pub domain_id: String,
    /// Parent run.
    pub execution: WorkflowExecution,
    /// Initiated event id in the parent.
    pub initiated_id: i64,
    /// Child run.
    pub completed_execution: WorkflowExecution,
    /// Child's closing event.
    pub completion_event: HistoryEvent,
}

/// Regenerate a run's outstanding tasks.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RefreshWorkflowTasksRequest {
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
}

// ============================================================================
// Replication
// ============================================================================

/// Replicated event batch without version history items.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplicateEventsRequest {
    /// Cluster that wrote the events.
    pub source_cluster: String,
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
    /// First event id of the batch.
    pub first_event_id: i64,
    /// Next event id after the batch.
    pub next_event_id: i64,
    /// Version of the batch.
    pub version: i64,
    /// Events.
    pub history: Vec<HistoryEvent>,
    /// First batch of a successor run.
    pub new_run_history: Vec<HistoryEvent>,
}

/// Replicated event batch with the source branch's version history.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplicateEventsV2Request {
    /// Cluster that wrote the events.
    pub source_cluster: String,
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
    /// Version history of the source branch up to the last event.
    pub version_history_items: Vec<VersionHistoryItem>,
    /// Events.
    pub events: Vec<HistoryEvent>,
    /// First batch of a successor run.
    pub new_run_events: Vec<HistoryEvent>,
    /// Run id of the successor, when `new_run_events` is set.
    #[serde(default)]
    pub new_run_id: Option<String>,
}

/// Replicated event batch with serialized events.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReplicateRawEventsRequest {
    /// Cluster that wrote the events.
    pub source_cluster: String,
    /// Domain.
    pub domain_id: String,
    /// Run.
    pub execution: WorkflowExecution,
    /// Encoded `Vec<HistoryEvent>`.
    pub history: DataBlob,
    /// Encoded first batch of a successor run.
    pub new_run_history: Option<DataBlob>,
}

/// Replicated activity progress.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncActivityRequest {
    /// Domain.
    pub domain_id: String,
    /// Workflow id.
    pub workflow_id: String,
    /// Run id.
    pub run_id: String,
    /// Version of the activity's last change.
    pub version: i64,
    /// Scheduled event id.
    pub scheduled_id: i64,
    /// When the current attempt was scheduled.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Started event id.
    pub started_id: i64,
    /// When the current attempt started.
    pub started_time: Option<DateTime<Utc>>,
    /// Last heartbeat time.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Heartbeat details.
    pub details: Option<Payload>,
    /// Attempt.
    pub attempt: i32,
    /// Previous attempt's failure reason.
    pub last_failure_reason: Option<String>,
    /// Previous attempt's worker.
    pub last_worker_identity: String,
}

/// Clock report from a remote shard.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncShardStatusRequest {
    /// Reporting cluster.
    pub source_cluster: String,
    /// Shard.
    pub shard_id: i32,
    /// Remote clock.
    pub timestamp: DateTime<Utc>,
}

/// Poll for replication tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetReplicationMessagesRequest {
    /// Polling cluster.
    pub polling_cluster: String,
    /// Highest task id already received.
    pub last_retrieved_message_id: i64,
    /// Highest task id the poller has applied.
    pub last_processed_message_id: i64,
}

/// Hydrate DLQ pointers into full tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetDlqReplicationMessagesRequest {
    /// Pointers to hydrate.
    pub task_infos: Vec<crate::replication::ReplicationTaskInfo>,
}

/// Read parked replication tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadDlqMessagesRequest {
    /// Cluster the tasks came from.
    pub source_cluster: String,
    /// Highest task id to read.
    pub inclusive_end_message_id: i64,
    /// Page size.
    pub maximum_page_size: usize,
    /// Last task id of the previous page.
    pub next_page_token: Option<i64>,
}

/// One page of parked tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadDlqMessagesResponse {
    /// Parked pointers.
    pub replication_tasks_info: Vec<crate::replication::ReplicationTaskInfo>,
    /// Pass back to read the next page.
    pub next_page_token: Option<i64>,
}

/// Drop parked tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PurgeDlqMessagesRequest {
    /// Cluster the tasks came from.
    pub source_cluster: String,
    /// Highest task id to drop.
    pub inclusive_end_message_id: i64,
}

/// Re-apply parked tasks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeDlqMessagesRequest {
    /// Cluster the tasks came from.
    pub source_cluster: String,
    /// Highest task id to merge.
    pub inclusive_end_message_id: i64,
    /// Page size.
    pub maximum_page_size: usize,
    /// Last task id of the previous page.
    pub next_page_token: Option<i64>,
}

/// Progress of a merge.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeDlqMessagesResponse {
    /// Pass back to merge the next page.
    pub next_page_token: Option<i64>,
}

/// Re-inject events from another branch or cluster into the current run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReapplyEventsRequest {
    /// Domain.
    pub domain_id: String,
    /// Workflow id; the events go to its current run.
    pub workflow_id: String,
    /// Run the events were originally written to.
    pub source_run_id: String,
    /// Events; only signals are reapplied.
    pub events: Vec<HistoryEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_json_is_tagged() {
        let decision = Decision::StartTimer {
            timer_id: "t1".into(),
            start_to_fire_timeout_seconds: 30,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["decision_type"], "StartTimer");
        assert_eq!(json["timer_id"], "t1");
    }

    #[test]
    fn test_unix_nanos() {
        let time = from_unix_nanos(1_700_000_000_123_456_789);
        assert_eq!(to_unix_nanos(time), 1_700_000_000_123_456_789);
        assert_eq!(to_unix_nanos(from_unix_nanos(0)), 0);
    }
}
