// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock engine for testing.
//!
//! Records every call by operation name and answers with default responses,
//! or with queued/permanent failures. Lets replication and dispatch code be
//! tested without a store.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::Engine;
use crate::api::*;
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::notifier::HistoryEventNotification;
use crate::replication::{ReplicationMessages, ReplicationTask};
use crate::tasks::Task;

/// Mock engine for testing.
#[derive(Debug, Default)]
pub struct MockEngine {
    calls: Mutex<Vec<&'static str>>,
    failures: Mutex<VecDeque<HistoryError>>,
    started: AtomicBool,
    /// If set, every call fails with this error once queued failures run out.
    pub fail_with: Option<HistoryError>,
}

impl MockEngine {
    /// Create a mock engine that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock engine that fails every call with `err`.
    pub fn failing(err: HistoryError) -> Self {
        Self {
            fail_with: Some(err),
            ..Self::default()
        }
    }

    /// Fail the next call with `err`. Queued failures are used in order.
    pub fn push_failure(&self, err: HistoryError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(err);
        }
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls to `operation`.
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .map(|c| c.iter().filter(|name| **name == operation).count())
            .unwrap_or(0)
    }

    /// Whether `start` was called more recently than `stop`.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn record(&self, operation: &'static str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(operation);
        }
    }

    fn respond<T: Default>(&self, operation: &'static str) -> Result<T> {
        self.record(operation);
        let queued = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        match queued.or_else(|| self.fail_with.clone()) {
            Some(err) => Err(err),
            None => Ok(T::default()),
        }
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        self.respond("start")
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        self.respond("stop")
    }

    async fn start_workflow_execution(
        &self,
        _ctx: &CallContext,
        _request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse> {
        self.respond("start_workflow_execution")
    }

    async fn get_mutable_state(
        &self,
        _ctx: &CallContext,
        _request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse> {
        self.respond("get_mutable_state")
    }

    async fn poll_mutable_state(
        &self,
        _ctx: &CallContext,
        _request: PollMutableStateRequest,
    ) -> Result<PollMutableStateResponse> {
        self.respond("poll_mutable_state")
    }

    async fn describe_mutable_state(
        &self,
        _ctx: &CallContext,
        _request: DescribeMutableStateRequest,
    ) -> Result<DescribeMutableStateResponse> {
        self.respond("describe_mutable_state")
    }

    async fn describe_workflow_execution(
        &self,
        _ctx: &CallContext,
        _request: DescribeWorkflowExecutionRequest,
    ) -> Result<DescribeWorkflowExecutionResponse> {
        self.respond("describe_workflow_execution")
    }

    async fn reset_sticky_task_list(
        &self,
        _ctx: &CallContext,
        _request: ResetStickyTaskListRequest,
    ) -> Result<()> {
        self.respond("reset_sticky_task_list")
    }

    async fn query_workflow(
        &self,
        _ctx: &CallContext,
        _request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse> {
        self.respond("query_workflow")
    }

    async fn signal_workflow_execution(
        &self,
        _ctx: &CallContext,
        _request: SignalWorkflowExecutionRequest,
    ) -> Result<()> {
        self.respond("signal_workflow_execution")
    }

    async fn signal_with_start_workflow_execution(
        &self,
        _ctx: &CallContext,
        _request: SignalWithStartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse> {
        self.respond("signal_with_start_workflow_execution")
    }

    async fn request_cancel_workflow_execution(
        &self,
        _ctx: &CallContext,
        _request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<()> {
        self.respond("request_cancel_workflow_execution")
    }

    async fn terminate_workflow_execution(
        &self,
        _ctx: &CallContext,
        _request: TerminateWorkflowExecutionRequest,
    ) -> Result<()> {
        self.respond("terminate_workflow_execution")
    }

    async fn reset_workflow_execution(
        &self,
        _ctx: &CallContext,
        _request: ResetWorkflowExecutionRequest,
    ) -> Result<ResetWorkflowExecutionResponse> {
        self.respond("reset_workflow_execution")
    }

    async fn remove_signal_mutable_state(
        &self,
        _ctx: &CallContext,
        _request: RemoveSignalMutableStateRequest,
    ) -> Result<()> {
        self.respond("remove_signal_mutable_state")
    }

    async fn record_decision_task_started(
        &self,
        _ctx: &CallContext,
        _request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        self.respond("record_decision_task_started")
    }

    async fn record_activity_task_started(
        &self,
        _ctx: &CallContext,
        _request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse> {
        self.respond("record_activity_task_started")
    }

    async fn respond_decision_task_completed(
        &self,
        _ctx: &CallContext,
        _request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse> {
        self.respond("respond_decision_task_completed")
    }

    async fn respond_decision_task_failed(
        &self,
        _ctx: &CallContext,
        _request: RespondDecisionTaskFailedRequest,
    ) -> Result<()> {
        self.respond("respond_decision_task_failed")
    }

    async fn respond_activity_task_completed(
        &self,
        _ctx: &CallContext,
        _request: RespondActivityTaskCompletedRequest,
    ) -> Result<()> {
        self.respond("respond_activity_task_completed")
    }

    async fn respond_activity_task_failed(
        &self,
        _ctx: &CallContext,
        _request: RespondActivityTaskFailedRequest,
    ) -> Result<()> {
        self.respond("respond_activity_task_failed")
    }

    async fn respond_activity_task_canceled(
        &self,
        _ctx: &CallContext,
        _request: RespondActivityTaskCanceledRequest,
    ) -> Result<()> {
        self.respond("respond_activity_task_canceled")
    }

    async fn record_activity_task_heartbeat(
        &self,
        _ctx: &CallContext,
        _request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse> {
        self.respond("record_activity_task_heartbeat")
    }

    async fn schedule_decision_task(
        &self,
        _ctx: &CallContext,
        _request: ScheduleDecisionTaskRequest,
    ) -> Result<()> {
        self.respond("schedule_decision_task")
    }

    async fn record_child_execution_started(
        &self,
        _ctx: &CallContext,
        _request: RecordChildExecutionStartedRequest,
    ) -> Result<()> {
        self.respond("record_child_execution_started")
    }

    async fn record_child_execution_completed(
        &self,
        _ctx: &CallContext,
        _request: RecordChildExecutionCompletedRequest,
    ) -> Result<()> {
        self.respond("record_child_execution_completed")
    }

    async fn refresh_workflow_tasks(
        &self,
        _ctx: &CallContext,
        _request: RefreshWorkflowTasksRequest,
    ) -> Result<()> {
        self.respond("refresh_workflow_tasks")
    }

    async fn replicate_events(&self, _ctx: &CallContext, _request: ReplicateEventsRequest) -> Result<()> {
        self.respond("replicate_events")
    }

    async fn replicate_events_v2(
        &self,
        _ctx: &CallContext,
        _request: ReplicateEventsV2Request,
    ) -> Result<()> {
        self.respond("replicate_events_v2")
    }

    async fn replicate_raw_events(
        &self,
        _ctx: &CallContext,
        _request: ReplicateRawEventsRequest,
    ) -> Result<()> {
        self.respond("replicate_raw_events")
    }

    async fn sync_activity(&self, _ctx: &CallContext, _request: SyncActivityRequest) -> Result<()> {
        self.respond("sync_activity")
    }

    async fn sync_shard_status(&self, _ctx: &CallContext, _request: SyncShardStatusRequest) -> Result<()> {
        self.respond("sync_shard_status")
    }

    async fn get_replication_messages(
        &self,
        _ctx: &CallContext,
        _request: GetReplicationMessagesRequest,
    ) -> Result<ReplicationMessages> {
        self.respond("get_replication_messages")
    }

    async fn get_dlq_replication_messages(
        &self,
        _ctx: &CallContext,
        _request: GetDlqReplicationMessagesRequest,
    ) -> Result<Vec<ReplicationTask>> {
        self.respond("get_dlq_replication_messages")
    }

    async fn read_dlq_messages(
        &self,
        _ctx: &CallContext,
        _request: ReadDlqMessagesRequest,
    ) -> Result<ReadDlqMessagesResponse> {
        self.respond("read_dlq_messages")
    }

    async fn purge_dlq_messages(&self, _ctx: &CallContext, _request: PurgeDlqMessagesRequest) -> Result<()> {
        self.respond("purge_dlq_messages")
    }

    async fn merge_dlq_messages(
        &self,
        _ctx: &CallContext,
        _request: MergeDlqMessagesRequest,
    ) -> Result<MergeDlqMessagesResponse> {
        self.respond("merge_dlq_messages")
    }

    async fn reapply_events(&self, _ctx: &CallContext, _request: ReapplyEventsRequest) -> Result<()> {
        self.respond("reapply_events")
    }

    fn notify_new_history_event(&self, _notification: HistoryEventNotification) {
        self.record("notify_new_history_event");
    }

    fn notify_new_transfer_tasks(&self, _tasks: &[Task]) {
        self.record("notify_new_transfer_tasks");
    }

    fn notify_new_timer_tasks(&self, _tasks: &[Task]) {
        self.record("notify_new_timer_tasks");
    }

    fn notify_new_replication_tasks(&self, _tasks: &[Task]) {
        self.record("notify_new_replication_tasks");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_defaults() {
        let engine = MockEngine::new();
        let ctx = CallContext::background();
        engine.start().await.unwrap();
        assert!(engine.is_started());

        let response = engine
            .record_activity_task_heartbeat(&ctx, RecordActivityTaskHeartbeatRequest::default())
            .await
            .unwrap();
        assert!(!response.cancel_requested);
        engine.notify_new_timer_tasks(&[]);

        assert_eq!(
            engine.calls(),
            vec!["start", "record_activity_task_heartbeat", "notify_new_timer_tasks"]
        );
    }

    #[tokio::test]
    async fn test_queued_failures_before_permanent_one() {
        let engine = MockEngine::failing(HistoryError::EngineStopped { shard_id: 3 });
        engine.push_failure(HistoryError::conflict("busy"));
        let ctx = CallContext::background();

        let first = engine
            .sync_activity(&ctx, SyncActivityRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(first, HistoryError::Conflict { .. }));
        let second = engine
            .sync_activity(&ctx, SyncActivityRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(second, HistoryError::EngineStopped { shard_id: 3 }));
        assert_eq!(engine.call_count("sync_activity"), 2);
    }
}
