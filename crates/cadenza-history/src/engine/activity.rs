// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity task protocol, child runs and task refresh.

use tracing::{debug, info, instrument, warn};

use super::{HistoryEngine, UpdateOutcome, WriteVersion};
use crate::api::*;
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::state::task_generator;
use crate::state::{ActivityInfo, MutableState};
use crate::types::{EMPTY_EVENT_ID, WorkflowKey};

impl HistoryEngine {
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        schedule_id = request.schedule_id,
    ))]
    pub(crate) async fn record_activity_task_started_inner(
        &self,
        ctx: &CallContext,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow(ctx, "record_activity_task_started", &key, |ms| {
            if !ms.is_running() {
                return Err(HistoryError::WorkflowCompleted);
            }
            let ai = ms.pending_activities.get(&request.schedule_id).ok_or_else(|| {
                HistoryError::entity_not_found(
                    "activity task",
                    format!("schedule id {}", request.schedule_id),
                )
            })?;
            if ai.is_started() {
                if ai.request_id == request.request_id {
                    debug!("Activity start replayed");
                    return Ok(UpdateOutcome::Unchanged(activity_started_response(ms, ai)));
                }
                return Err(HistoryError::TaskAlreadyStarted {
                    scheduled_event_id: request.schedule_id,
                });
            }
            ms.add_activity_task_started(request.schedule_id, &request.request_id, &request.identity)?;
            let ai = ms.activity_mut(request.schedule_id)?.clone();
            Ok(UpdateOutcome::Persist(activity_started_response(ms, &ai)))
        })
        .await
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.task_token.workflow_id,
        run_id = %request.task_token.run_id,
        schedule_id = request.task_token.schedule_id,
    ))]
    pub(crate) async fn respond_activity_task_completed_inner(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<()> {
        let token = &request.task_token;
        let key = self.token_key(token).await?;
        self.update_workflow(ctx, "respond_activity_task_completed", &key, |ms| {
            let schedule_id = started_activity(ms, token)?;
            ms.add_activity_task_completed(schedule_id, request.result.clone(), &request.identity)?;
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    /// Fail an attempt. The activity is retried without a history event
    /// when its retry policy allows another attempt.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.task_token.workflow_id,
        run_id = %request.task_token.run_id,
        schedule_id = request.task_token.schedule_id,
        reason = %request.reason,
    ))]
    pub(crate) async fn respond_activity_task_failed_inner(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<()> {
        let token = &request.task_token;
        let key = self.token_key(token).await?;
        self.update_workflow(ctx, "respond_activity_task_failed", &key, |ms| {
            let schedule_id = started_activity(ms, token)?;
            if ms.retry_activity(schedule_id, &request.reason)? {
                debug!("Activity attempt failed, retry scheduled");
                return Ok(UpdateOutcome::Persist(()));
            }
            ms.add_activity_task_failed(
                schedule_id,
                &request.reason,
                request.details.clone(),
                &request.identity,
            )?;
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.task_token.workflow_id,
        run_id = %request.task_token.run_id,
        schedule_id = request.task_token.schedule_id,
    ))]
    pub(crate) async fn respond_activity_task_canceled_inner(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<()> {
        let token = &request.task_token;
        let key = self.token_key(token).await?;
        self.update_workflow(ctx, "respond_activity_task_canceled", &key, |ms| {
            let schedule_id = started_activity(ms, token)?;
            ms.add_activity_task_canceled(schedule_id, request.details.clone(), &request.identity)?;
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    /// Record progress and restart the heartbeat clock. Tells the worker
    /// whether the workflow asked the activity to cancel.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.task_token.workflow_id,
        run_id = %request.task_token.run_id,
        schedule_id = request.task_token.schedule_id,
    ))]
    pub(crate) async fn record_activity_task_heartbeat_inner(
        &self,
        ctx: &CallContext,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse> {
        let token = &request.task_token;
        let key = self.token_key(token).await?;
        self.update_workflow(ctx, "record_activity_task_heartbeat", &key, |ms| {
            let schedule_id = started_activity(ms, token)?;
            ms.update_activity_progress(schedule_id, request.details.clone())?;
            let cancel_requested = ms
                .pending_activities
                .get(&schedule_id)
                .is_some_and(|ai| ai.cancel_requested);
            Ok(UpdateOutcome::Persist(RecordActivityTaskHeartbeatResponse { cancel_requested }))
        })
        .await
    }

    // ========================================================================
    // Children
    // ========================================================================

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        initiated_id = request.initiated_id,
        child_workflow_id = %request.child_execution.workflow_id,
    ))]
    pub(crate) async fn record_child_execution_started_inner(
        &self,
        ctx: &CallContext,
        request: RecordChildExecutionStartedRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow(ctx, "record_child_execution_started", &key, |ms| {
            if !ms.is_running() {
                return Err(HistoryError::WorkflowCompleted);
            }
            let ci = ms.pending_children.get(&request.initiated_id).ok_or_else(|| {
                HistoryError::entity_not_found(
                    "child execution",
                    format!("initiated id {}", request.initiated_id),
                )
            })?;
            if ci.workflow_id != request.child_execution.workflow_id {
                return Err(HistoryError::bad_request(
                    "child_execution",
                    format!("initiated id {} belongs to {}", request.initiated_id, ci.workflow_id),
                ));
            }
            if ci.started_id != EMPTY_EVENT_ID {
                debug!("Child start already recorded");
                return Ok(UpdateOutcome::Unchanged(()));
            }
            ms.add_child_workflow_execution_started(
                request.initiated_id,
                &request.child_execution.run_id,
            )?;
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    /// Record a child's close in its parent. A closed parent ignores it.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        initiated_id = request.initiated_id,
        child_workflow_id = %request.completed_execution.workflow_id,
    ))]
    pub(crate) async fn record_child_execution_completed_inner(
        &self,
        ctx: &CallContext,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow(ctx, "record_child_execution_completed", &key, |ms| {
            if !ms.is_running() {
                debug!("Parent already closed, child completion dropped");
                return Ok(UpdateOutcome::Unchanged(()));
            }
            let Some(ci) = ms.pending_children.get(&request.initiated_id) else {
                warn!("Child completion for an unknown or already closed child");
                return Err(HistoryError::entity_not_found(
                    "child execution",
                    format!("initiated id {}", request.initiated_id),
                ));
            };
            let completed = &request.completed_execution;
            if ci.workflow_id != completed.workflow_id
                || (!ci.run_id.is_empty() && ci.run_id != completed.run_id)
            {
                return Err(HistoryError::entity_not_found(
                    "child execution",
                    format!("{}/{}", completed.workflow_id, completed.run_id),
                ));
            }
            ms.add_child_workflow_execution_closed(
                request.initiated_id,
                &request.completion_event.attributes,
            )?;
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    /// Replace a run's outstanding tasks with ones derived from its state.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn refresh_workflow_tasks_inner(
        &self,
        ctx: &CallContext,
        request: RefreshWorkflowTasksRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        let refreshed = self
            .update_workflow_with(
                ctx,
                "refresh_workflow_tasks",
                &key,
                WriteVersion::Existing,
                |ms| {
                    let tasks = task_generator::refresh_tasks(ms);
                    let count = tasks.len();
                    ms.pending.tasks = tasks;
                    Ok(UpdateOutcome::Persist(count))
                },
            )
            .await?;
        info!(tasks = refreshed, "Workflow tasks refreshed");
        Ok(())
    }

    async fn token_key(&self, token: &TaskToken) -> Result<WorkflowKey> {
        if token.run_id.is_empty() {
            return Err(HistoryError::bad_request("task_token.run_id", "is required"));
        }
        self.resolve_key(&token.domain_id, &token.execution()).await
    }
}

/// Scheduled id of the started attempt `token` was issued for.
fn started_activity(ms: &MutableState, token: &TaskToken) -> Result<i64> {
    if !ms.is_running() {
        return Err(HistoryError::WorkflowCompleted);
    }
    let ai = if token.schedule_id != EMPTY_EVENT_ID {
        ms.pending_activities.get(&token.schedule_id)
    } else {
        token.activity_id.as_deref().and_then(|id| ms.activity_by_id(id))
    };
    let not_found = || {
        HistoryError::entity_not_found("activity task", format!("schedule id {}", token.schedule_id))
    };
    let ai = ai.ok_or_else(not_found)?;
    if !ai.is_started() || i64::from(ai.attempt) != token.schedule_attempt {
        warn!(
            attempt = ai.attempt,
            token_attempt = token.schedule_attempt,
            started = ai.is_started(),
            "Stale activity task token"
        );
        return Err(not_found());
    }
    Ok(ai.schedule_id)
}

fn activity_started_response(ms: &MutableState, ai: &ActivityInfo) -> RecordActivityTaskStartedResponse {
    let info = &ms.execution_info;
    RecordActivityTaskStartedResponse {
        scheduled: ai.scheduled.clone(),
        started_timestamp: ai.started_time,
        attempt: ai.attempt,
        scheduled_timestamp_of_this_attempt: Some(ai.scheduled_time),
        heartbeat_details: ai.details.clone(),
        workflow_type: info.workflow_type.clone(),
        workflow_domain: info.domain_id.clone(),
        task_token: TaskToken {
            domain_id: info.domain_id.clone(),
            workflow_id: info.workflow_id.clone(),
            run_id: info.run_id.clone(),
            schedule_id: ai.schedule_id,
            schedule_attempt: i64::from(ai.attempt),
            activity_id: Some(ai.activity_id().to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::super::Engine;
    use super::super::test_support::*;
    use super::*;
    use crate::events::{ActivityTaskScheduledAttributes, EventAttributes, HistoryEvent};
    use crate::events::StartChildWorkflowExecutionInitiatedAttributes;
    use crate::types::{Payload, RetryPolicy, WorkflowExecution};

    /// Run with its first decision completed, having issued `decisions`.
    async fn decided(engine: &HistoryEngine, wf: &str, decisions: Vec<Decision>) -> WorkflowKey {
        let ctx = CallContext::background();
        let key = started(engine, wf).await;
        let started = engine
            .record_decision_task_started(
                &ctx,
                RecordDecisionTaskStartedRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    schedule_id: 2,
                    request_id: "poll".into(),
                    identity: "worker".into(),
                },
            )
            .await
            .unwrap();
        engine
            .respond_decision_task_completed(
                &ctx,
                RespondDecisionTaskCompletedRequest {
                    task_token: started.task_token,
                    decisions,
                    identity: "worker".into(),
                    ..RespondDecisionTaskCompletedRequest::default()
                },
            )
            .await
            .unwrap();
        key
    }

    fn schedule(activity_id: &str, retry_policy: Option<RetryPolicy>) -> Decision {
        Decision::ScheduleActivityTask(ActivityTaskScheduledAttributes {
            activity_id: activity_id.into(),
            activity_type: "charge".into(),
            schedule_to_close_timeout_seconds: 600,
            heartbeat_timeout_seconds: 30,
            retry_policy,
            ..ActivityTaskScheduledAttributes::default()
        })
    }

    async fn start_activity(
        engine: &HistoryEngine,
        key: &WorkflowKey,
        schedule_id: i64,
        request_id: &str,
    ) -> Result<RecordActivityTaskStartedResponse> {
        engine
            .record_activity_task_started(
                &CallContext::background(),
                RecordActivityTaskStartedRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    schedule_id,
                    request_id: request_id.into(),
                    identity: "activity-worker".into(),
                },
            )
            .await
    }

    async fn next_event_id(engine: &HistoryEngine, key: &WorkflowKey) -> i64 {
        engine
            .get_mutable_state(
                &CallContext::background(),
                GetMutableStateRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    expected_next_event_id: 0,
                    current_branch_token: None,
                },
            )
            .await
            .unwrap()
            .next_event_id
    }

    #[tokio::test]
    async fn test_activity_start_dedup() {
        let engine = engine().await;
        // decision: 1-4, activity scheduled at 5
        let key = decided(&engine, "wf", vec![schedule("a1", None)]).await;

        let first = start_activity(&engine, &key, 5, "poll-1").await.unwrap();
        let replay = start_activity(&engine, &key, 5, "poll-1").await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(first.task_token.activity_id.as_deref(), Some("a1"));

        let err = start_activity(&engine, &key, 5, "poll-2").await.unwrap_err();
        assert_eq!(err, HistoryError::TaskAlreadyStarted { scheduled_event_id: 5 });

        let missing = start_activity(&engine, &key, 99, "poll-3").await.unwrap_err();
        assert!(matches!(missing, HistoryError::EntityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_activity_completion_schedules_decision() {
        let engine = engine().await;
        let key = decided(&engine, "wf", vec![schedule("a1", None)]).await;
        let started = start_activity(&engine, &key, 5, "poll-1").await.unwrap();

        engine
            .respond_activity_task_completed(
                &CallContext::background(),
                RespondActivityTaskCompletedRequest {
                    task_token: started.task_token,
                    result: Some(Payload::from_text("ok")),
                    identity: "activity-worker".into(),
                },
            )
            .await
            .unwrap();
        // started (6), completed (7), decision scheduled (8)
        assert_eq!(next_event_id(&engine, &key).await, 9);
    }

    #[tokio::test]
    async fn test_retryable_failure_writes_no_event() {
        let engine = engine().await;
        let policy = RetryPolicy {
            initial_interval_seconds: 1,
            backoff_coefficient: 2.0,
            maximum_interval_seconds: 10,
            maximum_attempts: 3,
            ..RetryPolicy::default()
        };
        let key = decided(&engine, "wf", vec![schedule("a1", Some(policy))]).await;
        let started = start_activity(&engine, &key, 5, "poll-1").await.unwrap();
        let before = next_event_id(&engine, &key).await;

        engine
            .respond_activity_task_failed(
                &CallContext::background(),
                RespondActivityTaskFailedRequest {
                    task_token: started.task_token.clone(),
                    reason: "card declined".into(),
                    details: None,
                    identity: "activity-worker".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(next_event_id(&engine, &key).await, before);

        // The old attempt's token is stale now.
        let err = engine
            .record_activity_task_heartbeat(
                &CallContext::background(),
                RecordActivityTaskHeartbeatRequest {
                    task_token: started.task_token,
                    details: None,
                    identity: "activity-worker".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::EntityNotFound { .. }));

        let retried = start_activity(&engine, &key, 5, "poll-2").await.unwrap();
        assert_eq!(retried.attempt, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_cancel_request() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let key = decided(&engine, "wf", vec![schedule("a1", None)]).await;
        let activity = start_activity(&engine, &key, 5, "poll-1").await.unwrap();

        let heartbeat = |token: TaskToken| RecordActivityTaskHeartbeatRequest {
            task_token: token,
            details: Some(Payload::from_text("50%")),
            identity: "activity-worker".into(),
        };
        let response = engine
            .record_activity_task_heartbeat(&ctx, heartbeat(activity.task_token.clone()))
            .await
            .unwrap();
        assert!(!response.cancel_requested);

        // A signal wakes the workflow; decision 8 asks the activity to cancel.
        engine
            .signal_workflow_execution(
                &ctx,
                SignalWorkflowExecutionRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    signal_name: "cancel-charge".into(),
                    ..SignalWorkflowExecutionRequest::default()
                },
            )
            .await
            .unwrap();
        // activity started (6), signal (7), decision scheduled (8)
        let started = engine
            .record_decision_task_started(
                &ctx,
                RecordDecisionTaskStartedRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    schedule_id: 8,
                    request_id: "poll-8".into(),
                    identity: "worker".into(),
                },
            )
            .await
            .unwrap();
        engine
            .respond_decision_task_completed(
                &ctx,
                RespondDecisionTaskCompletedRequest {
                    task_token: started.task_token,
                    decisions: vec![Decision::RequestCancelActivityTask {
                        activity_id: "a1".into(),
                    }],
                    identity: "worker".into(),
                    ..RespondDecisionTaskCompletedRequest::default()
                },
            )
            .await
            .unwrap();

        let response = engine
            .record_activity_task_heartbeat(&ctx, heartbeat(activity.task_token.clone()))
            .await
            .unwrap();
        assert!(response.cancel_requested);

        engine
            .respond_activity_task_canceled(
                &ctx,
                RespondActivityTaskCanceledRequest {
                    task_token: activity.task_token,
                    details: None,
                    identity: "activity-worker".into(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_activity() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let err = engine
            .record_activity_task_heartbeat(
                &CallContext::background(),
                RecordActivityTaskHeartbeatRequest {
                    task_token: TaskToken {
                        domain_id: key.domain_id.clone(),
                        workflow_id: key.workflow_id.clone(),
                        run_id: key.run_id.clone(),
                        schedule_id: 42,
                        ..TaskToken::default()
                    },
                    details: None,
                    identity: "activity-worker".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::EntityNotFound { .. }));
        assert_eq!(next_event_id(&engine, &key).await, 3);
    }

    #[tokio::test]
    async fn test_child_lifecycle_and_closed_parent() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let key = decided(
            &engine,
            "parent",
            vec![Decision::StartChildWorkflowExecution(
                StartChildWorkflowExecutionInitiatedAttributes {
                    workflow_id: "child".into(),
                    workflow_type: "fulfil".into(),
                    ..StartChildWorkflowExecutionInitiatedAttributes::default()
                },
            )],
        )
        .await;

        engine
            .record_child_execution_started(
                &ctx,
                RecordChildExecutionStartedRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    initiated_id: 5,
                    child_execution: WorkflowExecution::new("child", "child-run"),
                },
            )
            .await
            .unwrap();

        let completion = |attributes| RecordChildExecutionCompletedRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            initiated_id: 5,
            completed_execution: WorkflowExecution::new("child", "child-run"),
            completion_event: HistoryEvent {
                event_id: 5,
                version: 1,
                task_id: 0,
                timestamp: chrono::Utc::now(),
                attributes,
            },
        };
        engine
            .record_child_execution_completed(
                &ctx,
                completion(EventAttributes::WorkflowExecutionCompleted {
                    result: None,
                    decision_task_completed_event_id: 4,
                }),
            )
            .await
            .unwrap();
        let described = engine
            .describe_workflow_execution(
                &ctx,
                DescribeWorkflowExecutionRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                },
            )
            .await
            .unwrap();
        assert!(described.pending_children.is_empty());

        engine
            .terminate_workflow_execution(
                &ctx,
                TerminateWorkflowExecutionRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    reason: "done".into(),
                    ..TerminateWorkflowExecutionRequest::default()
                },
            )
            .await
            .unwrap();
        let before = next_event_id(&engine, &key).await;
        engine
            .record_child_execution_completed(
                &ctx,
                completion(EventAttributes::WorkflowExecutionCompleted {
                    result: None,
                    decision_task_completed_event_id: 4,
                }),
            )
            .await
            .unwrap();
        assert_eq!(next_event_id(&engine, &key).await, before);
    }

    #[tokio::test]
    async fn test_refresh_keeps_history() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        engine
            .refresh_workflow_tasks(
                &CallContext::background(),
                RefreshWorkflowTasksRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                },
            )
            .await
            .unwrap();
        assert_eq!(next_event_id(&engine, &key).await, 3);
    }
}
