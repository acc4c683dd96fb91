// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decision task protocol.
//!
//! A decision completes by applying the worker's decisions in order. If any
//! decision carries bad attributes the whole batch is discarded, the
//! decision is recorded as failed with the matching cause and a retry
//! decision is scheduled.

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{HistoryEngine, UpdateOutcome};
use crate::api::*;
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::events::{
    ActivityTaskScheduledAttributes, StartChildWorkflowExecutionInitiatedAttributes,
    WorkflowExecutionContinuedAsNewAttributes,
};
use crate::state::{DecisionInfo, MutableState};
use crate::types::{DecisionTaskFailedCause, EMPTY_EVENT_ID, Payload, TaskList};

/// Longest user timer a decision may start (100 years).
const MAX_TIMER_SECONDS: i64 = 100 * 365 * 24 * 60 * 60;

/// Result of applying a batch of decisions.
enum Completion {
    Completed(Option<RecordDecisionTaskStartedResponse>),
    Failed(HistoryError),
}

/// A decision rejected for its attributes.
struct BadDecision {
    cause: DecisionTaskFailedCause,
    message: String,
}

impl BadDecision {
    fn new(cause: DecisionTaskFailedCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

impl HistoryEngine {
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        schedule_id = request.schedule_id,
    ))]
    pub(crate) async fn record_decision_task_started_inner(
        &self,
        ctx: &CallContext,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow(ctx, "record_decision_task_started", &key, |ms| {
            if !ms.is_running() {
                return Err(HistoryError::WorkflowCompleted);
            }
            let decision = &ms.execution_info.decision;
            if decision.schedule_id != request.schedule_id {
                return Err(HistoryError::entity_not_found(
                    "decision task",
                    format!("schedule id {}", request.schedule_id),
                ));
            }
            if decision.started_id != EMPTY_EVENT_ID {
                if decision.request_id == request.request_id {
                    debug!("Decision start replayed");
                    return Ok(UpdateOutcome::Unchanged(started_response(ms)));
                }
                return Err(HistoryError::TaskAlreadyStarted {
                    scheduled_event_id: request.schedule_id,
                });
            }
            ms.add_decision_task_started(request.schedule_id, &request.request_id, &request.identity)?;
            Ok(UpdateOutcome::Persist(started_response(ms)))
        })
        .await
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.task_token.workflow_id,
        run_id = %request.task_token.run_id,
        schedule_id = request.task_token.schedule_id,
        decisions = request.decisions.len(),
    ))]
    pub(crate) async fn respond_decision_task_completed_inner(
        &self,
        ctx: &CallContext,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse> {
        let token = &request.task_token;
        let key = self.resolve_key(&token.domain_id, &token.execution()).await?;

        let completion = self
            .update_workflow(ctx, "respond_decision_task_completed", &key, |ms| {
                if !ms.is_running() {
                    return Err(HistoryError::WorkflowCompleted);
                }
                inflight_decision(ms, token)?;
                let before = ms.clone();
                let had_buffered = ms.has_buffered_events();

                let completed = ms.add_decision_task_completed(
                    &request.identity,
                    request.execution_context.clone(),
                    &request.binary_checksum,
                )?;
                match &request.sticky_attributes {
                    Some(sticky) if !sticky.worker_task_list.is_empty() => ms.set_sticky_task_list(
                        &sticky.worker_task_list,
                        sticky.schedule_to_start_timeout_seconds,
                    ),
                    _ => ms.clear_sticky_task_list(),
                }

                // 1. Apply the batch, or fail the decision as a whole
                if let Err(bad) =
                    apply_decisions(ms, completed.event_id, &request.decisions, &request.identity)?
                {
                    warn!(cause = ?bad.cause, message = %bad.message, "Decision rejected");
                    *ms = before;
                    ms.clear_sticky_task_list();
                    ms.add_decision_task_failed(
                        bad.cause,
                        Some(Payload::from_text(&bad.message)),
                        &request.identity,
                    )?;
                    ms.add_decision_task_scheduled()?;
                    let err = HistoryError::bad_request("decisions", bad.message);
                    return Ok(UpdateOutcome::Persist(Completion::Failed(err)));
                }

                // 2. Follow-up decision
                if !ms.is_running() {
                    return Ok(UpdateOutcome::Persist(Completion::Completed(None)));
                }
                if (had_buffered || request.force_create_new_decision_task)
                    && !ms.has_pending_decision()
                {
                    let scheduled = ms.add_decision_task_scheduled()?;
                    if request.return_new_decision_task {
                        let request_id = Uuid::new_v4().to_string();
                        ms.add_decision_task_started(
                            scheduled.schedule_id,
                            &request_id,
                            &request.identity,
                        )?;
                        let started = started_response(ms);
                        return Ok(UpdateOutcome::Persist(Completion::Completed(Some(started))));
                    }
                }
                Ok(UpdateOutcome::Persist(Completion::Completed(None)))
            })
            .await?;

        match completion {
            Completion::Completed(started_response) => {
                debug!(next_decision = started_response.is_some(), "Decision completed");
                Ok(RespondDecisionTaskCompletedResponse { started_response })
            }
            Completion::Failed(err) => Err(err),
        }
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.task_token.workflow_id,
        run_id = %request.task_token.run_id,
        schedule_id = request.task_token.schedule_id,
        cause = ?request.cause,
    ))]
    pub(crate) async fn respond_decision_task_failed_inner(
        &self,
        ctx: &CallContext,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<()> {
        let token = &request.task_token;
        let key = self.resolve_key(&token.domain_id, &token.execution()).await?;
        self.update_workflow(ctx, "respond_decision_task_failed", &key, |ms| {
            if !ms.is_running() {
                return Err(HistoryError::WorkflowCompleted);
            }
            inflight_decision(ms, token)?;
            ms.add_decision_task_failed(request.cause, request.details.clone(), &request.identity)?;
            if request.cause == DecisionTaskFailedCause::ResetStickyTaskList {
                ms.clear_sticky_task_list();
            }
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        is_first_decision = request.is_first_decision,
    ))]
    pub(crate) async fn schedule_decision_task_inner(
        &self,
        ctx: &CallContext,
        request: ScheduleDecisionTaskRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow(ctx, "schedule_decision_task", &key, |ms| {
            if !ms.is_running() {
                return Err(HistoryError::WorkflowCompleted);
            }
            if ms.has_pending_decision() {
                return Ok(UpdateOutcome::Unchanged(()));
            }
            ms.add_decision_task_scheduled()?;
            Ok(UpdateOutcome::Persist(()))
        })
        .await
    }
}

/// The in-flight decision `token` was issued for.
fn inflight_decision(ms: &MutableState, token: &TaskToken) -> Result<DecisionInfo> {
    let decision = &ms.execution_info.decision;
    if decision.schedule_id != token.schedule_id
        || decision.started_id == EMPTY_EVENT_ID
        || decision.attempt != token.schedule_attempt
    {
        warn!(
            token_schedule_id = token.schedule_id,
            token_attempt = token.schedule_attempt,
            schedule_id = decision.schedule_id,
            attempt = decision.attempt,
            "Stale decision task token"
        );
        return Err(HistoryError::entity_not_found(
            "decision task",
            format!("schedule id {}", token.schedule_id),
        ));
    }
    Ok(decision.clone())
}

pub(crate) fn started_response(ms: &MutableState) -> RecordDecisionTaskStartedResponse {
    let info = &ms.execution_info;
    let decision = &info.decision;
    RecordDecisionTaskStartedResponse {
        workflow_type: info.workflow_type.clone(),
        previous_started_event_id: info.last_processed_event_id,
        scheduled_event_id: decision.schedule_id,
        started_event_id: decision.started_id,
        next_event_id: ms.next_event_id(),
        attempt: decision.attempt,
        sticky_execution_enabled: info
            .sticky_task_list
            .as_deref()
            .is_some_and(|sticky| sticky == decision.task_list),
        workflow_execution_task_list: info.task_list.clone(),
        branch_token: ms.current_branch_token().unwrap_or_default(),
        scheduled_timestamp: decision.scheduled_time,
        started_timestamp: decision.started_time,
        task_token: TaskToken {
            domain_id: info.domain_id.clone(),
            workflow_id: info.workflow_id.clone(),
            run_id: info.run_id.clone(),
            schedule_id: decision.schedule_id,
            schedule_attempt: decision.attempt,
            activity_id: None,
        },
    }
}

// ============================================================================
// Decision application
// ============================================================================

/// Apply `decisions` in order. The outer error aborts the update; the inner
/// one fails the decision task.
fn apply_decisions(
    ms: &mut MutableState,
    completed_id: i64,
    decisions: &[Decision],
    identity: &str,
) -> Result<std::result::Result<(), BadDecision>> {
    for (index, decision) in decisions.iter().enumerate() {
        if !ms.is_running() {
            return Ok(Err(BadDecision::new(
                DecisionTaskFailedCause::UnhandledDecision,
                format!("decision {} follows a decision that closed the run", index),
            )));
        }
        if let Err(bad) = apply_decision(ms, completed_id, decision, identity)? {
            return Ok(Err(bad));
        }
    }
    Ok(Ok(()))
}

fn apply_decision(
    ms: &mut MutableState,
    completed_id: i64,
    decision: &Decision,
    identity: &str,
) -> Result<std::result::Result<(), BadDecision>> {
    use DecisionTaskFailedCause as Cause;

    match decision {
        Decision::ScheduleActivityTask(attrs) => {
            let attrs = match activity_attributes(ms, attrs) {
                Ok(attrs) => attrs,
                Err(bad) => return Ok(Err(bad)),
            };
            if ms.activity_by_id(&attrs.activity_id).is_some() {
                return Ok(Err(BadDecision::new(
                    Cause::BadScheduleActivityAttributes,
                    format!("activity id {} is already pending", attrs.activity_id),
                )));
            }
            ms.add_activity_task_scheduled(completed_id, attrs)?;
        }

        Decision::RequestCancelActivityTask { activity_id } => {
            if activity_id.is_empty() {
                return Ok(Err(BadDecision::new(
                    Cause::BadRequestCancelActivityAttributes,
                    "activity_id is required",
                )));
            }
            match ms.activity_by_id(activity_id).map(|ai| (ai.schedule_id, ai.is_started())) {
                None => {
                    ms.add_request_cancel_activity_task_failed(
                        completed_id,
                        activity_id,
                        "ACTIVITY_ID_UNKNOWN",
                    )?;
                }
                Some((schedule_id, started)) => {
                    ms.add_activity_task_cancel_requested(completed_id, activity_id)?;
                    // Nobody holds an unstarted activity, so it cancels at once.
                    if !started {
                        ms.add_activity_task_canceled(schedule_id, None, identity)?;
                    }
                }
            }
        }

        Decision::StartTimer {
            timer_id,
            start_to_fire_timeout_seconds,
        } => {
            if timer_id.is_empty() || *start_to_fire_timeout_seconds <= 0 {
                return Ok(Err(BadDecision::new(
                    Cause::BadStartTimerAttributes,
                    "timer_id and a positive start_to_fire_timeout_seconds are required",
                )));
            }
            if *start_to_fire_timeout_seconds > MAX_TIMER_SECONDS {
                return Ok(Err(BadDecision::new(
                    Cause::BadStartTimerAttributes,
                    format!("start_to_fire_timeout_seconds must not exceed {MAX_TIMER_SECONDS}"),
                )));
            }
            if ms.pending_timers.contains_key(timer_id) {
                ms.add_start_timer_failed(completed_id, timer_id, "TIMER_ID_ALREADY_STARTED")?;
            } else {
                ms.add_timer_started(completed_id, timer_id, *start_to_fire_timeout_seconds)?;
            }
        }

        Decision::CancelTimer { timer_id } => {
            if timer_id.is_empty() {
                return Ok(Err(BadDecision::new(
                    Cause::BadCancelTimerAttributes,
                    "timer_id is required",
                )));
            }
            if ms.pending_timers.contains_key(timer_id) {
                ms.add_timer_canceled(completed_id, timer_id, identity)?;
            } else {
                ms.add_cancel_timer_failed(completed_id, timer_id, "TIMER_ID_UNKNOWN", identity)?;
            }
        }

        Decision::CompleteWorkflowExecution { result } => {
            if let Some(bad) = unhandled_events(ms) {
                return Ok(Err(bad));
            }
            ms.add_workflow_execution_completed(completed_id, result.clone())?;
        }

        Decision::FailWorkflowExecution { reason, details } => {
            if reason.is_empty() {
                return Ok(Err(BadDecision::new(
                    Cause::BadFailWorkflowExecutionAttributes,
                    "reason is required",
                )));
            }
            if let Some(bad) = unhandled_events(ms) {
                return Ok(Err(bad));
            }
            ms.add_workflow_execution_failed(completed_id, reason, details.clone())?;
        }

        Decision::CancelWorkflowExecution { details } => {
            if !ms.execution_info.cancel_requested {
                return Ok(Err(BadDecision::new(
                    Cause::BadCancelWorkflowExecutionAttributes,
                    "cancellation was not requested",
                )));
            }
            if let Some(bad) = unhandled_events(ms) {
                return Ok(Err(bad));
            }
            ms.add_workflow_execution_canceled(completed_id, details.clone())?;
        }

        Decision::ContinueAsNewWorkflowExecution(attrs) => {
            let attrs = match continue_as_new_attributes(ms, attrs) {
                Ok(attrs) => attrs,
                Err(bad) => return Ok(Err(bad)),
            };
            if let Some(bad) = unhandled_events(ms) {
                return Ok(Err(bad));
            }
            let new_run_id = Uuid::new_v4().to_string();
            let new_branch = Uuid::new_v4().to_string();
            ms.add_continued_as_new(completed_id, &new_run_id, &new_branch, attrs)?;
        }

        Decision::RecordMarker {
            marker_name,
            details,
        } => {
            if marker_name.is_empty() {
                return Ok(Err(BadDecision::new(
                    Cause::BadRecordMarkerAttributes,
                    "marker_name is required",
                )));
            }
            ms.add_marker_recorded(completed_id, marker_name, details.clone())?;
        }

        Decision::StartChildWorkflowExecution(attrs) => {
            let attrs = match child_attributes(ms, attrs) {
                Ok(attrs) => attrs,
                Err(bad) => return Ok(Err(bad)),
            };
            ms.add_start_child_workflow_execution_initiated(completed_id, attrs)?;
        }

        Decision::SignalExternalWorkflowExecution {
            domain,
            execution,
            signal_name,
            input,
            control,
            child_workflow_only,
        } => {
            if execution.workflow_id.is_empty() || signal_name.is_empty() {
                return Ok(Err(BadDecision::new(
                    Cause::BadSignalWorkflowExecutionAttributes,
                    "workflow_id and signal_name are required",
                )));
            }
            let domain = if domain.is_empty() {
                ms.execution_info.domain_id.clone()
            } else {
                domain.clone()
            };
            ms.add_signal_external_workflow_execution_initiated(
                completed_id,
                &domain,
                execution.clone(),
                signal_name,
                input.clone(),
                control.clone(),
                *child_workflow_only,
            )?;
        }

        Decision::UpsertWorkflowSearchAttributes { search_attributes } => {
            if search_attributes.is_empty() {
                return Ok(Err(BadDecision::new(
                    Cause::BadSearchAttributes,
                    "search_attributes must not be empty",
                )));
            }
            ms.add_upsert_search_attributes(completed_id, search_attributes.clone())?;
        }
    }
    Ok(Ok(()))
}

/// Close decisions must see every event; buffered ones are still unseen.
fn unhandled_events(ms: &MutableState) -> Option<BadDecision> {
    ms.has_buffered_events().then(|| {
        BadDecision::new(
            DecisionTaskFailedCause::UnhandledDecision,
            format!(
                "{} events arrived while the decision was in flight",
                ms.buffered_events.len()
            ),
        )
    })
}

fn activity_attributes(
    ms: &MutableState,
    attrs: &ActivityTaskScheduledAttributes,
) -> std::result::Result<ActivityTaskScheduledAttributes, BadDecision> {
    let bad = |message: &str| {
        BadDecision::new(DecisionTaskFailedCause::BadScheduleActivityAttributes, message)
    };
    if attrs.activity_id.is_empty() {
        return Err(bad("activity_id is required"));
    }
    if attrs.activity_type.is_empty() {
        return Err(bad("activity_type is required"));
    }
    if attrs.schedule_to_close_timeout_seconds < 0
        || attrs.schedule_to_start_timeout_seconds < 0
        || attrs.start_to_close_timeout_seconds < 0
        || attrs.heartbeat_timeout_seconds < 0
    {
        return Err(bad("timeouts must not be negative"));
    }

    let mut attrs = attrs.clone();
    if attrs.task_list.name.is_empty() {
        attrs.task_list = TaskList::normal(ms.execution_info.task_list.clone());
    }
    let valid_schedule_to_close = attrs.schedule_to_close_timeout_seconds > 0;
    let valid_both = attrs.schedule_to_start_timeout_seconds > 0
        && attrs.start_to_close_timeout_seconds > 0;
    if valid_schedule_to_close {
        if attrs.schedule_to_start_timeout_seconds == 0 {
            attrs.schedule_to_start_timeout_seconds = attrs.schedule_to_close_timeout_seconds;
        }
        if attrs.start_to_close_timeout_seconds == 0 {
            attrs.start_to_close_timeout_seconds = attrs.schedule_to_close_timeout_seconds;
        }
    } else if valid_both {
        attrs.schedule_to_close_timeout_seconds = attrs
            .schedule_to_start_timeout_seconds
            .checked_add(attrs.start_to_close_timeout_seconds)
            .ok_or_else(|| bad("schedule_to_start plus start_to_close timeout is out of range"))?;
    } else {
        return Err(bad(
            "either schedule_to_close or both schedule_to_start and start_to_close timeouts are required",
        ));
    }
    Ok(attrs)
}

fn continue_as_new_attributes(
    ms: &MutableState,
    attrs: &WorkflowExecutionContinuedAsNewAttributes,
) -> std::result::Result<WorkflowExecutionContinuedAsNewAttributes, BadDecision> {
    let info = &ms.execution_info;
    if attrs.backoff_start_interval_seconds < 0 {
        return Err(BadDecision::new(
            DecisionTaskFailedCause::BadContinueAsNewAttributes,
            "backoff_start_interval_seconds must not be negative",
        ));
    }
    let mut attrs = attrs.clone();
    if attrs.workflow_type.is_empty() {
        attrs.workflow_type = info.workflow_type.clone();
    }
    if attrs.task_list.name.is_empty() {
        attrs.task_list = TaskList::normal(info.task_list.clone());
    }
    if attrs.execution_start_to_close_timeout_seconds <= 0 {
        attrs.execution_start_to_close_timeout_seconds = info.workflow_timeout_seconds;
    }
    if attrs.task_start_to_close_timeout_seconds <= 0 {
        attrs.task_start_to_close_timeout_seconds = info.decision_timeout_seconds;
    }
    Ok(attrs)
}

fn child_attributes(
    ms: &MutableState,
    attrs: &StartChildWorkflowExecutionInitiatedAttributes,
) -> std::result::Result<StartChildWorkflowExecutionInitiatedAttributes, BadDecision> {
    let info = &ms.execution_info;
    if attrs.workflow_id.is_empty() || attrs.workflow_type.is_empty() {
        return Err(BadDecision::new(
            DecisionTaskFailedCause::BadStartChildExecutionAttributes,
            "workflow_id and workflow_type are required",
        ));
    }
    let mut attrs = attrs.clone();
    if attrs.domain.is_empty() {
        attrs.domain = info.domain_id.clone();
    }
    if attrs.task_list.name.is_empty() {
        attrs.task_list = TaskList::normal(info.task_list.clone());
    }
    if attrs.execution_start_to_close_timeout_seconds <= 0 {
        attrs.execution_start_to_close_timeout_seconds = info.workflow_timeout_seconds;
    }
    if attrs.task_start_to_close_timeout_seconds <= 0 {
        attrs.task_start_to_close_timeout_seconds = info.decision_timeout_seconds;
    }
    Ok(attrs)
}
