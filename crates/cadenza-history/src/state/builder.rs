// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event builders.
//!
//! Every `add_*` method creates one event with the transaction's version,
//! applies it and queues the tasks it implies. Bufferable events created
//! while a decision is in flight are held in `buffered_events` with
//! `BUFFERED_EVENT_ID` and get real ids when flushed.

use std::collections::HashMap;

use chrono::Utc;

use super::{DecisionInfo, MutableState, retry, task_generator};
use crate::error::{HistoryError, Result};
use crate::events::{
    ActivityTaskScheduledAttributes, ChildWorkflowExecutionClosedAttributes, EventAttributes,
    HistoryEvent, StartChildWorkflowExecutionInitiatedAttributes,
    WorkflowExecutionContinuedAsNewAttributes, WorkflowExecutionStartedAttributes,
};
use crate::tasks::{PendingTask, TaskKind};
use crate::types::{
    BUFFERED_EVENT_ID, DecisionTaskFailedCause, EMPTY_EVENT_ID, Payload, SearchAttributes,
    TaskList, TaskListKind, TimeoutType, WorkflowExecution, WorkflowKey,
};

impl MutableState {
    fn add_event(&mut self, attributes: EventAttributes) -> Result<HistoryEvent> {
        let buffer = attributes.is_bufferable() && self.has_inflight_decision();
        let event = HistoryEvent {
            event_id: if buffer {
                BUFFERED_EVENT_ID
            } else {
                self.next_event_id()
            },
            version: self.current_version,
            task_id: 0,
            timestamp: Utc::now(),
            attributes,
        };

        self.apply_event(&event)?;
        let tasks = task_generator::tasks_for_event(self, &event);
        self.pending.tasks.extend(tasks);

        if buffer {
            self.buffered_events.push(event.clone());
        } else {
            self.record_event(event.clone())?;
        }
        Ok(event)
    }

    fn require_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(HistoryError::WorkflowCompleted)
        }
    }

    /// Give buffered events real ids, in arrival order.
    ///
    /// Started ids of activities and children whose start was buffered are
    /// patched in both the later close events and the pending infos.
    pub(crate) fn flush_buffered_events(&mut self) -> Result<()> {
        if self.buffered_events.is_empty() {
            return Ok(());
        }
        let buffered = std::mem::take(&mut self.buffered_events);
        let mut activity_started: HashMap<i64, i64> = HashMap::new();
        let mut child_started: HashMap<i64, i64> = HashMap::new();

        for mut event in buffered {
            let event_id = self.next_event_id();
            event.event_id = event_id;
            event.version = self.current_version;

            match &mut event.attributes {
                EventAttributes::ActivityTaskStarted {
                    scheduled_event_id, ..
                } => {
                    activity_started.insert(*scheduled_event_id, event_id);
                    if let Some(ai) = self.pending_activities.get_mut(scheduled_event_id) {
                        ai.started_id = event_id;
                    }
                }
                EventAttributes::ActivityTaskCompleted {
                    scheduled_event_id,
                    started_event_id,
                    ..
                }
                | EventAttributes::ActivityTaskFailed {
                    scheduled_event_id,
                    started_event_id,
                    ..
                }
                | EventAttributes::ActivityTaskTimedOut {
                    scheduled_event_id,
                    started_event_id,
                    ..
                }
                | EventAttributes::ActivityTaskCanceled {
                    scheduled_event_id,
                    started_event_id,
                    ..
                } => {
                    if *started_event_id == BUFFERED_EVENT_ID
                        && let Some(id) = activity_started.get(scheduled_event_id)
                    {
                        *started_event_id = *id;
                    }
                }
                EventAttributes::ChildWorkflowExecutionStarted {
                    initiated_event_id, ..
                } => {
                    child_started.insert(*initiated_event_id, event_id);
                    if let Some(ci) = self.pending_children.get_mut(initiated_event_id) {
                        ci.started_id = event_id;
                    }
                }
                EventAttributes::ChildWorkflowExecutionCompleted(attrs)
                | EventAttributes::ChildWorkflowExecutionFailed(attrs)
                | EventAttributes::ChildWorkflowExecutionCanceled(attrs)
                | EventAttributes::ChildWorkflowExecutionTimedOut(attrs)
                | EventAttributes::ChildWorkflowExecutionTerminated(attrs) => {
                    if attrs.started_event_id == BUFFERED_EVENT_ID
                        && let Some(id) = child_started.get(&attrs.initiated_event_id)
                    {
                        attrs.started_event_id = *id;
                    }
                }
                _ => {}
            }
            self.record_event(event)?;
        }
        Ok(())
    }

    // ========================================================================
    // Workflow
    // ========================================================================

    /// First event of a run.
    pub fn add_workflow_execution_started(
        &mut self,
        attrs: WorkflowExecutionStartedAttributes,
    ) -> Result<HistoryEvent> {
        if self.next_event_id() != crate::types::FIRST_EVENT_ID {
            return Err(HistoryError::invalid_state("run already has a started event"));
        }
        self.add_event(EventAttributes::WorkflowExecutionStarted(attrs))
    }

    /// Record a signal.
    pub fn add_workflow_execution_signaled(
        &mut self,
        signal_name: &str,
        input: Option<Payload>,
        identity: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.to_string(),
            input,
            identity: identity.to_string(),
        })
    }

    /// Record a cancellation request.
    pub fn add_workflow_execution_cancel_requested(
        &mut self,
        cause: &str,
        request_id: &str,
        identity: &str,
        external: Option<(i64, WorkflowExecution)>,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        let (external_initiated_event_id, external_workflow_execution) = match external {
            Some((id, execution)) => (Some(id), Some(execution)),
            None => (None, None),
        };
        let event = self.add_event(EventAttributes::WorkflowExecutionCancelRequested {
            cause: cause.to_string(),
            external_initiated_event_id,
            external_workflow_execution,
            identity: identity.to_string(),
        })?;
        self.execution_info.cancel_request_id = request_id.to_string();
        Ok(event)
    }

    fn add_close_event(&mut self, attributes: EventAttributes) -> Result<HistoryEvent> {
        self.require_running()?;
        self.flush_buffered_events()?;
        self.add_event(attributes)
    }

    /// Close the run as completed.
    pub fn add_workflow_execution_completed(
        &mut self,
        decision_task_completed_event_id: i64,
        result: Option<Payload>,
    ) -> Result<HistoryEvent> {
        self.add_close_event(EventAttributes::WorkflowExecutionCompleted {
            result,
            decision_task_completed_event_id,
        })
    }

    /// Close the run as failed.
    pub fn add_workflow_execution_failed(
        &mut self,
        decision_task_completed_event_id: i64,
        reason: &str,
        details: Option<Payload>,
    ) -> Result<HistoryEvent> {
        self.add_close_event(EventAttributes::WorkflowExecutionFailed {
            reason: reason.to_string(),
            details,
            decision_task_completed_event_id,
        })
    }

    /// Close the run as canceled.
    pub fn add_workflow_execution_canceled(
        &mut self,
        decision_task_completed_event_id: i64,
        details: Option<Payload>,
    ) -> Result<HistoryEvent> {
        self.add_close_event(EventAttributes::WorkflowExecutionCanceled {
            decision_task_completed_event_id,
            details,
        })
    }

    /// Close the run as terminated.
    pub fn add_workflow_execution_terminated(
        &mut self,
        reason: &str,
        details: Option<Payload>,
        identity: &str,
    ) -> Result<HistoryEvent> {
        self.add_close_event(EventAttributes::WorkflowExecutionTerminated {
            reason: reason.to_string(),
            details,
            identity: identity.to_string(),
        })
    }

    /// Close the run and start its successor in the same transaction.
    ///
    /// The successor's transaction is left open; the engine closes it when
    /// persisting.
    pub fn add_continued_as_new(
        &mut self,
        decision_task_completed_event_id: i64,
        new_run_id: &str,
        new_branch_token: &str,
        attrs: WorkflowExecutionContinuedAsNewAttributes,
    ) -> Result<HistoryEvent> {
        let event = self.add_close_event(EventAttributes::WorkflowExecutionContinuedAsNew(
            WorkflowExecutionContinuedAsNewAttributes {
                new_execution_run_id: new_run_id.to_string(),
                decision_task_completed_event_id,
                ..attrs.clone()
            },
        ))?;

        let info = &self.execution_info;
        let key = WorkflowKey::new(
            info.domain_id.clone(),
            info.workflow_id.clone(),
            new_run_id.to_string(),
        );
        let mut successor = MutableState::new(&key, new_branch_token, self.current_version);
        successor.execution_info.retention_seconds = info.retention_seconds;
        successor.start_transaction(self.current_version, self.pending.replicate);
        successor.add_workflow_execution_started(WorkflowExecutionStartedAttributes {
            workflow_type: attrs.workflow_type,
            task_list: attrs.task_list,
            input: attrs.input,
            execution_start_to_close_timeout_seconds: attrs
                .execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: attrs.task_start_to_close_timeout_seconds,
            identity: String::new(),
            parent: info.parent.clone(),
            continued_execution_run_id: Some(info.run_id.clone()),
            first_execution_run_id: info.first_execution_run_id.clone(),
            first_decision_task_backoff_seconds: attrs.backoff_start_interval_seconds,
            memo: info.memo.clone(),
            search_attributes: info.search_attributes.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
        })?;
        if attrs.backoff_start_interval_seconds == 0 {
            successor.add_decision_task_scheduled()?;
        }
        self.pending.new_run = Some(Box::new(successor));
        Ok(event)
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    /// Schedule a decision task. Buffered events are flushed first so the
    /// decision sees them.
    pub fn add_decision_task_scheduled(&mut self) -> Result<DecisionInfo> {
        self.require_running()?;
        if self.has_pending_decision() {
            return Err(HistoryError::invalid_state(format!(
                "decision {} is already pending",
                self.execution_info.decision.schedule_id
            )));
        }
        self.flush_buffered_events()?;

        let info = &self.execution_info;
        let task_list = match &info.sticky_task_list {
            Some(name) => TaskList {
                name: name.clone(),
                kind: TaskListKind::Sticky,
            },
            None => TaskList::normal(info.task_list.clone()),
        };
        self.add_event(EventAttributes::DecisionTaskScheduled {
            task_list,
            start_to_close_timeout_seconds: info.decision_timeout_seconds,
            attempt: info.decision.attempt,
        })?;
        Ok(self.execution_info.decision.clone())
    }

    /// A worker picked up decision `schedule_id`.
    pub fn add_decision_task_started(
        &mut self,
        schedule_id: i64,
        request_id: &str,
        identity: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::DecisionTaskStarted {
            scheduled_event_id: schedule_id,
            identity: identity.to_string(),
            request_id: request_id.to_string(),
        })
    }

    /// The in-flight decision completed.
    pub fn add_decision_task_completed(
        &mut self,
        identity: &str,
        execution_context: Option<Payload>,
        binary_checksum: &str,
    ) -> Result<HistoryEvent> {
        let decision = self.inflight_decision()?;
        self.add_event(EventAttributes::DecisionTaskCompleted {
            scheduled_event_id: decision.schedule_id,
            started_event_id: decision.started_id,
            identity: identity.to_string(),
            execution_context,
            binary_checksum: binary_checksum.to_string(),
        })
    }

    /// The in-flight decision failed.
    pub fn add_decision_task_failed(
        &mut self,
        cause: DecisionTaskFailedCause,
        details: Option<Payload>,
        identity: &str,
    ) -> Result<HistoryEvent> {
        let decision = self.inflight_decision()?;
        self.add_event(EventAttributes::DecisionTaskFailed {
            scheduled_event_id: decision.schedule_id,
            started_event_id: decision.started_id,
            cause,
            details,
            identity: identity.to_string(),
            reason: None,
            base_run_id: None,
            new_run_id: None,
        })
    }

    /// Marks the point a reset run branched from `base_run_id`.
    ///
    /// A reset run's decision is pending at the fork point; it is failed so
    /// the worker replays from there.
    pub fn add_reset_decision_task_failed(
        &mut self,
        reason: &str,
        base_run_id: &str,
        new_run_id: &str,
        identity: &str,
    ) -> Result<HistoryEvent> {
        let mut decision = self.execution_info.decision.clone();
        if decision.schedule_id == EMPTY_EVENT_ID {
            return Err(HistoryError::invalid_state("reset point has no pending decision"));
        }
        if decision.started_id == EMPTY_EVENT_ID {
            self.add_decision_task_started(decision.schedule_id, "", identity)?;
            decision = self.execution_info.decision.clone();
        }
        self.add_event(EventAttributes::DecisionTaskFailed {
            scheduled_event_id: decision.schedule_id,
            started_event_id: decision.started_id,
            cause: DecisionTaskFailedCause::ResetWorkflow,
            details: None,
            identity: identity.to_string(),
            reason: Some(reason.to_string()),
            base_run_id: Some(base_run_id.to_string()),
            new_run_id: Some(new_run_id.to_string()),
        })
    }

    fn inflight_decision(&self) -> Result<DecisionInfo> {
        self.require_running()?;
        if !self.has_inflight_decision() {
            return Err(HistoryError::invalid_state("no decision in flight"));
        }
        Ok(self.execution_info.decision.clone())
    }

    /// Route later decisions to the worker's sticky task list.
    pub fn set_sticky_task_list(&mut self, name: &str, schedule_to_start_timeout_seconds: i32) {
        self.execution_info.sticky_task_list = Some(name.to_string());
        self.execution_info.sticky_schedule_to_start_timeout_seconds =
            schedule_to_start_timeout_seconds;
    }

    /// Route later decisions to the normal task list.
    pub fn clear_sticky_task_list(&mut self) {
        self.execution_info.sticky_task_list = None;
        self.execution_info.sticky_schedule_to_start_timeout_seconds = 0;
    }

    // ========================================================================
    // Activities
    // ========================================================================

    /// Schedule an activity.
    pub fn add_activity_task_scheduled(
        &mut self,
        decision_task_completed_event_id: i64,
        attrs: ActivityTaskScheduledAttributes,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        if self.activity_by_id(&attrs.activity_id).is_some() {
            return Err(HistoryError::bad_request(
                "activity_id",
                format!("activity {} is already pending", attrs.activity_id),
            ));
        }
        self.add_event(EventAttributes::ActivityTaskScheduled(
            ActivityTaskScheduledAttributes {
                decision_task_completed_event_id,
                ..attrs
            },
        ))
    }

    /// A worker picked up activity `schedule_id`.
    pub fn add_activity_task_started(
        &mut self,
        schedule_id: i64,
        request_id: &str,
        identity: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        let attempt = self.activity_mut(schedule_id)?.attempt;
        let event = self.add_event(EventAttributes::ActivityTaskStarted {
            scheduled_event_id: schedule_id,
            identity: identity.to_string(),
            request_id: request_id.to_string(),
            attempt,
        })?;
        self.push_sync_activity(schedule_id);
        Ok(event)
    }

    /// Activity completed.
    pub fn add_activity_task_completed(
        &mut self,
        schedule_id: i64,
        result: Option<Payload>,
        identity: &str,
    ) -> Result<HistoryEvent> {
        let started_event_id = self.started_activity(schedule_id)?;
        self.add_event(EventAttributes::ActivityTaskCompleted {
            result,
            scheduled_event_id: schedule_id,
            started_event_id,
            identity: identity.to_string(),
        })
    }

    /// Activity failed for good.
    pub fn add_activity_task_failed(
        &mut self,
        schedule_id: i64,
        reason: &str,
        details: Option<Payload>,
        identity: &str,
    ) -> Result<HistoryEvent> {
        let started_event_id = self.started_activity(schedule_id)?;
        self.add_event(EventAttributes::ActivityTaskFailed {
            reason: reason.to_string(),
            details,
            scheduled_event_id: schedule_id,
            started_event_id,
            identity: identity.to_string(),
        })
    }

    /// Activity acknowledged cancellation.
    pub fn add_activity_task_canceled(
        &mut self,
        schedule_id: i64,
        details: Option<Payload>,
        identity: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        let ai = self.activity_mut(schedule_id)?;
        if !ai.cancel_requested {
            return Err(HistoryError::invalid_state(format!(
                "activity {} was not asked to cancel",
                schedule_id
            )));
        }
        let latest_cancel_requested_event_id = ai.cancel_request_id;
        let started_event_id = ai.started_id;
        self.add_event(EventAttributes::ActivityTaskCanceled {
            details,
            latest_cancel_requested_event_id,
            scheduled_event_id: schedule_id,
            started_event_id,
            identity: identity.to_string(),
        })
    }

    fn started_activity(&mut self, schedule_id: i64) -> Result<i64> {
        self.require_running()?;
        let ai = self.activity_mut(schedule_id)?;
        if !ai.is_started() {
            return Err(HistoryError::invalid_state(format!(
                "activity {} has not started",
                schedule_id
            )));
        }
        Ok(ai.started_id)
    }

    /// Ask a pending activity to cancel.
    pub fn add_activity_task_cancel_requested(
        &mut self,
        decision_task_completed_event_id: i64,
        activity_id: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        if self.activity_by_id(activity_id).is_none() {
            return Err(HistoryError::entity_not_found("activity", activity_id.to_string()));
        }
        self.add_event(EventAttributes::ActivityTaskCancelRequested {
            activity_id: activity_id.to_string(),
            decision_task_completed_event_id,
        })
    }

    /// A cancel request named an unknown activity.
    pub fn add_request_cancel_activity_task_failed(
        &mut self,
        decision_task_completed_event_id: i64,
        activity_id: &str,
        cause: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::RequestCancelActivityTaskFailed {
            activity_id: activity_id.to_string(),
            cause: cause.to_string(),
            decision_task_completed_event_id,
        })
    }

    /// Schedule another attempt of a failed activity, if its retry policy
    /// allows one. Returns whether a retry was scheduled; no event is
    /// written either way.
    pub fn retry_activity(&mut self, schedule_id: i64, reason: &str) -> Result<bool> {
        self.require_running()?;
        let now = Utc::now();
        let ai = self.activity_mut(schedule_id)?;
        let Some(policy) = ai.scheduled.retry_policy.clone() else {
            return Ok(false);
        };
        let Some(retry_at) =
            retry::next_backoff(&policy, ai.attempt, reason, now, ai.expiration_time)
                .and_then(|backoff| now.checked_add_signed(backoff))
        else {
            return Ok(false);
        };

        ai.attempt = ai.attempt.saturating_add(1);
        ai.scheduled_time = retry_at;
        ai.started_id = EMPTY_EVENT_ID;
        ai.started_time = None;
        ai.request_id.clear();
        ai.last_heartbeat_time = None;
        ai.last_failure_reason = Some(reason.to_string());
        let attempt = ai.attempt;
        let scheduled_time = ai.scheduled_time;

        self.pending.tasks.push(PendingTask::at(
            scheduled_time,
            TaskKind::ActivityRetryTimer {
                schedule_id,
                attempt,
            },
        ));
        let timeouts =
            task_generator::activity_scheduled_timeouts(schedule_id, attempt, scheduled_time, self);
        self.pending.tasks.extend(timeouts);
        self.push_sync_activity(schedule_id);
        Ok(true)
    }

    /// Record a heartbeat and restart the heartbeat timeout clock.
    pub fn update_activity_progress(
        &mut self,
        schedule_id: i64,
        details: Option<Payload>,
    ) -> Result<()> {
        self.require_running()?;
        let now = Utc::now();
        let ai = self.activity_mut(schedule_id)?;
        ai.details = details;
        ai.last_heartbeat_time = Some(now);
        let heartbeat = ai.scheduled.heartbeat_timeout_seconds;
        let attempt = ai.attempt;
        if heartbeat > 0 {
            self.pending.tasks.push(task_generator::activity_timeout(
                now,
                heartbeat,
                schedule_id,
                attempt,
                TimeoutType::Heartbeat,
            ));
        }
        self.push_sync_activity(schedule_id);
        Ok(())
    }

    fn push_sync_activity(&mut self, schedule_id: i64) {
        if self.pending.replicate {
            self.pending
                .tasks
                .push(PendingTask::now(TaskKind::SyncActivity { schedule_id }));
        }
    }

    // ========================================================================
    // Timers and markers
    // ========================================================================

    /// Start a user timer.
    pub fn add_timer_started(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: &str,
        start_to_fire_timeout_seconds: i64,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        if self.pending_timers.contains_key(timer_id) {
            return Err(HistoryError::bad_request(
                "timer_id",
                format!("timer {} is already pending", timer_id),
            ));
        }
        self.add_event(EventAttributes::TimerStarted {
            timer_id: timer_id.to_string(),
            start_to_fire_timeout_seconds,
            decision_task_completed_event_id,
        })
    }

    /// A start-timer decision reused a pending timer id.
    pub fn add_start_timer_failed(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: &str,
        cause: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::StartTimerFailed {
            timer_id: timer_id.to_string(),
            cause: cause.to_string(),
            decision_task_completed_event_id,
        })
    }

    /// Cancel a pending timer.
    pub fn add_timer_canceled(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: &str,
        identity: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        let started_event_id = self
            .pending_timers
            .get(timer_id)
            .map(|t| t.started_id)
            .ok_or_else(|| HistoryError::entity_not_found("timer", timer_id.to_string()))?;
        self.add_event(EventAttributes::TimerCanceled {
            timer_id: timer_id.to_string(),
            started_event_id,
            decision_task_completed_event_id,
            identity: identity.to_string(),
        })
    }

    /// A cancel-timer decision named an unknown timer.
    pub fn add_cancel_timer_failed(
        &mut self,
        decision_task_completed_event_id: i64,
        timer_id: &str,
        cause: &str,
        identity: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::CancelTimerFailed {
            timer_id: timer_id.to_string(),
            cause: cause.to_string(),
            decision_task_completed_event_id,
            identity: identity.to_string(),
        })
    }

    /// Record a marker.
    pub fn add_marker_recorded(
        &mut self,
        decision_task_completed_event_id: i64,
        marker_name: &str,
        details: Option<Payload>,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::MarkerRecorded {
            marker_name: marker_name.to_string(),
            details,
            decision_task_completed_event_id,
        })
    }

    /// Merge search attributes.
    pub fn add_upsert_search_attributes(
        &mut self,
        decision_task_completed_event_id: i64,
        search_attributes: SearchAttributes,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::UpsertWorkflowSearchAttributes {
            decision_task_completed_event_id,
            search_attributes,
        })
    }

    // ========================================================================
    // Children and external signals
    // ========================================================================

    /// Initiate a child run.
    pub fn add_start_child_workflow_execution_initiated(
        &mut self,
        decision_task_completed_event_id: i64,
        attrs: StartChildWorkflowExecutionInitiatedAttributes,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::StartChildWorkflowExecutionInitiated(
            StartChildWorkflowExecutionInitiatedAttributes {
                decision_task_completed_event_id,
                ..attrs
            },
        ))
    }

    /// The child run was created.
    pub fn add_child_workflow_execution_started(
        &mut self,
        initiated_id: i64,
        child_run_id: &str,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        let ci = self
            .pending_children
            .get(&initiated_id)
            .ok_or_else(|| HistoryError::entity_not_found("child execution", initiated_id.to_string()))?;
        let attributes = EventAttributes::ChildWorkflowExecutionStarted {
            domain: ci.domain.clone(),
            initiated_event_id: initiated_id,
            workflow_execution: WorkflowExecution::new(ci.workflow_id.clone(), child_run_id),
            workflow_type: ci.workflow_type.clone(),
        };
        self.add_event(attributes)
    }

    /// The child run closed with `completion`, its closing event.
    pub fn add_child_workflow_execution_closed(
        &mut self,
        initiated_id: i64,
        completion: &EventAttributes,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        let ci = self
            .pending_children
            .get(&initiated_id)
            .ok_or_else(|| HistoryError::entity_not_found("child execution", initiated_id.to_string()))?;
        if ci.started_id == EMPTY_EVENT_ID {
            return Err(HistoryError::invalid_state(format!(
                "child {} has not started",
                initiated_id
            )));
        }
        let attrs = ChildWorkflowExecutionClosedAttributes {
            domain: ci.domain.clone(),
            workflow_execution: WorkflowExecution::new(ci.workflow_id.clone(), ci.run_id.clone()),
            workflow_type: ci.workflow_type.clone(),
            initiated_event_id: initiated_id,
            started_event_id: ci.started_id,
            ..ChildWorkflowExecutionClosedAttributes::default()
        };
        let attributes = match completion {
            EventAttributes::WorkflowExecutionCompleted { result, .. } => {
                EventAttributes::ChildWorkflowExecutionCompleted(
                    ChildWorkflowExecutionClosedAttributes {
                        result: result.clone(),
                        ..attrs
                    },
                )
            }
            EventAttributes::WorkflowExecutionFailed {
                reason, details, ..
            } => EventAttributes::ChildWorkflowExecutionFailed(ChildWorkflowExecutionClosedAttributes {
                reason: Some(reason.clone()),
                details: details.clone(),
                ..attrs
            }),
            EventAttributes::WorkflowExecutionCanceled { details, .. } => {
                EventAttributes::ChildWorkflowExecutionCanceled(
                    ChildWorkflowExecutionClosedAttributes {
                        details: details.clone(),
                        ..attrs
                    },
                )
            }
            EventAttributes::WorkflowExecutionTimedOut { .. } => {
                EventAttributes::ChildWorkflowExecutionTimedOut(attrs)
            }
            EventAttributes::WorkflowExecutionTerminated {
                reason, details, ..
            } => EventAttributes::ChildWorkflowExecutionTerminated(
                ChildWorkflowExecutionClosedAttributes {
                    reason: Some(reason.clone()),
                    details: details.clone(),
                    ..attrs
                },
            ),
            other => {
                return Err(HistoryError::bad_request(
                    "completion_event",
                    format!("{} does not close a child", other.event_type()),
                ));
            }
        };
        self.add_event(attributes)
    }

    /// Initiate a signal to another run.
    #[allow(clippy::too_many_arguments)]
    pub fn add_signal_external_workflow_execution_initiated(
        &mut self,
        decision_task_completed_event_id: i64,
        domain: &str,
        workflow_execution: WorkflowExecution,
        signal_name: &str,
        input: Option<Payload>,
        control: Option<Payload>,
        child_workflow_only: bool,
    ) -> Result<HistoryEvent> {
        self.require_running()?;
        self.add_event(EventAttributes::SignalExternalWorkflowExecutionInitiated {
            decision_task_completed_event_id,
            domain: domain.to_string(),
            workflow_execution,
            signal_name: signal_name.to_string(),
            input,
            control,
            child_workflow_only,
        })
    }
}
