// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Event application: the pure state transition for every event type.

use chrono::Duration;

use super::{
    ActivityInfo, ChildExecutionInfo, DecisionInfo, MutableState, SignalInfo, TimerInfo, fire_time,
    retry,
};
use crate::error::{HistoryError, Result};
use crate::events::{EventAttributes, HistoryEvent};
use crate::types::{CloseStatus, EMPTY_EVENT_ID, WorkflowState};

impl MutableState {
    /// Apply `event` to the state. Does not touch event ids or the version
    /// history; callers record the event separately.
    pub(crate) fn apply_event(&mut self, event: &HistoryEvent) -> Result<()> {
        let ts = event.timestamp;
        self.execution_info.last_updated = ts;

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted(attrs) => {
                let info = &mut self.execution_info;
                info.workflow_type = attrs.workflow_type.clone();
                info.task_list = attrs.task_list.name.clone();
                info.workflow_timeout_seconds = attrs.execution_start_to_close_timeout_seconds;
                info.decision_timeout_seconds = attrs.task_start_to_close_timeout_seconds;
                info.parent = attrs.parent.clone();
                info.first_execution_run_id = if attrs.first_execution_run_id.is_empty() {
                    info.run_id.clone()
                } else {
                    attrs.first_execution_run_id.clone()
                };
                info.memo = attrs.memo.clone();
                info.search_attributes = attrs.search_attributes.clone();
                info.create_request_id = attrs.request_id.clone();
                info.start_time = ts;
                info.execution_time =
                    ts + Duration::seconds(i64::from(attrs.first_decision_task_backoff_seconds));
                info.state = WorkflowState::Running;
                info.close_status = CloseStatus::None;
            }

            EventAttributes::DecisionTaskScheduled {
                task_list,
                start_to_close_timeout_seconds,
                attempt,
            } => {
                self.execution_info.decision = DecisionInfo {
                    version: event.version,
                    schedule_id: event.event_id,
                    started_id: EMPTY_EVENT_ID,
                    request_id: String::new(),
                    timeout_seconds: *start_to_close_timeout_seconds,
                    attempt: *attempt,
                    task_list: task_list.name.clone(),
                    scheduled_time: Some(ts),
                    started_time: None,
                };
            }

            EventAttributes::DecisionTaskStarted {
                scheduled_event_id,
                request_id,
                ..
            } => {
                let decision = &mut self.execution_info.decision;
                if decision.schedule_id != *scheduled_event_id {
                    return Err(HistoryError::invalid_state(format!(
                        "decision started for {} but {} is scheduled",
                        scheduled_event_id, decision.schedule_id
                    )));
                }
                decision.version = event.version;
                decision.started_id = event.event_id;
                decision.request_id = request_id.clone();
                decision.started_time = Some(ts);
            }

            EventAttributes::DecisionTaskCompleted {
                started_event_id, ..
            } => {
                self.execution_info.last_processed_event_id = *started_event_id;
                self.execution_info.decision = DecisionInfo::default();
            }

            EventAttributes::DecisionTaskFailed { .. }
            | EventAttributes::DecisionTaskTimedOut { .. } => {
                let attempt = self.execution_info.decision.attempt + 1;
                self.execution_info.decision = DecisionInfo {
                    attempt,
                    ..DecisionInfo::default()
                };
            }

            EventAttributes::ActivityTaskScheduled(attrs) => {
                let expiration_time = attrs
                    .retry_policy
                    .as_ref()
                    .and_then(|p| retry::expiration_time(p, ts));
                self.pending_activities.insert(
                    event.event_id,
                    ActivityInfo {
                        version: event.version,
                        schedule_id: event.event_id,
                        scheduled: attrs.clone(),
                        scheduled_time: ts,
                        started_id: EMPTY_EVENT_ID,
                        expiration_time,
                        ..ActivityInfo::default()
                    },
                );
            }

            EventAttributes::ActivityTaskStarted {
                scheduled_event_id,
                identity,
                request_id,
                attempt,
            } => {
                let ai = self.activity_mut(*scheduled_event_id)?;
                ai.version = event.version;
                ai.started_id = event.event_id;
                ai.started_time = Some(ts);
                ai.request_id = request_id.clone();
                ai.attempt = *attempt;
                ai.last_worker_identity = identity.clone();
            }

            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id,
                ..
            }
            | EventAttributes::ActivityTaskFailed {
                scheduled_event_id,
                ..
            }
            | EventAttributes::ActivityTaskTimedOut {
                scheduled_event_id,
                ..
            }
            | EventAttributes::ActivityTaskCanceled {
                scheduled_event_id,
                ..
            } => {
                self.pending_activities.remove(scheduled_event_id);
            }

            EventAttributes::ActivityTaskCancelRequested { activity_id, .. } => {
                let schedule_id = self
                    .activity_by_id(activity_id)
                    .map(|ai| ai.schedule_id)
                    .ok_or_else(|| HistoryError::entity_not_found("activity", activity_id.clone()))?;
                let ai = self.activity_mut(schedule_id)?;
                ai.version = event.version;
                ai.cancel_requested = true;
                ai.cancel_request_id = event.event_id;
            }

            EventAttributes::TimerStarted {
                timer_id,
                start_to_fire_timeout_seconds,
                ..
            } => {
                self.pending_timers.insert(
                    timer_id.clone(),
                    TimerInfo {
                        version: event.version,
                        timer_id: timer_id.clone(),
                        started_id: event.event_id,
                        expiry_time: fire_time(ts, *start_to_fire_timeout_seconds),
                    },
                );
            }

            EventAttributes::TimerFired { timer_id, .. }
            | EventAttributes::TimerCanceled { timer_id, .. } => {
                self.pending_timers.remove(timer_id);
            }

            EventAttributes::WorkflowExecutionCompleted { .. } => {
                self.close(event, CloseStatus::Completed)
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                self.close(event, CloseStatus::Failed)
            }
            EventAttributes::WorkflowExecutionTimedOut { .. } => {
                self.close(event, CloseStatus::TimedOut)
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                self.close(event, CloseStatus::Terminated)
            }
            EventAttributes::WorkflowExecutionCanceled { .. } => {
                self.close(event, CloseStatus::Canceled)
            }
            EventAttributes::WorkflowExecutionContinuedAsNew(_) => {
                self.close(event, CloseStatus::ContinuedAsNew)
            }

            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                self.execution_info.cancel_requested = true;
            }

            EventAttributes::WorkflowExecutionSignaled { .. } => {
                self.execution_info.signal_count += 1;
            }

            EventAttributes::StartChildWorkflowExecutionInitiated(attrs) => {
                self.pending_children.insert(
                    event.event_id,
                    ChildExecutionInfo {
                        version: event.version,
                        initiated_id: event.event_id,
                        started_id: EMPTY_EVENT_ID,
                        domain: attrs.domain.clone(),
                        workflow_id: attrs.workflow_id.clone(),
                        run_id: String::new(),
                        workflow_type: attrs.workflow_type.clone(),
                        create_request_id: uuid::Uuid::new_v4().to_string(),
                    },
                );
            }

            EventAttributes::StartChildWorkflowExecutionFailed {
                initiated_event_id, ..
            } => {
                self.pending_children.remove(initiated_event_id);
            }

            EventAttributes::ChildWorkflowExecutionStarted {
                initiated_event_id,
                workflow_execution,
                ..
            } => {
                let ci = self
                    .pending_children
                    .get_mut(initiated_event_id)
                    .ok_or_else(|| {
                        HistoryError::entity_not_found("child execution", initiated_event_id.to_string())
                    })?;
                ci.version = event.version;
                ci.started_id = event.event_id;
                ci.run_id = workflow_execution.run_id.clone();
            }

            EventAttributes::ChildWorkflowExecutionCompleted(attrs)
            | EventAttributes::ChildWorkflowExecutionFailed(attrs)
            | EventAttributes::ChildWorkflowExecutionCanceled(attrs)
            | EventAttributes::ChildWorkflowExecutionTimedOut(attrs)
            | EventAttributes::ChildWorkflowExecutionTerminated(attrs) => {
                self.pending_children.remove(&attrs.initiated_event_id);
            }

            EventAttributes::SignalExternalWorkflowExecutionInitiated {
                domain,
                workflow_execution,
                signal_name,
                ..
            } => {
                self.pending_signals.insert(
                    event.event_id,
                    SignalInfo {
                        version: event.version,
                        initiated_id: event.event_id,
                        request_id: uuid::Uuid::new_v4().to_string(),
                        signal_name: signal_name.clone(),
                        domain: domain.clone(),
                        execution: workflow_execution.clone(),
                    },
                );
            }

            EventAttributes::SignalExternalWorkflowExecutionFailed {
                initiated_event_id, ..
            }
            | EventAttributes::ExternalWorkflowExecutionSignaled {
                initiated_event_id, ..
            } => {
                self.pending_signals.remove(initiated_event_id);
            }

            EventAttributes::UpsertWorkflowSearchAttributes {
                search_attributes, ..
            } => {
                for (key, value) in search_attributes {
                    self.execution_info
                        .search_attributes
                        .insert(key.clone(), value.clone());
                }
            }

            EventAttributes::RequestCancelActivityTaskFailed { .. }
            | EventAttributes::StartTimerFailed { .. }
            | EventAttributes::CancelTimerFailed { .. }
            | EventAttributes::MarkerRecorded { .. } => {}
        }
        Ok(())
    }

    fn close(&mut self, event: &HistoryEvent, status: CloseStatus) {
        let info = &mut self.execution_info;
        info.state = WorkflowState::Completed;
        info.close_status = status;
        info.close_time = Some(event.timestamp);
        info.completion_event = Some(event.clone());
        info.decision = DecisionInfo::default();
    }

    pub(crate) fn activity_mut(&mut self, schedule_id: i64) -> Result<&mut ActivityInfo> {
        self.pending_activities
            .get_mut(&schedule_id)
            .ok_or_else(|| HistoryError::entity_not_found("activity", schedule_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::started_state;
    use super::*;
    use crate::events::ActivityTaskScheduledAttributes;
    use crate::types::{Payload, TaskList};
    use chrono::Utc;

    fn event(ms: &MutableState, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id: ms.next_event_id(),
            version: 1,
            task_id: 0,
            timestamp: Utc::now(),
            attributes,
        }
    }

    #[test]
    fn test_activity_lifecycle() {
        let mut ms = started_state("wf");
        let scheduled = event(
            &ms,
            EventAttributes::ActivityTaskScheduled(ActivityTaskScheduledAttributes {
                activity_id: "a1".into(),
                activity_type: "charge".into(),
                task_list: TaskList::normal("tl"),
                ..Default::default()
            }),
        );
        ms.replay_event(&scheduled).unwrap();
        assert!(ms.pending_activities.contains_key(&3));
        assert_eq!(ms.activity_by_id("a1").unwrap().schedule_id, 3);

        let started = event(
            &ms,
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id: 3,
                identity: "worker".into(),
                request_id: "r".into(),
                attempt: 0,
            },
        );
        ms.replay_event(&started).unwrap();
        assert!(ms.pending_activities[&3].is_started());

        let completed = event(
            &ms,
            EventAttributes::ActivityTaskCompleted {
                result: Some(Payload::from_text("ok")),
                scheduled_event_id: 3,
                started_event_id: 4,
                identity: "worker".into(),
            },
        );
        ms.replay_event(&completed).unwrap();
        assert!(ms.pending_activities.is_empty());
        assert_eq!(ms.next_event_id(), 6);
    }

    #[test]
    fn test_close_event_clears_decision() {
        let mut ms = started_state("wf");
        let terminated = event(
            &ms,
            EventAttributes::WorkflowExecutionTerminated {
                reason: "ops".into(),
                details: None,
                identity: "admin".into(),
            },
        );
        ms.replay_event(&terminated).unwrap();
        assert!(!ms.is_running());
        assert!(!ms.has_pending_decision());
        assert_eq!(ms.execution_info.close_status, CloseStatus::Terminated);
        assert_eq!(ms.execution_info.completion_event, Some(terminated));
    }

    #[test]
    fn test_decision_started_for_wrong_schedule_rejected() {
        let mut ms = started_state("wf");
        let started = event(
            &ms,
            EventAttributes::DecisionTaskStarted {
                scheduled_event_id: 99,
                identity: "w".into(),
                request_id: "r".into(),
            },
        );
        assert!(ms.apply_event(&started).is_err());
    }
}
