// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer and timer tasks implied by events.

use chrono::{DateTime, Duration, Utc};

use super::MutableState;
use crate::events::{EventAttributes, HistoryEvent};
use crate::tasks::{PendingTask, TaskKind};
use crate::types::TimeoutType;

/// Tasks that `event`, already applied to `ms`, requires.
pub fn tasks_for_event(ms: &MutableState, event: &HistoryEvent) -> Vec<PendingTask> {
    let ts = event.timestamp;
    let info = &ms.execution_info;
    let mut tasks = Vec::new();

    match &event.attributes {
        EventAttributes::WorkflowExecutionStarted(attrs) => {
            tasks.push(PendingTask::now(TaskKind::RecordWorkflowStarted));
            if attrs.execution_start_to_close_timeout_seconds > 0 {
                let backoff = i64::from(attrs.first_decision_task_backoff_seconds);
                let timeout = i64::from(attrs.execution_start_to_close_timeout_seconds);
                tasks.push(PendingTask::at(
                    ts + Duration::seconds(backoff + timeout),
                    TaskKind::WorkflowTimeout,
                ));
            }
            if attrs.first_decision_task_backoff_seconds > 0 {
                tasks.push(PendingTask::at(
                    info.execution_time,
                    TaskKind::WorkflowBackoffTimer,
                ));
            }
        }

        EventAttributes::DecisionTaskScheduled {
            task_list, attempt, ..
        } => {
            tasks.push(PendingTask::now(TaskKind::DecisionTask {
                task_list: task_list.name.clone(),
                schedule_id: event.event_id,
            }));
            if info.sticky_task_list.as_deref() == Some(task_list.name.as_str())
                && info.sticky_schedule_to_start_timeout_seconds > 0
            {
                tasks.push(decision_timeout(
                    ts,
                    info.sticky_schedule_to_start_timeout_seconds,
                    event.event_id,
                    *attempt,
                    TimeoutType::ScheduleToStart,
                ));
            }
        }

        EventAttributes::DecisionTaskStarted {
            scheduled_event_id, ..
        } => {
            tasks.push(decision_timeout(
                ts,
                info.decision.timeout_seconds,
                *scheduled_event_id,
                info.decision.attempt,
                TimeoutType::StartToClose,
            ));
        }

        EventAttributes::ActivityTaskScheduled(attrs) => {
            tasks.push(PendingTask::now(TaskKind::ActivityTask {
                domain_id: info.domain_id.clone(),
                task_list: attrs.task_list.name.clone(),
                schedule_id: event.event_id,
            }));
            tasks.extend(activity_scheduled_timeouts(event.event_id, 0, ts, ms));
        }

        EventAttributes::ActivityTaskStarted {
            scheduled_event_id,
            attempt,
            ..
        } => {
            if let Some(ai) = ms.pending_activities.get(scheduled_event_id) {
                for (seconds, timeout_type) in [
                    (ai.scheduled.start_to_close_timeout_seconds, TimeoutType::StartToClose),
                    (ai.scheduled.heartbeat_timeout_seconds, TimeoutType::Heartbeat),
                ] {
                    if seconds > 0 {
                        tasks.push(activity_timeout(
                            ts,
                            seconds,
                            *scheduled_event_id,
                            *attempt,
                            timeout_type,
                        ));
                    }
                }
            }
        }

        EventAttributes::TimerStarted {
            start_to_fire_timeout_seconds,
            ..
        } => {
            tasks.push(PendingTask::at(
                super::fire_time(ts, *start_to_fire_timeout_seconds),
                TaskKind::UserTimer {
                    started_id: event.event_id,
                },
            ));
        }

        EventAttributes::StartChildWorkflowExecutionInitiated(attrs) => {
            tasks.push(PendingTask::now(TaskKind::StartChildExecution {
                target_domain_id: attrs.domain.clone(),
                target_workflow_id: attrs.workflow_id.clone(),
                initiated_id: event.event_id,
            }));
        }

        EventAttributes::SignalExternalWorkflowExecutionInitiated {
            domain,
            workflow_execution,
            ..
        } => {
            tasks.push(PendingTask::now(TaskKind::SignalExecution {
                target_domain_id: domain.clone(),
                target_workflow_id: workflow_execution.workflow_id.clone(),
                target_run_id: workflow_execution.run_id.clone(),
                initiated_id: event.event_id,
            }));
        }

        EventAttributes::UpsertWorkflowSearchAttributes { .. } => {
            tasks.push(PendingTask::now(TaskKind::UpsertWorkflowSearchAttributes));
        }

        attrs if attrs.is_workflow_close() => {
            tasks.push(PendingTask::now(TaskKind::CloseExecution));
            tasks.push(PendingTask::at(
                ts + Duration::seconds(info.retention_seconds),
                TaskKind::DeleteHistoryEvent,
            ));
        }

        _ => {}
    }
    tasks
}

/// Regenerate every outstanding transfer and timer task from state.
///
/// Used after a rebuild or on operator request; consumers already tolerate
/// duplicates.
pub fn refresh_tasks(ms: &MutableState) -> Vec<PendingTask> {
    let info = &ms.execution_info;
    let mut tasks = Vec::new();

    if !ms.is_running() {
        tasks.push(PendingTask::now(TaskKind::CloseExecution));
        let closed = info.close_time.unwrap_or(info.last_updated);
        tasks.push(PendingTask::at(
            closed + Duration::seconds(info.retention_seconds),
            TaskKind::DeleteHistoryEvent,
        ));
        return tasks;
    }

    tasks.push(PendingTask::now(TaskKind::RecordWorkflowStarted));
    if info.workflow_timeout_seconds > 0 {
        tasks.push(PendingTask::at(
            info.execution_time + Duration::seconds(i64::from(info.workflow_timeout_seconds)),
            TaskKind::WorkflowTimeout,
        ));
    }

    let decision = &info.decision;
    if ms.has_pending_decision() {
        if ms.has_inflight_decision() {
            let started = decision.started_time.unwrap_or(info.last_updated);
            tasks.push(decision_timeout(
                started,
                decision.timeout_seconds,
                decision.schedule_id,
                decision.attempt,
                TimeoutType::StartToClose,
            ));
        } else {
            tasks.push(PendingTask::now(TaskKind::DecisionTask {
                task_list: decision.task_list.clone(),
                schedule_id: decision.schedule_id,
            }));
        }
    }

    for ai in ms.pending_activities.values() {
        if ai.is_started() {
            let started = ai.started_time.unwrap_or(ai.scheduled_time);
            if ai.scheduled.start_to_close_timeout_seconds > 0 {
                tasks.push(activity_timeout(
                    started,
                    ai.scheduled.start_to_close_timeout_seconds,
                    ai.schedule_id,
                    ai.attempt,
                    TimeoutType::StartToClose,
                ));
            }
            if ai.scheduled.heartbeat_timeout_seconds > 0 {
                let last = ai.last_heartbeat_time.unwrap_or(started);
                tasks.push(activity_timeout(
                    last,
                    ai.scheduled.heartbeat_timeout_seconds,
                    ai.schedule_id,
                    ai.attempt,
                    TimeoutType::Heartbeat,
                ));
            }
        } else {
            tasks.push(PendingTask::now(TaskKind::ActivityTask {
                domain_id: info.domain_id.clone(),
                task_list: ai.scheduled.task_list.name.clone(),
                schedule_id: ai.schedule_id,
            }));
            tasks.extend(activity_scheduled_timeouts(
                ai.schedule_id,
                ai.attempt,
                ai.scheduled_time,
                ms,
            ));
        }
    }

    for timer in ms.pending_timers.values() {
        tasks.push(PendingTask::at(
            timer.expiry_time,
            TaskKind::UserTimer {
                started_id: timer.started_id,
            },
        ));
    }

    for child in ms.pending_children.values() {
        if child.run_id.is_empty() {
            tasks.push(PendingTask::now(TaskKind::StartChildExecution {
                target_domain_id: child.domain.clone(),
                target_workflow_id: child.workflow_id.clone(),
                initiated_id: child.initiated_id,
            }));
        }
    }

    for signal in ms.pending_signals.values() {
        tasks.push(PendingTask::now(TaskKind::SignalExecution {
            target_domain_id: signal.domain.clone(),
            target_workflow_id: signal.execution.workflow_id.clone(),
            target_run_id: signal.execution.run_id.clone(),
            initiated_id: signal.initiated_id,
        }));
    }

    tasks
}

/// Schedule-to-start and schedule-to-close timers of an activity attempt.
pub(crate) fn activity_scheduled_timeouts(
    schedule_id: i64,
    attempt: i32,
    scheduled: DateTime<Utc>,
    ms: &MutableState,
) -> Vec<PendingTask> {
    let Some(ai) = ms.pending_activities.get(&schedule_id) else {
        return Vec::new();
    };
    let mut tasks = Vec::new();
    if ai.scheduled.schedule_to_start_timeout_seconds > 0 {
        tasks.push(activity_timeout(
            scheduled,
            ai.scheduled.schedule_to_start_timeout_seconds,
            schedule_id,
            attempt,
            TimeoutType::ScheduleToStart,
        ));
    }
    // Retried attempts share the first attempt's schedule-to-close deadline.
    if attempt == 0 && ai.scheduled.schedule_to_close_timeout_seconds > 0 {
        tasks.push(activity_timeout(
            scheduled,
            ai.scheduled.schedule_to_close_timeout_seconds,
            schedule_id,
            attempt,
            TimeoutType::ScheduleToClose,
        ));
    }
    tasks
}

pub(crate) fn activity_timeout(
    from: DateTime<Utc>,
    seconds: i32,
    schedule_id: i64,
    attempt: i32,
    timeout_type: TimeoutType,
) -> PendingTask {
    PendingTask::at(
        from + Duration::seconds(i64::from(seconds)),
        TaskKind::ActivityTimeout {
            schedule_id,
            attempt,
            timeout_type,
        },
    )
}

fn decision_timeout(
    from: DateTime<Utc>,
    seconds: i32,
    schedule_id: i64,
    attempt: i64,
    timeout_type: TimeoutType,
) -> PendingTask {
    PendingTask::at(
        from + Duration::seconds(i64::from(seconds)),
        TaskKind::DecisionTimeout {
            schedule_id,
            attempt,
            timeout_type,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::super::test_support::started_state;
    use super::*;

    #[test]
    fn test_refresh_running_workflow() {
        let ms = started_state("wf");
        let tasks = refresh_tasks(&ms);
        assert!(tasks
            .iter()
            .any(|t| matches!(t.kind, TaskKind::DecisionTask { schedule_id: 2, .. })));
        assert!(tasks.iter().any(|t| t.kind == TaskKind::WorkflowTimeout));
        assert!(!tasks.iter().any(|t| t.kind == TaskKind::CloseExecution));
    }

    #[test]
    fn test_refresh_inflight_decision_arms_timeout() {
        let mut ms = started_state("wf");
        ms.start_transaction(1, false);
        ms.add_decision_task_started(2, "poll", "worker").unwrap();
        ms.close_transaction().unwrap();

        let tasks = refresh_tasks(&ms);
        assert!(tasks.iter().any(|t| matches!(
            t.kind,
            TaskKind::DecisionTimeout {
                schedule_id: 2,
                timeout_type: TimeoutType::StartToClose,
                ..
            }
        )));
        assert!(!tasks
            .iter()
            .any(|t| matches!(t.kind, TaskKind::DecisionTask { .. })));
    }
}
