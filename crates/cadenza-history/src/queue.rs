// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wake-ups for task queue consumers.
//!
//! Writers call [`TaskNotifier::notify_new_tasks`] after committing; queue
//! consumers wait on [`TaskNotifier::wait_for_new_tasks`]. Notifications
//! are `Notify` permits, so a write that happens while nobody waits still
//! wakes the next waiter, and writers never block.

use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::Notify;

use crate::tasks::{Task, TaskCategory};

#[derive(Debug, Default)]
struct QueueSignal {
    notify: Notify,
    high_water_mark: AtomicI64,
}

/// Per-category wake-ups and high-water marks.
#[derive(Debug, Default)]
pub struct TaskNotifier {
    transfer: QueueSignal,
    timer: QueueSignal,
    replication: QueueSignal,
}

impl TaskNotifier {
    /// Notifier with nothing queued.
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self, category: TaskCategory) -> &QueueSignal {
        match category {
            TaskCategory::Transfer => &self.transfer,
            TaskCategory::Timer => &self.timer,
            TaskCategory::Replication => &self.replication,
        }
    }

    /// Record committed tasks of any category and wake their consumers.
    pub fn notify_new_tasks(&self, tasks: &[Task]) {
        for category in TaskCategory::ALL {
            let highest = tasks
                .iter()
                .filter(|t| t.category() == category)
                .map(|t| t.task_id)
                .max();
            if let Some(highest) = highest {
                self.notify(category, highest);
            }
        }
    }

    /// Wake consumers of `category`, e.g. after a remote clock moved.
    pub fn poke(&self, category: TaskCategory) {
        self.signal(category).notify.notify_one();
    }

    fn notify(&self, category: TaskCategory, task_id: i64) {
        let signal = self.signal(category);
        signal.high_water_mark.fetch_max(task_id, Ordering::SeqCst);
        signal.notify.notify_one();
    }

    /// Wait until tasks of `category` are committed (or a poke arrives).
    pub async fn wait_for_new_tasks(&self, category: TaskCategory) {
        self.signal(category).notify.notified().await;
    }

    /// Highest task id of `category` seen so far.
    pub fn high_water_mark(&self, category: TaskCategory) -> i64 {
        self.signal(category).high_water_mark.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskKind;
    use crate::types::WorkflowKey;
    use chrono::Utc;
    use std::time::Duration;

    fn task(task_id: i64, kind: TaskKind) -> Task {
        Task {
            key: WorkflowKey::new("d", "wf", "r"),
            task_id,
            visibility_time: Utc::now(),
            version: 1,
            kind,
        }
    }

    #[tokio::test]
    async fn test_notification_before_wait_is_kept() {
        let notifier = TaskNotifier::new();
        notifier.notify_new_tasks(&[
            task(7, TaskKind::RecordWorkflowStarted),
            task(9, TaskKind::WorkflowTimeout),
        ]);

        tokio::time::timeout(
            Duration::from_secs(1),
            notifier.wait_for_new_tasks(TaskCategory::Transfer),
        )
        .await
        .expect("permit should be stored");
        assert_eq!(notifier.high_water_mark(TaskCategory::Transfer), 7);
        assert_eq!(notifier.high_water_mark(TaskCategory::Timer), 9);
        assert_eq!(notifier.high_water_mark(TaskCategory::Replication), 0);
    }

    #[tokio::test]
    async fn test_high_water_mark_never_decreases() {
        let notifier = TaskNotifier::new();
        notifier.notify_new_tasks(&[task(20, TaskKind::CloseExecution)]);
        notifier.notify_new_tasks(&[task(10, TaskKind::CloseExecution)]);
        assert_eq!(notifier.high_water_mark(TaskCategory::Transfer), 20);
    }
}
