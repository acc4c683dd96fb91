// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History event notifications for long pollers.
//!
//! Each run with at least one waiting poller has a `watch` channel. Writers
//! publish the run's new position with [`HistoryEventNotifier::notify`],
//! which never blocks and is a no-op when nobody is waiting. A
//! [`Subscription`] removes the channel when the last subscriber drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::trace;

use crate::state::MutableState;
use crate::types::WorkflowKey;

/// New position of a run after a committed write.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEventNotification {
    /// The run.
    pub key: WorkflowKey,
    /// First event id of the last batch.
    pub last_first_event_id: i64,
    /// Next event id.
    pub next_event_id: i64,
    /// Started event id of the last completed decision.
    pub previous_started_event_id: i64,
    /// Whether the run is still open.
    pub is_workflow_running: bool,
    /// Current branch.
    pub current_branch_token: String,
    /// When the notification was produced.
    pub timestamp: DateTime<Utc>,
}

impl HistoryEventNotification {
    /// Notification describing `ms`.
    pub fn from_state(ms: &MutableState) -> Self {
        Self {
            key: ms.key(),
            last_first_event_id: ms.execution_info.last_first_event_id,
            next_event_id: ms.next_event_id(),
            previous_started_event_id: ms.execution_info.last_processed_event_id,
            is_workflow_running: ms.is_running(),
            current_branch_token: ms.current_branch_token().unwrap_or_default(),
            timestamp: Utc::now(),
        }
    }
}

type Notification = Option<HistoryEventNotification>;

struct Watcher {
    sender: watch::Sender<Notification>,
    subscribers: usize,
}

type Watchers = Arc<Mutex<HashMap<WorkflowKey, Watcher>>>;

/// Fan-out of history notifications to pollers.
#[derive(Clone, Default)]
pub struct HistoryEventNotifier {
    watchers: Watchers,
}

impl std::fmt::Debug for HistoryEventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEventNotifier")
            .field("watched_runs", &self.watched_runs())
            .finish()
    }
}

impl HistoryEventNotifier {
    /// Notifier with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `key`. Subscribe before reading state so a write
    /// between the read and the wait is not missed.
    pub fn subscribe(&self, key: &WorkflowKey) -> Subscription {
        let mut watchers = lock(&self.watchers);
        let watcher = watchers.entry(key.clone()).or_insert_with(|| Watcher {
            sender: watch::channel(None).0,
            subscribers: 0,
        });
        watcher.subscribers += 1;
        Subscription {
            key: key.clone(),
            receiver: watcher.sender.subscribe(),
            watchers: self.watchers.clone(),
        }
    }

    /// Publish a run's new position. Never blocks.
    pub fn notify(&self, notification: HistoryEventNotification) {
        let watchers = lock(&self.watchers);
        if let Some(watcher) = watchers.get(&notification.key) {
            trace!(
                workflow_id = %notification.key.workflow_id,
                next_event_id = notification.next_event_id,
                "Notifying pollers"
            );
            watcher.sender.send_replace(Some(notification));
        }
    }

    /// Number of runs with waiting pollers.
    pub fn watched_runs(&self) -> usize {
        lock(&self.watchers).len()
    }
}

// Critical sections never panic, so a poisoned map is still consistent.
fn lock(watchers: &Watchers) -> std::sync::MutexGuard<'_, HashMap<WorkflowKey, Watcher>> {
    watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A poller's interest in one run.
pub struct Subscription {
    key: WorkflowKey,
    receiver: watch::Receiver<Notification>,
    watchers: Watchers,
}

impl Subscription {
    /// Wait for the next notification.
    ///
    /// Returns `None` if the channel closed, which only happens when the
    /// notifier itself is gone.
    pub async fn changed(&mut self) -> Option<HistoryEventNotification> {
        self.receiver.changed().await.ok()?;
        self.receiver.borrow_and_update().clone()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut watchers = lock(&self.watchers);
        if let Some(watcher) = watchers.get_mut(&self.key) {
            watcher.subscribers = watcher.subscribers.saturating_sub(1);
            if watcher.subscribers == 0 {
                watchers.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn notification(key: &WorkflowKey, next_event_id: i64) -> HistoryEventNotification {
        HistoryEventNotification {
            key: key.clone(),
            last_first_event_id: 1,
            next_event_id,
            previous_started_event_id: 0,
            is_workflow_running: true,
            current_branch_token: "branch-1".into(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_notification() {
        let notifier = HistoryEventNotifier::new();
        let key = WorkflowKey::new("d", "wf", "r");
        let mut sub = notifier.subscribe(&key);

        let publisher = notifier.clone();
        let published = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.notify(notification(&published, 5));
        });

        let received = tokio::time::timeout(Duration::from_secs(5), sub.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.next_event_id, 5);
    }

    #[tokio::test]
    async fn test_notify_without_subscribers_is_noop() {
        let notifier = HistoryEventNotifier::new();
        let key = WorkflowKey::new("d", "wf", "r");
        notifier.notify(notification(&key, 3));
        assert_eq!(notifier.watched_runs(), 0);
    }

    #[tokio::test]
    async fn test_last_drop_removes_watcher() {
        let notifier = HistoryEventNotifier::new();
        let key = WorkflowKey::new("d", "wf", "r");
        let a = notifier.subscribe(&key);
        let b = notifier.subscribe(&key);
        assert_eq!(notifier.watched_runs(), 1);
        drop(a);
        assert_eq!(notifier.watched_runs(), 1);
        drop(b);
        assert_eq!(notifier.watched_runs(), 0);
    }
}
