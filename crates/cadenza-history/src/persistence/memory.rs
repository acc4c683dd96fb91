// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory execution store.
//!
//! Every operation takes one lock and validates all conditions before
//! changing anything, so a failed write leaves no partial state behind.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CreateMode, CreateWorkflowRequest, CurrentExecution, ExecutionStore, PersistedExecution,
    PersistenceError, ShardInfo, UpdateMode, UpdateWorkflowRequest, WorkflowSnapshot,
};
use crate::events::HistoryEvent;
use crate::replication::ReplicationTaskInfo;
use crate::tasks::{Task, TaskCategory};
use crate::types::{FIRST_EVENT_ID, WorkflowKey};

type CurrentKey = (i32, String, String);

#[derive(Default)]
struct Inner {
    shards: HashMap<i32, ShardInfo>,
    executions: HashMap<(i32, WorkflowKey), PersistedExecution>,
    current: HashMap<CurrentKey, CurrentExecution>,
    branches: HashMap<(i32, String), Vec<HistoryEvent>>,
    tasks: HashMap<(i32, TaskCategory), BTreeMap<i64, Task>>,
    dlq: HashMap<(i32, String), BTreeMap<i64, ReplicationTaskInfo>>,
}

impl Inner {
    fn check_range(&self, shard_id: i32, range_id: i64) -> Result<(), PersistenceError> {
        match self.shards.get(&shard_id) {
            Some(shard) if shard.range_id == range_id => Ok(()),
            Some(shard) => Err(PersistenceError::ShardOwnershipLost {
                shard_id,
                details: format!("range {} is now {}", range_id, shard.range_id),
            }),
            None => Err(PersistenceError::ShardOwnershipLost {
                shard_id,
                details: "shard record missing".to_string(),
            }),
        }
    }

    fn check_append(
        &self,
        shard_id: i32,
        branch_token: &str,
        events: &[HistoryEvent],
    ) -> Result<(), PersistenceError> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let expected = self
            .branches
            .get(&(shard_id, branch_token.to_string()))
            .and_then(|events| events.last())
            .map(|e| e.event_id + 1)
            .unwrap_or(FIRST_EVENT_ID);
        let contiguous = events
            .windows(2)
            .all(|pair| pair[1].event_id == pair[0].event_id + 1);
        if first.event_id != expected || !contiguous {
            return Err(PersistenceError::HistoryGap {
                branch_token: branch_token.to_string(),
                expected,
                actual: first.event_id,
            });
        }
        Ok(())
    }

    fn append(&mut self, shard_id: i32, branch_token: &str, events: &[HistoryEvent]) {
        self.branches
            .entry((shard_id, branch_token.to_string()))
            .or_default()
            .extend(events.iter().cloned());
    }

    fn enqueue(&mut self, shard_id: i32, tasks: &[Task]) {
        for task in tasks {
            self.tasks
                .entry((shard_id, task.category()))
                .or_default()
                .insert(task.task_id, task.clone());
        }
    }

    fn check_snapshot(&self, shard_id: i32, snapshot: &WorkflowSnapshot) -> Result<(), PersistenceError> {
        let key = snapshot.state.key();
        if self.executions.contains_key(&(shard_id, key.clone())) {
            return Err(PersistenceError::ConditionFailed(format!(
                "execution {} already exists",
                key
            )));
        }
        let branch = snapshot.state.current_branch_token().map_err(|e| {
            PersistenceError::Database {
                operation: "branch_token".to_string(),
                details: e.to_string(),
            }
        })?;
        self.check_append(shard_id, &branch, &snapshot.events)
    }

    fn write_snapshot(&mut self, shard_id: i32, snapshot: WorkflowSnapshot) {
        let branch = snapshot
            .state
            .current_branch_token()
            .unwrap_or_default();
        self.append(shard_id, &branch, &snapshot.events);
        self.enqueue(shard_id, &snapshot.tasks);
        self.executions.insert(
            (shard_id, snapshot.state.key()),
            PersistedExecution {
                state: snapshot.state,
                db_version: snapshot.db_version,
            },
        );
    }
}

fn current_key(shard_id: i32, key: &WorkflowKey) -> CurrentKey {
    (shard_id, key.domain_id.clone(), key.workflow_id.clone())
}

/// Execution store kept in process memory.
#[derive(Default)]
pub struct InMemoryExecutionStore {
    inner: Mutex<Inner>,
}

impl InMemoryExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, PersistenceError> {
        self.inner.lock().map_err(|e| PersistenceError::Database {
            operation: "lock".to_string(),
            details: e.to_string(),
        })
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn get_or_create_shard(
        &self,
        shard_id: i32,
        owner: &str,
    ) -> Result<ShardInfo, PersistenceError> {
        let mut inner = self.lock()?;
        let shard = inner.shards.entry(shard_id).or_insert_with(|| ShardInfo {
            shard_id,
            owner: owner.to_string(),
            updated_at: Utc::now(),
            ..ShardInfo::default()
        });
        Ok(shard.clone())
    }

    async fn update_shard(
        &self,
        shard: &ShardInfo,
        previous_range_id: i64,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        inner.check_range(shard.shard_id, previous_range_id)?;
        inner.shards.insert(shard.shard_id, shard.clone());
        Ok(())
    }

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        let shard_id = request.shard_id;
        inner.check_range(shard_id, request.range_id)?;

        let key = request.snapshot.state.key();
        let pointer_key = current_key(shard_id, &key);
        match &request.mode {
            CreateMode::BrandNew => {
                if let Some(current) = inner.current.get(&pointer_key) {
                    return Err(PersistenceError::WorkflowAlreadyStarted(Box::new(
                        current.clone(),
                    )));
                }
            }
            CreateMode::WorkflowIdReuse {
                previous_run_id,
                previous_last_write_version,
            } => match inner.current.get(&pointer_key) {
                Some(current)
                    if current.run_id == *previous_run_id
                        && current.last_write_version == *previous_last_write_version => {}
                other => {
                    return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                        "expected current run {}, found {:?}",
                        previous_run_id,
                        other.map(|c| c.run_id.clone())
                    )));
                }
            },
            CreateMode::Zombie => {}
        }
        inner.check_snapshot(shard_id, &request.snapshot)?;

        if request.mode != CreateMode::Zombie {
            inner
                .current
                .insert(pointer_key, CurrentExecution::from_state(&request.snapshot.state));
        }
        inner.write_snapshot(shard_id, request.snapshot);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        key: &WorkflowKey,
    ) -> Result<Option<PersistedExecution>, PersistenceError> {
        let inner = self.lock()?;
        Ok(inner.executions.get(&(shard_id, key.clone())).cloned())
    }

    async fn get_current_execution(
        &self,
        shard_id: i32,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<Option<CurrentExecution>, PersistenceError> {
        let inner = self.lock()?;
        Ok(inner
            .current
            .get(&(shard_id, domain_id.to_string(), workflow_id.to_string()))
            .cloned())
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowRequest,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        let shard_id = request.shard_id;
        inner.check_range(shard_id, request.range_id)?;

        // 1. Validate the conditional write
        let mutation = request.mutation;
        let key = mutation.state.key();
        let stored = inner
            .executions
            .get(&(shard_id, key.clone()))
            .ok_or_else(|| PersistenceError::NotFound(format!("execution {}", key)))?;
        if stored.db_version != mutation.expected_db_version {
            return Err(PersistenceError::ConditionFailed(format!(
                "execution {} is at db_version {}, expected {}",
                key, stored.db_version, mutation.expected_db_version
            )));
        }

        let pointer_key = current_key(shard_id, &key);
        if request.mode == UpdateMode::UpdateCurrent {
            let current_run = inner.current.get(&pointer_key).map(|c| c.run_id.as_str());
            if current_run != Some(key.run_id.as_str()) {
                return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                    "run {} is not current",
                    key.run_id
                )));
            }
        }

        let branch = mutation.state.current_branch_token().map_err(|e| {
            PersistenceError::Database {
                operation: "branch_token".to_string(),
                details: e.to_string(),
            }
        })?;
        inner.check_append(shard_id, &branch, &mutation.events)?;
        if let Some(new_run) = &request.new_run {
            inner.check_snapshot(shard_id, new_run)?;
        }

        // 2. Apply
        inner.append(shard_id, &branch, &mutation.events);
        inner.enqueue(shard_id, &mutation.tasks);
        if request.mode == UpdateMode::UpdateCurrent {
            let pointer = match &request.new_run {
                Some(new_run) => CurrentExecution::from_state(&new_run.state),
                None => CurrentExecution::from_state(&mutation.state),
            };
            inner.current.insert(pointer_key, pointer);
        }
        inner.executions.insert(
            (shard_id, key),
            PersistedExecution {
                state: mutation.state,
                db_version: mutation.expected_db_version + 1,
            },
        );
        if let Some(new_run) = request.new_run {
            inner.write_snapshot(shard_id, new_run);
        }
        Ok(())
    }

    async fn append_history_events(
        &self,
        shard_id: i32,
        branch_token: &str,
        events: &[HistoryEvent],
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        inner.check_append(shard_id, branch_token, events)?;
        inner.append(shard_id, branch_token, events);
        Ok(())
    }

    async fn read_history_events(
        &self,
        shard_id: i32,
        branch_token: &str,
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, PersistenceError> {
        let inner = self.lock()?;
        Ok(inner
            .branches
            .get(&(shard_id, branch_token.to_string()))
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.event_id >= min_event_id && e.event_id < max_event_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fork_history_branch(
        &self,
        shard_id: i32,
        source_branch: &str,
        fork_event_id: i64,
        new_branch: &str,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        let new_key = (shard_id, new_branch.to_string());
        if inner.branches.contains_key(&new_key) {
            return Err(PersistenceError::ConditionFailed(format!(
                "branch {} already exists",
                new_branch
            )));
        }
        let source = inner
            .branches
            .get(&(shard_id, source_branch.to_string()))
            .ok_or_else(|| PersistenceError::NotFound(format!("branch {}", source_branch)))?;
        let forked: Vec<HistoryEvent> = source
            .iter()
            .filter(|e| e.event_id <= fork_event_id)
            .cloned()
            .collect();
        if forked.last().map(|e| e.event_id) != Some(fork_event_id) {
            return Err(PersistenceError::NotFound(format!(
                "event {} on branch {}",
                fork_event_id, source_branch
            )));
        }
        inner.branches.insert(new_key, forked);
        Ok(())
    }

    async fn get_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        min_task_id: i64,
        max_task_id: i64,
        batch_size: usize,
    ) -> Result<Vec<Task>, PersistenceError> {
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .get(&(shard_id, category))
            .map(|tasks| {
                tasks
                    .range(min_task_id + 1..=max_task_id)
                    .take(batch_size)
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_timer_tasks(
        &self,
        shard_id: i32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<Task>, PersistenceError> {
        let inner = self.lock()?;
        let mut due: Vec<Task> = inner
            .tasks
            .get(&(shard_id, TaskCategory::Timer))
            .map(|tasks| {
                tasks
                    .values()
                    .filter(|t| t.visibility_time >= min_time && t.visibility_time < max_time)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        due.sort_by_key(|t| (t.visibility_time, t.task_id));
        due.truncate(batch_size);
        Ok(due)
    }

    async fn range_complete_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        min_task_id: i64,
        max_task_id: i64,
    ) -> Result<u64, PersistenceError> {
        let mut inner = self.lock()?;
        let Some(tasks) = inner.tasks.get_mut(&(shard_id, category)) else {
            return Ok(0);
        };
        let before = tasks.len();
        tasks.retain(|id, _| *id <= min_task_id || *id > max_task_id);
        Ok((before - tasks.len()) as u64)
    }

    async fn put_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        task: &ReplicationTaskInfo,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        inner
            .dlq
            .entry((shard_id, source_cluster.to_string()))
            .or_default()
            .insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        min_task_id: i64,
        max_task_id: i64,
        page_size: usize,
    ) -> Result<Vec<ReplicationTaskInfo>, PersistenceError> {
        let inner = self.lock()?;
        Ok(inner
            .dlq
            .get(&(shard_id, source_cluster.to_string()))
            .map(|tasks| {
                tasks
                    .range(min_task_id + 1..=max_task_id)
                    .take(page_size)
                    .map(|(_, task)| task.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn range_delete_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        min_task_id: i64,
        max_task_id: i64,
    ) -> Result<u64, PersistenceError> {
        let mut inner = self.lock()?;
        let Some(tasks) = inner.dlq.get_mut(&(shard_id, source_cluster.to_string())) else {
            return Ok(0);
        };
        let before = tasks.len();
        tasks.retain(|id, _| *id <= min_task_id || *id > max_task_id);
        Ok((before - tasks.len()) as u64)
    }

    async fn delete_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        task_id: i64,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.lock()?;
        if let Some(tasks) = inner.dlq.get_mut(&(shard_id, source_cluster.to_string())) {
            tasks.remove(&task_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::test_support::started_state_with_history;
    use crate::tasks::TaskKind;

    async fn store_with_shard() -> (InMemoryExecutionStore, ShardInfo) {
        let store = InMemoryExecutionStore::new();
        let shard = store.get_or_create_shard(1, "host-a").await.unwrap();
        (store, shard)
    }

    fn task(key: &WorkflowKey, task_id: i64, kind: TaskKind) -> Task {
        Task {
            key: key.clone(),
            task_id,
            visibility_time: Utc::now(),
            version: 1,
            kind,
        }
    }

    async fn create(store: &InMemoryExecutionStore, workflow_id: &str) -> WorkflowKey {
        let (ms, events) = started_state_with_history(workflow_id);
        let key = ms.key();
        store
            .create_workflow_execution(CreateWorkflowRequest {
                shard_id: 1,
                range_id: 0,
                mode: CreateMode::BrandNew,
                snapshot: WorkflowSnapshot {
                    state: ms,
                    db_version: 1,
                    events,
                    tasks: vec![task(&key, 1, TaskKind::RecordWorkflowStarted)],
                },
            })
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn test_create_and_duplicate_start() {
        let (store, _) = store_with_shard().await;
        let key = create(&store, "wf").await;

        let current = store
            .get_current_execution(1, &key.domain_id, &key.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.run_id, "run-1");
        assert!(current.is_running());

        let (mut ms, events) = started_state_with_history("wf");
        ms.execution_info.run_id = "run-2".into();
        let err = store
            .create_workflow_execution(CreateWorkflowRequest {
                shard_id: 1,
                range_id: 0,
                mode: CreateMode::BrandNew,
                snapshot: WorkflowSnapshot {
                    state: ms,
                    db_version: 1,
                    events,
                    tasks: Vec::new(),
                },
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::WorkflowAlreadyStarted(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_db_version_rejected() {
        let (store, _) = store_with_shard().await;
        let key = create(&store, "wf").await;
        let loaded = store.get_workflow_execution(1, &key).await.unwrap().unwrap();

        let update = |expected| UpdateWorkflowRequest {
            shard_id: 1,
            range_id: 0,
            mode: UpdateMode::UpdateCurrent,
            mutation: super::super::WorkflowMutation {
                state: loaded.state.clone(),
                expected_db_version: expected,
                events: Vec::new(),
                tasks: Vec::new(),
            },
            new_run: None,
        };
        // Two writers that loaded the same version race; exactly one lands
        let (first, second) = futures::future::join(
            store.update_workflow_execution(update(1)),
            store.update_workflow_execution(update(1)),
        )
        .await;
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(PersistenceError::ConditionFailed(_))))
                .count(),
            1
        );
        assert_eq!(
            store.get_workflow_execution(1, &key).await.unwrap().unwrap().db_version,
            2
        );
    }

    #[tokio::test]
    async fn test_range_check() {
        let (store, mut shard) = store_with_shard().await;
        shard.range_id = 1;
        store.update_shard(&shard, 0).await.unwrap();
        let err = store.update_shard(&shard, 0).await.unwrap_err();
        assert!(matches!(err, PersistenceError::ShardOwnershipLost { shard_id: 1, .. }));
    }

    #[tokio::test]
    async fn test_history_gap_and_fork() {
        let (store, _) = store_with_shard().await;
        let (_, events) = started_state_with_history("wf");
        store.append_history_events(1, "b1", &events).await.unwrap();

        let err = store.append_history_events(1, "b1", &events).await.unwrap_err();
        assert!(matches!(err, PersistenceError::HistoryGap { expected: 3, actual: 1, .. }));

        store.fork_history_branch(1, "b1", 1, "b2").await.unwrap();
        let forked = store.read_history_events(1, "b2", 1, i64::MAX).await.unwrap();
        assert_eq!(forked.len(), 1);
        store.append_history_events(1, "b2", &events[1..]).await.unwrap();
    }

    #[tokio::test]
    async fn test_task_ranges() {
        let (store, _) = store_with_shard().await;
        let key = create(&store, "wf").await;
        let tasks = store
            .get_tasks(1, TaskCategory::Transfer, 0, i64::MAX, 10)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].key, key);

        let removed = store
            .range_complete_tasks(1, TaskCategory::Transfer, 0, 1)
            .await
            .unwrap();
        assert_eq!(removed, 1);
    }
}
