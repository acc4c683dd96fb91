// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard context.
//!
//! A [`ShardContext`] is this host's claim on one shard. Acquiring it bumps
//! the shard's `range_id`, which fences out the previous owner: every store
//! write carries the range it was issued under and fails once the range
//! moved.
//!
//! Task ids come from the owned range, `[range_id << bits, (range_id + 1) <<
//! bits)`. When a range runs out it is renewed with another conditional
//! shard update. Writes go through the context so that id allocation and
//! the write itself happen under one lock: ids reach the store in
//! increasing order and `max_read_level` never runs ahead of a committed
//! task.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ClusterMetadata, EngineConfig};
use crate::error::{HistoryError, Result};
use crate::events::HistoryEvent;
use crate::persistence::{
    CreateMode, CreateWorkflowRequest, ExecutionStore, PersistenceError, ShardInfo, UpdateMode,
    UpdateWorkflowRequest, WorkflowMutation, WorkflowSnapshot,
};
use crate::state::MutableState;
use crate::tasks::{PendingTask, Task};

/// One run's share of a write.
#[derive(Debug, Clone)]
pub struct RunWrite {
    /// State after the transaction.
    pub state: MutableState,
    /// Initial `db_version` for creates, expected `db_version` for updates.
    pub db_version: i64,
    /// Events to append.
    pub events: Vec<HistoryEvent>,
    /// Tasks to enqueue.
    pub tasks: Vec<PendingTask>,
}

struct ShardState {
    info: ShardInfo,
    next_task_id: i64,
    max_task_id: i64,
    max_read_level: i64,
}

/// This host's ownership of one shard.
pub struct ShardContext {
    shard_id: i32,
    owner: String,
    store: Arc<dyn ExecutionStore>,
    config: EngineConfig,
    cluster: ClusterMetadata,
    state: Mutex<ShardState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("shard_id", &self.shard_id)
            .field("owner", &self.owner)
            .field("store", &"...")
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl ShardContext {
    /// Take ownership of `shard_id`, fencing out any previous owner.
    pub async fn acquire(
        shard_id: i32,
        owner: &str,
        store: Arc<dyn ExecutionStore>,
        config: EngineConfig,
        cluster: ClusterMetadata,
    ) -> Result<Arc<Self>> {
        let mut info = store.get_or_create_shard(shard_id, owner).await?;
        let previous_range_id = info.range_id;
        info.range_id += 1;
        info.owner = owner.to_string();
        info.updated_at = Utc::now();
        store.update_shard(&info, previous_range_id).await?;

        let bits = config.range_size_bits;
        let next_task_id = info.range_id << bits;
        info!(
            shard_id = shard_id,
            range_id = info.range_id,
            owner = %owner,
            "Shard acquired"
        );

        Ok(Arc::new(Self {
            shard_id,
            owner: owner.to_string(),
            store,
            config,
            cluster,
            state: Mutex::new(ShardState {
                info,
                next_task_id,
                max_task_id: next_task_id + (1 << bits),
                max_read_level: next_task_id - 1,
            }),
            closed: AtomicBool::new(false),
        }))
    }

    /// Shard id.
    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Store backing the shard.
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Engine tunables.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cluster topology.
    pub fn cluster(&self) -> &ClusterMetadata {
        &self.cluster
    }

    /// Whether ownership was lost or released.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop using the shard.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(shard_id = self.shard_id, "Shard released");
        }
    }

    /// Fail with `ShardNotOwned` once the shard is closed.
    pub fn ensure_owned(&self) -> Result<()> {
        if self.is_closed() {
            Err(HistoryError::ShardNotOwned {
                shard_id: self.shard_id,
            })
        } else {
            Ok(())
        }
    }

    /// Range currently held.
    pub async fn range_id(&self) -> i64 {
        self.state.lock().await.info.range_id
    }

    /// Highest task id known to be committed.
    pub async fn max_read_level(&self) -> i64 {
        self.state.lock().await.max_read_level
    }

    /// Copy of the shard record.
    pub async fn shard_info(&self) -> ShardInfo {
        self.state.lock().await.info.clone()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Create a run. Returns the tasks as written.
    pub async fn create_workflow_execution(
        &self,
        mode: CreateMode,
        run: RunWrite,
    ) -> Result<Vec<Task>> {
        self.ensure_owned()?;
        let mut state = self.state.lock().await;

        let ids = self.allocate(&mut state, run.tasks.len() + 1).await?;
        let highest = ids.last().copied().unwrap_or(state.max_read_level);
        let mut ids = ids.into_iter();
        let snapshot = snapshot(run, &mut ids);
        let written = snapshot.tasks.clone();

        let request = CreateWorkflowRequest {
            shard_id: self.shard_id,
            range_id: state.info.range_id,
            mode,
            snapshot,
        };
        self.check_ownership(self.store.create_workflow_execution(request).await)?;
        state.max_read_level = highest;
        Ok(written)
    }

    /// Update a run, optionally creating its successor. Returns the tasks
    /// as written, successor's included.
    pub async fn update_workflow_execution(
        &self,
        mode: UpdateMode,
        run: RunWrite,
        new_run: Option<RunWrite>,
    ) -> Result<Vec<Task>> {
        self.ensure_owned()?;
        let mut state = self.state.lock().await;

        let needed = run.tasks.len()
            + 1
            + new_run.as_ref().map(|r| r.tasks.len() + 1).unwrap_or(0);
        let ids = self.allocate(&mut state, needed).await?;
        let highest = ids.last().copied().unwrap_or(state.max_read_level);
        let mut ids = ids.into_iter();

        let mutation = {
            let txn_id = ids.next().unwrap_or_default();
            let version = run.state.current_version;
            let key = run.state.key();
            WorkflowMutation {
                tasks: to_tasks(&key, version, run.tasks, &mut ids),
                events: stamp(run.events, txn_id),
                state: run.state,
                expected_db_version: run.db_version,
            }
        };
        let new_run = new_run.map(|r| snapshot(r, &mut ids));

        let mut written = mutation.tasks.clone();
        if let Some(snapshot) = &new_run {
            written.extend(snapshot.tasks.iter().cloned());
        }

        let request = UpdateWorkflowRequest {
            shard_id: self.shard_id,
            range_id: state.info.range_id,
            mode,
            mutation,
            new_run,
        };
        self.check_ownership(self.store.update_workflow_execution(request).await)?;
        state.max_read_level = highest;
        Ok(written)
    }

    // ========================================================================
    // Replication bookkeeping
    // ========================================================================

    /// Record how far `cluster` has applied this shard's replication tasks.
    pub async fn update_cluster_replication_level(&self, cluster: &str, level: i64) -> Result<()> {
        self.ensure_owned()?;
        let mut state = self.state.lock().await;
        let current = state
            .info
            .cluster_replication_level
            .get(cluster)
            .copied()
            .unwrap_or(0);
        if level <= current {
            return Ok(());
        }
        let mut info = state.info.clone();
        info.cluster_replication_level.insert(cluster.to_string(), level);
        info.replication_ack_level = info
            .cluster_replication_level
            .values()
            .copied()
            .min()
            .unwrap_or(level);
        self.persist_info(&mut state, info).await
    }

    /// Record the latest clock reported by `cluster`. Clocks never move back.
    pub async fn update_remote_cluster_time(
        &self,
        cluster: &str,
        time: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_owned()?;
        let mut state = self.state.lock().await;
        if let Some(current) = state.info.remote_cluster_times.get(cluster)
            && *current >= time
        {
            return Ok(());
        }
        let mut info = state.info.clone();
        info.remote_cluster_times.insert(cluster.to_string(), time);
        self.persist_info(&mut state, info).await
    }

    /// Latest clock reported by `cluster`.
    pub async fn remote_cluster_time(&self, cluster: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .info
            .remote_cluster_times
            .get(cluster)
            .copied()
    }

    /// Ack level of `cluster`.
    pub async fn cluster_replication_level(&self, cluster: &str) -> i64 {
        self.state
            .lock()
            .await
            .info
            .cluster_replication_level
            .get(cluster)
            .copied()
            .unwrap_or(0)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn allocate(&self, state: &mut ShardState, count: usize) -> Result<Vec<i64>> {
        let count = count as i64;
        let range_size = 1i64 << self.config.range_size_bits;
        if count > range_size {
            return Err(HistoryError::LimitExceeded {
                details: format!("{} task ids do not fit in one range of {}", count, range_size),
            });
        }
        if state.next_task_id + count > state.max_task_id {
            self.renew_range(state).await?;
        }
        let first = state.next_task_id;
        state.next_task_id += count;
        Ok((first..first + count).collect())
    }

    async fn renew_range(&self, state: &mut ShardState) -> Result<()> {
        let mut info = state.info.clone();
        info.range_id += 1;
        self.persist_info(state, info).await?;

        let bits = self.config.range_size_bits;
        state.next_task_id = state.info.range_id << bits;
        state.max_task_id = (state.info.range_id + 1) << bits;
        debug!(
            shard_id = self.shard_id,
            range_id = state.info.range_id,
            "Shard range renewed"
        );
        Ok(())
    }

    async fn persist_info(&self, state: &mut ShardState, mut info: ShardInfo) -> Result<()> {
        info.updated_at = Utc::now();
        let result = self.store.update_shard(&info, state.info.range_id).await;
        self.check_ownership(result)?;
        state.info = info;
        Ok(())
    }

    fn check_ownership(&self, result: std::result::Result<(), PersistenceError>) -> Result<()> {
        if let Err(PersistenceError::ShardOwnershipLost { details, .. }) = &result {
            warn!(shard_id = self.shard_id, details = %details, "Shard ownership lost");
            self.close();
        }
        result.map_err(HistoryError::from)
    }
}

fn stamp(mut events: Vec<HistoryEvent>, task_id: i64) -> Vec<HistoryEvent> {
    for event in &mut events {
        event.task_id = task_id;
    }
    events
}

fn to_tasks(
    key: &crate::types::WorkflowKey,
    version: i64,
    pending: Vec<PendingTask>,
    ids: &mut impl Iterator<Item = i64>,
) -> Vec<Task> {
    let now = Utc::now();
    pending
        .into_iter()
        .zip(ids)
        .map(|(task, task_id)| Task {
            key: key.clone(),
            task_id,
            visibility_time: task.visibility_time.unwrap_or(now),
            version,
            kind: task.kind,
        })
        .collect()
}

fn snapshot(run: RunWrite, ids: &mut impl Iterator<Item = i64>) -> WorkflowSnapshot {
    let txn_id = ids.next().unwrap_or_default();
    let key = run.state.key();
    let version = run.state.current_version;
    WorkflowSnapshot {
        tasks: to_tasks(&key, version, run.tasks, ids),
        events: stamp(run.events, txn_id),
        state: run.state,
        db_version: run.db_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryExecutionStore;
    use crate::state::test_support::started_state_with_history;
    use crate::tasks::TaskKind;

    fn config(bits: u32) -> EngineConfig {
        EngineConfig {
            range_size_bits: bits,
            ..EngineConfig::default()
        }
    }

    async fn shard(store: Arc<dyn ExecutionStore>, bits: u32) -> Arc<ShardContext> {
        ShardContext::acquire(1, "host-a", store, config(bits), ClusterMetadata::single("active"))
            .await
            .unwrap()
    }

    fn run_write(workflow_id: &str) -> RunWrite {
        let (mut state, events) = started_state_with_history(workflow_id);
        state.version_histories.current_mut().unwrap().branch_token = format!("{}-branch", workflow_id);
        RunWrite {
            state,
            db_version: 1,
            events,
            tasks: vec![
                PendingTask::now(TaskKind::RecordWorkflowStarted),
                PendingTask::now(TaskKind::DecisionTask {
                    task_list: "tl".into(),
                    schedule_id: 2,
                }),
            ],
        }
    }

    #[tokio::test]
    async fn test_task_ids_increase_across_range_renewal() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let shard = shard(store, 2).await;
        assert_eq!(shard.range_id().await, 1);

        let first = shard
            .create_workflow_execution(CreateMode::BrandNew, run_write("wf-1"))
            .await
            .unwrap();
        let second = shard
            .create_workflow_execution(CreateMode::BrandNew, run_write("wf-2"))
            .await
            .unwrap();

        let ids: Vec<i64> = first.iter().chain(second.iter()).map(|t| t.task_id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids {:?}", ids);
        assert_eq!(shard.range_id().await, 2);
        assert_eq!(shard.max_read_level().await, *ids.last().unwrap());
    }

    #[tokio::test]
    async fn test_events_stamped_with_transaction_id() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let shard = shard(store.clone(), 10).await;
        let tasks = shard
            .create_workflow_execution(CreateMode::BrandNew, run_write("wf"))
            .await
            .unwrap();

        let events = store.read_history_events(1, "wf-branch", 1, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.task_id == tasks[0].task_id - 1));
    }

    #[tokio::test]
    async fn test_stolen_shard_rejects_writes() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let old_owner = shard(store.clone(), 10).await;
        let _new_owner = ShardContext::acquire(
            1,
            "host-b",
            store,
            config(10),
            ClusterMetadata::single("active"),
        )
        .await
        .unwrap();

        let err = old_owner
            .create_workflow_execution(CreateMode::BrandNew, run_write("wf"))
            .await
            .unwrap_err();
        assert_eq!(err, HistoryError::ShardNotOwned { shard_id: 1 });
        assert!(old_owner.is_closed());
        assert!(old_owner.ensure_owned().is_err());
    }

    #[tokio::test]
    async fn test_replication_levels_and_remote_clock() {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let shard = shard(store, 10).await;

        shard.update_cluster_replication_level("standby", 40).await.unwrap();
        shard.update_cluster_replication_level("standby", 30).await.unwrap();
        assert_eq!(shard.cluster_replication_level("standby").await, 40);
        assert_eq!(shard.shard_info().await.replication_ack_level, 40);

        let later = Utc::now();
        let earlier = later - chrono::Duration::seconds(5);
        shard.update_remote_cluster_time("standby", later).await.unwrap();
        shard.update_remote_cluster_time("standby", earlier).await.unwrap();
        assert_eq!(shard.remote_cluster_time("standby").await, Some(later));
    }
}
