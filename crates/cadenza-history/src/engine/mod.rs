// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The history engine of one shard.
//!
//! [`Engine`] is the surface a transport (or a test) drives. Every call
//! takes a [`CallContext`] carrying the caller deadline and cancellation,
//! plus a typed request from [`crate::api`].
//!
//! [`HistoryEngine`] implements it over a [`ShardContext`]. All mutations of
//! an existing run go through one path: lock the run's cache slot, apply the
//! change to a copy of the state inside a transaction, write the transaction
//! through the shard with an optimistic `db_version` check, then publish the
//! new position to pollers and the new tasks to queue consumers. A lost
//! conditional write drops the cached copy, reloads and retries.

mod activity;
mod decision;
pub mod mock;
mod query;
mod replication;
mod workflow;

pub use self::mock::MockEngine;
pub use self::query::{QueryDispatcher, QueryTarget, UnavailableQueryDispatcher};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{MutexGuard, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::*;
use crate::cache::{CachedState, ExecutionCache};
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::notifier::{HistoryEventNotification, HistoryEventNotifier};
use crate::persistence::{CreateMode, UpdateMode};
use crate::queue::TaskNotifier;
use crate::replication::{NoRemoteClusters, RemoteClusterClient, ReplicationMessages, ReplicationTask};
use crate::shard::{RunWrite, ShardContext};
use crate::state::MutableState;
use crate::tasks::{Task, TaskCategory};
use crate::types::{WorkflowExecution, WorkflowKey, WorkflowState};

/// Operations served by the history service for one shard.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Start serving. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stop serving: reject new calls, wake suspended pollers and wait
    /// (bounded) for in-flight calls. Idempotent.
    async fn stop(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Workflow lifecycle
    // ------------------------------------------------------------------

    /// Create a run.
    async fn start_workflow_execution(
        &self,
        ctx: &CallContext,
        request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse>;

    /// Current position of a run.
    async fn get_mutable_state(
        &self,
        ctx: &CallContext,
        request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse>;

    /// Wait until the run moves past `expected_next_event_id` or closes.
    async fn poll_mutable_state(
        &self,
        ctx: &CallContext,
        request: PollMutableStateRequest,
    ) -> Result<PollMutableStateResponse>;

    /// Debug dump of cached and stored state.
    async fn describe_mutable_state(
        &self,
        ctx: &CallContext,
        request: DescribeMutableStateRequest,
    ) -> Result<DescribeMutableStateResponse>;

    /// Configuration, status and pending work of a run.
    async fn describe_workflow_execution(
        &self,
        ctx: &CallContext,
        request: DescribeWorkflowExecutionRequest,
    ) -> Result<DescribeWorkflowExecutionResponse>;

    /// Stop dispatching decisions to the sticky task list.
    async fn reset_sticky_task_list(
        &self,
        ctx: &CallContext,
        request: ResetStickyTaskListRequest,
    ) -> Result<()>;

    /// Answer a query against a run.
    async fn query_workflow(
        &self,
        ctx: &CallContext,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse>;

    /// Deliver a signal.
    async fn signal_workflow_execution(
        &self,
        ctx: &CallContext,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Signal the running run, or start one carrying the signal.
    async fn signal_with_start_workflow_execution(
        &self,
        ctx: &CallContext,
        request: SignalWithStartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse>;

    /// Ask the run to cancel itself.
    async fn request_cancel_workflow_execution(
        &self,
        ctx: &CallContext,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Close the run immediately. A no-op on closed runs.
    async fn terminate_workflow_execution(
        &self,
        ctx: &CallContext,
        request: TerminateWorkflowExecutionRequest,
    ) -> Result<()>;

    /// Start a new run from a decision point of an existing one.
    async fn reset_workflow_execution(
        &self,
        ctx: &CallContext,
        request: ResetWorkflowExecutionRequest,
    ) -> Result<ResetWorkflowExecutionResponse>;

    /// Forget a delivered signal's request id.
    async fn remove_signal_mutable_state(
        &self,
        ctx: &CallContext,
        request: RemoveSignalMutableStateRequest,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Task execution
    // ------------------------------------------------------------------

    /// Hand a scheduled decision to a worker.
    async fn record_decision_task_started(
        &self,
        ctx: &CallContext,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse>;

    /// Hand a scheduled activity to a worker.
    async fn record_activity_task_started(
        &self,
        ctx: &CallContext,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse>;

    /// Apply a worker's decisions.
    async fn respond_decision_task_completed(
        &self,
        ctx: &CallContext,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse>;

    /// Record a failed decision and schedule another.
    async fn respond_decision_task_failed(
        &self,
        ctx: &CallContext,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<()>;

    /// Record an activity result.
    async fn respond_activity_task_completed(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<()>;

    /// Record an activity failure, retrying it when its policy allows.
    async fn respond_activity_task_failed(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<()>;

    /// Record an activity's acknowledgement of a cancel request.
    async fn respond_activity_task_canceled(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<()>;

    /// Record liveness of a started activity.
    async fn record_activity_task_heartbeat(
        &self,
        ctx: &CallContext,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse>;

    /// Schedule a decision if none is pending.
    async fn schedule_decision_task(
        &self,
        ctx: &CallContext,
        request: ScheduleDecisionTaskRequest,
    ) -> Result<()>;

    /// Record that a child run was created.
    async fn record_child_execution_started(
        &self,
        ctx: &CallContext,
        request: RecordChildExecutionStartedRequest,
    ) -> Result<()>;

    /// Record that a child run closed. A no-op once the parent closed.
    async fn record_child_execution_completed(
        &self,
        ctx: &CallContext,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()>;

    /// Regenerate transfer and timer tasks from state.
    async fn refresh_workflow_tasks(
        &self,
        ctx: &CallContext,
        request: RefreshWorkflowTasksRequest,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// Apply a batch described by its first and next event ids.
    async fn replicate_events(&self, ctx: &CallContext, request: ReplicateEventsRequest) -> Result<()>;

    /// Apply a batch described by its version history.
    async fn replicate_events_v2(
        &self,
        ctx: &CallContext,
        request: ReplicateEventsV2Request,
    ) -> Result<()>;

    /// Apply a serialized batch.
    async fn replicate_raw_events(
        &self,
        ctx: &CallContext,
        request: ReplicateRawEventsRequest,
    ) -> Result<()>;

    /// Apply activity progress from the active cluster.
    async fn sync_activity(&self, ctx: &CallContext, request: SyncActivityRequest) -> Result<()>;

    /// Record a remote cluster's clock.
    async fn sync_shard_status(&self, ctx: &CallContext, request: SyncShardStatusRequest) -> Result<()>;

    /// Page of hydrated replication tasks for a polling cluster.
    async fn get_replication_messages(
        &self,
        ctx: &CallContext,
        request: GetReplicationMessagesRequest,
    ) -> Result<ReplicationMessages>;

    /// Hydrate parked task pointers.
    async fn get_dlq_replication_messages(
        &self,
        ctx: &CallContext,
        request: GetDlqReplicationMessagesRequest,
    ) -> Result<Vec<ReplicationTask>>;

    /// Page through the DLQ of a source cluster.
    async fn read_dlq_messages(
        &self,
        ctx: &CallContext,
        request: ReadDlqMessagesRequest,
    ) -> Result<ReadDlqMessagesResponse>;

    /// Drop parked tasks.
    async fn purge_dlq_messages(&self, ctx: &CallContext, request: PurgeDlqMessagesRequest) -> Result<()>;

    /// Re-apply parked tasks and drop them.
    async fn merge_dlq_messages(
        &self,
        ctx: &CallContext,
        request: MergeDlqMessagesRequest,
    ) -> Result<MergeDlqMessagesResponse>;

    /// Re-apply signals from a losing branch onto the current run.
    async fn reapply_events(&self, ctx: &CallContext, request: ReapplyEventsRequest) -> Result<()>;

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Publish a run's new position to pollers.
    fn notify_new_history_event(&self, notification: HistoryEventNotification);

    /// Wake transfer queue consumers.
    fn notify_new_transfer_tasks(&self, tasks: &[Task]);

    /// Wake timer queue consumers.
    fn notify_new_timer_tasks(&self, tasks: &[Task]);

    /// Wake replication queue consumers.
    fn notify_new_replication_tasks(&self, tasks: &[Task]);
}

/// Serving state of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Created, not yet started.
    Initialized,
    /// Serving calls.
    Started,
    /// Stopped for good.
    Stopped,
}

/// What an update did to the state.
pub(crate) enum UpdateOutcome<T> {
    /// Persist the transaction.
    Persist(T),
    /// Persist, scheduling a decision first if none is pending.
    PersistAndScheduleDecision(T),
    /// Nothing changed; skip the write.
    Unchanged(T),
}

/// Version new events of an update are written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteVersion {
    /// The domain's failover version; the domain must be active here.
    Active,
    /// Keep the run's version; no events may be written.
    Existing,
}

/// History engine over one shard.
pub struct HistoryEngine {
    shard: Arc<ShardContext>,
    cache: ExecutionCache,
    history_notifier: HistoryEventNotifier,
    task_notifier: Arc<TaskNotifier>,
    query_dispatcher: Arc<dyn QueryDispatcher>,
    remote_clusters: Arc<dyn RemoteClusterClient>,
    status: Mutex<EngineStatus>,
    inflight: AtomicUsize,
    drained: Notify,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("shard", &self.shard)
            .field("cache", &self.cache)
            .field("status", &self.status())
            .field("inflight", &self.inflight.load(Ordering::SeqCst))
            .field("query_dispatcher", &"...")
            .field("remote_clusters", &"...")
            .finish()
    }
}

struct InflightGuard<'a> {
    engine: &'a HistoryEngine,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.engine.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.engine.drained.notify_waiters();
        }
    }
}

impl HistoryEngine {
    /// Engine over `shard`. Call [`Engine::start`] before use.
    pub fn new(shard: Arc<ShardContext>) -> Self {
        let capacity = shard.config().cache_capacity;
        Self {
            shard,
            cache: ExecutionCache::new(capacity),
            history_notifier: HistoryEventNotifier::new(),
            task_notifier: Arc::new(TaskNotifier::new()),
            query_dispatcher: Arc::new(UnavailableQueryDispatcher),
            remote_clusters: Arc::new(NoRemoteClusters),
            status: Mutex::new(EngineStatus::Initialized),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Use `dispatcher` to deliver queries to workers.
    pub fn with_query_dispatcher(mut self, dispatcher: Arc<dyn QueryDispatcher>) -> Self {
        self.query_dispatcher = dispatcher;
        self
    }

    /// Use `client` to hydrate parked replication tasks.
    pub fn with_remote_clusters(mut self, client: Arc<dyn RemoteClusterClient>) -> Self {
        self.remote_clusters = client;
        self
    }

    /// Share `notifier` with queue consumers.
    pub fn with_task_notifier(mut self, notifier: Arc<TaskNotifier>) -> Self {
        self.task_notifier = notifier;
        self
    }

    /// The shard served.
    pub fn shard(&self) -> &Arc<ShardContext> {
        &self.shard
    }

    /// Wake-ups for queue consumers.
    pub fn task_notifier(&self) -> &Arc<TaskNotifier> {
        &self.task_notifier
    }

    /// Fan-out to pollers.
    pub fn history_notifier(&self) -> &HistoryEventNotifier {
        &self.history_notifier
    }

    /// Current serving state.
    pub fn status(&self) -> EngineStatus {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: EngineStatus) -> EngineStatus {
        let mut current = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::replace(&mut *current, status)
    }

    /// Register an inbound call. Fails once the engine stopped serving.
    fn enter(&self, ctx: &CallContext, operation: &'static str) -> Result<InflightGuard<'_>> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard { engine: self };
        if self.status() != EngineStatus::Started {
            return Err(self.stopped());
        }
        self.shard.ensure_owned()?;
        ctx.check(operation)?;
        Ok(guard)
    }

    fn stopped(&self) -> HistoryError {
        HistoryError::EngineStopped {
            shard_id: self.shard.shard_id(),
        }
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + self.shard.config().shutdown_drain_timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let remaining = self.inflight.load(Ordering::SeqCst);
            if remaining == 0 {
                return;
            }
            debug!(remaining, "Waiting for in-flight calls");
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    remaining = self.inflight.load(Ordering::SeqCst),
                    "Drain timeout reached, stopping with calls in flight"
                );
                return;
            }
        }
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    /// Resolve an execution to a run, using the current run when no run id
    /// is given.
    pub(crate) async fn resolve_key(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowKey> {
        if domain_id.is_empty() {
            return Err(HistoryError::bad_request("domain_id", "is required"));
        }
        if execution.workflow_id.is_empty() {
            return Err(HistoryError::bad_request("workflow_id", "is required"));
        }
        if !execution.run_id.is_empty() {
            return Ok(WorkflowKey::new(
                domain_id,
                execution.workflow_id.clone(),
                execution.run_id.clone(),
            ));
        }
        let current = self
            .shard
            .store()
            .get_current_execution(self.shard.shard_id(), domain_id, &execution.workflow_id)
            .await?
            .ok_or_else(|| HistoryError::WorkflowNotFound {
                workflow_id: execution.workflow_id.clone(),
                run_id: String::new(),
            })?;
        Ok(WorkflowKey::new(domain_id, current.workflow_id, current.run_id))
    }

    /// Failover version for local writes to `domain_id`.
    pub(crate) fn active_version(&self, domain_id: &str) -> Result<i64> {
        let cluster = self.shard.cluster();
        if !cluster.is_domain_active(domain_id) {
            return Err(HistoryError::DomainNotActive {
                domain_id: domain_id.to_string(),
                current_cluster: cluster.current_cluster().to_string(),
                active_cluster: cluster.active_cluster(domain_id).unwrap_or_default().to_string(),
            });
        }
        Ok(cluster.domain_failover_version(domain_id))
    }

    /// Fill an empty cache slot from the store.
    pub(crate) async fn load_into<'a>(
        &self,
        slot: &'a mut Option<CachedState>,
        key: &WorkflowKey,
    ) -> Result<&'a mut CachedState> {
        if slot.is_none() {
            let persisted = self
                .shard
                .store()
                .get_workflow_execution(self.shard.shard_id(), key)
                .await?
                .ok_or_else(|| HistoryError::WorkflowNotFound {
                    workflow_id: key.workflow_id.clone(),
                    run_id: key.run_id.clone(),
                })?;
            *slot = Some(CachedState {
                ms: persisted.state,
                db_version: persisted.db_version,
            });
        }
        slot.as_mut()
            .ok_or_else(|| HistoryError::invalid_state("execution cache slot is empty"))
    }

    /// Lock a run's cache slot, bounded by the caller's deadline.
    pub(crate) async fn lock_run<'a>(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        context: &'a crate::cache::WorkflowContext,
    ) -> Result<MutexGuard<'a, Option<CachedState>>> {
        ctx.run(operation, async { Ok(context.lock().await) }).await
    }

    /// Copy of a run's state.
    pub(crate) async fn load_state(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        key: &WorkflowKey,
    ) -> Result<MutableState> {
        let context = self.cache.get_or_create(key)?;
        let mut slot = self.lock_run(ctx, operation, &context).await?;
        let cached = self.load_into(&mut slot, key).await?;
        Ok(cached.ms.clone())
    }

    /// Mutate a run with a domain-active write.
    pub(crate) async fn update_workflow<T, F>(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        key: &WorkflowKey,
        action: F,
    ) -> Result<T>
    where
        F: FnMut(&mut MutableState) -> Result<UpdateOutcome<T>>,
    {
        self.update_workflow_with(ctx, operation, key, WriteVersion::Active, action)
            .await
    }

    /// Mutate a run: lock, load, apply `action` to a copy, write
    /// conditionally, publish. Retries lost conditional writes.
    pub(crate) async fn update_workflow_with<T, F>(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        key: &WorkflowKey,
        version: WriteVersion,
        mut action: F,
    ) -> Result<T>
    where
        F: FnMut(&mut MutableState) -> Result<UpdateOutcome<T>>,
    {
        let retries = self.shard.config().conflict_retry_count.max(1);
        let mut last_conflict = None;

        for attempt in 0..retries {
            let context = self.cache.get_or_create(key)?;
            let mut slot = self.lock_run(ctx, operation, &context).await?;
            let cached = self.load_into(&mut slot, key).await?;

            // 1. Work on a copy so a failed action leaves the cache intact
            let mut ms = cached.ms.clone();
            let db_version = cached.db_version;
            let mode = update_mode(&ms);
            let write_version = match version {
                WriteVersion::Active => self.active_version(&key.domain_id)?,
                WriteVersion::Existing => ms.current_version,
            };
            ms.start_transaction(write_version, self.shard.cluster().is_global());

            // 2. Apply
            let (value, schedule_decision) = match action(&mut ms)? {
                UpdateOutcome::Unchanged(value) => return Ok(value),
                UpdateOutcome::Persist(value) => (value, false),
                UpdateOutcome::PersistAndScheduleDecision(value) => (value, true),
            };
            if schedule_decision && ms.is_running() && !ms.has_pending_decision() {
                ms.add_decision_task_scheduled()?;
            }

            // 3. Write
            let txn = ms.close_transaction()?;
            let new_run = match txn.new_run {
                Some(mut successor) => {
                    let successor_txn = successor.close_transaction()?;
                    Some(RunWrite {
                        state: *successor,
                        db_version: 1,
                        events: successor_txn.events,
                        tasks: successor_txn.tasks,
                    })
                }
                None => None,
            };
            let new_state = new_run.as_ref().map(|run| run.state.clone());
            let run = RunWrite {
                state: ms.clone(),
                db_version,
                events: txn.events,
                tasks: txn.tasks,
            };

            match self.shard.update_workflow_execution(mode, run, new_run).await {
                Ok(tasks) => {
                    *slot = Some(CachedState {
                        ms: ms.clone(),
                        db_version: db_version + 1,
                    });
                    drop(slot);
                    self.publish(&ms, &tasks);
                    if let Some(successor) = &new_state {
                        self.history_notifier
                            .notify(HistoryEventNotification::from_state(successor));
                    }
                    return Ok(value);
                }
                Err(HistoryError::Conflict { details }) => {
                    debug!(
                        workflow_id = %key.workflow_id,
                        run_id = %key.run_id,
                        attempt,
                        details = %details,
                        "Conditional write lost, reloading"
                    );
                    *slot = None;
                    last_conflict = Some(details);
                }
                Err(err) => {
                    *slot = None;
                    return Err(err);
                }
            }
        }

        Err(HistoryError::conflict(last_conflict.unwrap_or_else(|| {
            format!("{} kept losing conditional writes", operation)
        })))
    }

    /// Create a run whose first transaction is still open in `ms`.
    pub(crate) async fn create_run(&self, mode: CreateMode, mut ms: MutableState) -> Result<()> {
        let txn = ms.close_transaction()?;
        let run = RunWrite {
            state: ms.clone(),
            db_version: 1,
            events: txn.events,
            tasks: txn.tasks,
        };
        let tasks = self.shard.create_workflow_execution(mode, run).await?;
        self.publish(&ms, &tasks);
        Ok(())
    }

    /// Write state that was changed outside a builder transaction, e.g.
    /// after replicated events were appended to a side branch.
    pub(crate) async fn persist_locked(
        &self,
        slot: &mut Option<CachedState>,
        mode: UpdateMode,
        mut ms: MutableState,
        db_version: i64,
    ) -> Result<()> {
        let txn = ms.close_transaction()?;
        let run = RunWrite {
            state: ms.clone(),
            db_version,
            events: txn.events,
            tasks: txn.tasks,
        };
        match self.shard.update_workflow_execution(mode, run, None).await {
            Ok(tasks) => {
                self.publish(&ms, &tasks);
                *slot = Some(CachedState {
                    ms,
                    db_version: db_version + 1,
                });
                Ok(())
            }
            Err(err) => {
                *slot = None;
                Err(err)
            }
        }
    }

    fn publish(&self, ms: &MutableState, tasks: &[Task]) {
        self.history_notifier
            .notify(HistoryEventNotification::from_state(ms));
        self.task_notifier.notify_new_tasks(tasks);
    }

    pub(crate) fn cache(&self) -> &ExecutionCache {
        &self.cache
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn query_dispatcher(&self) -> &Arc<dyn QueryDispatcher> {
        &self.query_dispatcher
    }

    pub(crate) fn remote_clusters(&self) -> &Arc<dyn RemoteClusterClient> {
        &self.remote_clusters
    }
}

/// Pointer handling for a write to `ms`. Open runs own the pointer, except
/// zombies; closed runs leave it alone.
pub(crate) fn update_mode(ms: &MutableState) -> UpdateMode {
    if ms.is_running() && ms.execution_info.state != WorkflowState::Zombie {
        UpdateMode::UpdateCurrent
    } else {
        UpdateMode::BypassCurrent
    }
}

fn filter_tasks(tasks: &[Task], category: TaskCategory) -> Vec<Task> {
    tasks
        .iter()
        .filter(|t| t.category() == category)
        .cloned()
        .collect()
}

#[async_trait]
impl Engine for HistoryEngine {
    async fn start(&self) -> Result<()> {
        match self.set_status(EngineStatus::Started) {
            EngineStatus::Initialized => {
                info!(shard_id = self.shard.shard_id(), "History engine started");
                Ok(())
            }
            EngineStatus::Started => Ok(()),
            EngineStatus::Stopped => {
                self.set_status(EngineStatus::Stopped);
                Err(self.stopped())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.set_status(EngineStatus::Stopped) == EngineStatus::Stopped {
            return Ok(());
        }
        info!(shard_id = self.shard.shard_id(), "History engine stopping");
        self.shutdown.cancel();
        self.drain().await;
        self.shard.close();
        info!(shard_id = self.shard.shard_id(), "History engine stopped");
        Ok(())
    }

    async fn start_workflow_execution(
        &self,
        ctx: &CallContext,
        request: StartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse> {
        let _guard = self.enter(ctx, "start_workflow_execution")?;
        self.start_workflow(ctx, request, None).await
    }

    async fn get_mutable_state(
        &self,
        ctx: &CallContext,
        request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse> {
        let _guard = self.enter(ctx, "get_mutable_state")?;
        self.get_mutable_state_inner(ctx, request).await
    }

    async fn poll_mutable_state(
        &self,
        ctx: &CallContext,
        request: PollMutableStateRequest,
    ) -> Result<PollMutableStateResponse> {
        let _guard = self.enter(ctx, "poll_mutable_state")?;
        self.poll_mutable_state_inner(ctx, request).await
    }

    async fn describe_mutable_state(
        &self,
        ctx: &CallContext,
        request: DescribeMutableStateRequest,
    ) -> Result<DescribeMutableStateResponse> {
        let _guard = self.enter(ctx, "describe_mutable_state")?;
        self.describe_mutable_state_inner(request).await
    }

    async fn describe_workflow_execution(
        &self,
        ctx: &CallContext,
        request: DescribeWorkflowExecutionRequest,
    ) -> Result<DescribeWorkflowExecutionResponse> {
        let _guard = self.enter(ctx, "describe_workflow_execution")?;
        self.describe_workflow_execution_inner(ctx, request).await
    }

    async fn reset_sticky_task_list(
        &self,
        ctx: &CallContext,
        request: ResetStickyTaskListRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "reset_sticky_task_list")?;
        self.reset_sticky_task_list_inner(ctx, request).await
    }

    async fn query_workflow(
        &self,
        ctx: &CallContext,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse> {
        let _guard = self.enter(ctx, "query_workflow")?;
        self.query_workflow_inner(ctx, request).await
    }

    async fn signal_workflow_execution(
        &self,
        ctx: &CallContext,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "signal_workflow_execution")?;
        self.signal_workflow(ctx, request).await
    }

    async fn signal_with_start_workflow_execution(
        &self,
        ctx: &CallContext,
        request: SignalWithStartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse> {
        let _guard = self.enter(ctx, "signal_with_start_workflow_execution")?;
        self.signal_with_start(ctx, request).await
    }

    async fn request_cancel_workflow_execution(
        &self,
        ctx: &CallContext,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "request_cancel_workflow_execution")?;
        self.request_cancel_workflow(ctx, request).await
    }

    async fn terminate_workflow_execution(
        &self,
        ctx: &CallContext,
        request: TerminateWorkflowExecutionRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "terminate_workflow_execution")?;
        self.terminate_workflow(ctx, request).await
    }

    async fn reset_workflow_execution(
        &self,
        ctx: &CallContext,
        request: ResetWorkflowExecutionRequest,
    ) -> Result<ResetWorkflowExecutionResponse> {
        let _guard = self.enter(ctx, "reset_workflow_execution")?;
        self.reset_workflow(ctx, request).await
    }

    async fn remove_signal_mutable_state(
        &self,
        ctx: &CallContext,
        request: RemoveSignalMutableStateRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "remove_signal_mutable_state")?;
        self.remove_signal_mutable_state_inner(ctx, request).await
    }

    async fn record_decision_task_started(
        &self,
        ctx: &CallContext,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        let _guard = self.enter(ctx, "record_decision_task_started")?;
        self.record_decision_task_started_inner(ctx, request).await
    }

    async fn record_activity_task_started(
        &self,
        ctx: &CallContext,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse> {
        let _guard = self.enter(ctx, "record_activity_task_started")?;
        self.record_activity_task_started_inner(ctx, request).await
    }

    async fn respond_decision_task_completed(
        &self,
        ctx: &CallContext,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<RespondDecisionTaskCompletedResponse> {
        let _guard = self.enter(ctx, "respond_decision_task_completed")?;
        self.respond_decision_task_completed_inner(ctx, request).await
    }

    async fn respond_decision_task_failed(
        &self,
        ctx: &CallContext,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "respond_decision_task_failed")?;
        self.respond_decision_task_failed_inner(ctx, request).await
    }

    async fn respond_activity_task_completed(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "respond_activity_task_completed")?;
        self.respond_activity_task_completed_inner(ctx, request).await
    }

    async fn respond_activity_task_failed(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "respond_activity_task_failed")?;
        self.respond_activity_task_failed_inner(ctx, request).await
    }

    async fn respond_activity_task_canceled(
        &self,
        ctx: &CallContext,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "respond_activity_task_canceled")?;
        self.respond_activity_task_canceled_inner(ctx, request).await
    }

    async fn record_activity_task_heartbeat(
        &self,
        ctx: &CallContext,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse> {
        let _guard = self.enter(ctx, "record_activity_task_heartbeat")?;
        self.record_activity_task_heartbeat_inner(ctx, request).await
    }

    async fn schedule_decision_task(
        &self,
        ctx: &CallContext,
        request: ScheduleDecisionTaskRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "schedule_decision_task")?;
        self.schedule_decision_task_inner(ctx, request).await
    }

    async fn record_child_execution_started(
        &self,
        ctx: &CallContext,
        request: RecordChildExecutionStartedRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "record_child_execution_started")?;
        self.record_child_execution_started_inner(ctx, request).await
    }

    async fn record_child_execution_completed(
        &self,
        ctx: &CallContext,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "record_child_execution_completed")?;
        self.record_child_execution_completed_inner(ctx, request).await
    }

    async fn refresh_workflow_tasks(
        &self,
        ctx: &CallContext,
        request: RefreshWorkflowTasksRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "refresh_workflow_tasks")?;
        self.refresh_workflow_tasks_inner(ctx, request).await
    }

    async fn replicate_events(&self, ctx: &CallContext, request: ReplicateEventsRequest) -> Result<()> {
        let _guard = self.enter(ctx, "replicate_events")?;
        self.replicate_events_inner(ctx, request).await
    }

    async fn replicate_events_v2(
        &self,
        ctx: &CallContext,
        request: ReplicateEventsV2Request,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "replicate_events_v2")?;
        self.replicate_events_v2_inner(ctx, request).await
    }

    async fn replicate_raw_events(
        &self,
        ctx: &CallContext,
        request: ReplicateRawEventsRequest,
    ) -> Result<()> {
        let _guard = self.enter(ctx, "replicate_raw_events")?;
        self.replicate_raw_events_inner(ctx, request).await
    }

    async fn sync_activity(&self, ctx: &CallContext, request: SyncActivityRequest) -> Result<()> {
        let _guard = self.enter(ctx, "sync_activity")?;
        self.sync_activity_inner(ctx, request).await
    }

    async fn sync_shard_status(&self, ctx: &CallContext, request: SyncShardStatusRequest) -> Result<()> {
        let _guard = self.enter(ctx, "sync_shard_status")?;
        self.sync_shard_status_inner(request).await
    }

    async fn get_replication_messages(
        &self,
        ctx: &CallContext,
        request: GetReplicationMessagesRequest,
    ) -> Result<ReplicationMessages> {
        let _guard = self.enter(ctx, "get_replication_messages")?;
        self.get_replication_messages_inner(request).await
    }

    async fn get_dlq_replication_messages(
        &self,
        ctx: &CallContext,
        request: GetDlqReplicationMessagesRequest,
    ) -> Result<Vec<ReplicationTask>> {
        let _guard = self.enter(ctx, "get_dlq_replication_messages")?;
        self.get_dlq_replication_messages_inner(request).await
    }

    async fn read_dlq_messages(
        &self,
        ctx: &CallContext,
        request: ReadDlqMessagesRequest,
    ) -> Result<ReadDlqMessagesResponse> {
        let _guard = self.enter(ctx, "read_dlq_messages")?;
        self.read_dlq_messages_inner(request).await
    }

    async fn purge_dlq_messages(&self, ctx: &CallContext, request: PurgeDlqMessagesRequest) -> Result<()> {
        let _guard = self.enter(ctx, "purge_dlq_messages")?;
        self.purge_dlq_messages_inner(request).await
    }

    async fn merge_dlq_messages(
        &self,
        ctx: &CallContext,
        request: MergeDlqMessagesRequest,
    ) -> Result<MergeDlqMessagesResponse> {
        let _guard = self.enter(ctx, "merge_dlq_messages")?;
        self.merge_dlq_messages_inner(ctx, request).await
    }

    async fn reapply_events(&self, ctx: &CallContext, request: ReapplyEventsRequest) -> Result<()> {
        let _guard = self.enter(ctx, "reapply_events")?;
        self.reapply_events_inner(ctx, request).await
    }

    fn notify_new_history_event(&self, notification: HistoryEventNotification) {
        self.history_notifier.notify(notification);
    }

    fn notify_new_transfer_tasks(&self, tasks: &[Task]) {
        self.task_notifier
            .notify_new_tasks(&filter_tasks(tasks, TaskCategory::Transfer));
    }

    fn notify_new_timer_tasks(&self, tasks: &[Task]) {
        self.task_notifier
            .notify_new_tasks(&filter_tasks(tasks, TaskCategory::Timer));
    }

    fn notify_new_replication_tasks(&self, tasks: &[Task]) {
        self.task_notifier
            .notify_new_tasks(&filter_tasks(tasks, TaskCategory::Replication));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::{ClusterMetadata, EngineConfig};
    use crate::persistence::InMemoryExecutionStore;
    use crate::persistence::ExecutionStore;

    /// Started engine over a fresh in-memory store.
    pub(crate) async fn engine_with(config: EngineConfig, cluster: ClusterMetadata) -> Arc<HistoryEngine> {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let shard = ShardContext::acquire(1, "test-host", store, config, cluster)
            .await
            .unwrap();
        let engine = Arc::new(HistoryEngine::new(shard));
        engine.start().await.unwrap();
        engine
    }

    pub(crate) async fn engine() -> Arc<HistoryEngine> {
        engine_with(EngineConfig::default(), ClusterMetadata::single("active")).await
    }

    pub(crate) fn start_request(workflow_id: &str) -> StartWorkflowExecutionRequest {
        StartWorkflowExecutionRequest {
            domain_id: "domain".into(),
            workflow_id: workflow_id.into(),
            workflow_type: "order".into(),
            task_list: "orders".into(),
            execution_start_to_close_timeout_seconds: 3600,
            task_start_to_close_timeout_seconds: 10,
            identity: "tester".into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            ..StartWorkflowExecutionRequest::default()
        }
    }

    pub(crate) async fn started(engine: &HistoryEngine, workflow_id: &str) -> WorkflowKey {
        let response = engine
            .start_workflow_execution(&CallContext::background(), start_request(workflow_id))
            .await
            .unwrap();
        WorkflowKey::new("domain", workflow_id, response.run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_calls_fail_before_start_and_after_stop() {
        let engine = engine().await;
        engine.stop().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Stopped);

        let err = engine
            .start_workflow_execution(&CallContext::background(), start_request("wf"))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::EngineStopped { shard_id: 1 }));
        assert!(engine.start().await.is_err());
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let engine = engine().await;
        engine.start().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Started);
    }

    #[tokio::test]
    async fn test_stop_wakes_pollers() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;

        let poller = engine.clone();
        let handle = tokio::spawn(async move {
            poller
                .poll_mutable_state(
                    &CallContext::with_timeout(Duration::from_secs(30)),
                    PollMutableStateRequest {
                        domain_id: key.domain_id.clone(),
                        execution: key.execution(),
                        expected_next_event_id: 100,
                        current_branch_token: None,
                    },
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(5), engine.stop())
            .await
            .unwrap()
            .unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(HistoryError::EngineStopped { .. })));
        assert!(engine.shard().is_closed());
    }

    #[tokio::test]
    async fn test_update_mode_follows_run_state() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let mut ms = engine
            .load_state(&CallContext::background(), "test", &key)
            .await
            .unwrap();
        assert_eq!(update_mode(&ms), UpdateMode::UpdateCurrent);
        ms.execution_info.state = WorkflowState::Zombie;
        assert_eq!(update_mode(&ms), UpdateMode::BypassCurrent);
        ms.execution_info.state = WorkflowState::Completed;
        assert_eq!(update_mode(&ms), UpdateMode::BypassCurrent);
    }

    #[tokio::test]
    async fn test_notify_filters_by_category() {
        let engine = engine().await;
        let task = Task {
            key: WorkflowKey::new("d", "wf", "r"),
            task_id: 42,
            visibility_time: chrono::Utc::now(),
            version: 1,
            kind: crate::tasks::TaskKind::WorkflowTimeout,
        };
        engine.notify_new_transfer_tasks(std::slice::from_ref(&task));
        assert_eq!(engine.task_notifier().high_water_mark(TaskCategory::Timer), 0);
        engine.notify_new_timer_tasks(std::slice::from_ref(&task));
        assert_eq!(engine.task_notifier().high_water_mark(TaskCategory::Timer), 42);
    }
}
