// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication ingestion, replication task serving and the replication DLQ.
//!
//! Incoming batches are placed with [`resolve_branch`]: duplicates are
//! dropped, appends extend a branch, gaps are bounced back as `RetryTask`
//! and diverging batches fork a new branch. When the branch written to is
//! not the current one, [`incoming_wins`] decides whether state is rebuilt
//! from it. A replicated run that loses against the current run of its
//! workflow id is stored as a zombie.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{HistoryEngine, UpdateOutcome, WriteVersion, update_mode};
use crate::api::*;
use crate::cache::CachedState;
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::events::{EventAttributes, HistoryEvent};
use crate::persistence::CreateMode;
use crate::replication::{
    BranchResolution, ReplicationMessages, ReplicationTask, ReplicationTaskAttributes,
    ReplicationTaskInfo, ReplicationTaskType, apply_task, incoming_wins, resolve_branch,
};
use crate::state::task_generator;
use crate::state::{MutableState, VersionHistory, VersionHistoryItem};
use crate::tasks::TaskCategory;
use crate::types::{
    EMPTY_EVENT_ID, EMPTY_VERSION, FIRST_EVENT_ID, WorkflowExecution, WorkflowKey, WorkflowState,
};

impl HistoryEngine {
    // ========================================================================
    // Event batches
    // ========================================================================

    #[instrument(skip(self, ctx, request), fields(
        source_cluster = %request.source_cluster,
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn replicate_events_v2_inner(
        &self,
        ctx: &CallContext,
        request: ReplicateEventsV2Request,
    ) -> Result<()> {
        const OPERATION: &str = "replicate_events_v2";
        let key = replicated_key(&request.domain_id, &request.execution)?;
        validate_batch(&request.events, &request.version_history_items)?;

        self.apply_batch(
            ctx,
            OPERATION,
            &key,
            &request.source_cluster,
            &request.version_history_items,
            &request.events,
        )
        .await?;

        if let Some(new_run_id) = request.new_run_id.as_deref()
            && !request.new_run_events.is_empty()
        {
            let successor = WorkflowKey::new(
                key.domain_id.clone(),
                key.workflow_id.clone(),
                new_run_id,
            );
            let items = items_of(&request.new_run_events)?;
            validate_batch(&request.new_run_events, &items)?;
            self.apply_batch(
                ctx,
                OPERATION,
                &successor,
                &request.source_cluster,
                &items,
                &request.new_run_events,
            )
            .await?;
        }
        Ok(())
    }

    /// Legacy batches carry a single version instead of a version history;
    /// the history is reconstructed from the local branch up to the batch.
    #[instrument(skip(self, ctx, request), fields(
        source_cluster = %request.source_cluster,
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        first_event_id = request.first_event_id,
    ))]
    pub(crate) async fn replicate_events_inner(
        &self,
        ctx: &CallContext,
        request: ReplicateEventsRequest,
    ) -> Result<()> {
        const OPERATION: &str = "replicate_events";
        let key = replicated_key(&request.domain_id, &request.execution)?;
        let (first, last) = match (request.history.first(), request.history.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(HistoryError::bad_request("history", "must not be empty")),
        };
        if first.event_id != request.first_event_id || last.event_id + 1 != request.next_event_id {
            return Err(HistoryError::bad_request(
                "history",
                format!(
                    "events {}..={} do not match range [{}, {})",
                    first.event_id, last.event_id, request.first_event_id, request.next_event_id
                ),
            ));
        }

        let mut branch = match self.load_state(ctx, OPERATION, &key).await {
            Ok(ms) => local_prefix(&ms, request.first_event_id)?,
            Err(HistoryError::WorkflowNotFound { .. }) => VersionHistory::default(),
            Err(err) => return Err(err),
        };
        if let Some(prefix_last) = branch.last_item()
            && request.version < prefix_last.version
        {
            warn!(
                version = request.version,
                local_version = prefix_last.version,
                "Dropping replicated batch older than local history"
            );
            return Ok(());
        }
        for event in &request.history {
            branch.add_or_update(event.event_id, event.version)?;
        }

        let new_run_id = match &last.attributes {
            EventAttributes::WorkflowExecutionContinuedAsNew(attrs)
                if !request.new_run_history.is_empty() =>
            {
                Some(attrs.new_execution_run_id.clone())
            }
            _ => None,
        };
        self.replicate_events_v2_inner(
            ctx,
            ReplicateEventsV2Request {
                source_cluster: request.source_cluster,
                domain_id: request.domain_id,
                execution: request.execution,
                version_history_items: branch.items,
                events: request.history,
                new_run_events: request.new_run_history,
                new_run_id,
            },
        )
        .await
    }

    pub(crate) async fn replicate_raw_events_inner(
        &self,
        ctx: &CallContext,
        request: ReplicateRawEventsRequest,
    ) -> Result<()> {
        let history: Vec<HistoryEvent> = request
            .history
            .decode()
            .map_err(|e| HistoryError::bad_request("history", e.to_string()))?;
        let new_run_history: Vec<HistoryEvent> = match &request.new_run_history {
            Some(blob) if !blob.is_empty() => blob
                .decode()
                .map_err(|e| HistoryError::bad_request("new_run_history", e.to_string()))?,
            _ => Vec::new(),
        };
        let (first_event_id, next_event_id, version) = match (history.first(), history.last()) {
            (Some(first), Some(last)) => (first.event_id, last.event_id + 1, last.version),
            _ => return Err(HistoryError::bad_request("history", "must not be empty")),
        };
        self.replicate_events_inner(
            ctx,
            ReplicateEventsRequest {
                source_cluster: request.source_cluster,
                domain_id: request.domain_id,
                execution: request.execution,
                first_event_id,
                next_event_id,
                version,
                history,
                new_run_history,
            },
        )
        .await
    }

    /// Apply one batch to `key`, creating the run when it is unknown.
    async fn apply_batch(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        key: &WorkflowKey,
        source_cluster: &str,
        items: &[VersionHistoryItem],
        events: &[HistoryEvent],
    ) -> Result<()> {
        let context = self.cache().get_or_create(key)?;
        let mut slot = self.lock_run(ctx, operation, &context).await?;
        let cached = match self.load_into(&mut slot, key).await {
            Ok(cached) => cached.clone(),
            Err(HistoryError::WorkflowNotFound { .. }) => {
                // Creating may touch the current run; never hold two run locks.
                drop(slot);
                return self
                    .create_replicated_run(ctx, operation, key, events)
                    .await;
            }
            Err(err) => return Err(err),
        };

        let CachedState { ms, db_version } = cached;
        let first = &events[0];
        match resolve_branch(&ms.version_histories, items, first.event_id)? {
            BranchResolution::Duplicate => {
                warn!(
                    first_event_id = first.event_id,
                    version = first.version,
                    "Duplicate replicated batch, skipping"
                );
                Ok(())
            }
            BranchResolution::Gap { last, .. } => Err(retry_task(
                key,
                last.event_id,
                last.version,
                first.event_id,
                first.version,
            )),
            BranchResolution::Append { branch_index }
                if branch_index == ms.version_histories.current_index =>
            {
                let mut ms = ms;
                let mode = update_mode(&ms);
                let next = ms.next_event_id();
                ms.start_transaction(ms.current_version, false);
                for event in events.iter().filter(|e| e.event_id >= next) {
                    ms.replay_event(event)?;
                }
                debug!(
                    first_event_id = first.event_id,
                    next_event_id = ms.next_event_id(),
                    "Appended replicated batch"
                );
                self.persist_locked(&mut slot, mode, ms, db_version).await
            }
            BranchResolution::Append { branch_index } => {
                self.write_branch(&mut slot, ms, db_version, branch_index, None, source_cluster, events)
                    .await
            }
            BranchResolution::Fork { branch_index, lca } => {
                self.write_branch(
                    &mut slot,
                    ms,
                    db_version,
                    branch_index,
                    Some(lca),
                    source_cluster,
                    events,
                )
                .await
            }
        }
    }

    /// Write `events` to a non-current branch, forking it at `fork` first
    /// when given, then rebuild state from it if it wins.
    #[allow(clippy::too_many_arguments)]
    async fn write_branch(
        &self,
        slot: &mut Option<CachedState>,
        mut ms: MutableState,
        db_version: i64,
        branch_index: usize,
        fork: Option<VersionHistoryItem>,
        source_cluster: &str,
        events: &[HistoryEvent],
    ) -> Result<()> {
        let shard = self.shard();
        let store = shard.store();
        let shard_id = shard.shard_id();

        let index = match fork {
            None => branch_index,
            Some(lca) => {
                let source = ms
                    .version_histories
                    .histories
                    .get(branch_index)
                    .ok_or_else(|| HistoryError::invalid_state("fork source branch is missing"))?;
                let items = source.truncated_at(lca)?;
                let token = Uuid::new_v4().to_string();
                store
                    .fork_history_branch(shard_id, &source.branch_token, lca.event_id, &token)
                    .await?;
                debug!(
                    fork_event_id = lca.event_id,
                    branch_token = %token,
                    "Forked history branch for replicated batch"
                );
                ms.version_histories.add(VersionHistory::new(token, items))
            }
        };

        let branch = ms
            .version_histories
            .histories
            .get_mut(index)
            .ok_or_else(|| HistoryError::invalid_state("replicated branch is missing"))?;
        let branch_next = branch
            .last_item()
            .map(|item| item.event_id + 1)
            .unwrap_or(FIRST_EVENT_ID);
        let fresh: Vec<HistoryEvent> = events
            .iter()
            .filter(|e| e.event_id >= branch_next)
            .cloned()
            .collect();
        for event in &fresh {
            branch.add_or_update(event.event_id, event.version)?;
        }
        let token = branch.branch_token.clone();
        let incoming_last = branch
            .last_item()
            .ok_or_else(|| HistoryError::invalid_state("replicated branch has no events"))?;
        store.append_history_events(shard_id, &token, &fresh).await?;

        let local_last = ms
            .version_histories
            .current()?
            .last_item()
            .ok_or_else(|| HistoryError::invalid_state("current branch has no events"))?;
        let mode = update_mode(&ms);
        let current_cluster = shard.cluster().current_cluster();

        if !incoming_wins(local_last, incoming_last, source_cluster, current_cluster) {
            debug!(
                local_version = local_last.version,
                incoming_version = incoming_last.version,
                "Replicated batch kept on non-current branch"
            );
            ms.start_transaction(ms.current_version, false);
            return self.persist_locked(slot, mode, ms, db_version).await;
        }

        info!(
            local_event_id = local_last.event_id,
            local_version = local_last.version,
            incoming_event_id = incoming_last.event_id,
            incoming_version = incoming_last.version,
            "Replicated branch replaces current branch"
        );
        let history = store
            .read_history_events(shard_id, &token, FIRST_EVENT_ID, incoming_last.event_id + 1)
            .await?;
        let mut rebuilt = MutableState::rebuild(&ms.key(), &token, &history)?;
        rebuilt.version_histories = ms.version_histories;
        rebuilt.version_histories.set_current(index)?;
        rebuilt.signal_requested_ids = ms.signal_requested_ids;
        rebuilt.reapplied_events = ms.reapplied_events;
        rebuilt.start_transaction(rebuilt.current_version, false);
        rebuilt.pending.tasks = task_generator::refresh_tasks(&rebuilt);
        self.persist_locked(slot, mode, rebuilt, db_version).await
    }

    /// Create a run from its first replicated batch.
    async fn create_replicated_run(
        &self,
        ctx: &CallContext,
        operation: &'static str,
        key: &WorkflowKey,
        events: &[HistoryEvent],
    ) -> Result<()> {
        let first = &events[0];
        if first.event_id != FIRST_EVENT_ID {
            return Err(retry_task(
                key,
                EMPTY_EVENT_ID,
                EMPTY_VERSION,
                first.event_id,
                first.version,
            ));
        }

        let mut ms = MutableState::new(key, Uuid::new_v4().to_string(), first.version);
        ms.start_transaction(first.version, false);
        for event in events {
            ms.replay_event(event)?;
        }
        let incoming_version = ms.last_write_version();

        let shard = self.shard();
        let current = shard
            .store()
            .get_current_execution(shard.shard_id(), &key.domain_id, &key.workflow_id)
            .await?;
        let mode = match current {
            None => CreateMode::BrandNew,
            Some(current) if current.run_id == key.run_id => {
                debug!("Replicated run was created concurrently");
                return Ok(());
            }
            Some(current) if current.is_running() => {
                if current.last_write_version >= incoming_version {
                    info!(
                        current_run_id = %current.run_id,
                        current_version = current.last_write_version,
                        incoming_version,
                        "Replicated run loses to current run, storing as zombie"
                    );
                    ms.execution_info.state = WorkflowState::Zombie;
                    ms.pending.tasks.clear();
                    CreateMode::Zombie
                } else {
                    let current_key = WorkflowKey::new(
                        key.domain_id.clone(),
                        key.workflow_id.clone(),
                        current.run_id.clone(),
                    );
                    self.zombify(ctx, operation, &current_key).await?;
                    CreateMode::WorkflowIdReuse {
                        previous_run_id: current.run_id,
                        previous_last_write_version: current.last_write_version,
                    }
                }
            }
            Some(current) => CreateMode::WorkflowIdReuse {
                previous_run_id: current.run_id,
                previous_last_write_version: current.last_write_version,
            },
        };
        debug!(next_event_id = ms.next_event_id(), mode = ?mode, "Creating replicated run");
        self.create_run(mode, ms).await
    }

    /// Demote an open run that lost to a replicated run of the same
    /// workflow id.
    async fn zombify(&self, ctx: &CallContext, operation: &'static str, key: &WorkflowKey) -> Result<()> {
        self.update_workflow_with(ctx, operation, key, WriteVersion::Existing, |ms| {
            if !ms.is_running() {
                return Ok(UpdateOutcome::Unchanged(()));
            }
            ms.execution_info.state = WorkflowState::Zombie;
            Ok(UpdateOutcome::Persist(()))
        })
        .await?;
        info!(run_id = %key.run_id, "Current run demoted to zombie");
        Ok(())
    }

    // ========================================================================
    // Activity and shard progress
    // ========================================================================

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.workflow_id,
        run_id = %request.run_id,
        scheduled_id = request.scheduled_id,
    ))]
    pub(crate) async fn sync_activity_inner(
        &self,
        ctx: &CallContext,
        request: SyncActivityRequest,
    ) -> Result<()> {
        const OPERATION: &str = "sync_activity";
        let key = replicated_key(
            &request.domain_id,
            &WorkflowExecution::new(request.workflow_id.clone(), request.run_id.clone()),
        )?;
        let context = self.cache().get_or_create(&key)?;
        let mut slot = self.lock_run(ctx, OPERATION, &context).await?;
        let CachedState { mut ms, db_version } = match self.load_into(&mut slot, &key).await {
            Ok(cached) => cached.clone(),
            Err(HistoryError::WorkflowNotFound { .. }) => {
                return Err(retry_task(
                    &key,
                    EMPTY_EVENT_ID,
                    EMPTY_VERSION,
                    request.scheduled_id + 1,
                    request.version,
                ));
            }
            Err(err) => return Err(err),
        };

        if !ms.is_running() {
            debug!("Run closed, dropping activity progress");
            return Ok(());
        }
        if request.scheduled_id >= ms.next_event_id() {
            let last = ms
                .version_histories
                .current()?
                .last_item()
                .unwrap_or(VersionHistoryItem::new(EMPTY_EVENT_ID, EMPTY_VERSION));
            return Err(retry_task(
                &key,
                last.event_id,
                last.version,
                request.scheduled_id + 1,
                request.version,
            ));
        }
        let Some(ai) = ms.pending_activities.get_mut(&request.scheduled_id) else {
            debug!("Activity no longer pending");
            return Ok(());
        };
        if ai.version > request.version
            || (ai.version == request.version && ai.attempt > request.attempt)
        {
            debug!(
                local_version = ai.version,
                local_attempt = ai.attempt,
                "Stale activity progress"
            );
            return Ok(());
        }

        ai.version = request.version;
        if let Some(scheduled_time) = request.scheduled_time {
            ai.scheduled_time = scheduled_time;
        }
        ai.started_id = request.started_id;
        ai.started_time = request.started_time;
        ai.last_heartbeat_time = request.last_heartbeat_time;
        ai.details = request.details;
        ai.attempt = request.attempt;
        ai.last_failure_reason = request.last_failure_reason;
        ai.last_worker_identity = request.last_worker_identity;

        let mode = update_mode(&ms);
        ms.start_transaction(ms.current_version, false);
        self.persist_locked(&mut slot, mode, ms, db_version).await
    }

    pub(crate) async fn sync_shard_status_inner(&self, request: SyncShardStatusRequest) -> Result<()> {
        let shard = self.shard();
        if request.source_cluster.is_empty() {
            return Err(HistoryError::bad_request("source_cluster", "is required"));
        }
        if request.source_cluster == shard.cluster().current_cluster() {
            return Err(HistoryError::bad_request(
                "source_cluster",
                "must be a remote cluster",
            ));
        }
        if request.shard_id != shard.shard_id() {
            return Err(HistoryError::bad_request(
                "shard_id",
                format!("expected {}, got {}", shard.shard_id(), request.shard_id),
            ));
        }
        shard
            .update_remote_cluster_time(&request.source_cluster, request.timestamp)
            .await?;
        // Standby timers are driven by the remote clock.
        self.task_notifier().poke(TaskCategory::Timer);
        debug!(
            source_cluster = %request.source_cluster,
            timestamp = %request.timestamp,
            "Remote cluster time updated"
        );
        Ok(())
    }

    // ========================================================================
    // Serving replication tasks
    // ========================================================================

    #[instrument(skip(self, request), fields(
        polling_cluster = %request.polling_cluster,
        last_retrieved = request.last_retrieved_message_id,
    ))]
    pub(crate) async fn get_replication_messages_inner(
        &self,
        request: GetReplicationMessagesRequest,
    ) -> Result<ReplicationMessages> {
        let shard = self.shard();
        let cluster = shard.cluster();
        if !cluster
            .remote_clusters()
            .any(|name| name == request.polling_cluster)
        {
            return Err(HistoryError::bad_request(
                "polling_cluster",
                format!("'{}' is not a remote cluster", request.polling_cluster),
            ));
        }

        if request.last_processed_message_id > 0 {
            shard
                .update_cluster_replication_level(
                    &request.polling_cluster,
                    request.last_processed_message_id,
                )
                .await?;
            let ack_level = shard.shard_info().await.replication_ack_level;
            if ack_level > 0 {
                let completed = shard
                    .store()
                    .range_complete_tasks(shard.shard_id(), TaskCategory::Replication, 0, ack_level)
                    .await?;
                debug!(ack_level, completed, "Completed acknowledged replication tasks");
            }
        }

        let page_size = shard.config().replication_page_size.max(1);
        let max_read_level = shard.max_read_level().await;
        let tasks = shard
            .store()
            .get_tasks(
                shard.shard_id(),
                TaskCategory::Replication,
                request.last_retrieved_message_id,
                max_read_level,
                page_size,
            )
            .await?;

        let mut messages = ReplicationMessages {
            tasks: Vec::with_capacity(tasks.len()),
            last_retrieved_message_id: request.last_retrieved_message_id,
            has_more: tasks.len() >= page_size,
        };
        for task in &tasks {
            messages.last_retrieved_message_id = task.task_id;
            let Some(info) = ReplicationTaskInfo::from_task(task) else {
                continue;
            };
            if let Some(hydrated) = self.hydrate(&info, task.visibility_time).await? {
                messages.tasks.push(hydrated);
            }
        }
        debug!(
            count = messages.tasks.len(),
            last_retrieved = messages.last_retrieved_message_id,
            has_more = messages.has_more,
            "Serving replication tasks"
        );
        Ok(messages)
    }

    pub(crate) async fn get_dlq_replication_messages_inner(
        &self,
        request: GetDlqReplicationMessagesRequest,
    ) -> Result<Vec<ReplicationTask>> {
        let now = Utc::now();
        let mut tasks = Vec::with_capacity(request.task_infos.len());
        for info in &request.task_infos {
            if let Some(task) = self.hydrate(info, now).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Turn a task pointer into a self-contained task. `None` when what it
    /// points at is gone.
    async fn hydrate(
        &self,
        info: &ReplicationTaskInfo,
        creation_time: DateTime<Utc>,
    ) -> Result<Option<ReplicationTask>> {
        let shard = self.shard();
        let store = shard.store();
        let shard_id = shard.shard_id();
        let key = WorkflowKey::new(
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        let Some(persisted) = store.get_workflow_execution(shard_id, &key).await? else {
            warn!(
                workflow_id = %key.workflow_id,
                run_id = %key.run_id,
                task_id = info.task_id,
                "Replication task points at a missing run"
            );
            return Ok(None);
        };
        let ms = persisted.state;

        let attributes = match info.task_type {
            ReplicationTaskType::History => {
                let events = store
                    .read_history_events(
                        shard_id,
                        &info.branch_token,
                        info.first_event_id,
                        info.next_event_id,
                    )
                    .await?;
                let branch = ms
                    .version_histories
                    .histories
                    .iter()
                    .find(|h| h.branch_token == info.branch_token);
                let last_event_id = info.next_event_id - 1;
                let (Some(branch), false) = (branch, events.is_empty()) else {
                    warn!(
                        task_id = info.task_id,
                        branch_token = %info.branch_token,
                        "Replication task points at missing history"
                    );
                    return Ok(None);
                };
                let version = branch.version_at(last_event_id).ok_or_else(|| {
                    HistoryError::invalid_state(format!(
                        "branch {} has no event {}",
                        info.branch_token, last_event_id
                    ))
                })?;
                let items = branch.truncated_at(VersionHistoryItem::new(last_event_id, version))?;
                let new_run_events = match &info.new_run_id {
                    Some(run_id) => self.first_batch(&key, run_id).await?,
                    None => Vec::new(),
                };
                ReplicationTaskAttributes::History(ReplicateEventsV2Request {
                    source_cluster: shard.cluster().current_cluster().to_string(),
                    domain_id: info.domain_id.clone(),
                    execution: info.execution(),
                    version_history_items: items,
                    events,
                    new_run_id: info.new_run_id.clone().filter(|_| !new_run_events.is_empty()),
                    new_run_events,
                })
            }
            ReplicationTaskType::SyncActivity => {
                let Some(ai) = ms.pending_activities.get(&info.schedule_id) else {
                    debug!(
                        schedule_id = info.schedule_id,
                        "Activity finished before its progress was shipped"
                    );
                    return Ok(None);
                };
                ReplicationTaskAttributes::SyncActivity(SyncActivityRequest {
                    domain_id: info.domain_id.clone(),
                    workflow_id: info.workflow_id.clone(),
                    run_id: info.run_id.clone(),
                    version: ai.version,
                    scheduled_id: ai.schedule_id,
                    scheduled_time: Some(ai.scheduled_time),
                    started_id: ai.started_id,
                    started_time: ai.started_time,
                    last_heartbeat_time: ai.last_heartbeat_time,
                    details: ai.details.clone(),
                    attempt: ai.attempt,
                    last_failure_reason: ai.last_failure_reason.clone(),
                    last_worker_identity: ai.last_worker_identity.clone(),
                })
            }
        };

        Ok(Some(ReplicationTask {
            source_task_id: info.task_id,
            creation_time,
            info: info.clone(),
            attributes,
        }))
    }

    /// First transaction's events of a successor run.
    async fn first_batch(&self, predecessor: &WorkflowKey, run_id: &str) -> Result<Vec<HistoryEvent>> {
        let shard = self.shard();
        let key = WorkflowKey::new(
            predecessor.domain_id.clone(),
            predecessor.workflow_id.clone(),
            run_id,
        );
        let Some(persisted) = shard.store().get_workflow_execution(shard.shard_id(), &key).await?
        else {
            return Ok(Vec::new());
        };
        let token = persisted.state.current_branch_token()?;
        let events = shard
            .store()
            .read_history_events(
                shard.shard_id(),
                &token,
                FIRST_EVENT_ID,
                persisted.state.next_event_id(),
            )
            .await?;
        let batch = events.first().map(|e| e.task_id);
        Ok(events
            .into_iter()
            .take_while(|e| Some(e.task_id) == batch)
            .collect())
    }

    // ========================================================================
    // DLQ
    // ========================================================================

    async fn read_dlq_page(
        &self,
        source_cluster: &str,
        inclusive_end: i64,
        page_size: usize,
        page_token: Option<i64>,
    ) -> Result<(Vec<ReplicationTaskInfo>, Option<i64>)> {
        if source_cluster.is_empty() {
            return Err(HistoryError::bad_request("source_cluster", "is required"));
        }
        let shard = self.shard();
        let page_size = match page_size {
            0 => shard.config().replication_page_size.max(1),
            n => n,
        };
        let infos = shard
            .store()
            .get_replication_dlq(
                shard.shard_id(),
                source_cluster,
                page_token.unwrap_or(0),
                inclusive_end,
                page_size,
            )
            .await?;
        let next = if infos.len() >= page_size {
            infos.last().map(|info| info.task_id)
        } else {
            None
        };
        Ok((infos, next))
    }

    pub(crate) async fn read_dlq_messages_inner(
        &self,
        request: ReadDlqMessagesRequest,
    ) -> Result<ReadDlqMessagesResponse> {
        let (replication_tasks_info, next_page_token) = self
            .read_dlq_page(
                &request.source_cluster,
                request.inclusive_end_message_id,
                request.maximum_page_size,
                request.next_page_token,
            )
            .await?;
        Ok(ReadDlqMessagesResponse {
            replication_tasks_info,
            next_page_token,
        })
    }

    pub(crate) async fn purge_dlq_messages_inner(&self, request: PurgeDlqMessagesRequest) -> Result<()> {
        if request.source_cluster.is_empty() {
            return Err(HistoryError::bad_request("source_cluster", "is required"));
        }
        let shard = self.shard();
        let purged = shard
            .store()
            .range_delete_replication_dlq(
                shard.shard_id(),
                &request.source_cluster,
                0,
                request.inclusive_end_message_id,
            )
            .await?;
        info!(
            source_cluster = %request.source_cluster,
            inclusive_end = request.inclusive_end_message_id,
            purged,
            "Purged replication DLQ"
        );
        Ok(())
    }

    /// Re-hydrate one DLQ page on the source cluster and apply it. A task
    /// that fails again stops the merge and leaves the page parked.
    #[instrument(skip(self, ctx, request), fields(source_cluster = %request.source_cluster))]
    pub(crate) async fn merge_dlq_messages_inner(
        &self,
        ctx: &CallContext,
        request: MergeDlqMessagesRequest,
    ) -> Result<MergeDlqMessagesResponse> {
        let (infos, next_page_token) = self
            .read_dlq_page(
                &request.source_cluster,
                request.inclusive_end_message_id,
                request.maximum_page_size,
                request.next_page_token,
            )
            .await?;
        let Some(last) = infos.last().map(|info| info.task_id) else {
            return Ok(MergeDlqMessagesResponse {
                next_page_token: None,
            });
        };

        let tasks = self
            .remote_clusters()
            .get_dlq_replication_messages(
                ctx,
                &request.source_cluster,
                GetDlqReplicationMessagesRequest {
                    task_infos: infos.clone(),
                },
            )
            .await?;
        for task in &tasks {
            apply_task(self, ctx, task).await?;
        }

        let shard = self.shard();
        let removed = shard
            .store()
            .range_delete_replication_dlq(
                shard.shard_id(),
                &request.source_cluster,
                request.next_page_token.unwrap_or(0),
                last,
            )
            .await?;
        info!(
            parked = infos.len(),
            applied = tasks.len(),
            removed,
            "Merged replication DLQ page"
        );
        Ok(MergeDlqMessagesResponse { next_page_token })
    }

    // ========================================================================
    // Reapply
    // ========================================================================

    /// Re-inject signals into the current run. Each event is applied at
    /// most once, keyed by its source run, id and version.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.workflow_id,
        source_run_id = %request.source_run_id,
    ))]
    pub(crate) async fn reapply_events_inner(
        &self,
        ctx: &CallContext,
        request: ReapplyEventsRequest,
    ) -> Result<()> {
        const OPERATION: &str = "reapply_events";
        let key = self
            .resolve_key(
                &request.domain_id,
                &WorkflowExecution::new(request.workflow_id.clone(), ""),
            )
            .await?;
        let signals: Vec<&HistoryEvent> = request
            .events
            .iter()
            .filter(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionSignaled { .. }))
            .collect();
        if signals.is_empty() {
            return Ok(());
        }

        let reapplied = self
            .update_workflow(ctx, OPERATION, &key, |ms| {
                if !ms.is_running() {
                    debug!("Current run closed, nothing to reapply to");
                    return Ok(UpdateOutcome::Unchanged(0));
                }
                let own_history = request.source_run_id == ms.execution_info.run_id;
                let mut count = 0;
                for event in &signals {
                    let signature = reapply_signature(&request.source_run_id, event);
                    if ms.reapplied_events.contains(&signature) {
                        continue;
                    }
                    if own_history
                        && ms
                            .version_histories
                            .current()?
                            .contains(VersionHistoryItem::new(event.event_id, event.version))
                    {
                        continue;
                    }
                    if let EventAttributes::WorkflowExecutionSignaled {
                        signal_name,
                        input,
                        identity,
                    } = &event.attributes
                    {
                        ms.add_workflow_execution_signaled(signal_name, input.clone(), identity)?;
                        ms.reapplied_events.insert(signature);
                        count += 1;
                    }
                }
                if count == 0 {
                    Ok(UpdateOutcome::Unchanged(0))
                } else {
                    Ok(UpdateOutcome::PersistAndScheduleDecision(count))
                }
            })
            .await?;
        info!(run_id = %key.run_id, reapplied, "Reapplied events");
        Ok(())
    }
}

fn replicated_key(domain_id: &str, execution: &WorkflowExecution) -> Result<WorkflowKey> {
    if domain_id.is_empty() {
        return Err(HistoryError::bad_request("domain_id", "is required"));
    }
    if execution.workflow_id.is_empty() {
        return Err(HistoryError::bad_request("workflow_id", "is required"));
    }
    if execution.run_id.is_empty() {
        return Err(HistoryError::bad_request("run_id", "is required for replication"));
    }
    Ok(WorkflowKey::new(
        domain_id,
        execution.workflow_id.clone(),
        execution.run_id.clone(),
    ))
}

/// Events must be contiguous and end where the version history ends.
fn validate_batch(events: &[HistoryEvent], items: &[VersionHistoryItem]) -> Result<()> {
    let (Some(first), Some(last)) = (events.first(), events.last()) else {
        return Err(HistoryError::bad_request("events", "must not be empty"));
    };
    if first.event_id < FIRST_EVENT_ID {
        return Err(HistoryError::bad_request("events", "event ids start at 1"));
    }
    if events
        .windows(2)
        .any(|pair| pair[1].event_id != pair[0].event_id + 1)
    {
        return Err(HistoryError::bad_request("events", "event ids must be contiguous"));
    }
    match items.last() {
        Some(item) if item.event_id == last.event_id && item.version == last.version => Ok(()),
        Some(item) => Err(HistoryError::bad_request(
            "version_history_items",
            format!(
                "end at ({}, {}) but the last event is ({}, {})",
                item.event_id, item.version, last.event_id, last.version
            ),
        )),
        None => Err(HistoryError::bad_request(
            "version_history_items",
            "must not be empty",
        )),
    }
}

/// Version history of a batch that starts a run.
fn items_of(events: &[HistoryEvent]) -> Result<Vec<VersionHistoryItem>> {
    let mut history = VersionHistory::default();
    for event in events {
        history.add_or_update(event.event_id, event.version)?;
    }
    Ok(history.items)
}

/// Local current branch up to the event before `first_event_id`, or the
/// whole branch when it ends earlier.
fn local_prefix(ms: &MutableState, first_event_id: i64) -> Result<VersionHistory> {
    let current = ms.version_histories.current()?;
    let prefix_end = first_event_id - 1;
    match current.version_at(prefix_end) {
        Some(version) => Ok(VersionHistory::new(
            current.branch_token.clone(),
            current.truncated_at(VersionHistoryItem::new(prefix_end, version))?,
        )),
        None if prefix_end < FIRST_EVENT_ID => Ok(VersionHistory::default()),
        None => Ok(current.clone()),
    }
}

fn reapply_signature(source_run_id: &str, event: &HistoryEvent) -> String {
    format!(
        "{}:{}:{}:{}",
        source_run_id,
        event.event_id,
        event.version,
        event.event_type()
    )
}

fn retry_task(
    key: &WorkflowKey,
    start_event_id: i64,
    start_version: i64,
    end_event_id: i64,
    end_version: i64,
) -> HistoryError {
    HistoryError::RetryTask {
        domain_id: key.domain_id.clone(),
        workflow_id: key.workflow_id.clone(),
        run_id: key.run_id.clone(),
        start_event_id,
        start_version,
        end_event_id,
        end_version,
    }
}
