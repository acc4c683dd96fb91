// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow lifecycle operations.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{HistoryEngine, UpdateOutcome, WriteVersion};
use crate::api::*;
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::events::{EventAttributes, WorkflowExecutionStartedAttributes};
use crate::persistence::{CreateMode, CurrentExecution};
use crate::state::MutableState;
use crate::state::task_generator;
use crate::types::{
    FIRST_EVENT_ID, Payload, TaskList, WorkflowExecution, WorkflowIdReusePolicy, WorkflowKey,
    WorkflowState,
};

const TERMINATE_IF_RUNNING_REASON: &str = "terminated to start a new run (TerminateIfRunning)";

impl HistoryEngine {
    // ========================================================================
    // Start
    // ========================================================================

    /// Create a run, optionally carrying a signal in its first batch.
    #[instrument(skip(self, ctx, request, signal), fields(
        domain_id = %request.domain_id,
        workflow_id = %request.workflow_id,
    ))]
    pub(crate) async fn start_workflow(
        &self,
        ctx: &CallContext,
        request: StartWorkflowExecutionRequest,
        signal: Option<(String, Option<Payload>)>,
    ) -> Result<StartWorkflowExecutionResponse> {
        validate_start(&request)?;
        let version = self.active_version(&request.domain_id)?;
        let shard_id = self.shard().shard_id();
        let retries = self.shard().config().conflict_retry_count.max(1);

        for attempt in 0..retries {
            ctx.check("start_workflow_execution")?;

            // 1. Optimistically assume the workflow id is unused
            let run_id = Uuid::new_v4().to_string();
            let ms = self.new_run_state(&request, &run_id, version, signal.as_ref())?;
            let err = match self.create_run(CreateMode::BrandNew, ms).await {
                Ok(()) => {
                    info!(run_id = %run_id, "Workflow started");
                    return Ok(StartWorkflowExecutionResponse { run_id });
                }
                Err(err) => err,
            };

            // 2. Someone holds the workflow id
            match err {
                HistoryError::WorkflowAlreadyStarted {
                    run_id: existing,
                    start_request_id,
                    ..
                } if !request.request_id.is_empty() && start_request_id == request.request_id => {
                    debug!(run_id = %existing, "Start request already applied");
                    return Ok(StartWorkflowExecutionResponse { run_id: existing });
                }
                HistoryError::WorkflowAlreadyStarted { .. } => {}
                HistoryError::Conflict { .. } => continue,
                other => return Err(other),
            }

            let Some(current) = self
                .shard()
                .store()
                .get_current_execution(shard_id, &request.domain_id, &request.workflow_id)
                .await?
            else {
                continue;
            };

            // 3. Apply the reuse policy against the current run
            if current.is_running() {
                if request.workflow_id_reuse_policy != WorkflowIdReusePolicy::TerminateIfRunning {
                    return Err(already_started(&current));
                }
                let current_key =
                    WorkflowKey::new(&request.domain_id, &request.workflow_id, &current.run_id);
                match self
                    .terminate_run(ctx, &current_key, TERMINATE_IF_RUNNING_REASON, &request.identity)
                    .await
                {
                    Ok(()) | Err(HistoryError::WorkflowCompleted) => {}
                    Err(err) => return Err(err),
                }
                debug!(attempt, previous_run_id = %current.run_id, "Terminated running run, retrying start");
                continue;
            }
            check_reuse_policy(request.workflow_id_reuse_policy, &current)?;

            let run_id = Uuid::new_v4().to_string();
            let ms = self.new_run_state(&request, &run_id, version, signal.as_ref())?;
            let mode = CreateMode::WorkflowIdReuse {
                previous_run_id: current.run_id.clone(),
                previous_last_write_version: current.last_write_version,
            };
            match self.create_run(mode, ms).await {
                Ok(()) => {
                    info!(run_id = %run_id, previous_run_id = %current.run_id, "Workflow started");
                    return Ok(StartWorkflowExecutionResponse { run_id });
                }
                Err(HistoryError::Conflict { .. }) | Err(HistoryError::WorkflowAlreadyStarted { .. }) => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(HistoryError::conflict(format!(
            "workflow id '{}' kept changing owner during start",
            request.workflow_id
        )))
    }

    /// First transaction of a new run, left open for [`Self::create_run`].
    fn new_run_state(
        &self,
        request: &StartWorkflowExecutionRequest,
        run_id: &str,
        version: i64,
        signal: Option<&(String, Option<Payload>)>,
    ) -> Result<MutableState> {
        let key = WorkflowKey::new(&request.domain_id, &request.workflow_id, run_id);
        let branch = Uuid::new_v4().to_string();
        let mut ms = MutableState::new(&key, branch, version);
        ms.execution_info.retention_seconds = self.shard().config().retention.as_secs() as i64;

        ms.start_transaction(version, self.shard().cluster().is_global());
        ms.add_workflow_execution_started(WorkflowExecutionStartedAttributes {
            workflow_type: request.workflow_type.clone(),
            task_list: TaskList::normal(request.task_list.clone()),
            input: request.input.clone(),
            execution_start_to_close_timeout_seconds: request
                .execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds: request.task_start_to_close_timeout_seconds,
            identity: request.identity.clone(),
            parent: request.parent.clone(),
            continued_execution_run_id: None,
            first_execution_run_id: run_id.to_string(),
            first_decision_task_backoff_seconds: request.delay_start_seconds,
            memo: request.memo.clone(),
            search_attributes: request.search_attributes.clone(),
            request_id: request.request_id.clone(),
        })?;
        if let Some((name, input)) = signal {
            if !request.request_id.is_empty() {
                ms.signal_requested_ids.insert(request.request_id.clone());
            }
            ms.add_workflow_execution_signaled(name, input.clone(), &request.identity)?;
        }
        if request.delay_start_seconds <= 0 {
            ms.add_decision_task_scheduled()?;
        }
        Ok(ms)
    }

    async fn terminate_run(
        &self,
        ctx: &CallContext,
        key: &WorkflowKey,
        reason: &str,
        identity: &str,
    ) -> Result<()> {
        self.update_workflow(ctx, "terminate_workflow_execution", key, |ms| {
            ms.add_workflow_execution_terminated(reason, None, identity)?;
            Ok(UpdateOutcome::Persist(()))
        })
        .await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn get_mutable_state_inner(
        &self,
        ctx: &CallContext,
        request: GetMutableStateRequest,
    ) -> Result<GetMutableStateResponse> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        let ms = self.load_state(ctx, "get_mutable_state", &key).await?;
        check_branch(&ms, request.current_branch_token.as_deref())?;
        Ok(mutable_state_response(&ms))
    }

    /// Long poll: return once the run moves past the expected event id or
    /// closes. The wait is bounded by the caller deadline, which yields
    /// `Timeout`, and by the configured long-poll cap, which returns the
    /// unchanged state.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        expected_next_event_id = request.expected_next_event_id,
    ))]
    pub(crate) async fn poll_mutable_state_inner(
        &self,
        ctx: &CallContext,
        request: PollMutableStateRequest,
    ) -> Result<PollMutableStateResponse> {
        const OPERATION: &str = "poll_mutable_state";
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;

        // 1. Subscribe before reading so no write slips in between
        let mut subscription = self.history_notifier().subscribe(&key);
        let ms = self.load_state(ctx, OPERATION, &key).await?;
        let branch = request.current_branch_token.as_deref();
        check_branch(&ms, branch)?;
        let expected = request.expected_next_event_id;
        if ms.next_event_id() > expected || !ms.is_running() {
            return Ok(mutable_state_response(&ms));
        }

        // 2. Wait for a notification that satisfies the caller
        let shutdown = self.shutdown_token().clone();
        let wait = async {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Err(self.stopped()),
                    notification = subscription.changed() => {
                        let Some(notification) = notification else {
                            return Err(self.stopped());
                        };
                        if let Some(branch) = branch
                            && notification.current_branch_token != branch
                        {
                            return Err(HistoryError::CurrentBranchChanged {
                                details: format!(
                                    "branch moved to {}",
                                    notification.current_branch_token
                                ),
                            });
                        }
                        if notification.next_event_id > expected
                            || !notification.is_workflow_running
                        {
                            return Ok(());
                        }
                    }
                }
            }
        };
        let cap = self.shard().config().long_poll_timeout;
        match tokio::time::timeout(cap, ctx.run(OPERATION, wait)).await {
            Ok(result) => result?,
            Err(_) => debug!("Long poll cap reached"),
        }

        // 3. Report the position after the wake-up
        let ms = self.load_state(ctx, OPERATION, &key).await?;
        Ok(mutable_state_response(&ms))
    }

    #[instrument(skip(self, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn describe_mutable_state_inner(
        &self,
        request: DescribeMutableStateRequest,
    ) -> Result<DescribeMutableStateResponse> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;

        let mutable_state_in_cache = match self.cache().get(&key)?.and_then(|c| c.try_snapshot()) {
            Some(cached) => Some(serde_json::to_string(&cached.ms)?),
            None => None,
        };
        let persisted = self
            .shard()
            .store()
            .get_workflow_execution(self.shard().shard_id(), &key)
            .await?
            .ok_or_else(|| HistoryError::WorkflowNotFound {
                workflow_id: key.workflow_id.clone(),
                run_id: key.run_id.clone(),
            })?;

        Ok(DescribeMutableStateResponse {
            mutable_state_in_cache,
            mutable_state_in_database: serde_json::to_string(&persisted.state)?,
        })
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn describe_workflow_execution_inner(
        &self,
        ctx: &CallContext,
        request: DescribeWorkflowExecutionRequest,
    ) -> Result<DescribeWorkflowExecutionResponse> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        let ms = self.load_state(ctx, "describe_workflow_execution", &key).await?;
        let info = &ms.execution_info;

        let pending_activities = ms
            .pending_activities
            .values()
            .map(|ai| PendingActivityInfo {
                activity_id: ai.activity_id().to_string(),
                activity_type: ai.scheduled.activity_type.clone(),
                state: if ai.cancel_requested {
                    PendingActivityState::CancelRequested
                } else if ai.is_started() {
                    PendingActivityState::Started
                } else {
                    PendingActivityState::Scheduled
                },
                heartbeat_details: ai.details.clone(),
                last_heartbeat_time: ai.last_heartbeat_time,
                last_started_time: ai.started_time,
                attempt: ai.attempt,
                scheduled_time: ai.scheduled_time,
                expiration_time: ai.expiration_time,
                last_failure_reason: ai.last_failure_reason.clone(),
                last_worker_identity: ai.last_worker_identity.clone(),
            })
            .collect();
        let pending_children = ms
            .pending_children
            .values()
            .map(|ci| PendingChildExecutionInfo {
                domain: ci.domain.clone(),
                workflow_id: ci.workflow_id.clone(),
                run_id: ci.run_id.clone(),
                workflow_type: ci.workflow_type.clone(),
                initiated_id: ci.initiated_id,
            })
            .collect();
        let closed = info.state == WorkflowState::Completed;

        Ok(DescribeWorkflowExecutionResponse {
            execution_configuration: WorkflowExecutionConfiguration {
                task_list: info.task_list.clone(),
                execution_start_to_close_timeout_seconds: info.workflow_timeout_seconds,
                task_start_to_close_timeout_seconds: info.decision_timeout_seconds,
            },
            workflow_execution_info: WorkflowExecutionInfo {
                execution: key.execution(),
                workflow_type: info.workflow_type.clone(),
                start_time: to_unix_nanos(info.start_time),
                execution_time: to_unix_nanos(info.execution_time),
                close_time: info.close_time.filter(|_| closed).map(to_unix_nanos),
                close_status: closed.then_some(info.close_status),
                history_length: ms.next_event_id() - FIRST_EVENT_ID,
                parent: info.parent.clone(),
                memo: (!info.memo.is_empty()).then(|| info.memo.clone()),
                search_attributes: (!info.search_attributes.is_empty())
                    .then(|| info.search_attributes.clone()),
                task_list: info.task_list.clone(),
            },
            pending_activities,
            pending_children,
        })
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn reset_sticky_task_list_inner(
        &self,
        ctx: &CallContext,
        request: ResetStickyTaskListRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow_with(
            ctx,
            "reset_sticky_task_list",
            &key,
            WriteVersion::Existing,
            |ms| {
                if !ms.is_running() || ms.execution_info.sticky_task_list.is_none() {
                    return Ok(UpdateOutcome::Unchanged(()));
                }
                ms.clear_sticky_task_list();
                Ok(UpdateOutcome::Persist(()))
            },
        )
        .await
    }

    // ========================================================================
    // Signals
    // ========================================================================

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        signal_name = %request.signal_name,
    ))]
    pub(crate) async fn signal_workflow(
        &self,
        ctx: &CallContext,
        request: SignalWorkflowExecutionRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        let max_signals = self.shard().config().max_signals_per_execution;

        self.update_workflow(ctx, "signal_workflow_execution", &key, |ms| {
            if !ms.is_running() {
                return Err(HistoryError::WorkflowCompleted);
            }
            if request.child_workflow_only {
                check_parent(ms, request.external_execution.as_ref())?;
            }
            let request_id = request.request_id.as_str();
            if !request_id.is_empty() && ms.signal_requested_ids.contains(request_id) {
                debug!(request_id, "Signal already delivered");
                return Ok(UpdateOutcome::Unchanged(()));
            }
            if max_signals > 0 && ms.execution_info.signal_count >= max_signals {
                warn!(
                    signal_count = ms.execution_info.signal_count,
                    "Signal limit reached"
                );
                return Err(HistoryError::LimitExceeded {
                    details: format!("workflow already received {} signals", max_signals),
                });
            }
            if !request_id.is_empty() {
                ms.signal_requested_ids.insert(request_id.to_string());
            }
            ms.add_workflow_execution_signaled(
                &request.signal_name,
                request.input.clone(),
                &request.identity,
            )?;
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    /// Signal the running run of the workflow id, or start a new run with
    /// the signal in its first batch. Racing callers converge on one run.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.start.workflow_id,
        signal_name = %request.signal_name,
    ))]
    pub(crate) async fn signal_with_start(
        &self,
        ctx: &CallContext,
        request: SignalWithStartWorkflowExecutionRequest,
    ) -> Result<StartWorkflowExecutionResponse> {
        let start = &request.start;
        validate_start(start)?;
        let shard_id = self.shard().shard_id();
        let retries = self.shard().config().conflict_retry_count.max(1);

        for _ in 0..retries {
            ctx.check("signal_with_start_workflow_execution")?;
            let current = self
                .shard()
                .store()
                .get_current_execution(shard_id, &start.domain_id, &start.workflow_id)
                .await?;

            // 1. Deliver to the running run
            if let Some(current) = current.as_ref().filter(|c| c.is_running()) {
                let signal = SignalWorkflowExecutionRequest {
                    domain_id: start.domain_id.clone(),
                    execution: WorkflowExecution::new(&start.workflow_id, &current.run_id),
                    signal_name: request.signal_name.clone(),
                    input: request.signal_input.clone(),
                    identity: start.identity.clone(),
                    request_id: start.request_id.clone(),
                    external_execution: None,
                    child_workflow_only: false,
                };
                match self.signal_workflow(ctx, signal).await {
                    Ok(()) => {
                        return Ok(StartWorkflowExecutionResponse {
                            run_id: current.run_id.clone(),
                        });
                    }
                    Err(HistoryError::WorkflowCompleted) => continue,
                    Err(err) => return Err(err),
                }
            }

            // 2. No open run: start one carrying the signal
            let signal = Some((request.signal_name.clone(), request.signal_input.clone()));
            match self.start_workflow(ctx, start.clone(), signal).await {
                Ok(response) => return Ok(response),
                Err(HistoryError::WorkflowAlreadyStarted { run_id, .. })
                    if current.as_ref().map(|c| c.run_id.as_str()) != Some(run_id.as_str()) =>
                {
                    debug!(run_id = %run_id, "Lost start race, signalling the winner");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(HistoryError::conflict(format!(
            "workflow id '{}' kept changing owner during signal with start",
            start.workflow_id
        )))
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn remove_signal_mutable_state_inner(
        &self,
        ctx: &CallContext,
        request: RemoveSignalMutableStateRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow_with(
            ctx,
            "remove_signal_mutable_state",
            &key,
            WriteVersion::Existing,
            |ms| {
                if ms.signal_requested_ids.remove(&request.request_id) {
                    Ok(UpdateOutcome::Persist(()))
                } else {
                    Ok(UpdateOutcome::Unchanged(()))
                }
            },
        )
        .await
    }

    // ========================================================================
    // Cancel, terminate, reset
    // ========================================================================

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn request_cancel_workflow(
        &self,
        ctx: &CallContext,
        request: RequestCancelWorkflowExecutionRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        self.update_workflow(ctx, "request_cancel_workflow_execution", &key, |ms| {
            if !ms.is_running() {
                return Err(HistoryError::WorkflowCompleted);
            }
            if request.child_workflow_only {
                check_parent(ms, request.external_execution.as_ref())?;
            }
            if ms.execution_info.cancel_requested {
                if !request.request_id.is_empty()
                    && ms.execution_info.cancel_request_id == request.request_id
                {
                    return Ok(UpdateOutcome::Unchanged(()));
                }
                return Err(HistoryError::invalid_state("cancellation already requested"));
            }
            let external = match (request.external_initiated_event_id, &request.external_execution) {
                (Some(initiated_id), Some(execution)) => Some((initiated_id, execution.clone())),
                _ => None,
            };
            ms.add_workflow_execution_cancel_requested(
                &request.cause,
                &request.request_id,
                &request.identity,
                external,
            )?;
            Ok(UpdateOutcome::PersistAndScheduleDecision(()))
        })
        .await
    }

    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub(crate) async fn terminate_workflow(
        &self,
        ctx: &CallContext,
        request: TerminateWorkflowExecutionRequest,
    ) -> Result<()> {
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;
        let closed = self
            .update_workflow(ctx, "terminate_workflow_execution", &key, |ms| {
                if !ms.is_running() {
                    return Ok(UpdateOutcome::Unchanged(false));
                }
                ms.add_workflow_execution_terminated(
                    &request.reason,
                    request.details.clone(),
                    &request.identity,
                )?;
                Ok(UpdateOutcome::Persist(true))
            })
            .await?;
        if closed {
            info!(reason = %request.reason, "Workflow terminated");
        } else {
            debug!("Workflow already closed, terminate ignored");
        }
        Ok(())
    }

    /// Start a new run from the history of `execution` up to (excluding)
    /// `decision_finish_event_id`, re-applying later signals. The current
    /// run is terminated in the same write when it is still open.
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        decision_finish_event_id = request.decision_finish_event_id,
    ))]
    pub(crate) async fn reset_workflow(
        &self,
        ctx: &CallContext,
        request: ResetWorkflowExecutionRequest,
    ) -> Result<ResetWorkflowExecutionResponse> {
        const OPERATION: &str = "reset_workflow_execution";
        let base_key = self.resolve_key(&request.domain_id, &request.execution).await?;
        let version = self.active_version(&request.domain_id)?;
        let base = self.load_state(ctx, OPERATION, &base_key).await?;
        let store = self.shard().store();
        let shard_id = self.shard().shard_id();

        // 1. The reset point must finish a decision
        let finish = request.decision_finish_event_id;
        if finish <= FIRST_EVENT_ID + 1 || finish >= base.next_event_id() {
            return Err(HistoryError::bad_request(
                "decision_finish_event_id",
                format!("{} is outside the run's history", finish),
            ));
        }
        let base_branch = base.current_branch_token()?;
        let finishing = store
            .read_history_events(shard_id, &base_branch, finish, finish + 1)
            .await?;
        if !finishing.first().is_some_and(|e| e.attributes.is_decision_close()) {
            return Err(HistoryError::bad_request(
                "decision_finish_event_id",
                format!("event {} does not finish a decision", finish),
            ));
        }

        // 2. Fork the history right before the reset point and rebuild
        let new_run_id = Uuid::new_v4().to_string();
        let new_branch = Uuid::new_v4().to_string();
        store
            .fork_history_branch(shard_id, &base_branch, finish - 1, &new_branch)
            .await?;
        let history = store
            .read_history_events(shard_id, &new_branch, FIRST_EVENT_ID, finish)
            .await?;
        let new_key = WorkflowKey::new(&request.domain_id, &base_key.workflow_id, &new_run_id);
        let mut ms = MutableState::rebuild(&new_key, &new_branch, &history)?;
        ms.execution_info.create_request_id = request.request_id.clone();
        ms.execution_info.retention_seconds = base.execution_info.retention_seconds;

        // 3. Fail the decision at the fork point, re-apply later signals
        ms.start_transaction(version, self.shard().cluster().is_global());
        ms.add_reset_decision_task_failed(
            &request.reason,
            &base_key.run_id,
            &new_run_id,
            &request.identity,
        )?;
        let tail = store
            .read_history_events(shard_id, &base_branch, finish, base.next_event_id())
            .await?;
        let mut reapplied = 0;
        for event in &tail {
            if let EventAttributes::WorkflowExecutionSignaled {
                signal_name,
                input,
                identity,
            } = &event.attributes
            {
                ms.add_workflow_execution_signaled(signal_name, input.clone(), identity)?;
                reapplied += 1;
            }
        }
        ms.add_decision_task_scheduled()?;
        ms.pending.tasks = task_generator::refresh_tasks(&ms);

        // 4. Replace the current run
        let current = store
            .get_current_execution(shard_id, &request.domain_id, &base_key.workflow_id)
            .await?
            .ok_or_else(|| HistoryError::WorkflowNotFound {
                workflow_id: base_key.workflow_id.clone(),
                run_id: String::new(),
            })?;
        if current.is_running() {
            let current_key =
                WorkflowKey::new(&request.domain_id, &base_key.workflow_id, &current.run_id);
            self.update_workflow(ctx, OPERATION, &current_key, |running| {
                running.add_workflow_execution_terminated(
                    &request.reason,
                    None,
                    &request.identity,
                )?;
                running.pending.new_run = Some(Box::new(ms.clone()));
                Ok(UpdateOutcome::Persist(()))
            })
            .await?;
        } else {
            let mode = CreateMode::WorkflowIdReuse {
                previous_run_id: current.run_id.clone(),
                previous_last_write_version: current.last_write_version,
            };
            self.create_run(mode, ms).await?;
        }

        info!(new_run_id = %new_run_id, reapplied, "Workflow reset");
        Ok(ResetWorkflowExecutionResponse { run_id: new_run_id })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn validate_start(request: &StartWorkflowExecutionRequest) -> Result<()> {
    if request.domain_id.is_empty() {
        return Err(HistoryError::bad_request("domain_id", "is required"));
    }
    if request.workflow_id.is_empty() {
        return Err(HistoryError::bad_request("workflow_id", "is required"));
    }
    if request.workflow_type.is_empty() {
        return Err(HistoryError::bad_request("workflow_type", "is required"));
    }
    if request.task_list.is_empty() {
        return Err(HistoryError::bad_request("task_list", "is required"));
    }
    if request.execution_start_to_close_timeout_seconds <= 0 {
        return Err(HistoryError::bad_request(
            "execution_start_to_close_timeout_seconds",
            "must be positive",
        ));
    }
    if request.task_start_to_close_timeout_seconds <= 0 {
        return Err(HistoryError::bad_request(
            "task_start_to_close_timeout_seconds",
            "must be positive",
        ));
    }
    if request.delay_start_seconds < 0 {
        return Err(HistoryError::bad_request("delay_start_seconds", "must not be negative"));
    }
    Ok(())
}

fn already_started(current: &CurrentExecution) -> HistoryError {
    HistoryError::WorkflowAlreadyStarted {
        workflow_id: current.workflow_id.clone(),
        run_id: current.run_id.clone(),
        start_request_id: current.create_request_id.clone(),
    }
}

/// Whether a closed current run may be followed by a new run.
fn check_reuse_policy(policy: WorkflowIdReusePolicy, current: &CurrentExecution) -> Result<()> {
    let allowed = match policy {
        WorkflowIdReusePolicy::AllowDuplicate | WorkflowIdReusePolicy::TerminateIfRunning => true,
        WorkflowIdReusePolicy::AllowDuplicateFailedOnly => current.close_status.is_failure(),
        WorkflowIdReusePolicy::RejectDuplicate => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(already_started(current))
    }
}

fn check_parent(ms: &MutableState, external: Option<&WorkflowExecution>) -> Result<()> {
    let is_child = match (&ms.execution_info.parent, external) {
        (Some(parent), Some(external)) => {
            parent.execution.workflow_id == external.workflow_id
                && (external.run_id.is_empty() || parent.execution.run_id == external.run_id)
        }
        _ => false,
    };
    if is_child {
        Ok(())
    } else {
        Err(HistoryError::WorkflowNotFound {
            workflow_id: ms.execution_info.workflow_id.clone(),
            run_id: ms.execution_info.run_id.clone(),
        })
    }
}

fn check_branch(ms: &MutableState, expected: Option<&str>) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let current = ms.current_branch_token()?;
    if current != expected {
        return Err(HistoryError::CurrentBranchChanged {
            details: format!("caller reads {}, current branch is {}", expected, current),
        });
    }
    Ok(())
}

pub(crate) fn mutable_state_response(ms: &MutableState) -> GetMutableStateResponse {
    let info = &ms.execution_info;
    GetMutableStateResponse {
        execution: ms.key().execution(),
        workflow_type: info.workflow_type.clone(),
        next_event_id: ms.next_event_id(),
        previous_started_event_id: info.last_processed_event_id,
        last_first_event_id: info.last_first_event_id,
        task_list: info.task_list.clone(),
        sticky_task_list: info.sticky_task_list.clone(),
        sticky_schedule_to_start_timeout_seconds: info.sticky_schedule_to_start_timeout_seconds,
        current_branch_token: ms.current_branch_token().unwrap_or_default(),
        is_workflow_running: ms.is_running(),
        workflow_state: info.state,
        close_status: info.close_status,
        version_histories: ms.version_histories.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Engine;
    use super::super::test_support::*;
    use super::*;
    use crate::config::{ClusterMetadata, EngineConfig};
    use crate::types::CloseStatus;
    use std::time::Duration;

    fn get_request(key: &WorkflowKey, expected: i64) -> GetMutableStateRequest {
        GetMutableStateRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            expected_next_event_id: expected,
            current_branch_token: None,
        }
    }

    fn terminate_request(key: &WorkflowKey) -> TerminateWorkflowExecutionRequest {
        TerminateWorkflowExecutionRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            reason: "operator".into(),
            details: None,
            identity: "admin".into(),
        }
    }

    fn signal_request(key: &WorkflowKey, request_id: &str) -> SignalWorkflowExecutionRequest {
        SignalWorkflowExecutionRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            signal_name: "ping".into(),
            input: Some(Payload::from_text("hello")),
            identity: "sender".into(),
            request_id: request_id.into(),
            ..SignalWorkflowExecutionRequest::default()
        }
    }

    #[tokio::test]
    async fn test_start_creates_run_with_first_decision() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;

        let state = engine
            .get_mutable_state(&CallContext::background(), get_request(&key, 0))
            .await
            .unwrap();
        assert_eq!(state.next_event_id, 3);
        assert!(state.is_workflow_running);
        assert_eq!(state.workflow_type, "order");
        assert_eq!(state.task_list, "orders");
    }

    #[tokio::test]
    async fn test_start_is_deduplicated_by_request_id() {
        let engine = engine().await;
        let request = start_request("wf");
        let ctx = CallContext::background();
        let first = engine.start_workflow_execution(&ctx, request.clone()).await.unwrap();
        let second = engine.start_workflow_execution(&ctx, request).await.unwrap();
        assert_eq!(first.run_id, second.run_id);
    }

    #[tokio::test]
    async fn test_start_rejects_running_workflow_id() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let err = engine
            .start_workflow_execution(&CallContext::background(), start_request("wf"))
            .await
            .unwrap_err();
        match err {
            HistoryError::WorkflowAlreadyStarted { run_id, .. } => assert_eq!(run_id, key.run_id),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reuse_policies_after_close() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;
        engine
            .terminate_workflow_execution(&ctx, terminate_request(&key))
            .await
            .unwrap();

        let mut reject = start_request("wf");
        reject.workflow_id_reuse_policy = WorkflowIdReusePolicy::RejectDuplicate;
        assert!(matches!(
            engine.start_workflow_execution(&ctx, reject).await,
            Err(HistoryError::WorkflowAlreadyStarted { .. })
        ));

        // Terminated counts as a failure close.
        let failed_only = start_request("wf");
        let second = engine.start_workflow_execution(&ctx, failed_only).await.unwrap();
        assert_ne!(second.run_id, key.run_id);
    }

    #[tokio::test]
    async fn test_terminate_if_running_replaces_run() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let first = started(&engine, "wf").await;

        let mut request = start_request("wf");
        request.workflow_id_reuse_policy = WorkflowIdReusePolicy::TerminateIfRunning;
        let second = engine.start_workflow_execution(&ctx, request).await.unwrap();
        assert_ne!(second.run_id, first.run_id);

        let old = engine
            .get_mutable_state(&ctx, get_request(&first, 0))
            .await
            .unwrap();
        assert!(!old.is_workflow_running);
        assert_eq!(old.close_status, CloseStatus::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;

        engine
            .terminate_workflow_execution(&ctx, terminate_request(&key))
            .await
            .unwrap();
        let after_first = engine
            .get_mutable_state(&ctx, get_request(&key, 0))
            .await
            .unwrap();
        engine
            .terminate_workflow_execution(&ctx, terminate_request(&key))
            .await
            .unwrap();
        let after_second = engine
            .get_mutable_state(&ctx, get_request(&key, 0))
            .await
            .unwrap();
        assert_eq!(after_first.next_event_id, after_second.next_event_id);
        assert_eq!(after_second.close_status, CloseStatus::Terminated);
    }

    #[tokio::test]
    async fn test_signal_dedup_and_limit() {
        let config = EngineConfig {
            max_signals_per_execution: 2,
            ..EngineConfig::default()
        };
        let engine = engine_with(config, ClusterMetadata::single("active")).await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;

        engine.signal_workflow_execution(&ctx, signal_request(&key, "s1")).await.unwrap();
        engine.signal_workflow_execution(&ctx, signal_request(&key, "s1")).await.unwrap();
        let state = engine.get_mutable_state(&ctx, get_request(&key, 0)).await.unwrap();
        assert_eq!(state.next_event_id, 4);

        engine.signal_workflow_execution(&ctx, signal_request(&key, "s2")).await.unwrap();
        let err = engine
            .signal_workflow_execution(&ctx, signal_request(&key, "s3"))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::LimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_signal_closed_run_fails() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;
        engine
            .terminate_workflow_execution(&ctx, terminate_request(&key))
            .await
            .unwrap();
        let err = engine
            .signal_workflow_execution(&ctx, signal_request(&key, ""))
            .await
            .unwrap_err();
        assert_eq!(err, HistoryError::WorkflowCompleted);
    }

    #[tokio::test]
    async fn test_signal_with_start_signals_running_run() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;

        let response = engine
            .signal_with_start_workflow_execution(
                &ctx,
                SignalWithStartWorkflowExecutionRequest {
                    start: start_request("wf"),
                    signal_name: "ping".into(),
                    signal_input: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(response.run_id, key.run_id);
    }

    #[tokio::test]
    async fn test_request_cancel_is_deduplicated() {
        let engine = engine().await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;
        let request = RequestCancelWorkflowExecutionRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            identity: "admin".into(),
            request_id: "cancel-1".into(),
            cause: "shutdown".into(),
            ..RequestCancelWorkflowExecutionRequest::default()
        };
        engine.request_cancel_workflow_execution(&ctx, request.clone()).await.unwrap();
        engine.request_cancel_workflow_execution(&ctx, request.clone()).await.unwrap();

        let other = RequestCancelWorkflowExecutionRequest {
            request_id: "cancel-2".into(),
            ..request
        };
        assert!(matches!(
            engine.request_cancel_workflow_execution(&ctx, other).await,
            Err(HistoryError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_run_id_addresses_current_run() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let response = engine
            .describe_workflow_execution(
                &CallContext::background(),
                DescribeWorkflowExecutionRequest {
                    domain_id: key.domain_id.clone(),
                    execution: WorkflowExecution::new("wf", ""),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.workflow_execution_info.execution.run_id, key.run_id);
        assert_eq!(response.workflow_execution_info.history_length, 2);
        assert!(response.workflow_execution_info.close_status.is_none());
    }

    #[tokio::test]
    async fn test_branch_mismatch_is_reported() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let mut request = get_request(&key, 0);
        request.current_branch_token = Some("some-other-branch".into());
        let err = engine
            .get_mutable_state(&CallContext::background(), request)
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::CurrentBranchChanged { .. }));
    }

    #[tokio::test]
    async fn test_poll_returns_when_signal_arrives() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;

        let poller = engine.clone();
        let poll_key = key.clone();
        let handle = tokio::spawn(async move {
            poller
                .poll_mutable_state(
                    &CallContext::with_timeout(Duration::from_secs(10)),
                    get_request(&poll_key, 3),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine
            .signal_workflow_execution(&CallContext::background(), signal_request(&key, ""))
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.next_event_id, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_at_deadline() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let started_at = tokio::time::Instant::now();

        let err = engine
            .poll_mutable_state(
                &CallContext::with_timeout(Duration::from_secs(2)),
                get_request(&key, 3),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::Timeout { .. }));
        assert!(started_at.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_describe_mutable_state_has_database_copy() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let response = engine
            .describe_mutable_state(
                &CallContext::background(),
                DescribeMutableStateRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                },
            )
            .await
            .unwrap();
        let stored: serde_json::Value =
            serde_json::from_str(&response.mutable_state_in_database).unwrap();
        assert_eq!(stored["execution_info"]["workflow_id"], "wf");
    }

    #[test]
    fn test_reuse_policy_matrix() {
        let closed = |close_status| CurrentExecution {
            workflow_id: "wf".into(),
            run_id: "r".into(),
            create_request_id: "req".into(),
            state: WorkflowState::Completed,
            close_status,
            last_write_version: 1,
        };
        let completed = closed(CloseStatus::Completed);
        let failed = closed(CloseStatus::Failed);

        assert!(check_reuse_policy(WorkflowIdReusePolicy::AllowDuplicate, &completed).is_ok());
        assert!(check_reuse_policy(WorkflowIdReusePolicy::AllowDuplicateFailedOnly, &failed).is_ok());
        assert!(check_reuse_policy(WorkflowIdReusePolicy::AllowDuplicateFailedOnly, &completed).is_err());
        assert!(check_reuse_policy(WorkflowIdReusePolicy::RejectDuplicate, &failed).is_err());
    }
}
