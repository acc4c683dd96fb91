// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Applies replication tasks pulled from one source cluster.
//!
//! Retryable failures are retried with a linear backoff. Tasks that still
//! fail, or fail with an error retrying cannot fix, are parked in the
//! shard's DLQ for that source so the stream keeps moving.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use super::{ReplicationMessages, ReplicationTask, ReplicationTaskAttributes};
use crate::context::CallContext;
use crate::engine::Engine;
use crate::error::{HistoryError, Result};
use crate::persistence::ExecutionStore;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The engine accepted the task.
    Applied,
    /// The task was parked in the DLQ.
    Parked,
}

/// Hand one hydrated task to `engine`.
pub async fn apply_task(engine: &dyn Engine, ctx: &CallContext, task: &ReplicationTask) -> Result<()> {
    match &task.attributes {
        ReplicationTaskAttributes::History(request) => {
            engine.replicate_events_v2(ctx, request.clone()).await
        }
        ReplicationTaskAttributes::SyncActivity(request) => {
            engine.sync_activity(ctx, request.clone()).await
        }
    }
}

/// Replication task processor for one `(shard, source cluster)` stream.
pub struct ReplicationTaskProcessor {
    engine: Arc<dyn Engine>,
    store: Arc<dyn ExecutionStore>,
    shard_id: i32,
    source_cluster: String,
    /// Retries of a retryable failure before the task is parked.
    pub max_retries: u32,
    /// Base delay between retries; attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
}

impl std::fmt::Debug for ReplicationTaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationTaskProcessor")
            .field("engine", &"...")
            .field("store", &"...")
            .field("shard_id", &self.shard_id)
            .field("source_cluster", &self.source_cluster)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl ReplicationTaskProcessor {
    /// Processor applying tasks from `source_cluster` to `engine`.
    pub fn new(
        engine: Arc<dyn Engine>,
        store: Arc<dyn ExecutionStore>,
        shard_id: i32,
        source_cluster: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            store,
            shard_id,
            source_cluster: source_cluster.into(),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }

    /// Source cluster of the stream.
    pub fn source_cluster(&self) -> &str {
        &self.source_cluster
    }

    /// Apply one task, parking it when it cannot be applied.
    ///
    /// Errors are only returned when the caller gave up, the engine is not
    /// serving, or the DLQ write itself failed.
    #[instrument(skip(self, ctx, task), fields(
        source_cluster = %self.source_cluster,
        task_id = task.source_task_id,
        workflow_id = %task.info.workflow_id,
    ))]
    pub async fn process(&self, ctx: &CallContext, task: &ReplicationTask) -> Result<ProcessOutcome> {
        let mut attempt = 0u32;
        loop {
            let err = match apply_task(self.engine.as_ref(), ctx, task).await {
                Ok(()) => {
                    debug!(attempt, "Replication task applied");
                    return Ok(ProcessOutcome::Applied);
                }
                Err(err) => err,
            };

            match &err {
                HistoryError::Canceled { .. }
                | HistoryError::Timeout { .. }
                | HistoryError::EngineStopped { .. }
                | HistoryError::ShardNotOwned { .. } => return Err(err),
                HistoryError::RetryTask { .. } => {}
                _ if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "Replication task failed, retrying");
                    let delay = self.retry_delay * attempt;
                    ctx.run("replication_retry", async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                    continue;
                }
                _ => {}
            }

            error!(
                attempt,
                error = %err,
                error_code = err.error_code(),
                "Parking replication task in DLQ"
            );
            self.store
                .put_replication_dlq(self.shard_id, &self.source_cluster, &task.info)
                .await?;
            return Ok(ProcessOutcome::Parked);
        }
    }

    /// Apply a page of messages in order.
    pub async fn process_messages(
        &self,
        ctx: &CallContext,
        messages: &ReplicationMessages,
    ) -> Result<Vec<ProcessOutcome>> {
        let mut outcomes = Vec::with_capacity(messages.tasks.len());
        for task in &messages.tasks {
            outcomes.push(self.process(ctx, task).await?);
        }
        Ok(outcomes)
    }
}
