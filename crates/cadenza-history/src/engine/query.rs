// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow queries.
//!
//! Queries are answered by workers; the engine only decides whether a query
//! may run and when. A query never observes a half-processed decision: it
//! waits for an in-flight decision to finish before it is dispatched.

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::HistoryEngine;
use crate::api::{QueryRejectCondition, QueryRejected, QueryWorkflowRequest, QueryWorkflowResponse, WorkflowQuery};
use crate::context::CallContext;
use crate::error::{HistoryError, Result};
use crate::types::{CloseStatus, Payload, WorkflowExecution};

/// A query ready for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTarget {
    /// Domain of the run.
    pub domain_id: String,
    /// Run to query.
    pub execution: WorkflowExecution,
    /// Task list a worker of the run polls; sticky when set.
    pub task_list: String,
    /// The query.
    pub query: WorkflowQuery,
}

/// Delivers queries to workers, typically through the matching service.
#[async_trait]
pub trait QueryDispatcher: Send + Sync {
    /// Run `target.query` on a worker and return its answer.
    async fn dispatch(&self, ctx: &CallContext, target: QueryTarget) -> Result<Option<Payload>>;
}

/// Dispatcher used when no worker connection is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableQueryDispatcher;

#[async_trait]
impl QueryDispatcher for UnavailableQueryDispatcher {
    async fn dispatch(&self, _ctx: &CallContext, target: QueryTarget) -> Result<Option<Payload>> {
        Err(HistoryError::QueryFailed {
            details: format!(
                "no query dispatcher configured for query '{}'",
                target.query.query_type
            ),
        })
    }
}

impl HistoryEngine {
    #[instrument(skip(self, ctx, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        query_type = %request.query.query_type,
    ))]
    pub(crate) async fn query_workflow_inner(
        &self,
        ctx: &CallContext,
        request: QueryWorkflowRequest,
    ) -> Result<QueryWorkflowResponse> {
        const OPERATION: &str = "query_workflow";
        if request.query.query_type.is_empty() {
            return Err(HistoryError::bad_request("query.query_type", "is required"));
        }
        let key = self.resolve_key(&request.domain_id, &request.execution).await?;

        // 1. Wait out an in-flight decision, no longer than the long-poll cap
        let wait_ctx = ctx
            .clone()
            .deadline_at(ctx.deadline_capped(self.shard().config().long_poll_timeout));
        let ms = loop {
            let mut subscription = self.history_notifier().subscribe(&key);
            let ms = self.load_state(ctx, OPERATION, &key).await?;
            if !ms.is_running() || !ms.has_inflight_decision() {
                break ms;
            }
            debug!(
                started_id = ms.execution_info.decision.started_id,
                "Query waiting for in-flight decision"
            );
            let shutdown = self.shutdown_token().clone();
            wait_ctx.run(OPERATION, async {
                tokio::select! {
                    _ = shutdown.cancelled() => Err(self.stopped()),
                    changed = subscription.changed() => match changed {
                        Some(_) => Ok(()),
                        None => Err(self.stopped()),
                    },
                }
            })
            .await?;
        };

        // 2. Reject conditions
        let info = &ms.execution_info;
        if let Some(condition) = request.query_reject_condition {
            let reject = match condition {
                QueryRejectCondition::NotOpen => !ms.is_running(),
                QueryRejectCondition::NotCompletedCleanly => {
                    !ms.is_running() && info.close_status != CloseStatus::Completed
                }
            };
            if reject {
                debug!(close_status = ?info.close_status, "Query rejected");
                return Ok(QueryWorkflowResponse {
                    query_result: None,
                    query_rejected: Some(QueryRejected {
                        close_status: info.close_status,
                    }),
                });
            }
        }

        // 3. Dispatch
        let target = QueryTarget {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            task_list: info
                .sticky_task_list
                .clone()
                .unwrap_or_else(|| info.task_list.clone()),
            query: request.query.clone(),
        };
        let query_result = self.query_dispatcher().dispatch(ctx, target).await?;
        Ok(QueryWorkflowResponse {
            query_result,
            query_rejected: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{Engine, HistoryEngine};
    use super::*;
    use crate::api::*;
    use crate::config::{ClusterMetadata, EngineConfig};
    use crate::persistence::{ExecutionStore, InMemoryExecutionStore};
    use crate::shard::ShardContext;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDispatcher {
        targets: Mutex<Vec<QueryTarget>>,
    }

    #[async_trait]
    impl QueryDispatcher for RecordingDispatcher {
        async fn dispatch(&self, _ctx: &CallContext, target: QueryTarget) -> Result<Option<Payload>> {
            let answer = format!("answer to {}", target.query.query_type);
            self.targets.lock().unwrap().push(target);
            Ok(Some(Payload::from_text(&answer)))
        }
    }

    async fn engine_with_dispatcher(dispatcher: Arc<RecordingDispatcher>) -> Arc<HistoryEngine> {
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let shard = ShardContext::acquire(
            1,
            "test-host",
            store,
            EngineConfig::default(),
            ClusterMetadata::single("active"),
        )
        .await
        .unwrap();
        let engine = Arc::new(HistoryEngine::new(shard).with_query_dispatcher(dispatcher));
        engine.start().await.unwrap();
        engine
    }

    fn query(key: &crate::types::WorkflowKey) -> QueryWorkflowRequest {
        QueryWorkflowRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            query: WorkflowQuery {
                query_type: "status".into(),
                query_args: None,
            },
            query_reject_condition: None,
        }
    }

    #[tokio::test]
    async fn test_query_is_dispatched_to_task_list() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with_dispatcher(dispatcher.clone()).await;
        let key = started(&engine, "wf").await;

        let response = engine
            .query_workflow(&CallContext::background(), query(&key))
            .await
            .unwrap();
        assert_eq!(response.query_result, Some(Payload::from_text("answer to status")));
        let targets = dispatcher.targets.lock().unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].task_list, "orders");
    }

    #[tokio::test]
    async fn test_query_waits_for_inflight_decision() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with_dispatcher(dispatcher.clone()).await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;
        let started = engine
            .record_decision_task_started(
                &ctx,
                RecordDecisionTaskStartedRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    schedule_id: 2,
                    request_id: "poll".into(),
                    identity: "worker".into(),
                },
            )
            .await
            .unwrap();

        let querier = engine.clone();
        let request = query(&key);
        let handle = tokio::spawn(async move {
            querier
                .query_workflow(&CallContext::with_timeout(Duration::from_secs(10)), request)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.targets.lock().unwrap().is_empty());

        engine
            .respond_decision_task_completed(
                &ctx,
                RespondDecisionTaskCompletedRequest {
                    task_token: started.task_token,
                    identity: "worker".into(),
                    ..RespondDecisionTaskCompletedRequest::default()
                },
            )
            .await
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(response.query_result.is_some());
        assert_eq!(dispatcher.targets.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_wait_is_capped_without_deadline() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
        let shard = ShardContext::acquire(
            1,
            "test-host",
            store,
            EngineConfig {
                long_poll_timeout: Duration::from_secs(2),
                ..EngineConfig::default()
            },
            ClusterMetadata::single("active"),
        )
        .await
        .unwrap();
        let engine = Arc::new(HistoryEngine::new(shard).with_query_dispatcher(dispatcher.clone()));
        engine.start().await.unwrap();
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;
        engine
            .record_decision_task_started(
                &ctx,
                RecordDecisionTaskStartedRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    schedule_id: 2,
                    request_id: "poll".into(),
                    identity: "worker".into(),
                },
            )
            .await
            .unwrap();

        let started_at = tokio::time::Instant::now();
        let err = engine.query_workflow(&ctx, query(&key)).await.unwrap_err();
        assert!(matches!(err, HistoryError::Timeout { .. }));
        assert!(started_at.elapsed() >= Duration::from_secs(2));
        assert!(dispatcher.targets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_conditions() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let engine = engine_with_dispatcher(dispatcher.clone()).await;
        let ctx = CallContext::background();
        let key = started(&engine, "wf").await;
        engine
            .terminate_workflow_execution(
                &ctx,
                TerminateWorkflowExecutionRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    reason: "test".into(),
                    ..TerminateWorkflowExecutionRequest::default()
                },
            )
            .await
            .unwrap();

        let mut request = query(&key);
        request.query_reject_condition = Some(QueryRejectCondition::NotCompletedCleanly);
        let response = engine.query_workflow(&ctx, request).await.unwrap();
        assert_eq!(
            response.query_rejected,
            Some(QueryRejected {
                close_status: CloseStatus::Terminated
            })
        );
        assert!(dispatcher.targets.lock().unwrap().is_empty());

        // Without a condition, closed runs are still queryable.
        let response = engine.query_workflow(&ctx, query(&key)).await.unwrap();
        assert!(response.query_rejected.is_none());
    }

    #[tokio::test]
    async fn test_without_dispatcher_query_fails() {
        let engine = engine().await;
        let key = started(&engine, "wf").await;
        let err = engine
            .query_workflow(&CallContext::background(), query(&key))
            .await
            .unwrap_err();
        assert!(matches!(err, HistoryError::QueryFailed { .. }));
    }
}
