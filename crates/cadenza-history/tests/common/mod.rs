// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for cadenza-history integration tests.
//!
//! Provides TestContext for setting up an engine over a store and driving
//! workflows through it.

#![allow(dead_code)]

use std::sync::Arc;

use uuid::Uuid;

use cadenza_history::api::*;
use cadenza_history::config::{ClusterMetadata, EngineConfig};
use cadenza_history::context::CallContext;
use cadenza_history::events::{EventAttributes, HistoryEvent};
use cadenza_history::persistence::{ExecutionStore, InMemoryExecutionStore};
use cadenza_history::shard::ShardContext;
use cadenza_history::state::MutableState;
use cadenza_history::types::WorkflowKey;
use cadenza_history::{Engine, HistoryEngine};

pub const DOMAIN: &str = "test-domain";
pub const TASK_LIST: &str = "orders";

/// Test context that owns one shard engine and its store.
pub struct TestContext {
    pub engine: Arc<HistoryEngine>,
    pub store: Arc<dyn ExecutionStore>,
}

impl TestContext {
    /// Engine over a fresh in-memory store with default tunables.
    pub async fn new() -> Self {
        Self::with_store(Arc::new(InMemoryExecutionStore::new()), EngineConfig::default()).await
    }

    /// Engine over a fresh in-memory store with `config`.
    pub async fn with_config(config: EngineConfig) -> Self {
        Self::with_store(Arc::new(InMemoryExecutionStore::new()), config).await
    }

    /// Engine for shard 1 over `store`.
    pub async fn with_store(store: Arc<dyn ExecutionStore>, config: EngineConfig) -> Self {
        let shard = ShardContext::acquire(
            1,
            "test-host",
            store.clone(),
            config,
            ClusterMetadata::single("active"),
        )
        .await
        .expect("Failed to acquire shard");
        let engine = Arc::new(HistoryEngine::new(shard));
        engine.start().await.expect("Failed to start engine");
        Self { engine, store }
    }

    pub fn start_request(workflow_id: &str) -> StartWorkflowExecutionRequest {
        StartWorkflowExecutionRequest {
            domain_id: DOMAIN.to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_type: "checkout".to_string(),
            task_list: TASK_LIST.to_string(),
            execution_start_to_close_timeout_seconds: 3600,
            task_start_to_close_timeout_seconds: 10,
            identity: "test-client".to_string(),
            request_id: Uuid::new_v4().to_string(),
            ..StartWorkflowExecutionRequest::default()
        }
    }

    /// Start a run and return its key.
    pub async fn start_workflow(&self, workflow_id: &str) -> WorkflowKey {
        let response = self
            .engine
            .start_workflow_execution(&CallContext::background(), Self::start_request(workflow_id))
            .await
            .expect("Failed to start workflow");
        WorkflowKey::new(DOMAIN, workflow_id, response.run_id)
    }

    pub async fn signal(&self, key: &WorkflowKey, signal_name: &str) {
        self.engine
            .signal_workflow_execution(
                &CallContext::background(),
                SignalWorkflowExecutionRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    signal_name: signal_name.to_string(),
                    identity: "test-client".to_string(),
                    request_id: Uuid::new_v4().to_string(),
                    ..SignalWorkflowExecutionRequest::default()
                },
            )
            .await
            .expect("Failed to signal workflow");
    }

    pub fn get_request(key: &WorkflowKey, expected_next_event_id: i64) -> GetMutableStateRequest {
        GetMutableStateRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            expected_next_event_id,
            current_branch_token: None,
        }
    }

    pub async fn mutable_state(&self, key: &WorkflowKey) -> GetMutableStateResponse {
        self.engine
            .get_mutable_state(&CallContext::background(), Self::get_request(key, 0))
            .await
            .expect("Failed to get mutable state")
    }

    /// The stored state of a run.
    pub async fn stored_state(&self, key: &WorkflowKey) -> MutableState {
        self.store
            .get_workflow_execution(self.engine.shard().shard_id(), key)
            .await
            .expect("Failed to load execution")
            .expect("Execution missing")
            .state
    }

    /// The full history of a run's current branch.
    pub async fn history(&self, key: &WorkflowKey) -> Vec<HistoryEvent> {
        let state = self.mutable_state(key).await;
        self.store
            .read_history_events(
                self.engine.shard().shard_id(),
                &state.current_branch_token,
                1,
                state.next_event_id,
            )
            .await
            .expect("Failed to read history")
    }

    /// Names of the signals recorded in a run's history, in order.
    pub async fn signal_names(&self, key: &WorkflowKey) -> Vec<String> {
        self.history(key)
            .await
            .into_iter()
            .filter_map(|event| match event.attributes {
                EventAttributes::WorkflowExecutionSignaled { signal_name, .. } => Some(signal_name),
                _ => None,
            })
            .collect()
    }

    /// Pick up the scheduled decision and answer it with `decisions`.
    pub async fn complete_decision(&self, key: &WorkflowKey, decisions: Vec<Decision>) {
        let ctx = CallContext::background();
        let schedule_id = self.stored_state(key).await.execution_info.decision.schedule_id;
        let started = self
            .engine
            .record_decision_task_started(
                &ctx,
                RecordDecisionTaskStartedRequest {
                    domain_id: key.domain_id.clone(),
                    execution: key.execution(),
                    schedule_id,
                    request_id: Uuid::new_v4().to_string(),
                    identity: "test-worker".to_string(),
                },
            )
            .await
            .expect("Failed to start decision");
        self.engine
            .respond_decision_task_completed(
                &ctx,
                RespondDecisionTaskCompletedRequest {
                    task_token: started.task_token,
                    decisions,
                    identity: "test-worker".to_string(),
                    ..RespondDecisionTaskCompletedRequest::default()
                },
            )
            .await
            .expect("Failed to complete decision");
    }

    pub fn terminate_request(key: &WorkflowKey) -> TerminateWorkflowExecutionRequest {
        TerminateWorkflowExecutionRequest {
            domain_id: key.domain_id.clone(),
            execution: key.execution(),
            reason: "test".to_string(),
            identity: "operator".to_string(),
            ..TerminateWorkflowExecutionRequest::default()
        }
    }
}
