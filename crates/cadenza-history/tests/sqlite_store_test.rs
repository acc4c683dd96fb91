// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests running the engine over the SQLite execution store.

mod common;

use std::sync::Arc;

use common::*;

use cadenza_history::HistoryError;
use cadenza_history::config::EngineConfig;
use cadenza_history::context::CallContext;
use cadenza_history::persistence::{ExecutionStore, InMemoryExecutionStore, SqliteExecutionStore};
use cadenza_history::types::CloseStatus;
use cadenza_history::Engine;

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");

    let key = {
        let store: Arc<dyn ExecutionStore> = Arc::new(SqliteExecutionStore::from_path(&path).await.unwrap());
        let ctx = TestContext::with_store(store, EngineConfig::default()).await;
        let key = ctx.start_workflow("order-1").await;
        ctx.signal(&key, "first").await;
        ctx.engine.stop().await.unwrap();
        key
    };

    // A new host takes the shard over from the same database
    let store: Arc<dyn ExecutionStore> = Arc::new(SqliteExecutionStore::from_path(&path).await.unwrap());
    let ctx = TestContext::with_store(store, EngineConfig::default()).await;
    let state = ctx.mutable_state(&key).await;
    assert!(state.is_workflow_running);
    assert_eq!(state.next_event_id, 4);

    ctx.signal(&key, "second").await;
    assert_eq!(ctx.signal_names(&key).await, vec!["first", "second"]);
}

#[tokio::test]
async fn test_sqlite_terminate_is_idempotent() {
    let store: Arc<dyn ExecutionStore> = Arc::new(SqliteExecutionStore::in_memory().await.unwrap());
    let ctx = TestContext::with_store(store, EngineConfig::default()).await;
    let call = CallContext::background();
    let key = ctx.start_workflow("order-2").await;

    for _ in 0..2 {
        ctx.engine
            .terminate_workflow_execution(&call, TestContext::terminate_request(&key))
            .await
            .unwrap();
    }
    let state = ctx.mutable_state(&key).await;
    assert_eq!(state.close_status, CloseStatus::Terminated);
    assert_eq!(ctx.history(&key).await.len() as i64, state.next_event_id - 1);
}

#[tokio::test]
async fn test_previous_owner_is_fenced_out() {
    let store: Arc<dyn ExecutionStore> = Arc::new(InMemoryExecutionStore::new());
    let old_owner = TestContext::with_store(store.clone(), EngineConfig::default()).await;
    let key = old_owner.start_workflow("order-3").await;

    let new_owner = TestContext::with_store(store, EngineConfig::default()).await;

    let err = old_owner
        .engine
        .terminate_workflow_execution(&CallContext::background(), TestContext::terminate_request(&key))
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::ShardNotOwned { .. }));

    // The new owner still sees the run untouched
    let state = new_owner.mutable_state(&key).await;
    assert!(state.is_workflow_running);
}
