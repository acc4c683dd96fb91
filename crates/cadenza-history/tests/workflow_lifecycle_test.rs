// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the workflow lifecycle driven through the engine surface.

mod common;

use common::*;

use cadenza_history::api::*;
use cadenza_history::context::CallContext;
use cadenza_history::types::{CloseStatus, Payload, WorkflowState};
use cadenza_history::{Engine, HistoryError};

#[tokio::test]
async fn test_full_workflow_lifecycle() {
    let ctx = TestContext::new().await;

    // 1. Start: started event plus the first decision
    let key = ctx.start_workflow("order-1").await;
    let state = ctx.mutable_state(&key).await;
    assert!(state.is_workflow_running);
    assert_eq!(state.next_event_id, 3);

    // 2. Signal while no decision is in flight
    ctx.signal(&key, "payment-received").await;
    assert_eq!(ctx.signal_names(&key).await, vec!["payment-received"]);

    // 3. Complete the run from a decision
    ctx.complete_decision(
        &key,
        vec![Decision::CompleteWorkflowExecution {
            result: Some(Payload::from_text("shipped")),
        }],
    )
    .await;

    let state = ctx.mutable_state(&key).await;
    assert!(!state.is_workflow_running);
    assert_eq!(state.close_status, CloseStatus::Completed);
    assert_eq!(state.workflow_state, WorkflowState::Completed);
}

#[tokio::test]
async fn test_event_ids_are_gap_free() {
    let ctx = TestContext::new().await;
    let key = ctx.start_workflow("order-2").await;
    ctx.signal(&key, "a").await;
    ctx.signal(&key, "b").await;
    ctx.complete_decision(&key, vec![]).await;
    ctx.signal(&key, "c").await;

    let history = ctx.history(&key).await;
    let ids: Vec<i64> = history.iter().map(|e| e.event_id).collect();
    let expected: Vec<i64> = (1..=ids.len() as i64).collect();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_terminate_is_idempotent() {
    let ctx = TestContext::new().await;
    let call = CallContext::background();
    let key = ctx.start_workflow("order-3").await;

    ctx.engine
        .terminate_workflow_execution(&call, TestContext::terminate_request(&key))
        .await
        .unwrap();
    let first = ctx.mutable_state(&key).await;

    ctx.engine
        .terminate_workflow_execution(&call, TestContext::terminate_request(&key))
        .await
        .unwrap();
    let second = ctx.mutable_state(&key).await;

    assert_eq!(first.next_event_id, second.next_event_id);
    assert_eq!(second.close_status, CloseStatus::Terminated);
    assert_eq!(ctx.history(&key).await.len() as i64, second.next_event_id - 1);
}

#[tokio::test]
async fn test_duplicate_start_is_rejected_unless_same_request() {
    let ctx = TestContext::new().await;
    let call = CallContext::background();
    let request = TestContext::start_request("order-4");

    let first = ctx
        .engine
        .start_workflow_execution(&call, request.clone())
        .await
        .unwrap();
    let retried = ctx
        .engine
        .start_workflow_execution(&call, request)
        .await
        .unwrap();
    assert_eq!(first.run_id, retried.run_id);

    let err = ctx
        .engine
        .start_workflow_execution(&call, TestContext::start_request("order-4"))
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::WorkflowAlreadyStarted { .. }));
    assert_eq!(err.error_code(), "WORKFLOW_ALREADY_STARTED");
}

#[tokio::test]
async fn test_stopped_engine_rejects_calls() {
    let ctx = TestContext::new().await;
    let key = ctx.start_workflow("order-5").await;
    ctx.engine.stop().await.unwrap();
    ctx.engine.stop().await.unwrap();

    let err = ctx
        .engine
        .get_mutable_state(&CallContext::background(), TestContext::get_request(&key, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, HistoryError::EngineStopped { .. }));
}
