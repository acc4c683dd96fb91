// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for signal-with-start, including racing callers.

mod common;

use std::collections::BTreeSet;

use common::*;

use cadenza_history::Engine;
use cadenza_history::api::SignalWithStartWorkflowExecutionRequest;
use cadenza_history::context::CallContext;
use cadenza_history::types::WorkflowKey;

fn signal_with_start(workflow_id: &str, signal_name: &str) -> SignalWithStartWorkflowExecutionRequest {
    SignalWithStartWorkflowExecutionRequest {
        start: TestContext::start_request(workflow_id),
        signal_name: signal_name.to_string(),
        signal_input: None,
    }
}

#[tokio::test]
async fn test_starts_run_with_signal_in_first_batch() {
    let ctx = TestContext::new().await;
    let response = ctx
        .engine
        .signal_with_start_workflow_execution(
            &CallContext::background(),
            signal_with_start("order-1", "kickoff"),
        )
        .await
        .unwrap();

    let key = WorkflowKey::new(DOMAIN, "order-1", response.run_id);
    assert_eq!(ctx.signal_names(&key).await, vec!["kickoff"]);
}

#[tokio::test]
async fn test_signals_existing_run() {
    let ctx = TestContext::new().await;
    let key = ctx.start_workflow("order-2").await;
    let response = ctx
        .engine
        .signal_with_start_workflow_execution(
            &CallContext::background(),
            signal_with_start("order-2", "late"),
        )
        .await
        .unwrap();

    assert_eq!(response.run_id, key.run_id);
    assert_eq!(ctx.signal_names(&key).await, vec!["late"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_callers_converge_on_one_run() {
    let ctx = TestContext::new().await;

    let first = {
        let engine = ctx.engine.clone();
        tokio::spawn(async move {
            engine
                .signal_with_start_workflow_execution(
                    &CallContext::background(),
                    signal_with_start("order-3", "from-a"),
                )
                .await
        })
    };
    let second = {
        let engine = ctx.engine.clone();
        tokio::spawn(async move {
            engine
                .signal_with_start_workflow_execution(
                    &CallContext::background(),
                    signal_with_start("order-3", "from-b"),
                )
                .await
        })
    };

    let (first, second) = futures::future::join(first, second).await;
    let first = first.unwrap().unwrap();
    let second = second.unwrap().unwrap();
    assert_eq!(first.run_id, second.run_id);

    let key = WorkflowKey::new(DOMAIN, "order-3", first.run_id);
    let signals: BTreeSet<String> = ctx.signal_names(&key).await.into_iter().collect();
    assert_eq!(
        signals,
        BTreeSet::from(["from-a".to_string(), "from-b".to_string()])
    );
}
