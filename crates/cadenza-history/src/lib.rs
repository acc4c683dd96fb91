// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cadenza History - Sharded Workflow History Engine
//!
//! This crate owns the durable state of workflow executions. For every run it
//! keeps the mutable state, appends the run's history, decides which state
//! transitions are legal and emits the follow-up work (transfer, timer and
//! replication tasks). It also reconciles event streams replicated from other
//! clusters and ships a visibility shim that indexes run summaries.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │              Callers (frontend, matching, queue processors)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │  Engine trait (typed requests)
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ShardController                                │
//! │        workflow id ──sha256──▶ shard ──▶ HistoryEngine (one per shard)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                          │                          │
//!           ▼                          ▼                          ▼
//! ┌───────────────────┐   ┌────────────────────────┐   ┌─────────────────────┐
//! │  ExecutionCache   │   │     MutableState       │   │  ShardContext       │
//! │  per-run locks    │   │  events + tasks in one │   │  range_id fencing,  │
//! │  cached state     │   │  transaction           │   │  task id allocation │
//! └───────────────────┘   └────────────────────────┘   └─────────────────────┘
//!                                                                 │
//!                                                                 ▼
//!                              ┌─────────────────────────────────────────────┐
//!                              │ ExecutionStore (in-memory or SQLite)        │
//!                              │ shard, runs, current pointer, branches,     │
//!                              │ task queues, replication DLQ                │
//!                              └─────────────────────────────────────────────┘
//! ```
//!
//! # Engine Operations
//!
//! | Group | Operations |
//! |-------|------------|
//! | Lifecycle | `start`, `stop` |
//! | Workflow | `start_workflow_execution`, `signal_workflow_execution`, `signal_with_start_workflow_execution`, `terminate_workflow_execution`, `request_cancel_workflow_execution`, `reset_workflow_execution`, `remove_signal_mutable_state`, `describe_workflow_execution`, `describe_mutable_state`, `get_mutable_state`, `poll_mutable_state`, `reset_sticky_task_list`, `query_workflow`, `refresh_workflow_tasks` |
//! | Decision | `schedule_decision_task`, `record_decision_task_started`, `respond_decision_task_completed`, `respond_decision_task_failed` |
//! | Activity | `record_activity_task_started`, `record_activity_task_heartbeat`, `respond_activity_task_completed`, `respond_activity_task_failed`, `respond_activity_task_canceled` |
//! | Children | `record_child_execution_started`, `record_child_execution_completed` |
//! | Replication | `replicate_events`, `replicate_events_v2`, `replicate_raw_events`, `sync_activity`, `sync_shard_status`, `get_replication_messages`, `get_dlq_replication_messages`, `read_dlq_messages`, `purge_dlq_messages`, `merge_dlq_messages`, `reapply_events` |
//! | Notification | `notify_new_history_event`, `notify_new_transfer_tasks`, `notify_new_timer_tasks`, `notify_new_replication_tasks` |
//!
//! ## Write Path
//!
//! Every mutation of an existing run follows the same steps:
//!
//! 1. **Lock**: take the run's slot in the execution cache
//! 2. **Mutate**: apply the change to a copy of the state inside a transaction
//! 3. **Write**: persist events, state and tasks with a `db_version` condition
//! 4. **Publish**: wake long pollers and queue consumers
//!
//! A lost conditional write drops the cached copy, reloads and retries up to
//! `conflict_retry_count` times before surfacing `Conflict`.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CADENZA_DATABASE_URL` | No | in-memory | SQLite connection string |
//! | `CADENZA_SHARD_COUNT` | No | `16` | Number of history shards |
//! | `CADENZA_HOST_IDENTITY` | No | `cadenza-history` | Owner recorded on acquired shards |
//! | `CADENZA_CURRENT_CLUSTER` | No | `active` | Local cluster name |
//! | `CADENZA_CLUSTERS` | No | `active:1` | `name:initial_version` list |
//! | `CADENZA_FAILOVER_VERSION_INCREMENT` | No | `10` | Failover version stride |
//! | `CADENZA_LONG_POLL_TIMEOUT_MS` | No | `20000` | `poll_mutable_state` cap |
//! | `CADENZA_CONFLICT_RETRY_COUNT` | No | `5` | Internal optimistic retries |
//! | `CADENZA_REPLICATION_PAGE_SIZE` | No | `100` | Replication message page |
//! | `CADENZA_MAX_SIGNALS_PER_EXECUTION` | No | `0` | Signal cap (0 = unlimited) |
//! | `CADENZA_RETENTION_DAYS` | No | `7` | Closed run retention |
//!
//! # Modules
//!
//! - [`engine`]: The [`Engine`](engine::Engine) trait and the per-shard history engine
//! - [`controller`]: Shard registry and workflow routing
//! - [`state`]: Mutable state, event application and task generation
//! - [`persistence`]: Execution store trait with in-memory and SQLite backends
//! - [`replication`]: Replication tasks, conflict resolution and the task processor
//! - [`visibility`]: Visibility manager and store trait
//! - [`runtime`]: Embeddable runtime builder

#![deny(missing_docs)]

/// Typed engine requests and responses.
pub mod api;

/// Per-run execution cache and locks.
pub mod cache;

/// Configuration loaded from environment variables.
pub mod config;

/// Caller deadline and cancellation.
pub mod context;

/// Shard registry and workflow-to-shard routing.
pub mod controller;

/// The history engine.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// History events and their attributes.
pub mod events;

/// Embedded database migrations.
pub mod migrations;

/// Long-poll notifications of new history.
pub mod notifier;

/// Execution store trait and backends.
pub mod persistence;

/// Task queue wake-ups.
pub mod queue;

/// Cross-cluster replication.
pub mod replication;

/// Embeddable runtime.
pub mod runtime;

/// Shard ownership and task id allocation.
pub mod shard;

/// Workflow mutable state.
pub mod state;

/// Transfer, timer and replication tasks.
pub mod tasks;

/// Shared value types.
pub mod types;

/// Visibility translation shim.
pub mod visibility;

pub use config::Config;
pub use controller::ShardController;
pub use engine::{Engine, HistoryEngine};
pub use error::{HistoryError, Result};
