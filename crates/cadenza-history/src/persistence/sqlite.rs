// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed execution store.
//!
//! State, events, tasks and shard records are stored as JSON text. Every
//! run write happens in one transaction that first re-checks the shard
//! range, then the row's `db_version`, then history contiguity.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use super::{
    CreateMode, CreateWorkflowRequest, CurrentExecution, ExecutionStore, PersistedExecution,
    PersistenceError, ShardInfo, UpdateMode, UpdateWorkflowRequest, WorkflowSnapshot,
};
use crate::events::HistoryEvent;
use crate::replication::ReplicationTaskInfo;
use crate::state::MutableState;
use crate::tasks::{Task, TaskCategory};
use crate::types::{FIRST_EVENT_ID, WorkflowKey};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed execution store.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `path` and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteExecutionStore::from_path(".data/history.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Connect to `url` (for example `sqlite::memory:`) and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, PersistenceError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| PersistenceError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| PersistenceError::Database {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// A private in-memory database. One connection, so every query sees
    /// the same database.
    pub async fn in_memory() -> Result<Self, PersistenceError> {
        Self::connect("sqlite::memory:", 1).await
    }
}

// ============================================================================
// Transaction helpers
// ============================================================================

async fn check_range(
    conn: &mut SqliteConnection,
    shard_id: i32,
    range_id: i64,
) -> Result<(), PersistenceError> {
    let stored: Option<i64> = sqlx::query_scalar("SELECT range_id FROM shards WHERE shard_id = ?")
        .bind(shard_id)
        .fetch_optional(&mut *conn)
        .await?;
    match stored {
        Some(stored) if stored == range_id => Ok(()),
        Some(stored) => Err(PersistenceError::ShardOwnershipLost {
            shard_id,
            details: format!("range {} is now {}", range_id, stored),
        }),
        None => Err(PersistenceError::ShardOwnershipLost {
            shard_id,
            details: "shard record missing".to_string(),
        }),
    }
}

async fn append_events(
    conn: &mut SqliteConnection,
    shard_id: i32,
    branch_token: &str,
    events: &[HistoryEvent],
) -> Result<(), PersistenceError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    let last: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(event_id) FROM history_events WHERE shard_id = ? AND branch_token = ?",
    )
    .bind(shard_id)
    .bind(branch_token)
    .fetch_one(&mut *conn)
    .await?;
    let expected = last.map(|id| id + 1).unwrap_or(FIRST_EVENT_ID);
    let contiguous = events
        .windows(2)
        .all(|pair| pair[1].event_id == pair[0].event_id + 1);
    if first.event_id != expected || !contiguous {
        return Err(PersistenceError::HistoryGap {
            branch_token: branch_token.to_string(),
            expected,
            actual: first.event_id,
        });
    }

    for event in events {
        sqlx::query(
            r#"
            INSERT INTO history_events (shard_id, branch_token, event_id, data)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(shard_id)
        .bind(branch_token)
        .bind(event.event_id)
        .bind(serde_json::to_string(event)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn insert_tasks(
    conn: &mut SqliteConnection,
    shard_id: i32,
    tasks: &[Task],
) -> Result<(), PersistenceError> {
    for task in tasks {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO tasks (shard_id, category, task_id, visibility_ms, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(shard_id)
        .bind(task.category().as_i32())
        .bind(task.task_id)
        .bind(task.visibility_time.timestamp_millis())
        .bind(serde_json::to_string(task)?)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn upsert_current(
    conn: &mut SqliteConnection,
    shard_id: i32,
    domain_id: &str,
    current: &CurrentExecution,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO current_executions (shard_id, domain_id, workflow_id, run_id, data)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT (shard_id, domain_id, workflow_id)
        DO UPDATE SET run_id = excluded.run_id, data = excluded.data
        "#,
    )
    .bind(shard_id)
    .bind(domain_id)
    .bind(&current.workflow_id)
    .bind(&current.run_id)
    .bind(serde_json::to_string(current)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn load_current(
    conn: &mut SqliteConnection,
    shard_id: i32,
    domain_id: &str,
    workflow_id: &str,
) -> Result<Option<CurrentExecution>, PersistenceError> {
    let data: Option<String> = sqlx::query_scalar(
        r#"
        SELECT data FROM current_executions
        WHERE shard_id = ? AND domain_id = ? AND workflow_id = ?
        "#,
    )
    .bind(shard_id)
    .bind(domain_id)
    .bind(workflow_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(data.map(|d| serde_json::from_str(&d)).transpose()?)
}

fn branch_of(state: &MutableState) -> Result<String, PersistenceError> {
    state
        .current_branch_token()
        .map_err(|e| PersistenceError::Database {
            operation: "branch_token".to_string(),
            details: e.to_string(),
        })
}

async fn insert_snapshot(
    conn: &mut SqliteConnection,
    shard_id: i32,
    snapshot: &WorkflowSnapshot,
) -> Result<(), PersistenceError> {
    let key = snapshot.state.key();
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO executions (shard_id, domain_id, workflow_id, run_id, db_version, state)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(shard_id)
    .bind(&key.domain_id)
    .bind(&key.workflow_id)
    .bind(&key.run_id)
    .bind(snapshot.db_version)
    .bind(serde_json::to_string(&snapshot.state)?)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(PersistenceError::ConditionFailed(format!(
            "execution {} already exists",
            key
        )));
    }

    append_events(conn, shard_id, &branch_of(&snapshot.state)?, &snapshot.events).await?;
    insert_tasks(conn, shard_id, &snapshot.tasks).await
}

fn decode_tasks(rows: Vec<String>) -> Result<Vec<Task>, PersistenceError> {
    rows.iter()
        .map(|data| serde_json::from_str(data).map_err(PersistenceError::from))
        .collect()
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn get_or_create_shard(
        &self,
        shard_id: i32,
        owner: &str,
    ) -> Result<ShardInfo, PersistenceError> {
        let fresh = ShardInfo {
            shard_id,
            owner: owner.to_string(),
            updated_at: Utc::now(),
            ..ShardInfo::default()
        };
        sqlx::query("INSERT OR IGNORE INTO shards (shard_id, range_id, data) VALUES (?, ?, ?)")
            .bind(shard_id)
            .bind(fresh.range_id)
            .bind(serde_json::to_string(&fresh)?)
            .execute(&self.pool)
            .await?;

        let data: String = sqlx::query_scalar("SELECT data FROM shards WHERE shard_id = ?")
            .bind(shard_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(serde_json::from_str(&data)?)
    }

    async fn update_shard(
        &self,
        shard: &ShardInfo,
        previous_range_id: i64,
    ) -> Result<(), PersistenceError> {
        let result = sqlx::query(
            r#"
            UPDATE shards SET range_id = ?, data = ?
            WHERE shard_id = ? AND range_id = ?
            "#,
        )
        .bind(shard.range_id)
        .bind(serde_json::to_string(shard)?)
        .bind(shard.shard_id)
        .bind(previous_range_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::ShardOwnershipLost {
                shard_id: shard.shard_id,
                details: format!("range {} no longer held", previous_range_id),
            });
        }
        Ok(())
    }

    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowRequest,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let shard_id = request.shard_id;
        check_range(&mut tx, shard_id, request.range_id).await?;

        let key = request.snapshot.state.key();
        let current = load_current(&mut tx, shard_id, &key.domain_id, &key.workflow_id).await?;
        match (&request.mode, current) {
            (CreateMode::BrandNew, Some(current)) => {
                return Err(PersistenceError::WorkflowAlreadyStarted(Box::new(current)));
            }
            (
                CreateMode::WorkflowIdReuse {
                    previous_run_id,
                    previous_last_write_version,
                },
                current,
            ) => {
                let matches = current.as_ref().is_some_and(|c| {
                    c.run_id == *previous_run_id
                        && c.last_write_version == *previous_last_write_version
                });
                if !matches {
                    return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                        "expected current run {}, found {:?}",
                        previous_run_id,
                        current.map(|c| c.run_id)
                    )));
                }
            }
            _ => {}
        }

        insert_snapshot(&mut tx, shard_id, &request.snapshot).await?;
        if request.mode != CreateMode::Zombie {
            upsert_current(
                &mut tx,
                shard_id,
                &key.domain_id,
                &CurrentExecution::from_state(&request.snapshot.state),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        shard_id: i32,
        key: &WorkflowKey,
    ) -> Result<Option<PersistedExecution>, PersistenceError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT db_version, state FROM executions
            WHERE shard_id = ? AND domain_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(db_version, state)| -> Result<_, PersistenceError> {
            Ok(PersistedExecution {
                state: serde_json::from_str(&state)?,
                db_version,
            })
        })
        .transpose()
    }

    async fn get_current_execution(
        &self,
        shard_id: i32,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<Option<CurrentExecution>, PersistenceError> {
        let mut conn = self.pool.acquire().await?;
        load_current(&mut conn, shard_id, domain_id, workflow_id).await
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowRequest,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let shard_id = request.shard_id;
        check_range(&mut tx, shard_id, request.range_id).await?;

        let mutation = &request.mutation;
        let key = mutation.state.key();

        // 1. Current-run condition
        if request.mode == UpdateMode::UpdateCurrent {
            let current = load_current(&mut tx, shard_id, &key.domain_id, &key.workflow_id).await?;
            if current.as_ref().map(|c| c.run_id.as_str()) != Some(key.run_id.as_str()) {
                return Err(PersistenceError::CurrentWorkflowConditionFailed(format!(
                    "run {} is not current",
                    key.run_id
                )));
            }
        }

        // 2. Conditional state write
        let result = sqlx::query(
            r#"
            UPDATE executions SET db_version = ?, state = ?
            WHERE shard_id = ? AND domain_id = ? AND workflow_id = ? AND run_id = ?
              AND db_version = ?
            "#,
        )
        .bind(mutation.expected_db_version + 1)
        .bind(serde_json::to_string(&mutation.state)?)
        .bind(shard_id)
        .bind(&key.domain_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .bind(mutation.expected_db_version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(PersistenceError::ConditionFailed(format!(
                "execution {} is not at db_version {}",
                key, mutation.expected_db_version
            )));
        }

        // 3. History and tasks
        append_events(&mut tx, shard_id, &branch_of(&mutation.state)?, &mutation.events).await?;
        insert_tasks(&mut tx, shard_id, &mutation.tasks).await?;

        // 4. Successor run and pointer
        if let Some(new_run) = &request.new_run {
            insert_snapshot(&mut tx, shard_id, new_run).await?;
        }
        if request.mode == UpdateMode::UpdateCurrent {
            let pointer = match &request.new_run {
                Some(new_run) => CurrentExecution::from_state(&new_run.state),
                None => CurrentExecution::from_state(&mutation.state),
            };
            upsert_current(&mut tx, shard_id, &key.domain_id, &pointer).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_history_events(
        &self,
        shard_id: i32,
        branch_token: &str,
        events: &[HistoryEvent],
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        append_events(&mut tx, shard_id, branch_token, events).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn read_history_events(
        &self,
        shard_id: i32,
        branch_token: &str,
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, PersistenceError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT data FROM history_events
            WHERE shard_id = ? AND branch_token = ? AND event_id >= ? AND event_id < ?
            ORDER BY event_id
            "#,
        )
        .bind(shard_id)
        .bind(branch_token)
        .bind(min_event_id)
        .bind(max_event_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(PersistenceError::from))
            .collect()
    }

    async fn fork_history_branch(
        &self,
        shard_id: i32,
        source_branch: &str,
        fork_event_id: i64,
        new_branch: &str,
    ) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT event_id FROM history_events WHERE shard_id = ? AND branch_token = ? LIMIT 1",
        )
        .bind(shard_id)
        .bind(new_branch)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            return Err(PersistenceError::ConditionFailed(format!(
                "branch {} already exists",
                new_branch
            )));
        }

        let has_fork_point: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT event_id FROM history_events
            WHERE shard_id = ? AND branch_token = ? AND event_id = ?
            "#,
        )
        .bind(shard_id)
        .bind(source_branch)
        .bind(fork_event_id)
        .fetch_optional(&mut *tx)
        .await?;
        if has_fork_point.is_none() {
            return Err(PersistenceError::NotFound(format!(
                "event {} on branch {}",
                fork_event_id, source_branch
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO history_events (shard_id, branch_token, event_id, data)
            SELECT shard_id, ?, event_id, data FROM history_events
            WHERE shard_id = ? AND branch_token = ? AND event_id <= ?
            "#,
        )
        .bind(new_branch)
        .bind(shard_id)
        .bind(source_branch)
        .bind(fork_event_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        min_task_id: i64,
        max_task_id: i64,
        batch_size: usize,
    ) -> Result<Vec<Task>, PersistenceError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT data FROM tasks
            WHERE shard_id = ? AND category = ? AND task_id > ? AND task_id <= ?
            ORDER BY task_id
            LIMIT ?
            "#,
        )
        .bind(shard_id)
        .bind(category.as_i32())
        .bind(min_task_id)
        .bind(max_task_id)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_tasks(rows)
    }

    async fn get_timer_tasks(
        &self,
        shard_id: i32,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<Task>, PersistenceError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT data FROM tasks
            WHERE shard_id = ? AND category = ? AND visibility_ms >= ? AND visibility_ms < ?
            ORDER BY visibility_ms, task_id
            LIMIT ?
            "#,
        )
        .bind(shard_id)
        .bind(TaskCategory::Timer.as_i32())
        .bind(min_time.timestamp_millis())
        .bind(max_time.timestamp_millis())
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;
        decode_tasks(rows)
    }

    async fn range_complete_tasks(
        &self,
        shard_id: i32,
        category: TaskCategory,
        min_task_id: i64,
        max_task_id: i64,
    ) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE shard_id = ? AND category = ? AND task_id > ? AND task_id <= ?
            "#,
        )
        .bind(shard_id)
        .bind(category.as_i32())
        .bind(min_task_id)
        .bind(max_task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn put_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        task: &ReplicationTaskInfo,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO replication_dlq (shard_id, source_cluster, task_id, data)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(shard_id)
        .bind(source_cluster)
        .bind(task.task_id)
        .bind(serde_json::to_string(task)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        min_task_id: i64,
        max_task_id: i64,
        page_size: usize,
    ) -> Result<Vec<ReplicationTaskInfo>, PersistenceError> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT data FROM replication_dlq
            WHERE shard_id = ? AND source_cluster = ? AND task_id > ? AND task_id <= ?
            ORDER BY task_id
            LIMIT ?
            "#,
        )
        .bind(shard_id)
        .bind(source_cluster)
        .bind(min_task_id)
        .bind(max_task_id)
        .bind(page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(PersistenceError::from))
            .collect()
    }

    async fn range_delete_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        min_task_id: i64,
        max_task_id: i64,
    ) -> Result<u64, PersistenceError> {
        let result = sqlx::query(
            r#"
            DELETE FROM replication_dlq
            WHERE shard_id = ? AND source_cluster = ? AND task_id > ? AND task_id <= ?
            "#,
        )
        .bind(shard_id)
        .bind(source_cluster)
        .bind(min_task_id)
        .bind(max_task_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_replication_dlq(
        &self,
        shard_id: i32,
        source_cluster: &str,
        task_id: i64,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "DELETE FROM replication_dlq WHERE shard_id = ? AND source_cluster = ? AND task_id = ?",
        )
        .bind(shard_id)
        .bind(source_cluster)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), PersistenceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
