// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for cadenza-history.
//!
//! This module provides [`HistoryRuntime`] which allows embedding the history
//! service into an existing tokio application instead of running the
//! standalone binary.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cadenza_history::runtime::HistoryRuntime;
//! use cadenza_history::persistence::SqliteExecutionStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteExecutionStore::connect("sqlite://history.db", 8).await?);
//!
//!     let runtime = HistoryRuntime::builder()
//!         .store(store)
//!         .shard_count(16)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let engine = runtime.controller().engine_for_workflow("order-42").await?;
//!     // ... drive the engine ...
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing::info;

use crate::config::{ClusterMetadata, Config, EngineConfig};
use crate::controller::ShardController;
use crate::engine::QueryDispatcher;
use crate::persistence::{ExecutionStore, InMemoryExecutionStore, SqliteExecutionStore};
use crate::replication::RemoteClusterClient;
use crate::visibility::{InMemoryVisibilityStore, VisibilityManager, VisibilityStore};

/// Builder for creating a [`HistoryRuntime`].
pub struct HistoryRuntimeBuilder {
    store: Option<Arc<dyn ExecutionStore>>,
    visibility_store: Option<Arc<dyn VisibilityStore>>,
    host_identity: String,
    shard_count: i32,
    engine: EngineConfig,
    cluster: ClusterMetadata,
    query_dispatcher: Option<Arc<dyn QueryDispatcher>>,
    remote_clusters: Option<Arc<dyn RemoteClusterClient>>,
}

impl std::fmt::Debug for HistoryRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryRuntimeBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("visibility_store", &self.visibility_store.as_ref().map(|_| "..."))
            .field("host_identity", &self.host_identity)
            .field("shard_count", &self.shard_count)
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl Default for HistoryRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            visibility_store: None,
            host_identity: "cadenza-history".to_string(),
            shard_count: 16,
            engine: EngineConfig::default(),
            cluster: ClusterMetadata::single("active"),
            query_dispatcher: None,
            remote_clusters: None,
        }
    }
}

impl HistoryRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from environment configuration. The store is not
    /// opened here; see [`open_store`].
    pub fn from_config(config: &Config) -> Self {
        Self {
            host_identity: config.host_identity.clone(),
            shard_count: config.shard_count,
            engine: config.engine.clone(),
            cluster: config.cluster.clone(),
            ..Self::default()
        }
    }

    /// Set the execution store (required).
    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the visibility store.
    ///
    /// Default: [`InMemoryVisibilityStore`]
    pub fn visibility_store(mut self, store: Arc<dyn VisibilityStore>) -> Self {
        self.visibility_store = Some(store);
        self
    }

    /// Owner name recorded on acquired shards.
    ///
    /// Default: `cadenza-history`
    pub fn host_identity(mut self, host_identity: impl Into<String>) -> Self {
        self.host_identity = host_identity.into();
        self
    }

    /// Number of history shards.
    ///
    /// Default: `16`
    pub fn shard_count(mut self, shard_count: i32) -> Self {
        self.shard_count = shard_count;
        self
    }

    /// Engine tunables.
    pub fn engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    /// Cluster topology.
    ///
    /// Default: single cluster named `active`
    pub fn cluster(mut self, cluster: ClusterMetadata) -> Self {
        self.cluster = cluster;
        self
    }

    /// Deliver queries through `dispatcher`.
    pub fn query_dispatcher(mut self, dispatcher: Arc<dyn QueryDispatcher>) -> Self {
        self.query_dispatcher = Some(dispatcher);
        self
    }

    /// Hydrate parked replication tasks through `client`.
    pub fn remote_clusters(mut self, client: Arc<dyn RemoteClusterClient>) -> Self {
        self.remote_clusters = Some(client);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<HistoryRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("execution store is required"))?;
        if self.shard_count <= 0 {
            anyhow::bail!("shard_count must be positive, got {}", self.shard_count);
        }

        let mut controller = ShardController::new(
            self.host_identity,
            self.shard_count,
            store,
            self.engine,
            self.cluster,
        );
        if let Some(dispatcher) = self.query_dispatcher {
            controller = controller.with_query_dispatcher(dispatcher);
        }
        if let Some(client) = self.remote_clusters {
            controller = controller.with_remote_clusters(client);
        }
        let visibility_store = self
            .visibility_store
            .unwrap_or_else(|| Arc::new(InMemoryVisibilityStore::new()));

        Ok(HistoryRuntimeConfig {
            controller,
            visibility: VisibilityManager::new(visibility_store),
        })
    }
}

/// Configuration for a [`HistoryRuntime`].
#[derive(Debug)]
pub struct HistoryRuntimeConfig {
    controller: ShardController,
    visibility: VisibilityManager,
}

impl HistoryRuntimeConfig {
    /// Start the runtime, acquiring every shard.
    pub async fn start(self) -> Result<HistoryRuntime> {
        let controller = Arc::new(self.controller);
        controller.start().await?;
        info!(shard_count = controller.shard_count(), "HistoryRuntime started");
        Ok(HistoryRuntime {
            controller,
            visibility: self.visibility,
            running: AtomicBool::new(true),
        })
    }
}

/// A running history service that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
#[derive(Debug)]
pub struct HistoryRuntime {
    controller: Arc<ShardController>,
    visibility: VisibilityManager,
    running: AtomicBool,
}

impl HistoryRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> HistoryRuntimeBuilder {
        HistoryRuntimeBuilder::new()
    }

    /// The shard registry.
    pub fn controller(&self) -> &Arc<ShardController> {
        &self.controller
    }

    /// The visibility manager.
    pub fn visibility(&self) -> &VisibilityManager {
        &self.visibility
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops every shard engine: new calls are rejected, suspended pollers
    /// are released and in-flight calls drain.
    pub async fn shutdown(self) -> Result<()> {
        info!("HistoryRuntime shutting down...");
        self.running.store(false, Ordering::SeqCst);
        self.controller.stop().await;
        info!("HistoryRuntime shutdown complete");
        Ok(())
    }
}

/// Open the execution store named by `config`: SQLite when a database URL
/// is set, otherwise an in-memory store.
pub async fn open_store(config: &Config) -> Result<Arc<dyn ExecutionStore>> {
    match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let store = SqliteExecutionStore::connect(url, 8).await?;
            info!("Database connection established");
            Ok(Arc::new(store))
        }
        None => {
            info!("No CADENZA_DATABASE_URL set, using in-memory execution store");
            Ok(Arc::new(InMemoryExecutionStore::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_store() {
        let err = HistoryRuntime::builder().build().unwrap_err();
        assert!(err.to_string().contains("execution store is required"));
    }

    #[test]
    fn test_builder_rejects_zero_shards() {
        let err = HistoryRuntime::builder()
            .store(Arc::new(InMemoryExecutionStore::new()))
            .shard_count(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("shard_count"));
    }

    #[test]
    fn test_builder_debug_hides_store() {
        let builder = HistoryRuntime::builder().store(Arc::new(InMemoryExecutionStore::new()));
        let debug = format!("{:?}", builder);
        assert!(debug.contains("HistoryRuntimeBuilder"));
        assert!(debug.contains("\"...\""));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let runtime = HistoryRuntime::builder()
            .store(Arc::new(InMemoryExecutionStore::new()))
            .shard_count(2)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();
        assert!(runtime.is_running());
        assert_eq!(runtime.controller().owned_shards().await, vec![0, 1]);

        let engine = runtime.controller().engine_for_workflow("wf").await.unwrap();
        runtime.shutdown().await.unwrap();
        assert!(engine.shard().is_closed());
    }
}
