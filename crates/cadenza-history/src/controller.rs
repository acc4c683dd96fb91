// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shard controller.
//!
//! Owns one [`HistoryEngine`] per acquired shard and routes workflow ids to
//! them. Shards are numbered `0..shard_count`; a workflow id maps to a shard
//! by the first eight bytes of its SHA-256 digest, so every host agrees on
//! the mapping without coordination.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{ClusterMetadata, EngineConfig};
use crate::engine::{Engine, HistoryEngine, QueryDispatcher, UnavailableQueryDispatcher};
use crate::error::{HistoryError, Result};
use crate::persistence::ExecutionStore;
use crate::replication::{NoRemoteClusters, RemoteClusterClient};
use crate::shard::ShardContext;

/// Shard owning `workflow_id` among `shard_count` shards.
pub fn shard_for_workflow_id(workflow_id: &str, shard_count: i32) -> i32 {
    let digest = Sha256::digest(workflow_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let count = shard_count.max(1) as u64;
    (u64::from_be_bytes(prefix) % count) as i32
}

/// Registry of the shard engines served by this host.
pub struct ShardController {
    host_identity: String,
    shard_count: i32,
    store: Arc<dyn ExecutionStore>,
    config: EngineConfig,
    cluster: ClusterMetadata,
    query_dispatcher: Arc<dyn QueryDispatcher>,
    remote_clusters: Arc<dyn RemoteClusterClient>,
    engines: RwLock<HashMap<i32, Arc<HistoryEngine>>>,
}

impl std::fmt::Debug for ShardController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardController")
            .field("host_identity", &self.host_identity)
            .field("shard_count", &self.shard_count)
            .field("store", &"...")
            .finish()
    }
}

impl ShardController {
    /// Controller for `shard_count` shards over `store`. No shard is
    /// acquired until [`ShardController::start`] or
    /// [`ShardController::acquire_shard`].
    pub fn new(
        host_identity: impl Into<String>,
        shard_count: i32,
        store: Arc<dyn ExecutionStore>,
        config: EngineConfig,
        cluster: ClusterMetadata,
    ) -> Self {
        Self {
            host_identity: host_identity.into(),
            shard_count: shard_count.max(1),
            store,
            config,
            cluster,
            query_dispatcher: Arc::new(UnavailableQueryDispatcher),
            remote_clusters: Arc::new(NoRemoteClusters),
            engines: RwLock::new(HashMap::new()),
        }
    }

    /// Hand `dispatcher` to every engine created afterwards.
    pub fn with_query_dispatcher(mut self, dispatcher: Arc<dyn QueryDispatcher>) -> Self {
        self.query_dispatcher = dispatcher;
        self
    }

    /// Hand `client` to every engine created afterwards.
    pub fn with_remote_clusters(mut self, client: Arc<dyn RemoteClusterClient>) -> Self {
        self.remote_clusters = client;
        self
    }

    /// Number of shards in the cluster.
    pub fn shard_count(&self) -> i32 {
        self.shard_count
    }

    /// Acquire every shard.
    pub async fn start(&self) -> Result<()> {
        for shard_id in 0..self.shard_count {
            self.acquire_shard(shard_id).await?;
        }
        info!(
            host = %self.host_identity,
            shard_count = self.shard_count,
            "Shard controller started"
        );
        Ok(())
    }

    /// Take ownership of `shard_id` and start its engine. Returns the
    /// running engine if the shard is already held.
    pub async fn acquire_shard(&self, shard_id: i32) -> Result<Arc<HistoryEngine>> {
        if !(0..self.shard_count).contains(&shard_id) {
            return Err(HistoryError::bad_request(
                "shard_id",
                format!("must be in 0..{}", self.shard_count),
            ));
        }
        let mut engines = self.engines.write().await;
        if let Some(engine) = engines.get(&shard_id) {
            if !engine.shard().is_closed() {
                return Ok(engine.clone());
            }
        }

        let shard = ShardContext::acquire(
            shard_id,
            &self.host_identity,
            self.store.clone(),
            self.config.clone(),
            self.cluster.clone(),
        )
        .await?;
        let engine = Arc::new(
            HistoryEngine::new(shard)
                .with_query_dispatcher(self.query_dispatcher.clone())
                .with_remote_clusters(self.remote_clusters.clone()),
        );
        engine.start().await?;
        engines.insert(shard_id, engine.clone());
        Ok(engine)
    }

    /// Stop serving `shard_id`. Releasing a shard that is not held is a no-op.
    pub async fn release_shard(&self, shard_id: i32) -> Result<()> {
        let engine = self.engines.write().await.remove(&shard_id);
        if let Some(engine) = engine {
            engine.stop().await?;
            info!(shard_id = shard_id, "Shard released");
        }
        Ok(())
    }

    /// The engine of a held shard.
    pub async fn engine_for_shard(&self, shard_id: i32) -> Result<Arc<HistoryEngine>> {
        let engines = self.engines.read().await;
        match engines.get(&shard_id) {
            Some(engine) if !engine.shard().is_closed() => Ok(engine.clone()),
            _ => Err(HistoryError::ShardNotOwned { shard_id }),
        }
    }

    /// The engine owning `workflow_id`.
    pub async fn engine_for_workflow(&self, workflow_id: &str) -> Result<Arc<HistoryEngine>> {
        self.engine_for_shard(shard_for_workflow_id(workflow_id, self.shard_count))
            .await
    }

    /// Ids of the shards currently held, ascending.
    pub async fn owned_shards(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.engines.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every engine. Failures are logged and the remaining engines are
    /// still stopped.
    pub async fn stop(&self) {
        let engines: Vec<_> = self.engines.write().await.drain().collect();
        for (shard_id, engine) in engines {
            if let Err(e) = engine.stop().await {
                warn!(shard_id = shard_id, error = %e, "Failed to stop shard engine");
            }
        }
        info!(host = %self.host_identity, "Shard controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::StartWorkflowExecutionRequest;
    use crate::context::CallContext;
    use crate::persistence::InMemoryExecutionStore;

    fn controller(shard_count: i32) -> ShardController {
        ShardController::new(
            "host-a",
            shard_count,
            Arc::new(InMemoryExecutionStore::new()),
            EngineConfig::default(),
            ClusterMetadata::single("active"),
        )
    }

    #[test]
    fn test_shard_mapping_is_stable_and_in_range() {
        for id in ["order-1", "order-2", "refund-77", ""] {
            let shard = shard_for_workflow_id(id, 16);
            assert!((0..16).contains(&shard));
            assert_eq!(shard, shard_for_workflow_id(id, 16));
        }
        assert_eq!(shard_for_workflow_id("anything", 1), 0);
    }

    #[tokio::test]
    async fn test_start_acquires_every_shard() {
        let controller = controller(4);
        controller.start().await.unwrap();
        assert_eq!(controller.owned_shards().await, vec![0, 1, 2, 3]);
        controller.stop().await;
        assert!(controller.owned_shards().await.is_empty());
    }

    #[tokio::test]
    async fn test_unowned_shard_is_rejected() {
        let controller = controller(4);
        controller.acquire_shard(2).await.unwrap();
        let err = controller.engine_for_shard(1).await.unwrap_err();
        assert!(matches!(err, HistoryError::ShardNotOwned { shard_id: 1 }));

        controller.release_shard(2).await.unwrap();
        assert!(controller.engine_for_shard(2).await.is_err());
        assert!(controller.acquire_shard(9).await.is_err());
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let controller = controller(2);
        let first = controller.acquire_shard(0).await.unwrap();
        let second = controller.acquire_shard(0).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_routes_workflow_to_owning_engine() {
        let controller = controller(4);
        controller.start().await.unwrap();
        let engine = controller.engine_for_workflow("order-1").await.unwrap();
        assert_eq!(
            engine.shard().shard_id(),
            shard_for_workflow_id("order-1", 4)
        );

        let response = engine
            .start_workflow_execution(
                &CallContext::background(),
                StartWorkflowExecutionRequest {
                    domain_id: "domain".into(),
                    workflow_id: "order-1".into(),
                    workflow_type: "checkout".into(),
                    task_list: "orders".into(),
                    execution_start_to_close_timeout_seconds: 60,
                    task_start_to_close_timeout_seconds: 10,
                    request_id: "req-1".into(),
                    ..StartWorkflowExecutionRequest::default()
                },
            )
            .await
            .unwrap();
        assert!(!response.run_id.is_empty());
        controller.stop().await;
    }
}
