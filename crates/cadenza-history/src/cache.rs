// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-run execution cache.
//!
//! Every run touched by the engine gets a [`WorkflowContext`]: an async
//! mutex guarding the cached mutable state. Holding the guard is what
//! serializes operations on one run inside this host; the store's
//! `db_version` check catches everything else.
//!
//! Contexts are shared through `Arc`. When the cache is full, only
//! contexts nobody else holds are evicted, so a run never has two live
//! locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::debug;

use crate::error::{HistoryError, Result};
use crate::state::MutableState;
use crate::types::WorkflowKey;

/// Cached state of a run and the `db_version` it was read at.
#[derive(Debug, Clone)]
pub struct CachedState {
    /// Mutable state.
    pub ms: MutableState,
    /// Stored version the state corresponds to.
    pub db_version: i64,
}

/// Lock and cache slot of one run.
#[derive(Debug)]
pub struct WorkflowContext {
    key: WorkflowKey,
    state: AsyncMutex<Option<CachedState>>,
}

impl WorkflowContext {
    fn new(key: WorkflowKey) -> Self {
        Self {
            key,
            state: AsyncMutex::new(None),
        }
    }

    /// Run this context belongs to.
    pub fn key(&self) -> &WorkflowKey {
        &self.key
    }

    /// Lock the run. `None` inside means the state must be loaded.
    pub async fn lock(&self) -> MutexGuard<'_, Option<CachedState>> {
        self.state.lock().await
    }

    /// Cached copy without waiting for the lock, if available.
    pub fn try_snapshot(&self) -> Option<CachedState> {
        self.state.try_lock().ok().and_then(|guard| guard.clone())
    }
}

/// Bounded map from run to [`WorkflowContext`].
#[derive(Debug)]
pub struct ExecutionCache {
    capacity: usize,
    entries: Mutex<HashMap<WorkflowKey, Arc<WorkflowContext>>>,
}

impl ExecutionCache {
    /// Cache holding up to `capacity` idle runs.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Context of `key`, created on first use.
    pub fn get_or_create(&self, key: &WorkflowKey) -> Result<Arc<WorkflowContext>> {
        let mut entries = self.entries()?;
        if let Some(context) = entries.get(key) {
            return Ok(context.clone());
        }
        if entries.len() >= self.capacity {
            let before = entries.len();
            entries.retain(|_, context| Arc::strong_count(context) > 1);
            debug!(evicted = before - entries.len(), "Execution cache trimmed");
        }
        let context = Arc::new(WorkflowContext::new(key.clone()));
        entries.insert(key.clone(), context.clone());
        Ok(context)
    }

    /// Context of `key` if cached.
    pub fn get(&self, key: &WorkflowKey) -> Result<Option<Arc<WorkflowContext>>> {
        Ok(self.entries()?.get(key).cloned())
    }

    /// Number of cached runs.
    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<WorkflowKey, Arc<WorkflowContext>>>> {
        self.entries
            .lock()
            .map_err(|e| HistoryError::invalid_state(format!("execution cache poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(run: &str) -> WorkflowKey {
        WorkflowKey::new("domain", "wf", run)
    }

    #[tokio::test]
    async fn test_same_key_shares_context() {
        let cache = ExecutionCache::new(4);
        let a = cache.get_or_create(&key("r1")).unwrap();
        let b = cache.get_or_create(&key("r1")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_skips_held_contexts() {
        let cache = ExecutionCache::new(2);
        let held = cache.get_or_create(&key("r1")).unwrap();
        drop(cache.get_or_create(&key("r2")).unwrap());

        let _third = cache.get_or_create(&key("r3")).unwrap();
        assert!(cache.get(&key("r1")).unwrap().is_some());
        assert!(cache.get(&key("r2")).unwrap().is_none());
        assert!(Arc::ptr_eq(&held, &cache.get_or_create(&key("r1")).unwrap()));
    }

    #[tokio::test]
    async fn test_lock_serializes_access() {
        let cache = ExecutionCache::new(2);
        let context = cache.get_or_create(&key("r1")).unwrap();
        let guard = context.lock().await;
        assert!(guard.is_none());
        assert!(context.try_snapshot().is_none());
        assert!(context.state.try_lock().is_err());
        drop(guard);
        assert!(context.state.try_lock().is_ok());
    }
}
