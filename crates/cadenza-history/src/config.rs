// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::BTreeMap;
use std::time::Duration;

/// Cadenza history service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL. `None` runs against the in-memory store.
    pub database_url: Option<String>,
    /// Number of history shards.
    pub shard_count: i32,
    /// Owner name recorded on acquired shards.
    pub host_identity: String,
    /// Cluster topology.
    pub cluster: ClusterMetadata,
    /// Engine tunables.
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `CADENZA_DATABASE_URL`: SQLite connection string (default: in-memory store)
    /// - `CADENZA_SHARD_COUNT`: number of shards (default: 16)
    /// - `CADENZA_HOST_IDENTITY`: shard owner name (default: cadenza-history)
    /// - `CADENZA_CURRENT_CLUSTER`: local cluster name (default: active)
    /// - `CADENZA_CLUSTERS`: `name:initial_version` list (default: active:1)
    /// - `CADENZA_FAILOVER_VERSION_INCREMENT`: version stride (default: 10)
    /// - `CADENZA_LONG_POLL_TIMEOUT_MS`: poll_mutable_state cap (default: 20000)
    /// - `CADENZA_CONFLICT_RETRY_COUNT`: optimistic retries (default: 5)
    /// - `CADENZA_REPLICATION_PAGE_SIZE`: replication page size (default: 100)
    /// - `CADENZA_MAX_SIGNALS_PER_EXECUTION`: signal cap, 0 = unlimited (default: 0)
    /// - `CADENZA_RETENTION_DAYS`: closed workflow retention (default: 7)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CADENZA_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let shard_count: i32 = parse_var("CADENZA_SHARD_COUNT", "16", "must be a positive integer")?;
        if shard_count <= 0 {
            return Err(ConfigError::Invalid(
                "CADENZA_SHARD_COUNT",
                "must be a positive integer",
            ));
        }

        let host_identity = std::env::var("CADENZA_HOST_IDENTITY")
            .unwrap_or_else(|_| "cadenza-history".to_string());

        let current_cluster =
            std::env::var("CADENZA_CURRENT_CLUSTER").unwrap_or_else(|_| "active".to_string());
        let clusters = std::env::var("CADENZA_CLUSTERS").unwrap_or_else(|_| "active:1".to_string());
        let failover_version_increment: i64 = parse_var(
            "CADENZA_FAILOVER_VERSION_INCREMENT",
            "10",
            "must be a positive integer",
        )?;
        let cluster = ClusterMetadata::parse(&current_cluster, &clusters, failover_version_increment)?;

        let long_poll_timeout_ms: u64 = parse_var(
            "CADENZA_LONG_POLL_TIMEOUT_MS",
            "20000",
            "must be a number of milliseconds",
        )?;
        let conflict_retry_count: u32 = parse_var(
            "CADENZA_CONFLICT_RETRY_COUNT",
            "5",
            "must be a non-negative integer",
        )?;
        let replication_page_size: usize = parse_var(
            "CADENZA_REPLICATION_PAGE_SIZE",
            "100",
            "must be a positive integer",
        )?;
        let max_signals_per_execution: i64 = parse_var(
            "CADENZA_MAX_SIGNALS_PER_EXECUTION",
            "0",
            "must be a non-negative integer",
        )?;
        let retention_days: u32 = parse_var(
            "CADENZA_RETENTION_DAYS",
            "7",
            "must be a non-negative integer",
        )?;

        Ok(Self {
            database_url,
            shard_count,
            host_identity,
            cluster,
            engine: EngineConfig {
                long_poll_timeout: Duration::from_millis(long_poll_timeout_ms),
                conflict_retry_count: conflict_retry_count.max(1),
                replication_page_size: replication_page_size.max(1),
                max_signals_per_execution: max_signals_per_execution.max(0),
                retention: Duration::from_secs(u64::from(retention_days) * 24 * 3600),
                ..EngineConfig::default()
            },
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    name: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(name, message))
}

/// Tunables consumed by every shard engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for a single `poll_mutable_state` wait.
    pub long_poll_timeout: Duration,
    /// Attempts for internally retried optimistic updates.
    pub conflict_retry_count: u32,
    /// Maximum replication tasks returned per `get_replication_messages`.
    pub replication_page_size: usize,
    /// Signals accepted per run; `0` disables the limit.
    pub max_signals_per_execution: i64,
    /// How long closed runs are retained before their history is deleted.
    pub retention: Duration,
    /// Execution cache capacity per shard.
    pub cache_capacity: usize,
    /// How long `stop` waits for in-flight calls to drain.
    pub shutdown_drain_timeout: Duration,
    /// Task ids reserved per shard range renewal, as a power of two.
    pub range_size_bits: u32,
    /// Attempts the replication task processor makes before DLQ routing.
    pub replication_task_max_retries: u32,
    /// Default schedule-to-start timeout for sticky decision tasks.
    pub sticky_schedule_to_start_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(20),
            conflict_retry_count: 5,
            replication_page_size: 100,
            max_signals_per_execution: 0,
            retention: Duration::from_secs(7 * 24 * 3600),
            cache_capacity: 512,
            shutdown_drain_timeout: Duration::from_secs(10),
            range_size_bits: 20,
            replication_task_max_retries: 3,
            sticky_schedule_to_start_timeout: Duration::from_secs(5),
        }
    }
}

/// Cluster topology used for failover versioning.
///
/// Every cluster owns an initial failover version; a domain's failover
/// version modulo the increment identifies the cluster it is active in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterMetadata {
    current_cluster: String,
    failover_version_increment: i64,
    clusters: BTreeMap<String, i64>,
    domain_versions: BTreeMap<String, i64>,
}

impl ClusterMetadata {
    /// Single-cluster topology.
    pub fn single(name: &str) -> Self {
        let mut clusters = BTreeMap::new();
        clusters.insert(name.to_string(), 1);
        Self {
            current_cluster: name.to_string(),
            failover_version_increment: 10,
            clusters,
            domain_versions: BTreeMap::new(),
        }
    }

    /// Build a topology from explicit `(name, initial_version)` pairs.
    pub fn new(
        current_cluster: &str,
        clusters: &[(&str, i64)],
        failover_version_increment: i64,
    ) -> Result<Self, ConfigError> {
        if failover_version_increment <= 0 {
            return Err(ConfigError::Invalid(
                "CADENZA_FAILOVER_VERSION_INCREMENT",
                "must be a positive integer",
            ));
        }
        let mut map = BTreeMap::new();
        for (name, initial) in clusters {
            if *initial < 0 || *initial >= failover_version_increment {
                return Err(ConfigError::Invalid(
                    "CADENZA_CLUSTERS",
                    "initial version must be within [0, failover version increment)",
                ));
            }
            if map.values().any(|v| v == initial) {
                return Err(ConfigError::Invalid(
                    "CADENZA_CLUSTERS",
                    "initial versions must be unique",
                ));
            }
            map.insert((*name).to_string(), *initial);
        }
        if !map.contains_key(current_cluster) {
            return Err(ConfigError::Invalid(
                "CADENZA_CURRENT_CLUSTER",
                "must name one of CADENZA_CLUSTERS",
            ));
        }
        Ok(Self {
            current_cluster: current_cluster.to_string(),
            failover_version_increment,
            clusters: map,
            domain_versions: BTreeMap::new(),
        })
    }

    /// Parse the `name:initial_version,name:initial_version` format.
    pub fn parse(
        current_cluster: &str,
        clusters: &str,
        failover_version_increment: i64,
    ) -> Result<Self, ConfigError> {
        let mut pairs = Vec::new();
        for entry in clusters.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (name, version) = entry
                .split_once(':')
                .ok_or(ConfigError::Invalid("CADENZA_CLUSTERS", "expected name:version"))?;
            let version: i64 = version
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid("CADENZA_CLUSTERS", "version must be an integer"))?;
            pairs.push((name.trim(), version));
        }
        Self::new(current_cluster, &pairs, failover_version_increment)
    }

    /// Pin a domain to an explicit failover version.
    pub fn with_domain_version(mut self, domain_id: &str, version: i64) -> Self {
        self.domain_versions.insert(domain_id.to_string(), version);
        self
    }

    /// Local cluster name.
    pub fn current_cluster(&self) -> &str {
        &self.current_cluster
    }

    /// Whether more than one cluster participates in replication.
    pub fn is_global(&self) -> bool {
        self.clusters.len() > 1
    }

    /// Names of all remote clusters.
    pub fn remote_clusters(&self) -> impl Iterator<Item = &str> {
        self.clusters
            .keys()
            .map(String::as_str)
            .filter(move |name| *name != self.current_cluster)
    }

    /// Failover version new events of `domain_id` are written with.
    pub fn domain_failover_version(&self, domain_id: &str) -> i64 {
        self.domain_versions
            .get(domain_id)
            .copied()
            .or_else(|| self.clusters.get(&self.current_cluster).copied())
            .unwrap_or(0)
    }

    /// Cluster that produced events with `version`.
    pub fn cluster_for_version(&self, version: i64) -> Option<&str> {
        let initial = version.rem_euclid(self.failover_version_increment);
        self.clusters
            .iter()
            .find(|(_, v)| **v == initial)
            .map(|(name, _)| name.as_str())
    }

    /// Cluster the domain is currently active in.
    pub fn active_cluster(&self, domain_id: &str) -> Option<&str> {
        self.cluster_for_version(self.domain_failover_version(domain_id))
    }

    /// Whether `domain_id` accepts local writes.
    pub fn is_domain_active(&self, domain_id: &str) -> bool {
        self.active_cluster(domain_id) == Some(self.current_cluster.as_str())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "CADENZA_DATABASE_URL",
        "CADENZA_SHARD_COUNT",
        "CADENZA_HOST_IDENTITY",
        "CADENZA_CURRENT_CLUSTER",
        "CADENZA_CLUSTERS",
        "CADENZA_FAILOVER_VERSION_INCREMENT",
        "CADENZA_LONG_POLL_TIMEOUT_MS",
        "CADENZA_CONFLICT_RETRY_COUNT",
        "CADENZA_REPLICATION_PAGE_SIZE",
        "CADENZA_MAX_SIGNALS_PER_EXECUTION",
        "CADENZA_RETENTION_DAYS",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for var in VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = Config::from_env().unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.shard_count, 16);
        assert_eq!(config.host_identity, "cadenza-history");
        assert_eq!(config.cluster.current_cluster(), "active");
        assert!(!config.cluster.is_global());
        assert_eq!(config.engine.long_poll_timeout, Duration::from_secs(20));
        assert_eq!(config.engine.conflict_retry_count, 5);
        assert_eq!(config.engine.replication_page_size, 100);
        assert_eq!(config.engine.max_signals_per_execution, 0);
        assert_eq!(config.engine.retention, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CADENZA_DATABASE_URL", "sqlite:history.db");
        guard.set("CADENZA_SHARD_COUNT", "4");
        guard.set("CADENZA_HOST_IDENTITY", "host-a");
        guard.set("CADENZA_CURRENT_CLUSTER", "west");
        guard.set("CADENZA_CLUSTERS", "east:1, west:2");
        guard.set("CADENZA_FAILOVER_VERSION_INCREMENT", "100");
        guard.set("CADENZA_LONG_POLL_TIMEOUT_MS", "500");
        guard.set("CADENZA_CONFLICT_RETRY_COUNT", "9");
        guard.set("CADENZA_REPLICATION_PAGE_SIZE", "25");
        guard.set("CADENZA_MAX_SIGNALS_PER_EXECUTION", "10");
        guard.set("CADENZA_RETENTION_DAYS", "1");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url.as_deref(), Some("sqlite:history.db"));
        assert_eq!(config.shard_count, 4);
        assert_eq!(config.host_identity, "host-a");
        assert_eq!(config.cluster.current_cluster(), "west");
        assert!(config.cluster.is_global());
        assert_eq!(config.cluster.remote_clusters().collect::<Vec<_>>(), vec!["east"]);
        assert_eq!(config.engine.long_poll_timeout, Duration::from_millis(500));
        assert_eq!(config.engine.conflict_retry_count, 9);
        assert_eq!(config.engine.replication_page_size, 25);
        assert_eq!(config.engine.max_signals_per_execution, 10);
        assert_eq!(config.engine.retention, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn test_config_invalid_shard_count() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CADENZA_SHARD_COUNT", "zero");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CADENZA_SHARD_COUNT", _)));

        guard.set("CADENZA_SHARD_COUNT", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CADENZA_SHARD_COUNT", _)));
    }

    #[test]
    fn test_config_current_cluster_must_be_listed() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CADENZA_CURRENT_CLUSTER", "south");
        guard.set("CADENZA_CLUSTERS", "east:1,west:2");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CADENZA_CURRENT_CLUSTER", _)));
    }

    #[test]
    fn test_config_blank_database_url_means_memory() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CADENZA_DATABASE_URL", "  ");
        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_cluster_metadata_versions() {
        let cluster = ClusterMetadata::new("east", &[("east", 1), ("west", 2)], 10).unwrap();

        assert_eq!(cluster.domain_failover_version("orders"), 1);
        assert_eq!(cluster.cluster_for_version(21), Some("east"));
        assert_eq!(cluster.cluster_for_version(12), Some("west"));
        assert_eq!(cluster.cluster_for_version(13), None);
        assert!(cluster.is_domain_active("orders"));

        let failed_over = cluster.with_domain_version("orders", 12);
        assert_eq!(failed_over.active_cluster("orders"), Some("west"));
        assert!(!failed_over.is_domain_active("orders"));
        assert!(failed_over.is_domain_active("billing"));
    }

    #[test]
    fn test_cluster_metadata_rejects_bad_topology() {
        assert!(ClusterMetadata::new("a", &[("a", 1), ("b", 1)], 10).is_err());
        assert!(ClusterMetadata::new("a", &[("a", 11)], 10).is_err());
        assert!(ClusterMetadata::new("a", &[("a", 1)], 0).is_err());
        assert!(ClusterMetadata::parse("a", "a=1", 10).is_err());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
