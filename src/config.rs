//! Orchestrator configuration.
//!
//! This module provides the runtime configuration of the manager, the
//! dead-letter queue and the memory aggregator, loaded from defaults and
//! `POOL_FORGE_*` environment variables, and the YAML topology file that
//! declares the pools the CLI spawns.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::ShellAdapter;
use crate::dlq::{BackoffSchedule, RetryPolicy};
use crate::error::{Categorize, ErrorCategory};
use crate::manager::RoutingStrategy;
use crate::pool::{
    ClusterBackend, DelegatedBackend, HttpClusterScheduler, HttpDelegateClient, LocalBackend,
    PoolBackend, PoolConfig, PoolKind,
};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The topology file is not valid YAML for the expected shape.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Categorize for ConfigError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

/// Configuration of the pool manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Maximum number of registered pools.
    pub max_pools: usize,
    pub routing_strategy: RoutingStrategy,
    /// Bound on routed executions in flight across all pools.
    pub max_concurrent_workflows: usize,
    /// Heartbeat monitor interval for pools started by the manager.
    pub monitor_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_pools: 16,
            routing_strategy: RoutingStrategy::default(),
            max_concurrent_workflows: 64,
            monitor_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration of the dead-letter queue.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// How often the processor looks for due entries.
    pub processor_interval: Duration,
    /// Base interval of the linear policy.
    pub linear_base: Duration,
    /// Base interval of the exponential policy.
    pub exponential_base: Duration,
    /// Upper bound of the exponential policy.
    pub exponential_cap: Duration,
    /// Policy for submissions that carry none.
    pub default_policy: RetryPolicy,
    pub default_max_retries: u32,
}

impl Default for DlqConfig {
    fn default() -> Self {
        let schedule = BackoffSchedule::default();
        Self {
            processor_interval: Duration::from_secs(30),
            linear_base: schedule.linear_base,
            exponential_base: schedule.exponential_base,
            exponential_cap: schedule.exponential_cap,
            default_policy: RetryPolicy::default(),
            default_max_retries: 3,
        }
    }
}

impl DlqConfig {
    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule {
            linear_base: self.linear_base,
            exponential_base: self.exponential_base,
            exponential_cap: self.exponential_cap,
        }
    }
}

/// Configuration of the memory aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Items per durable-sink write.
    pub batch_size: usize,
    /// Maximum concurrent batch writes.
    pub max_in_flight_batches: usize,
    /// Per-pool bound on a single collection.
    pub collection_timeout: Duration,
    /// Lifetime of cached search results.
    pub cache_ttl: Duration,
    /// Interval of the periodic sync loop.
    pub sync_interval: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_in_flight_batches: 4,
            collection_timeout: Duration::from_secs(10),
            cache_ttl: Duration::from_secs(300), // 5 minutes
            sync_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration of the whole orchestrator.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub manager: ManagerConfig,
    pub dlq: DlqConfig,
    pub aggregator: AggregatorConfig,
    /// SQLite URL of the durable sink; in-memory storage when unset.
    pub database_url: Option<String>,
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `POOL_FORGE_MAX_POOLS`: Maximum registered pools (default: 16)
    /// - `POOL_FORGE_ROUTING_STRATEGY`: least_loaded, round_robin, random or affinity
    /// - `POOL_FORGE_MAX_CONCURRENT_WORKFLOWS`: Global execution bound (default: 64)
    /// - `POOL_FORGE_MONITOR_INTERVAL_SECS`: Heartbeat monitor interval (default: 10)
    /// - `POOL_FORGE_DLQ_INTERVAL_SECS`: Retry processor interval (default: 30)
    /// - `POOL_FORGE_DLQ_LINEAR_BASE_SECS`: Linear base interval (default: 300)
    /// - `POOL_FORGE_DLQ_EXPONENTIAL_BASE_SECS`: Exponential base interval (default: 60)
    /// - `POOL_FORGE_DLQ_EXPONENTIAL_CAP_SECS`: Exponential cap (default: 3600)
    /// - `POOL_FORGE_RETRY_POLICY`: never, immediate, linear or exponential
    /// - `POOL_FORGE_MAX_RETRIES`: Default retry budget (default: 3)
    /// - `POOL_FORGE_BATCH_SIZE`: Items per sink write (default: 20)
    /// - `POOL_FORGE_MAX_IN_FLIGHT_BATCHES`: Concurrent sink writes (default: 4)
    /// - `POOL_FORGE_COLLECTION_TIMEOUT_SECS`: Per-pool collection bound (default: 10)
    /// - `POOL_FORGE_CACHE_TTL_SECS`: Search cache TTL (default: 300)
    /// - `POOL_FORGE_SYNC_INTERVAL_SECS`: Periodic sync interval (default: 60)
    /// - `POOL_FORGE_DATABASE_URL`: SQLite URL of the durable sink (optional)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Manager settings
        if let Some(val) = lookup("POOL_FORGE_MAX_POOLS") {
            config.manager.max_pools = parse_env_value(&val, "POOL_FORGE_MAX_POOLS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_ROUTING_STRATEGY") {
            config.manager.routing_strategy =
                parse_env_value(&val, "POOL_FORGE_ROUTING_STRATEGY")?;
        }

        if let Some(val) = lookup("POOL_FORGE_MAX_CONCURRENT_WORKFLOWS") {
            config.manager.max_concurrent_workflows =
                parse_env_value(&val, "POOL_FORGE_MAX_CONCURRENT_WORKFLOWS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_MONITOR_INTERVAL_SECS") {
            config.manager.monitor_interval =
                parse_env_secs(&val, "POOL_FORGE_MONITOR_INTERVAL_SECS")?;
        }

        // Dead-letter settings
        if let Some(val) = lookup("POOL_FORGE_DLQ_INTERVAL_SECS") {
            config.dlq.processor_interval = parse_env_secs(&val, "POOL_FORGE_DLQ_INTERVAL_SECS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_DLQ_LINEAR_BASE_SECS") {
            config.dlq.linear_base = parse_env_secs(&val, "POOL_FORGE_DLQ_LINEAR_BASE_SECS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_DLQ_EXPONENTIAL_BASE_SECS") {
            config.dlq.exponential_base =
                parse_env_secs(&val, "POOL_FORGE_DLQ_EXPONENTIAL_BASE_SECS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_DLQ_EXPONENTIAL_CAP_SECS") {
            config.dlq.exponential_cap =
                parse_env_secs(&val, "POOL_FORGE_DLQ_EXPONENTIAL_CAP_SECS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_RETRY_POLICY") {
            config.dlq.default_policy = parse_env_value(&val, "POOL_FORGE_RETRY_POLICY")?;
        }

        if let Some(val) = lookup("POOL_FORGE_MAX_RETRIES") {
            config.dlq.default_max_retries = parse_env_value(&val, "POOL_FORGE_MAX_RETRIES")?;
        }

        // Aggregator settings
        if let Some(val) = lookup("POOL_FORGE_BATCH_SIZE") {
            config.aggregator.batch_size = parse_env_value(&val, "POOL_FORGE_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("POOL_FORGE_MAX_IN_FLIGHT_BATCHES") {
            config.aggregator.max_in_flight_batches =
                parse_env_value(&val, "POOL_FORGE_MAX_IN_FLIGHT_BATCHES")?;
        }

        if let Some(val) = lookup("POOL_FORGE_COLLECTION_TIMEOUT_SECS") {
            config.aggregator.collection_timeout =
                parse_env_secs(&val, "POOL_FORGE_COLLECTION_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_CACHE_TTL_SECS") {
            config.aggregator.cache_ttl = parse_env_secs(&val, "POOL_FORGE_CACHE_TTL_SECS")?;
        }

        if let Some(val) = lookup("POOL_FORGE_SYNC_INTERVAL_SECS") {
            config.aggregator.sync_interval =
                parse_env_secs(&val, "POOL_FORGE_SYNC_INTERVAL_SECS")?;
        }

        // Storage
        config.database_url = lookup("POOL_FORGE_DATABASE_URL").filter(|v| !v.trim().is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Manager validation
        if self.manager.max_pools == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_pools must be greater than 0".to_string(),
            ));
        }

        if self.manager.max_concurrent_workflows == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_workflows must be greater than 0".to_string(),
            ));
        }

        if self.manager.monitor_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "monitor_interval must be greater than 0".to_string(),
            ));
        }

        // Dead-letter validation
        if self.dlq.processor_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dlq processor_interval must be greater than 0".to_string(),
            ));
        }

        if self.dlq.exponential_cap < self.dlq.exponential_base {
            return Err(ConfigError::ValidationFailed(
                "dlq exponential_cap cannot be below exponential_base".to_string(),
            ));
        }

        // Aggregator validation
        if self.aggregator.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if self.aggregator.max_in_flight_batches == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_in_flight_batches must be greater than 0".to_string(),
            ));
        }

        if self.aggregator.collection_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "collection_timeout must be greater than 0".to_string(),
            ));
        }

        if self.aggregator.sync_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sync_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the maximum number of pools.
    pub fn with_max_pools(mut self, max: usize) -> Self {
        self.manager.max_pools = max;
        self
    }

    /// Builder method to set the routing strategy.
    pub fn with_routing_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.manager.routing_strategy = strategy;
        self
    }

    /// Builder method to set the global execution bound.
    pub fn with_max_concurrent_workflows(mut self, max: usize) -> Self {
        self.manager.max_concurrent_workflows = max;
        self
    }

    /// Builder method to set the default retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy, max_retries: u32) -> Self {
        self.dlq.default_policy = policy;
        self.dlq.default_max_retries = max_retries;
        self
    }

    /// Builder method to set the retry processor interval.
    pub fn with_dlq_interval(mut self, interval: Duration) -> Self {
        self.dlq.processor_interval = interval;
        self
    }

    /// Builder method to set the aggregator batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.aggregator.batch_size = size;
        self
    }

    /// Builder method to set the search cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.aggregator.cache_ttl = ttl;
        self
    }

    /// Builder method to set the durable sink database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }
}

/// Pools declared in a topology file.
///
/// ```yaml
/// routing_strategy: least_loaded
/// pools:
///   - name: local-shell
///     kind: local
///     min_workers: 2
///     max_workers: 4
///     tags: [cpu]
///   - name: gpu-farm
///     kind: delegated
///     min_workers: 1
///     max_workers: 8
///     endpoint: http://gpu-agent:8080
///     api_key_env: GPU_AGENT_KEY
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub routing_strategy: Option<RoutingStrategy>,
    pub pools: Vec<PoolSpec>,
}

/// One pool of a topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub kind: PoolKind,
    pub min_workers: usize,
    pub max_workers: usize,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Delegate or scheduler base URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the delegate API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Shell used by local pools.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub task_timeout_secs: Option<u64>,
    #[serde(default)]
    pub heartbeat_timeout_secs: Option<u64>,
}

impl Topology {
    /// Loads and validates a topology file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let topology: Topology = serde_yaml::from_str(content)?;
        topology.validate()?;
        Ok(topology)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "topology declares no pools".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for spec in &self.pools {
            if !seen.insert(spec.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate pool name '{}'",
                    spec.name
                )));
            }
            spec.validate()?;
        }
        Ok(())
    }
}

impl PoolSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool_config()
            .validate()
            .map_err(|e| ConfigError::ValidationFailed(format!("pool '{}': {}", self.name, e)))?;

        match self.kind {
            PoolKind::Local => Ok(()),
            PoolKind::Delegated | PoolKind::Cluster => match self.endpoint.as_deref() {
                Some(endpoint) if !endpoint.trim().is_empty() => Ok(()),
                _ => Err(ConfigError::ValidationFailed(format!(
                    "pool '{}': {} pools need an endpoint",
                    self.name, self.kind
                ))),
            },
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::new(self.name.clone(), self.min_workers, self.max_workers);
        config.tags = self.tags.clone();
        if let Some(secs) = self.task_timeout_secs {
            config = config.with_task_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.heartbeat_timeout_secs {
            config = config.with_heartbeat_timeout(Duration::from_secs(secs));
        }
        config
    }

    /// Builds the backend this pool runs on.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` when `api_key_env` names an unset
    /// variable.
    pub fn build_backend(&self) -> Result<PoolBackend, ConfigError> {
        let endpoint = || {
            self.endpoint.clone().ok_or_else(|| {
                ConfigError::ValidationFailed(format!("pool '{}' has no endpoint", self.name))
            })
        };
        let client_error = |e: crate::error::AdapterError| ConfigError::InvalidValue {
            key: format!("pools.{}.endpoint", self.name),
            message: e.to_string(),
        };

        let backend = match self.kind {
            PoolKind::Local => {
                let mut adapter = ShellAdapter::new();
                if let Some(shell) = &self.shell {
                    adapter = adapter.with_shell(shell.clone());
                }
                PoolBackend::from(LocalBackend::new(Arc::new(adapter)))
            }
            PoolKind::Delegated => {
                let mut client = HttpDelegateClient::new(endpoint()?).map_err(client_error)?;
                if let Some(var) = &self.api_key_env {
                    let key = std::env::var(var)
                        .map_err(|_| ConfigError::MissingEnvVar(var.clone()))?;
                    client = client.with_api_key(key);
                }
                PoolBackend::from(DelegatedBackend::new(Arc::new(client)))
            }
            PoolKind::Cluster => {
                let scheduler = HttpClusterScheduler::new(endpoint()?).map_err(client_error)?;
                PoolBackend::from(ClusterBackend::new(Arc::new(scheduler)))
            }
        };
        Ok(backend)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as whole seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.manager.max_pools, 16);
        assert_eq!(config.manager.routing_strategy, RoutingStrategy::LeastLoaded);
        assert_eq!(config.dlq.processor_interval, Duration::from_secs(30));
        assert_eq!(config.dlq.default_policy, RetryPolicy::Exponential);
        assert_eq!(config.dlq.default_max_retries, 3);
        assert_eq!(config.aggregator.batch_size, 20);
        assert_eq!(config.aggregator.cache_ttl, Duration::from_secs(300));
        assert!(config.database_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dlq_schedule_mirrors_config() {
        let config = DlqConfig::default();
        assert_eq!(config.schedule(), BackoffSchedule::default());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("POOL_FORGE_MAX_POOLS", "4"),
            ("POOL_FORGE_ROUTING_STRATEGY", "round-robin"),
            ("POOL_FORGE_RETRY_POLICY", "linear"),
            ("POOL_FORGE_MAX_RETRIES", "5"),
            ("POOL_FORGE_CACHE_TTL_SECS", "30"),
            ("POOL_FORGE_DATABASE_URL", "sqlite::memory:"),
        ]))
        .unwrap();

        assert_eq!(config.manager.max_pools, 4);
        assert_eq!(config.manager.routing_strategy, RoutingStrategy::RoundRobin);
        assert_eq!(config.dlq.default_policy, RetryPolicy::Linear);
        assert_eq!(config.dlq.default_max_retries, 5);
        assert_eq!(config.aggregator.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.database_url.as_deref(), Some("sqlite::memory:"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(
            "POOL_FORGE_ROUTING_STRATEGY",
            "fastest",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "POOL_FORGE_ROUTING_STRATEGY"));
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err =
            OrchestratorConfig::from_lookup(lookup(&[("POOL_FORGE_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_topology_parses() {
        let topology = Topology::from_yaml_str(
            r#"
routing_strategy: affinity
pools:
  - name: local-shell
    kind: local
    min_workers: 1
    max_workers: 2
    tags: [cpu]
  - name: remote
    kind: delegated
    min_workers: 1
    max_workers: 4
    endpoint: http://localhost:9000
"#,
        )
        .unwrap();

        assert_eq!(topology.routing_strategy, Some(RoutingStrategy::Affinity));
        assert_eq!(topology.pools.len(), 2);
        assert_eq!(topology.pools[0].kind, PoolKind::Local);
        assert!(topology.pools[0].tags.contains("cpu"));
        assert_eq!(topology.pools[1].pool_config().max_workers, 4);

        let backend = topology.pools[0].build_backend().unwrap();
        assert_eq!(backend.kind(), PoolKind::Local);
    }

    #[test]
    fn test_topology_validation() {
        let missing_endpoint = r#"
pools:
  - name: remote
    kind: cluster
    min_workers: 1
    max_workers: 2
"#;
        assert!(matches!(
            Topology::from_yaml_str(missing_endpoint),
            Err(ConfigError::ValidationFailed(_))
        ));

        let duplicate = r#"
pools:
  - { name: a, kind: local, min_workers: 1, max_workers: 1 }
  - { name: a, kind: local, min_workers: 1, max_workers: 1 }
"#;
        assert!(Topology::from_yaml_str(duplicate).is_err());

        let bad_bounds = r#"
pools:
  - { name: a, kind: local, min_workers: 3, max_workers: 1 }
"#;
        assert!(Topology::from_yaml_str(bad_bounds).is_err());

        assert!(matches!(
            Topology::from_yaml_str("pools: ["),
            Err(ConfigError::Yaml(_))
        ));
    }
}
