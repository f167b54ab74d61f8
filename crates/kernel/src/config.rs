//! Configuration loaded from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheSettings, DistributedSettings};
use crate::invalidation::InvalidationSettings;
use crate::resilience::ResilienceSettings;
use crate::resolver::ResolverSettings;

/// Where the shared store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// One Redis server (default).
    Redis(String),
    /// Redis cluster seed nodes.
    Cluster(Vec<String>),
    /// In-process store; only valid for a single node.
    Memory,
}

/// Settings every component reads at runtime.
///
/// Served and replaced as one document by the ops surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    #[serde(default)]
    pub resolver: ResolverSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub distributed: DistributedSettings,
    #[serde(default)]
    pub invalidation: InvalidationSettings,
    #[serde(default)]
    pub resilience: ResilienceSettings,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 3000).
    pub port: u16,

    /// PostgreSQL connection URL.
    pub database_url: String,

    /// Maximum database connections in pool (default: 10).
    pub database_max_connections: u32,

    /// Shared store backend (default: Redis at 127.0.0.1:6379).
    pub store: StoreBackend,

    /// Prefix for every key and channel in the shared store (default: permgate).
    pub namespace: String,

    /// Identity of this node in events and logs (default: hostname plus a
    /// random suffix).
    pub node_id: String,

    /// Interval between invalidation queue sweeps (default: 250ms).
    pub sweep_interval: Duration,

    /// Lease on tasks claimed by a sweep (default: 30s).
    pub sweep_max_age: Duration,

    /// Interval between L1 housekeeping passes (default: 60s).
    pub maintenance_interval: Duration,

    /// Initial runtime settings.
    pub runtime: RuntimeSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = parse_or(&var, "PORT", 3000u16)?;

        let database_url =
            var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let database_max_connections = parse_or(&var, "DATABASE_MAX_CONNECTIONS", 10u32)?;

        let cluster_nodes: Vec<String> = var("REDIS_CLUSTER_NODES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let backend = var("STORE_BACKEND")
            .unwrap_or_else(|| "redis".to_string())
            .to_lowercase();

        let store = match backend.as_str() {
            "memory" => StoreBackend::Memory,
            "redis" if !cluster_nodes.is_empty() => StoreBackend::Cluster(cluster_nodes),
            "redis" => StoreBackend::Redis(
                var("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            ),
            other => anyhow::bail!("STORE_BACKEND must be `redis` or `memory`, got `{other}`"),
        };

        let namespace = var("PERMGATE_NAMESPACE").unwrap_or_else(|| "permgate".to_string());
        let node_id = var("PERMGATE_NODE_ID").unwrap_or_else(default_node_id);

        let sweep_interval = Duration::from_millis(parse_or(&var, "SWEEP_INTERVAL_MS", 250u64)?);
        let sweep_max_age = Duration::from_millis(parse_or(&var, "SWEEP_MAX_AGE_MS", 30_000u64)?);
        let maintenance_interval =
            Duration::from_secs(parse_or(&var, "L1_MAINTENANCE_INTERVAL_SECS", 60u64)?);

        let mut runtime = RuntimeSettings::default();

        let resolver = &mut runtime.resolver;
        resolver.l1_ttl_secs = parse_or(&var, "L1_TTL_SECS", resolver.l1_ttl_secs)?;
        resolver.l2_ttl_secs = parse_or(&var, "L2_TTL_SECS", resolver.l2_ttl_secs)?;
        resolver.deadline_ms = parse_or(&var, "CHECK_DEADLINE_MS", resolver.deadline_ms)?;

        let cache = &mut runtime.cache;
        cache.capacity = parse_or(&var, "L1_CAPACITY", cache.capacity)?;
        cache.max_capacity = parse_or(&var, "L1_MAX_CAPACITY", cache.max_capacity)?;
        cache.stale_grace_secs = parse_or(&var, "L1_STALE_GRACE_SECS", cache.stale_grace_secs)?;

        let distributed = &mut runtime.distributed;
        distributed.stale_grace_secs =
            parse_or(&var, "L2_STALE_GRACE_SECS", distributed.stale_grace_secs)?;

        let invalidation = &mut runtime.invalidation;
        invalidation.max_attempts =
            parse_or(&var, "INVALIDATION_MAX_ATTEMPTS", invalidation.max_attempts)?;
        invalidation.claim_batch =
            parse_or(&var, "INVALIDATION_CLAIM_BATCH", invalidation.claim_batch)?;
        invalidation.store_timeout_ms = parse_or(
            &var,
            "INVALIDATION_STORE_TIMEOUT_MS",
            invalidation.store_timeout_ms,
        )?;

        let resilience = &mut runtime.resilience;
        resilience.store_timeout_ms =
            parse_or(&var, "GUARD_STORE_TIMEOUT_MS", resilience.store_timeout_ms)?;

        let guard = &mut runtime.resilience.default;
        guard.max_concurrent = parse_or(&var, "BULKHEAD_MAX_CONCURRENT", guard.max_concurrent)?;
        guard.rate_limit = parse_or(&var, "RATE_LIMIT", guard.rate_limit)?;
        guard.rate_window_ms = parse_or(&var, "RATE_WINDOW_MS", guard.rate_window_ms)?;
        guard.failure_threshold =
            parse_or(&var, "BREAKER_FAILURE_THRESHOLD", guard.failure_threshold)?;
        guard.cooldown_ms = parse_or(&var, "BREAKER_COOLDOWN_MS", guard.cooldown_ms)?;
        guard.call_timeout_ms = parse_or(&var, "CALL_TIMEOUT_MS", guard.call_timeout_ms)?;

        Ok(Self {
            port,
            database_url,
            database_max_connections,
            store,
            namespace,
            node_id,
            sweep_interval,
            sweep_max_age,
            maintenance_interval,
            runtime,
        })
    }
}

fn parse_or<F, T>(var: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid {}", std::any::type_name::<T>())),
        None => Ok(default),
    }
}

fn default_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{host}-{:08x}", rand::random::<u32>())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_vars(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/permgate")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(
            config.store,
            StoreBackend::Redis("redis://127.0.0.1:6379".to_string())
        );
        assert_eq!(config.namespace, "permgate");
        assert_eq!(config.runtime, RuntimeSettings::default());
        assert!(!config.node_id.is_empty());
    }

    #[test]
    fn test_database_url_required() {
        assert!(load(&[]).is_err());
    }

    #[test]
    fn test_cluster_nodes_select_cluster_backend() {
        let config = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("REDIS_CLUSTER_NODES", "redis://a:7000, redis://b:7001,"),
        ])
        .unwrap();
        assert_eq!(
            config.store,
            StoreBackend::Cluster(vec!["redis://a:7000".into(), "redis://b:7001".into()])
        );
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let config = load(&[
            ("DATABASE_URL", "postgres://x"),
            ("STORE_BACKEND", "Memory"),
            ("L1_TTL_SECS", "5"),
            ("BREAKER_FAILURE_THRESHOLD", "3"),
            ("GUARD_STORE_TIMEOUT_MS", "75"),
        ])
        .unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.runtime.resolver.l1_ttl_secs, 5);
        assert_eq!(config.runtime.resilience.default.failure_threshold, 3);
        assert_eq!(config.runtime.resilience.store_timeout_ms, 75);
        assert_eq!(config.runtime.invalidation.store_timeout_ms, 1_000);

        let err = load(&[("DATABASE_URL", "postgres://x"), ("PORT", "http")]).unwrap_err();
        assert!(err.to_string().contains("PORT"));
        assert!(load(&[("DATABASE_URL", "postgres://x"), ("STORE_BACKEND", "disk")]).is_err());
    }

    #[test]
    fn test_runtime_settings_accept_partial_documents() {
        let settings: RuntimeSettings =
            serde_json::from_str(r#"{"resolver":{"l1_ttl_secs":1,"l2_ttl_secs":2,"deadline_ms":3}}"#)
                .unwrap();
        assert_eq!(settings.resolver.deadline_ms, 3);
        assert_eq!(settings.cache, CacheSettings::default());
    }
}
