//! Application state shared across all handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::key::KeySpace;
use crate::listener::{self, ChannelHandler};
use crate::metrics::Metrics;
use crate::resolver::{PermissionAuthority, PermissionResolver, PgAuthority};
use crate::store::{MemoryStore, RedisStore, SharedStore};
use crate::worker;

/// Shared application state.
///
/// Wrapped in Arc internally so Clone is cheap.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// PostgreSQL connection pool backing the authority.
    db: PgPool,

    /// Shared store (L2, invalidation queue, resilience state).
    store: Arc<dyn SharedStore>,

    /// Permission resolver and the components it owns.
    resolver: PermissionResolver,

    /// Prometheus metrics.
    metrics: Arc<Metrics>,
}

impl AppState {
    /// Connect to PostgreSQL and the shared store, then build the resolver.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await
            .context("failed to connect to PostgreSQL")?;

        let keys = KeySpace::new(config.namespace.clone());
        let store: Arc<dyn SharedStore> = match &config.store {
            StoreBackend::Redis(url) => Arc::new(
                RedisStore::connect(url, keys.clone())
                    .await
                    .context("failed to connect to Redis")?,
            ),
            StoreBackend::Cluster(nodes) => Arc::new(
                RedisStore::connect_cluster(nodes, keys.clone())
                    .await
                    .context("failed to connect to Redis cluster")?,
            ),
            StoreBackend::Memory => {
                info!("using in-process shared store; do not run more than one node");
                Arc::new(MemoryStore::new())
            }
        };
        store.ping().await.context("shared store PING failed")?;

        let authority: Arc<dyn PermissionAuthority> = Arc::new(PgAuthority::new(db.clone()));
        Ok(Self::from_parts(
            db,
            store,
            authority,
            Arc::new(SystemClock),
            keys,
            config,
        ))
    }

    /// Build state from already connected backends.
    pub fn from_parts(
        db: PgPool,
        store: Arc<dyn SharedStore>,
        authority: Arc<dyn PermissionAuthority>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        config: &Config,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let resolver = PermissionResolver::assemble(
            Arc::clone(&store),
            authority,
            clock,
            Arc::clone(&metrics),
            keys,
            &config.node_id,
            config.runtime.clone(),
        );
        Self {
            inner: Arc::new(AppStateInner {
                db,
                store,
                resolver,
                metrics,
            }),
        }
    }

    /// Start pub/sub listeners and background workers. They stop when
    /// `shutdown` flips to `true`.
    pub fn spawn_background(
        &self,
        config: &Config,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let resolver = &self.inner.resolver;
        let keys = resolver.distributed().keys();
        let coordinator: Arc<dyn ChannelHandler> = Arc::new(resolver.coordinator().clone());
        let resilience: Arc<dyn ChannelHandler> = Arc::new(resolver.resilience().clone());

        vec![
            listener::spawn(
                Arc::clone(&self.inner.store),
                keys.invalidation_channel(),
                coordinator,
                shutdown.clone(),
            ),
            listener::spawn(
                Arc::clone(&self.inner.store),
                keys.resilience_channel(),
                resilience,
                shutdown.clone(),
            ),
            worker::spawn_sweeper(
                resolver.coordinator().clone(),
                config.sweep_interval,
                config.sweep_max_age,
                shutdown.clone(),
            ),
            worker::spawn_cache_maintenance(
                resolver.local().clone(),
                config.maintenance_interval,
                shutdown.clone(),
            ),
        ]
    }

    /// Get the database pool.
    pub fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.inner.store
    }

    pub fn resolver(&self) -> &PermissionResolver {
        &self.inner.resolver
    }

    /// Get the metrics registry.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Check if PostgreSQL is healthy.
    pub async fn postgres_healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.inner.db).await.is_ok()
    }

    /// Check if the shared store is healthy.
    pub async fn store_healthy(&self) -> bool {
        self.inner.store.ping().await.is_ok()
    }
}
