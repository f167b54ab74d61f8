//! Permission resolver: the caller-facing facade.
//!
//! A check walks L1, then L2, then the authoritative store, and backfills
//! both tiers on the way out. Every L2 and authority call goes through the
//! [`ResilienceController`]; when a call fails the resolver may still answer
//! from the most recent cached value it has, flagged as degraded.

mod authority;

pub use self::authority::{AUTHORITY, PermissionAuthority, PgAuthority};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, DistributedCache, LocalCache, LocalCacheStats};
use crate::clock::Clock;
use crate::config::RuntimeSettings;
use crate::error::PermissionError;
use crate::invalidation::{
    BatchReport, CoordinatorStats, InvalidationCoordinator, InvalidationTarget, Reason,
};
use crate::key::{KeySpace, PermissionKey, Scope, ScopeType};
use crate::metrics::Metrics;
use crate::resilience::{DependencyStatus, ResilienceController};
use crate::store::{SharedStore, StoreError, bounded};

/// Dependency name L2 calls are guarded under.
pub const L2: &str = "l2";

/// Runtime-adjustable resolver settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// TTL of entries backfilled into L1.
    pub l1_ttl_secs: u64,
    /// TTL of entries backfilled into L2.
    pub l2_ttl_secs: u64,
    /// Default deadline for one check or one bulk check.
    pub deadline_ms: u64,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            l1_ttl_secs: 30,
            l2_ttl_secs: 300,
            deadline_ms: 3_000,
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    L1,
    L2,
    Authority,
    /// A cached value past its TTL, used because a dependency failed.
    Stale,
}

/// Outcome of a permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub source: DecisionSource,
    /// Answered from stale data after a failure.
    pub degraded: bool,
}

impl Decision {
    fn fresh(allowed: bool, source: DecisionSource) -> Self {
        Self {
            allowed,
            source,
            degraded: false,
        }
    }
}

/// Combined statistics for the ops surface.
#[derive(Debug, Clone, Serialize)]
pub struct ResolverStats {
    pub node_id: String,
    pub l1: LocalCacheStats,
    /// Absent when the shared store could not be read.
    pub invalidation: Option<CoordinatorStats>,
    pub dependencies: Vec<DependencyStatus>,
    pub maintenance: bool,
}

/// Per-request state shared between a bulk lookup and its caller, so that
/// work finished before a deadline is kept.
#[derive(Debug, Default)]
struct BulkProgress {
    decided: Vec<Option<Decision>>,
    seen: Vec<Option<CacheEntry>>,
}

/// Entry point for permission checks and caller-driven invalidation.
#[derive(Clone)]
pub struct PermissionResolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    local: LocalCache,
    l2: DistributedCache,
    coordinator: InvalidationCoordinator,
    resilience: ResilienceController,
    authority: Arc<dyn PermissionAuthority>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    settings: RwLock<ResolverSettings>,
}

impl PermissionResolver {
    /// Wire a resolver from already constructed components.
    pub fn new(
        coordinator: InvalidationCoordinator,
        resilience: ResilienceController,
        authority: Arc<dyn PermissionAuthority>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                local: coordinator.local().clone(),
                l2: coordinator.distributed().clone(),
                coordinator,
                resilience,
                authority,
                clock,
                metrics,
                settings: RwLock::new(settings),
            }),
        }
    }

    /// Build every component over one shared store.
    pub fn assemble(
        store: Arc<dyn SharedStore>,
        authority: Arc<dyn PermissionAuthority>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        keys: KeySpace,
        node_id: &str,
        settings: RuntimeSettings,
    ) -> Self {
        let local = LocalCache::new(settings.cache, Arc::clone(&clock));
        let l2 = DistributedCache::new(Arc::clone(&store), keys.clone(), settings.distributed);
        let coordinator = InvalidationCoordinator::new(
            local,
            l2,
            Arc::clone(&clock),
            Arc::clone(&metrics),
            node_id,
            settings.invalidation,
        );
        let resilience = ResilienceController::new(
            store,
            keys,
            Arc::clone(&clock),
            Arc::clone(&metrics),
            node_id,
            settings.resilience,
        );
        Self::new(
            coordinator,
            resilience,
            authority,
            clock,
            metrics,
            settings.resolver,
        )
    }

    pub fn local(&self) -> &LocalCache {
        &self.inner.local
    }

    pub fn distributed(&self) -> &DistributedCache {
        &self.inner.l2
    }

    pub fn coordinator(&self) -> &InvalidationCoordinator {
        &self.inner.coordinator
    }

    pub fn resilience(&self) -> &ResilienceController {
        &self.inner.resilience
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    fn keys(&self) -> &KeySpace {
        self.inner.l2.keys()
    }

    /// Check one permission under the configured deadline.
    pub async fn check_permission(
        &self,
        subject_id: &str,
        scope_type: ScopeType,
        scope_id: Option<&str>,
        permission: &str,
    ) -> Result<Decision, PermissionError> {
        let key = PermissionKey::new(subject_id, scope_type, scope_id, permission)?;
        let deadline = Duration::from_millis(self.inner.settings.read().deadline_ms);
        self.check_permission_within(&key, deadline).await
    }

    /// Check one permission, giving up on pending lookups after `deadline`.
    pub async fn check_permission_within(
        &self,
        key: &PermissionKey,
        deadline: Duration,
    ) -> Result<Decision, PermissionError> {
        let started = Instant::now();
        let cache_key = self.keys().cache_key(key);

        if let Some(entry) = self.inner.local.get(&cache_key) {
            self.inner.metrics.record_lookup("l1", true);
            self.observe(started);
            return Ok(Decision::fresh(entry.allowed, DecisionSource::L1));
        }
        self.inner.metrics.record_lookup("l1", false);

        let seen = Mutex::new(None);
        let outcome = match tokio::time::timeout(deadline, self.resolve(key, &cache_key, &seen)).await
        {
            Ok(result) => result,
            Err(_) => Err(PermissionError::Timeout(deadline)),
        };

        let result = match outcome {
            Ok(decision) => Ok(decision),
            Err(e) if e.allows_degraded() => self.degraded(key, &cache_key, seen.into_inner(), e),
            Err(e) => Err(e),
        };
        self.observe(started);
        result
    }

    /// L2 then authority for one key that missed L1.
    async fn resolve(
        &self,
        key: &PermissionKey,
        cache_key: &str,
        seen: &Mutex<Option<CacheEntry>>,
    ) -> Result<Decision, PermissionError> {
        let settings = self.inner.settings.read().clone();
        let epoch = self.inner.coordinator.epoch();

        let l2 = &self.inner.l2;
        let cached = self
            .inner
            .resilience
            .execute(L2, move || async move {
                l2.get(key).await.map_err(|e| PermissionError::unavailable(L2, e))
            })
            .await;

        match cached {
            Ok(Some(entry)) if entry.is_fresh(self.inner.clock.now_ms()) => {
                self.inner.metrics.record_lookup("l2", true);
                let allowed = entry.allowed;
                self.promote(cache_key, entry, epoch, settings.l1_ttl_secs);
                return Ok(Decision::fresh(allowed, DecisionSource::L2));
            }
            Ok(Some(entry)) => {
                self.inner.metrics.record_lookup("l2", false);
                *seen.lock() = Some(entry);
            }
            Ok(None) => self.inner.metrics.record_lookup("l2", false),
            Err(e) => {
                self.inner.metrics.record_lookup("l2", false);
                debug!(key = %key, error = %e, "L2 lookup failed, asking the authority");
            }
        }

        let scope = key.scope();
        let permissions = self
            .query_authority(key.subject_id(), std::slice::from_ref(scope))
            .await?;
        let allowed = permissions
            .get(scope)
            .is_some_and(|granted| granted.contains(key.permission()));

        let entry = CacheEntry::new(
            key.clone(),
            allowed,
            self.inner.clock.now_ms(),
            settings.l2_ttl_secs,
            epoch,
        );
        self.backfill(vec![(cache_key.to_string(), entry)], epoch, settings.l1_ttl_secs)
            .await;
        Ok(Decision::fresh(allowed, DecisionSource::Authority))
    }

    /// Check many permissions of one subject.
    ///
    /// Returns one result per request, in request order. L2 and the
    /// authority are each asked once for everything that missed the tier
    /// before.
    pub async fn bulk_check_permissions(
        &self,
        subject_id: &str,
        requests: &[(ScopeType, Option<&str>, &str)],
    ) -> Vec<Result<Decision, PermissionError>> {
        let started = Instant::now();
        let mut results: Vec<Option<Result<Decision, PermissionError>>> =
            Vec::with_capacity(requests.len());
        let mut pending: Vec<(usize, PermissionKey, String)> = Vec::new();

        for (i, (scope_type, scope_id, permission)) in requests.iter().enumerate() {
            match PermissionKey::new(subject_id, *scope_type, *scope_id, permission) {
                Ok(key) => {
                    let cache_key = self.keys().cache_key(&key);
                    if let Some(entry) = self.inner.local.get(&cache_key) {
                        self.inner.metrics.record_lookup("l1", true);
                        results.push(Some(Ok(Decision::fresh(entry.allowed, DecisionSource::L1))));
                    } else {
                        self.inner.metrics.record_lookup("l1", false);
                        results.push(None);
                        pending.push((i, key, cache_key));
                    }
                }
                Err(e) => results.push(Some(Err(e))),
            }
        }

        if !pending.is_empty() {
            let deadline = Duration::from_millis(self.inner.settings.read().deadline_ms);
            let progress = Mutex::new(BulkProgress {
                decided: vec![None; pending.len()],
                seen: vec![None; pending.len()],
            });
            let outcome = match tokio::time::timeout(
                deadline,
                self.resolve_bulk(subject_id, &pending, &progress),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(PermissionError::Timeout(deadline)),
            };

            let BulkProgress { decided, seen } = progress.into_inner();
            for (((i, key, cache_key), decision), stale) in pending.iter().zip(decided).zip(seen) {
                let result = match (decision, &outcome) {
                    (Some(decision), _) => Ok(decision),
                    (None, Err(e)) if e.allows_degraded() => {
                        self.degraded(key, cache_key, stale, e.clone())
                    }
                    (None, Err(e)) => Err(e.clone()),
                    (None, Ok(())) => Err(PermissionError::unavailable(
                        AUTHORITY,
                        "no decision produced for key",
                    )),
                };
                results[*i] = Some(result);
            }
        }

        self.observe(started);
        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| Err(PermissionError::unavailable(L2, "request not resolved")))
            })
            .collect()
    }

    async fn resolve_bulk(
        &self,
        subject_id: &str,
        pending: &[(usize, PermissionKey, String)],
        progress: &Mutex<BulkProgress>,
    ) -> Result<(), PermissionError> {
        let settings = self.inner.settings.read().clone();
        let epoch = self.inner.coordinator.epoch();

        let keys: Vec<PermissionKey> = pending.iter().map(|(_, key, _)| key.clone()).collect();
        let l2 = &self.inner.l2;
        let keys_ref = &keys;
        let cached = self
            .inner
            .resilience
            .execute(L2, move || async move {
                l2.get_many(keys_ref)
                    .await
                    .map_err(|e| PermissionError::unavailable(L2, e))
            })
            .await;

        match cached {
            Ok(entries) => {
                let now = self.inner.clock.now_ms();
                for (slot, entry) in entries.into_iter().enumerate() {
                    let Some(entry) = entry else {
                        self.inner.metrics.record_lookup("l2", false);
                        continue;
                    };
                    if entry.is_fresh(now) {
                        self.inner.metrics.record_lookup("l2", true);
                        progress.lock().decided[slot] =
                            Some(Decision::fresh(entry.allowed, DecisionSource::L2));
                        self.promote(&pending[slot].2, entry, epoch, settings.l1_ttl_secs);
                    } else {
                        self.inner.metrics.record_lookup("l2", false);
                        progress.lock().seen[slot] = Some(entry);
                    }
                }
            }
            Err(e) => {
                debug!(subject_id = %subject_id, error = %e, "L2 bulk lookup failed, asking the authority");
            }
        }

        let missing: Vec<usize> = {
            let progress = progress.lock();
            (0..pending.len())
                .filter(|slot| progress.decided[*slot].is_none())
                .collect()
        };
        if missing.is_empty() {
            return Ok(());
        }

        let mut scopes: Vec<Scope> = Vec::new();
        for slot in &missing {
            let scope = pending[*slot].1.scope();
            if !scopes.contains(scope) {
                scopes.push(scope.clone());
            }
        }
        let permissions = self.query_authority(subject_id, &scopes).await?;

        let now = self.inner.clock.now_ms();
        let mut fills = Vec::with_capacity(missing.len());
        {
            let mut progress = progress.lock();
            for slot in missing {
                let (_, key, cache_key) = &pending[slot];
                let allowed = permissions
                    .get(key.scope())
                    .is_some_and(|granted| granted.contains(key.permission()));
                progress.decided[slot] = Some(Decision::fresh(allowed, DecisionSource::Authority));
                fills.push((
                    cache_key.clone(),
                    CacheEntry::new(key.clone(), allowed, now, settings.l2_ttl_secs, epoch),
                ));
            }
        }
        self.backfill(fills, epoch, settings.l1_ttl_secs).await;
        Ok(())
    }

    /// One guarded, retried authority round trip.
    async fn query_authority(
        &self,
        subject_id: &str,
        scopes: &[Scope],
    ) -> Result<HashMap<Scope, HashSet<String>>, PermissionError> {
        let authority = &self.inner.authority;
        let metrics = &self.inner.metrics;
        self.inner
            .resilience
            .execute_with_retry(AUTHORITY, move || async move {
                metrics.authority_queries.inc();
                let started = Instant::now();
                let result = authority.fetch_permissions_bulk(subject_id, scopes).await;
                metrics
                    .authority_duration_seconds
                    .observe(started.elapsed().as_secs_f64());
                result
            })
            .await
    }

    /// Copy an L2 entry into L1 unless an invalidation landed meanwhile.
    fn promote(&self, cache_key: &str, entry: CacheEntry, epoch: u64, l1_ttl_secs: u64) {
        if self.inner.coordinator.epoch() == epoch {
            self.inner
                .local
                .insert(cache_key.to_string(), entry.capped(l1_ttl_secs));
        }
    }

    /// Write fresh results to L2, then L1.
    ///
    /// Skipped when the node's invalidation epoch moved since the lookup
    /// started; if it moves while the L2 write is in flight the written keys
    /// are removed again.
    async fn backfill(&self, fills: Vec<(String, CacheEntry)>, epoch: u64, l1_ttl_secs: u64) {
        let coordinator = &self.inner.coordinator;
        if coordinator.epoch() != epoch {
            debug!(entries = fills.len(), "invalidation during lookup, skipping backfill");
            return;
        }

        let l2 = &self.inner.l2;
        let entries: Vec<CacheEntry> = fills.iter().map(|(_, entry)| entry.clone()).collect();
        let entries_ref = &entries;
        let stored = self
            .inner
            .resilience
            .execute(L2, move || async move {
                l2.set_many(entries_ref)
                    .await
                    .map_err(|e| PermissionError::unavailable(L2, e))
            })
            .await;
        if let Err(e) = stored {
            debug!(entries = entries.len(), error = %e, "L2 backfill failed");
        }

        if coordinator.epoch() != epoch {
            let written: Vec<String> = fills.into_iter().map(|(key, _)| key).collect();
            let timeout = self.inner.resilience.store_timeout();
            if let Err(e) = bounded(timeout, l2.delete_many(&written)).await {
                warn!(keys = written.len(), error = %e, "failed to withdraw raced L2 backfill");
            }
            return;
        }

        for (cache_key, entry) in fills {
            self.inner.local.insert(cache_key, entry.capped(l1_ttl_secs));
        }
    }

    /// Answer from the newest cached value after `error`, or return the error.
    ///
    /// Never invents an answer: with nothing cached the check fails closed.
    fn degraded(
        &self,
        key: &PermissionKey,
        cache_key: &str,
        seen: Option<CacheEntry>,
        error: PermissionError,
    ) -> Result<Decision, PermissionError> {
        let best = [self.inner.local.get_stale(cache_key), seen]
            .into_iter()
            .flatten()
            .max_by_key(|entry| entry.computed_at_ms);

        let Some(entry) = best else {
            warn!(key = %key, error = %error, "permission check failed with nothing cached");
            return Err(error);
        };

        self.inner.metrics.degraded_decisions.inc();
        warn!(
            target: "permgate::audit",
            subject_id = %key.subject_id(),
            scope = %key.scope(),
            permission = %key.permission(),
            allowed = entry.allowed,
            computed_at_ms = entry.computed_at_ms,
            error = %error,
            "degraded permission decision"
        );
        Ok(Decision {
            allowed: entry.allowed,
            source: DecisionSource::Stale,
            degraded: true,
        })
    }

    fn observe(&self, started: Instant) {
        self.inner
            .metrics
            .check_duration_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    /// Drop every cached result of one subject on every node, including
    /// pending delayed invalidations queued for them.
    pub async fn invalidate_user(&self, subject_id: &str) -> Result<BatchReport, PermissionError> {
        let prefix = self.keys().subject_prefix(subject_id);
        let coordinator = &self.inner.coordinator;
        let mut report = coordinator
            .invalidate_now(
                vec![InvalidationTarget::Prefix(prefix)],
                Reason::UserRoleAssigned,
                Some(subject_id),
                None,
            )
            .await
            .map_err(store_unavailable)?;
        report.merge(
            coordinator
                .invalidate_by_subject(subject_id)
                .await
                .map_err(store_unavailable)?,
        );
        debug!(subject_id = %subject_id, keys_removed = report.keys_removed, "invalidated subject");
        Ok(report)
    }

    /// Drop cached results of every subject holding `role_id`.
    ///
    /// Role membership is read from the authority under its guards.
    pub async fn invalidate_role(&self, role_id: &str) -> Result<BatchReport, PermissionError> {
        let authority = &self.inner.authority;
        let subjects = self
            .inner
            .resilience
            .execute_with_retry(AUTHORITY, move || async move {
                authority.subjects_with_role(role_id).await
            })
            .await?;

        let targets: Vec<InvalidationTarget> = subjects
            .iter()
            .map(|subject| InvalidationTarget::Prefix(self.keys().subject_prefix(subject)))
            .collect();
        let report = self
            .inner
            .coordinator
            .invalidate_now(targets, Reason::RoleChanged, None, None)
            .await
            .map_err(store_unavailable)?;
        debug!(
            role_id = %role_id,
            subjects = subjects.len(),
            keys_removed = report.keys_removed,
            "invalidated role"
        );
        Ok(report)
    }

    /// Drop every cached result at one scope id.
    pub async fn invalidate_scope(&self, scope_id: &str) -> Result<BatchReport, PermissionError> {
        let coordinator = &self.inner.coordinator;
        let mut report = coordinator
            .invalidate_now(
                vec![InvalidationTarget::Scope(scope_id.to_string())],
                Reason::PermissionChanged,
                None,
                Some(scope_id),
            )
            .await
            .map_err(store_unavailable)?;
        report.merge(
            coordinator
                .invalidate_by_scope(scope_id)
                .await
                .map_err(store_unavailable)?,
        );
        Ok(report)
    }

    pub async fn stats(&self) -> ResolverStats {
        let invalidation = match self.inner.coordinator.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "invalidation stats unavailable");
                None
            }
        };
        ResolverStats {
            node_id: self.inner.coordinator.node_id().to_string(),
            l1: self.inner.local.stats(),
            invalidation,
            dependencies: self.inner.resilience.statuses().await,
            maintenance: self.inner.resilience.maintenance().await,
        }
    }

    /// Current settings of every component.
    pub fn settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            resolver: self.inner.settings.read().clone(),
            cache: self.inner.local.settings(),
            distributed: self.inner.l2.settings(),
            invalidation: self.inner.coordinator.settings(),
            resilience: self.inner.resilience.settings(),
        }
    }

    /// Replace the settings of every component on this node.
    pub fn set_settings(&self, settings: RuntimeSettings) {
        *self.inner.settings.write() = settings.resolver;
        self.inner.local.set_settings(settings.cache);
        self.inner.l2.set_settings(settings.distributed);
        self.inner.coordinator.set_settings(settings.invalidation);
        self.inner.resilience.set_settings(settings.resilience);
    }
}

fn store_unavailable(e: StoreError) -> PermissionError {
    PermissionError::unavailable(L2, e)
}

impl std::fmt::Debug for PermissionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionResolver")
            .field("node_id", &self.inner.coordinator.node_id())
            .finish()
    }
}
