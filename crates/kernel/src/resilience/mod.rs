//! Guards for calls that cross a process boundary.
//!
//! [`ResilienceController::execute`] evaluates, in this order: maintenance
//! mode, bulkhead, rate limiter, circuit breaker, then the call itself under
//! a timeout, and finally records the result on the breaker.
//!
//! Breaker snapshots and the maintenance flag live in the shared store. Each
//! node reads them through a short-lived local copy, and every change is
//! published on the resilience channel so peers update their copy at once.

mod breaker;
mod bulkhead;
mod rate_limit;

pub use self::breaker::{Admission, BreakerPolicy, BreakerSnapshot, CircuitState};
pub use self::bulkhead::{Bulkhead, BulkheadPermit};
pub use self::rate_limit::RateLimiter;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::PermissionError;
use crate::key::KeySpace;
use crate::metrics::{GuardLabels, Metrics};
use crate::store::{SharedStore, StoreResult, bounded};

/// CAS attempts before a breaker update falls back to the local copy.
const MAX_CAS_ATTEMPTS: usize = 3;

/// Guard thresholds for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardSettings {
    pub max_concurrent: usize,
    /// Calls allowed per window across the cluster; 0 disables the limiter.
    pub rate_limit: u64,
    pub rate_window_ms: u64,
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    pub cooldown_ms: u64,
    pub call_timeout_ms: u64,
    /// Retry a single `Unavailable` once in `execute_with_retry`.
    pub retry_unavailable: bool,
    pub retry_backoff_ms: u64,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            rate_limit: 0,
            rate_window_ms: 1_000,
            failure_threshold: 5,
            failure_window_ms: 30_000,
            cooldown_ms: 10_000,
            call_timeout_ms: 2_000,
            retry_unavailable: true,
            retry_backoff_ms: 50,
        }
    }
}

impl GuardSettings {
    pub fn policy(&self) -> BreakerPolicy {
        BreakerPolicy {
            failure_threshold: self.failure_threshold.max(1),
            failure_window_ms: self.failure_window_ms,
            cooldown_ms: self.cooldown_ms,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Runtime-adjustable resilience settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResilienceSettings {
    pub default: GuardSettings,
    /// Per-dependency replacements for `default`.
    #[serde(default)]
    pub overrides: BTreeMap<String, GuardSettings>,
    /// How long a node trusts its local copy of shared state.
    pub state_cache_ttl_ms: u64,
    /// Bound on each store round trip the guards make themselves.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    250
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            default: GuardSettings::default(),
            overrides: BTreeMap::new(),
            state_cache_ttl_ms: 500,
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl ResilienceSettings {
    pub fn for_dependency(&self, dependency: &str) -> &GuardSettings {
        self.overrides.get(dependency).unwrap_or(&self.default)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms.max(1))
    }
}

/// State change broadcast to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResilienceEvent {
    Breaker {
        dependency: String,
        snapshot: BreakerSnapshot,
        origin: String,
    },
    Maintenance {
        enabled: bool,
        origin: String,
    },
}

/// Observable state of one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub dependency: String,
    pub breaker: BreakerSnapshot,
    pub in_flight: usize,
    pub max_concurrent: usize,
    /// Calls counted in the current rate window, when the store answered.
    pub rate_window_count: Option<u64>,
}

/// Local copy of a value held in the shared store.
#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    /// Exact stored text, used as the CAS comparand.
    raw: Option<String>,
    fetched_at_ms: u64,
}

struct DependencyState {
    bulkhead: Bulkhead,
    breaker: Mutex<Option<Cached<BreakerSnapshot>>>,
}

/// Guards every call to a named dependency.
#[derive(Clone)]
pub struct ResilienceController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    node_id: String,
    settings: RwLock<ResilienceSettings>,
    dependencies: DashMap<String, Arc<DependencyState>>,
    maintenance: Mutex<Option<Cached<bool>>>,
}

impl ResilienceController {
    pub fn new(
        store: Arc<dyn SharedStore>,
        keys: KeySpace,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        node_id: impl Into<String>,
        settings: ResilienceSettings,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                limiter: RateLimiter::new(Arc::clone(&store), keys.clone()),
                store,
                keys,
                clock,
                metrics,
                node_id: node_id.into(),
                settings: RwLock::new(settings),
                dependencies: DashMap::new(),
                maintenance: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> ResilienceSettings {
        self.inner.settings.read().clone()
    }

    pub fn set_settings(&self, settings: ResilienceSettings) {
        *self.inner.settings.write() = settings;
        info!("resilience settings replaced");
    }

    pub fn guard_settings(&self, dependency: &str) -> GuardSettings {
        self.inner.settings.read().for_dependency(dependency).clone()
    }

    /// Bound on a single shared-store round trip.
    pub fn store_timeout(&self) -> Duration {
        self.inner.settings.read().store_timeout()
    }

    fn dependency(&self, name: &str) -> Arc<DependencyState> {
        if let Some(state) = self.inner.dependencies.get(name) {
            return Arc::clone(&state);
        }
        let gauge = self
            .inner
            .metrics
            .in_flight
            .get_or_create(&GuardLabels {
                dependency: name.to_string(),
                kind: "in_flight",
            })
            .clone();
        Arc::clone(
            &self
                .inner
                .dependencies
                .entry(name.to_string())
                .or_insert_with(|| {
                    Arc::new(DependencyState {
                        bulkhead: Bulkhead::new(gauge),
                        breaker: Mutex::new(None),
                    })
                }),
        )
    }

    /// Run `call` behind every guard for `dependency`.
    pub async fn execute<T, F, Fut>(&self, dependency: &str, call: F) -> Result<T, PermissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PermissionError>>,
    {
        let settings = self.guard_settings(dependency);

        if self.maintenance().await {
            return Err(self.reject(dependency, PermissionError::MaintenanceMode));
        }

        let state = self.dependency(dependency);
        let Some(_permit) = state.bulkhead.try_acquire(settings.max_concurrent) else {
            return Err(self.reject(dependency, PermissionError::Overloaded(dependency.into())));
        };

        if settings.rate_limit > 0 {
            let now = self.inner.clock.now_ms();
            if let Err(retry_after_ms) = self
                .inner
                .limiter
                .check(
                    dependency,
                    settings.rate_limit,
                    settings.rate_window_ms,
                    now,
                    self.store_timeout(),
                )
                .await
            {
                return Err(self.reject(
                    dependency,
                    PermissionError::RateLimited {
                        dependency: dependency.into(),
                        retry_after_ms,
                    },
                ));
            }
        }

        let probe = match self.admit(dependency, &state, &settings).await {
            Admission::Allow => false,
            Admission::Probe(_) => true,
            Admission::Reject { retry_after_ms } => {
                debug!(dependency = %dependency, retry_after_ms, "circuit open");
                return Err(self.reject(dependency, PermissionError::CircuitOpen(dependency.into())));
            }
        };

        let timeout = settings.call_timeout();
        let outcome = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(PermissionError::Timeout(timeout)),
        };

        match &outcome {
            Err(e @ (PermissionError::Unavailable { .. } | PermissionError::Timeout(_))) => {
                self.inner.metrics.record_rejection(dependency, e.kind());
                self.record_failure(dependency, &state, &settings, probe)
                    .await;
            }
            _ => self.record_success(dependency, &state, probe).await,
        }
        outcome
    }

    /// Like [`execute`](Self::execute), retrying a single `Unavailable` once
    /// after a jittered backoff. Guard rejections are never retried.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        dependency: &str,
        mut call: F,
    ) -> Result<T, PermissionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PermissionError>>,
    {
        let settings = self.guard_settings(dependency);
        match self.execute(dependency, &mut call).await {
            Err(e @ PermissionError::Unavailable { .. }) if settings.retry_unavailable => {
                let backoff = jittered(settings.retry_backoff_ms);
                debug!(dependency = %dependency, error = %e, backoff_ms = backoff, "retrying once");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                self.execute(dependency, &mut call).await
            }
            other => other,
        }
    }

    fn reject(&self, dependency: &str, error: PermissionError) -> PermissionError {
        self.inner.metrics.record_rejection(dependency, error.kind());
        error
    }

    /// Whether maintenance mode is on, from the local copy when fresh.
    pub async fn maintenance(&self) -> bool {
        let now = self.inner.clock.now_ms();
        let ttl = self.inner.settings.read().state_cache_ttl_ms;
        let cached = self.inner.maintenance.lock().clone();
        if let Some(cached) = &cached
            && now.saturating_sub(cached.fetched_at_ms) < ttl
        {
            return cached.value;
        }

        let key = self.inner.keys.maintenance_key();
        match bounded(self.store_timeout(), self.inner.store.get(&key)).await {
            Ok(raw) => {
                let enabled = raw.as_deref() == Some("1");
                *self.inner.maintenance.lock() = Some(Cached {
                    value: enabled,
                    raw,
                    fetched_at_ms: now,
                });
                enabled
            }
            Err(e) => {
                let last = cached.is_some_and(|c| c.value);
                warn!(error = %e, maintenance = last, "maintenance flag unreadable, using last known value");
                last
            }
        }
    }

    /// Turn maintenance mode on or off for the whole cluster.
    pub async fn set_maintenance(&self, enabled: bool) -> StoreResult<()> {
        let raw = if enabled { "1" } else { "0" };
        let key = self.inner.keys.maintenance_key();
        bounded(self.store_timeout(), self.inner.store.set(&key, raw, 0)).await?;
        *self.inner.maintenance.lock() = Some(Cached {
            value: enabled,
            raw: Some(raw.to_string()),
            fetched_at_ms: self.inner.clock.now_ms(),
        });
        self.publish(&ResilienceEvent::Maintenance {
            enabled,
            origin: self.inner.node_id.clone(),
        })
        .await;
        warn!(enabled, "maintenance mode changed");
        Ok(())
    }

    /// Current breaker state and local counters for one dependency.
    pub async fn status(&self, dependency: &str) -> DependencyStatus {
        let settings = self.guard_settings(dependency);
        let state = self.dependency(dependency);
        let breaker = self.load_breaker(dependency, &state, false).await.value;
        let rate_window_count = self
            .inner
            .limiter
            .current(
                dependency,
                settings.rate_window_ms,
                self.inner.clock.now_ms(),
                self.store_timeout(),
            )
            .await;
        DependencyStatus {
            dependency: dependency.to_string(),
            breaker,
            in_flight: state.bulkhead.in_flight(),
            max_concurrent: settings.max_concurrent,
            rate_window_count,
        }
    }

    /// Status of every dependency seen or configured on this node.
    pub async fn statuses(&self) -> Vec<DependencyStatus> {
        let mut names: Vec<String> = self
            .inner
            .dependencies
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.extend(self.inner.settings.read().overrides.keys().cloned());
        names.sort();
        names.dedup();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            out.push(self.status(&name).await);
        }
        out
    }

    /// Apply a peer's state change.
    pub fn handle_message(&self, payload: &str) {
        let event = match serde_json::from_str::<ResilienceEvent>(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "ignoring malformed resilience event");
                return;
            }
        };
        let now = self.inner.clock.now_ms();
        match event {
            ResilienceEvent::Breaker {
                dependency,
                snapshot,
                origin,
            } => {
                let state = self.dependency(&dependency);
                let mut slot = state.breaker.lock();
                let newer = slot
                    .as_ref()
                    .is_none_or(|c| snapshot.version > c.value.version);
                if newer {
                    debug!(
                        dependency = %dependency,
                        origin = %origin,
                        state = snapshot.state.as_str(),
                        "peer breaker update"
                    );
                    *slot = Some(Cached {
                        raw: serde_json::to_string(&snapshot).ok(),
                        value: snapshot,
                        fetched_at_ms: now,
                    });
                }
            }
            ResilienceEvent::Maintenance { enabled, origin } => {
                debug!(enabled, origin = %origin, "peer maintenance update");
                *self.inner.maintenance.lock() = Some(Cached {
                    value: enabled,
                    raw: Some(if enabled { "1" } else { "0" }.to_string()),
                    fetched_at_ms: now,
                });
            }
        }
    }

    /// Drop every local copy so the next call reads the store.
    pub fn forget_cached_state(&self) {
        for entry in &self.inner.dependencies {
            *entry.value().breaker.lock() = None;
        }
        *self.inner.maintenance.lock() = None;
    }

    async fn admit(
        &self,
        dependency: &str,
        state: &DependencyState,
        settings: &GuardSettings,
    ) -> Admission {
        let policy = settings.policy();
        let mut current = self.load_breaker(dependency, state, false).await;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.inner.clock.now_ms();
            let admission = current.value.admit(&policy, now);
            let Admission::Probe(next) = &admission else {
                return admission;
            };
            match self.persist(dependency, state, &current, next).await {
                Ok(true) => return admission,
                Ok(false) => current = self.load_breaker(dependency, state, true).await,
                Err(()) => return admission,
            }
        }
        Admission::Reject {
            retry_after_ms: policy.cooldown_ms,
        }
    }

    async fn record_success(&self, dependency: &str, state: &DependencyState, probe: bool) {
        self.update_breaker(dependency, state, |snap, _| snap.on_success(probe))
            .await;
    }

    async fn record_failure(
        &self,
        dependency: &str,
        state: &DependencyState,
        settings: &GuardSettings,
        probe: bool,
    ) {
        let policy = settings.policy();
        self.update_breaker(dependency, state, |snap, now| {
            snap.on_failure(&policy, now, probe)
        })
        .await;
    }

    /// Apply `transition` to the shared breaker, retrying on CAS conflicts
    /// against a fresh read.
    async fn update_breaker<F>(&self, dependency: &str, state: &DependencyState, transition: F)
    where
        F: Fn(&BreakerSnapshot, u64) -> Option<BreakerSnapshot>,
    {
        let mut current = self.load_breaker(dependency, state, false).await;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.inner.clock.now_ms();
            let Some(next) = transition(&current.value, now) else {
                return;
            };
            match self.persist(dependency, state, &current, &next).await {
                Ok(true) | Err(()) => return,
                Ok(false) => current = self.load_breaker(dependency, state, true).await,
            }
        }
        warn!(dependency = %dependency, "breaker update lost to concurrent writers");
    }

    /// Local copy of the breaker, refreshed from the store when stale or when
    /// `force` is set.
    async fn load_breaker(
        &self,
        dependency: &str,
        state: &DependencyState,
        force: bool,
    ) -> Cached<BreakerSnapshot> {
        let now = self.inner.clock.now_ms();
        let ttl = self.inner.settings.read().state_cache_ttl_ms;
        let cached = state.breaker.lock().clone();
        if !force
            && let Some(cached) = &cached
            && now.saturating_sub(cached.fetched_at_ms) < ttl
        {
            return cached.clone();
        }

        let key = self.inner.keys.breaker_key(dependency);
        let loaded = match bounded(self.store_timeout(), self.inner.store.get(&key)).await {
            Ok(raw) => {
                let value = match raw.as_deref().map(serde_json::from_str::<BreakerSnapshot>) {
                    Some(Ok(snapshot)) => snapshot,
                    Some(Err(e)) => {
                        warn!(dependency = %dependency, error = %e, "undecodable breaker state, treating as closed");
                        BreakerSnapshot::default()
                    }
                    None => BreakerSnapshot::default(),
                };
                Cached {
                    value,
                    raw,
                    fetched_at_ms: now,
                }
            }
            Err(e) => {
                warn!(dependency = %dependency, error = %e, "breaker state unreadable, using local copy");
                return cached.unwrap_or(Cached {
                    value: BreakerSnapshot::default(),
                    raw: None,
                    fetched_at_ms: now,
                });
            }
        };
        *state.breaker.lock() = Some(loaded.clone());
        loaded
    }

    /// CAS `next` over `current`. `Ok(false)` means another writer won;
    /// `Err(())` means the store failed and only the local copy was updated.
    async fn persist(
        &self,
        dependency: &str,
        state: &DependencyState,
        current: &Cached<BreakerSnapshot>,
        next: &BreakerSnapshot,
    ) -> Result<bool, ()> {
        let now = self.inner.clock.now_ms();
        let raw = match serde_json::to_string(next) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(dependency = %dependency, error = %e, "failed to encode breaker state");
                return Err(());
            }
        };
        let key = self.inner.keys.breaker_key(dependency);
        let outcome = bounded(
            self.store_timeout(),
            self.inner
                .store
                .compare_and_set(&key, current.raw.as_deref(), &raw),
        )
        .await;

        *state.breaker.lock() = match &outcome {
            Ok(false) => return Ok(false),
            _ => Some(Cached {
                value: next.clone(),
                raw: Some(raw),
                fetched_at_ms: now,
            }),
        };

        if next.state != current.value.state {
            self.inner
                .metrics
                .record_transition(dependency, next.state.as_str());
            warn!(
                dependency = %dependency,
                from = current.value.state.as_str(),
                to = next.state.as_str(),
                failures = next.failures,
                "circuit breaker transition"
            );
        }

        match outcome {
            Ok(_) => {
                self.publish(&ResilienceEvent::Breaker {
                    dependency: dependency.to_string(),
                    snapshot: next.clone(),
                    origin: self.inner.node_id.clone(),
                })
                .await;
                Ok(true)
            }
            Err(e) => {
                warn!(dependency = %dependency, error = %e, "breaker state not shared, store unavailable");
                Err(())
            }
        }
    }

    async fn publish(&self, event: &ResilienceEvent) {
        let channel = self.inner.keys.resilience_channel();
        let result = match serde_json::to_string(event) {
            Ok(payload) => {
                bounded(self.store_timeout(), self.inner.store.publish(&channel, &payload)).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to publish resilience event");
        }
    }
}

fn jittered(base_ms: u64) -> u64 {
    let half = base_ms / 2;
    half + rand::thread_rng().gen_range(0..=half.max(1))
}

impl std::fmt::Debug for ResilienceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceController")
            .field("node_id", &self.inner.node_id)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_defaults() {
        let mut settings = ResilienceSettings::default();
        settings.overrides.insert(
            "authority".into(),
            GuardSettings {
                max_concurrent: 4,
                ..GuardSettings::default()
            },
        );
        assert_eq!(settings.for_dependency("authority").max_concurrent, 4);
        assert_eq!(settings.for_dependency("l2").max_concurrent, 64);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let v = jittered(100);
            assert!((50..=100).contains(&v));
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(ResilienceEvent::Maintenance {
            enabled: true,
            origin: "n1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "maintenance");
    }
}
