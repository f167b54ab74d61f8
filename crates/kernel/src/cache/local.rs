//! Process-local L1 cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::CacheEntry;
use crate::clock::Clock;

/// Default L1 capacity.
const L1_CAPACITY: u64 = 10_000;

/// Hard ceiling for adaptive growth.
const L1_MAX_CAPACITY: u64 = 100_000;

/// How long expired entries are retained to back degraded answers.
const L1_STALE_GRACE_SECS: u64 = 300;

/// Runtime-adjustable L1 settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub capacity: u64,
    pub max_capacity: u64,
    pub stale_grace_secs: u64,
    /// Grow capacity when the window hit rate falls below this.
    pub adaptive_hit_rate_floor: f64,
    /// Lookups needed in a window before the hit rate is trusted.
    pub adaptive_min_samples: u64,
    pub adaptive_growth_factor: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: L1_CAPACITY,
            max_capacity: L1_MAX_CAPACITY,
            stale_grace_secs: L1_STALE_GRACE_SECS,
            adaptive_hit_rate_floor: 0.5,
            adaptive_min_samples: 1_000,
            adaptive_growth_factor: 1.5,
        }
    }
}

/// L1 statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: u64,
    pub capacity: u64,
    pub hit_rate: f64,
}

/// Keeps an entry for its TTL plus the stale grace period.
struct RetentionExpiry {
    grace: Duration,
}

impl RetentionExpiry {
    fn retention(&self, entry: &CacheEntry) -> Duration {
        Duration::from_secs(entry.ttl_secs) + self.grace
    }
}

impl Expiry<String, CacheEntry> for RetentionExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.retention(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.retention(value))
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
    window_hits: AtomicU64,
    window_misses: AtomicU64,
}

/// Bounded TTL + LRU cache of permission check results.
///
/// TTL is checked lazily against the injected clock on every lookup; entries
/// past their TTL stay readable through [`get_stale`](Self::get_stale) until
/// the retention horizon, after which Moka drops them.
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<LocalCacheInner>,
}

struct LocalCacheInner {
    cache: RwLock<Cache<String, CacheEntry>>,
    settings: RwLock<CacheSettings>,
    counters: Counters,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    pub fn new(settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        let counters = Counters::default();
        let cache = build_cache(&settings, settings.capacity, &counters.evictions);
        Self {
            inner: Arc::new(LocalCacheInner {
                cache: RwLock::new(cache),
                settings: RwLock::new(settings),
                counters,
                clock,
            }),
        }
    }

    fn cache(&self) -> Cache<String, CacheEntry> {
        self.inner.cache.read().clone()
    }

    /// Run a write against the current cache while holding its read guard,
    /// so a concurrent rebuild either migrates the result or runs after it.
    fn write<R>(&self, f: impl FnOnce(&Cache<String, CacheEntry>) -> R) -> R {
        let cache = self.inner.cache.read();
        f(&cache)
    }

    /// Fresh entry for `key`, counting a hit or a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = self.inner.clock.now_ms();
        let found = self.cache().get(key).filter(|e| e.is_fresh(now));
        let counters = &self.inner.counters;
        if found.is_some() {
            counters.hits.fetch_add(1, Ordering::Relaxed);
            counters.window_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
            counters.window_misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Entry for `key` even if its TTL has passed. Does not touch counters.
    pub fn get_stale(&self, key: &str) -> Option<CacheEntry> {
        self.cache().get(key)
    }

    pub fn insert(&self, key: String, entry: CacheEntry) {
        self.write(|cache| cache.insert(key, entry));
    }

    /// Remove one key. Removing an absent key succeeds.
    pub fn delete(&self, key: &str) {
        self.write(|cache| cache.invalidate(key));
    }

    /// Remove several keys.
    pub fn delete_many(&self, keys: &[String]) {
        self.write(|cache| {
            for key in keys {
                cache.invalidate(key);
            }
        });
    }

    /// Remove every entry matching `predicate`; returns how many were removed.
    pub fn delete_matching<F>(&self, predicate: F) -> u64
    where
        F: Fn(&str, &CacheEntry) -> bool,
    {
        self.write(|cache| {
            let matched: Vec<Arc<String>> = cache
                .iter()
                .filter(|(k, v)| predicate(k.as_str(), v))
                .map(|(k, _)| k)
                .collect();
            for key in &matched {
                cache.invalidate(key.as_str());
            }
            matched.len() as u64
        })
    }

    /// Remove every key starting with `prefix`.
    pub fn delete_prefix(&self, prefix: &str) -> u64 {
        self.delete_matching(|k, _| k.starts_with(prefix))
    }

    pub fn clear(&self) {
        self.write(|cache| cache.invalidate_all());
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> LocalCacheStats {
        let cache = self.cache();
        cache.run_pending_tasks();
        let counters = &self.inner.counters;
        let hits = counters.hits.load(Ordering::Relaxed);
        let misses = counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        LocalCacheStats {
            hits,
            misses,
            evictions: counters.evictions.load(Ordering::Relaxed),
            size: cache.entry_count(),
            capacity: cache.policy().max_capacity().unwrap_or(0),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    pub fn settings(&self) -> CacheSettings {
        self.inner.settings.read().clone()
    }

    /// Replace settings, rebuilding the cache when capacity or retention
    /// changed. Live entries are migrated.
    pub fn set_settings(&self, settings: CacheSettings) {
        let rebuild = {
            let current = self.inner.settings.read();
            current.capacity != settings.capacity
                || current.stale_grace_secs != settings.stale_grace_secs
        };
        let capacity = settings.capacity;
        *self.inner.settings.write() = settings;
        if rebuild {
            self.rebuild(capacity);
        }
    }

    /// Periodic housekeeping: flush Moka's pending expirations and apply the
    /// adaptive sizing policy. Returns the new capacity if it grew.
    pub fn maintain(&self) -> Option<u64> {
        self.cache().run_pending_tasks();

        let counters = &self.inner.counters;
        let hits = counters.window_hits.swap(0, Ordering::Relaxed);
        let misses = counters.window_misses.swap(0, Ordering::Relaxed);

        let next = {
            let settings = self.inner.settings.read();
            next_capacity(&settings, hits, misses)
        }?;

        self.inner.settings.write().capacity = next;
        self.rebuild(next);
        info!(capacity = next, hits, misses, "grew L1 capacity");
        Some(next)
    }

    fn rebuild(&self, capacity: u64) {
        let settings = self.settings();
        let fresh = build_cache(&settings, capacity, &self.inner.counters.evictions);
        let mut guard = self.inner.cache.write();
        for (key, entry) in guard.iter() {
            fresh.insert(key.as_str().to_string(), entry);
        }
        *guard = fresh;
        debug!(capacity, "rebuilt L1 cache");
    }
}

/// Capacity the adaptive policy wants after a window, if it should grow.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn next_capacity(settings: &CacheSettings, hits: u64, misses: u64) -> Option<u64> {
    let samples = hits + misses;
    if samples == 0 || samples < settings.adaptive_min_samples {
        return None;
    }
    let hit_rate = hits as f64 / samples as f64;
    if hit_rate >= settings.adaptive_hit_rate_floor || settings.capacity >= settings.max_capacity
    {
        return None;
    }
    let grown = (settings.capacity as f64 * settings.adaptive_growth_factor).ceil() as u64;
    Some(grown.clamp(settings.capacity + 1, settings.max_capacity))
}

fn build_cache(
    settings: &CacheSettings,
    capacity: u64,
    evictions: &Arc<AtomicU64>,
) -> Cache<String, CacheEntry> {
    let evictions = Arc::clone(evictions);
    Cache::builder()
        .max_capacity(capacity)
        .eviction_policy(EvictionPolicy::lru())
        .expire_after(RetentionExpiry {
            grace: Duration::from_secs(settings.stale_grace_secs),
        })
        .eviction_listener(move |_key, _value, cause: RemovalCause| {
            if cause.was_evicted() {
                evictions.fetch_add(1, Ordering::Relaxed);
            }
        })
        .build()
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("settings", &*self.inner.settings.read())
            .finish()
    }
}

#[cfg(test)]
// Tests are allowed to use unwrap/expect freely.
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::key::{PermissionKey, ScopeType};

    fn entry(subject: &str, computed_at_ms: u64, ttl_secs: u64) -> CacheEntry {
        let key = PermissionKey::new(subject, ScopeType::Global, None, "read").unwrap();
        CacheEntry::new(key, true, computed_at_ms, ttl_secs, 0)
    }

    fn cache_at(start_ms: u64) -> (LocalCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        (LocalCache::new(CacheSettings::default(), clock.clone()), clock)
    }

    #[test]
    fn test_get_after_insert_and_delete() {
        let (cache, _) = cache_at(0);
        cache.insert("k".into(), entry("1", 0, 30));
        assert!(cache.get("k").is_some());
        cache.delete("k");
        assert!(cache.get("k").is_none());
        // Deleting again is fine.
        cache.delete("k");
    }

    #[test]
    fn test_expired_entry_is_stale_only() {
        let (cache, clock) = cache_at(0);
        cache.insert("k".into(), entry("1", 0, 30));
        clock.advance_ms(30_000);
        assert!(cache.get("k").is_none());
        assert!(cache.get_stale("k").is_some());
    }

    #[test]
    fn test_counters_and_hit_rate() {
        let (cache, _) = cache_at(0);
        cache.insert("k".into(), entry("1", 0, 30));
        cache.get("k");
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_delete_prefix_only_touches_matches() {
        let (cache, _) = cache_at(0);
        cache.insert("a:1".into(), entry("1", 0, 30));
        cache.insert("a:2".into(), entry("1", 0, 30));
        cache.insert("b:1".into(), entry("2", 0, 30));
        assert_eq!(cache.delete_prefix("a:"), 2);
        assert!(cache.get("b:1").is_some());
        assert!(cache.get("a:1").is_none());
    }

    #[test]
    fn test_lru_bound_is_enforced() {
        let clock = Arc::new(ManualClock::new(0));
        let settings = CacheSettings {
            capacity: 10,
            ..CacheSettings::default()
        };
        let cache = LocalCache::new(settings, clock);
        for i in 0..100 {
            cache.insert(format!("k{i}"), entry("1", 0, 30));
        }
        assert!(cache.stats().size <= 10);
    }

    #[test]
    fn test_adaptive_growth_policy() {
        let settings = CacheSettings {
            capacity: 100,
            max_capacity: 120,
            adaptive_min_samples: 10,
            ..CacheSettings::default()
        };
        assert_eq!(next_capacity(&settings, 1, 19), Some(120));
        assert_eq!(next_capacity(&settings, 19, 1), None);
        assert_eq!(next_capacity(&settings, 1, 2), None);

        let at_ceiling = CacheSettings {
            capacity: 120,
            ..settings
        };
        assert_eq!(next_capacity(&at_ceiling, 0, 50), None);
    }

    #[test]
    fn test_deletes_survive_concurrent_rebuilds() {
        let (cache, _) = cache_at(0);
        for i in 0..200 {
            cache.insert(format!("seed{i}"), entry("1", 0, 30));
        }
        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..50u64 {
                    cache.set_settings(CacheSettings {
                        capacity: 1_000 + i,
                        ..CacheSettings::default()
                    });
                }
            });
            s.spawn(|| {
                for i in 0..2_000 {
                    let key = format!("k{i}");
                    cache.insert(key.clone(), entry("1", 0, 30));
                    cache.delete(&key);
                }
                for i in 0..200 {
                    cache.delete(&format!("seed{i}"));
                }
            });
        });
        for i in 0..2_000 {
            assert!(cache.get_stale(&format!("k{i}")).is_none(), "k{i} came back");
        }
        for i in 0..200 {
            assert!(cache.get_stale(&format!("seed{i}")).is_none());
        }
    }

    #[test]
    fn test_maintain_grows_and_keeps_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let settings = CacheSettings {
            capacity: 50,
            max_capacity: 200,
            adaptive_min_samples: 10,
            ..CacheSettings::default()
        };
        let cache = LocalCache::new(settings, clock);
        cache.insert("kept".into(), entry("1", 0, 30));
        for i in 0..20 {
            cache.get(&format!("miss{i}"));
        }
        assert_eq!(cache.maintain(), Some(75));
        assert_eq!(cache.settings().capacity, 75);
        assert!(cache.get("kept").is_some());
        // Window was reset.
        assert_eq!(cache.maintain(), None);
    }
}
