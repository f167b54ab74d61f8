//! Shared L2 cache over a [`SharedStore`].

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheEntry;
use crate::key::{KeySpace, PermissionKey};
use crate::store::{MessageStream, SharedStore, StoreResult};

/// Batches larger than this are deleted through a server-side script.
const BATCH_SCRIPT_THRESHOLD: usize = 100;

/// How long L2 keeps an entry past its TTL for degraded answers.
const L2_STALE_GRACE_SECS: u64 = 600;

/// Runtime-adjustable L2 settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSettings {
    pub batch_script_threshold: usize,
    pub stale_grace_secs: u64,
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self {
            batch_script_threshold: BATCH_SCRIPT_THRESHOLD,
            stale_grace_secs: L2_STALE_GRACE_SECS,
        }
    }
}

/// Typed cache client over the shared store.
///
/// Returns raw [`StoreResult`]s; callers decide how store failures are
/// guarded and reported.
#[derive(Clone)]
pub struct DistributedCache {
    inner: Arc<DistributedCacheInner>,
}

struct DistributedCacheInner {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    settings: RwLock<DistributedSettings>,
}

impl DistributedCache {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, settings: DistributedSettings) -> Self {
        Self {
            inner: Arc::new(DistributedCacheInner {
                store,
                keys,
                settings: RwLock::new(settings),
            }),
        }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.inner.keys
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.inner.store
    }

    pub fn settings(&self) -> DistributedSettings {
        self.inner.settings.read().clone()
    }

    pub fn set_settings(&self, settings: DistributedSettings) {
        *self.inner.settings.write() = settings;
    }

    /// Cached entry for `key`, fresh or within the stale grace period.
    pub async fn get(&self, key: &PermissionKey) -> StoreResult<Option<CacheEntry>> {
        let cache_key = self.inner.keys.cache_key(key);
        let raw = self.inner.store.get(&cache_key).await?;
        Ok(raw.and_then(|raw| decode(&cache_key, &raw)))
    }

    /// Fetch several entries in one round trip, aligned with `keys`.
    pub async fn get_many(&self, keys: &[PermissionKey]) -> StoreResult<Vec<Option<CacheEntry>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let cache_keys: Vec<String> = keys.iter().map(|k| self.inner.keys.cache_key(k)).collect();
        let raw = self.inner.store.get_many(&cache_keys).await?;
        Ok(cache_keys
            .iter()
            .zip(raw)
            .map(|(cache_key, raw)| raw.and_then(|raw| decode(cache_key, &raw)))
            .collect())
    }

    pub async fn set(&self, entry: &CacheEntry) -> StoreResult<()> {
        self.set_many(std::slice::from_ref(entry)).await
    }

    /// Write entries in one pipeline and register each under its scope tag.
    ///
    /// Each entry is kept for its TTL plus the stale grace period.
    pub async fn set_many(&self, entries: &[CacheEntry]) -> StoreResult<()> {
        let Some(max_ttl) = entries.iter().map(|e| e.ttl_secs).max() else {
            return Ok(());
        };
        let grace = self.inner.settings.read().stale_grace_secs;

        let mut pairs = Vec::with_capacity(entries.len());
        let mut tags = Vec::new();
        for entry in entries {
            let cache_key = self.inner.keys.cache_key(&entry.key);
            if let Some(scope_id) = entry.key.scope().scope_id.as_deref() {
                tags.push((self.inner.keys.scope_tag(scope_id), cache_key.clone()));
            }
            pairs.push((cache_key, serde_json::to_string(entry)?));
        }

        let ttl_ms = (max_ttl + grace).saturating_mul(1_000);
        self.inner.store.set_many(&pairs, &tags, ttl_ms).await?;
        debug!(entries = entries.len(), ttl_ms, "L2 backfill");
        Ok(())
    }

    pub async fn delete(&self, cache_key: &str) -> StoreResult<u64> {
        self.inner.store.delete_keys(&[cache_key.to_string()]).await
    }

    /// Delete a batch of keys, through a server-side script when the batch
    /// is larger than the configured threshold.
    pub async fn delete_many(&self, cache_keys: &[String]) -> StoreResult<u64> {
        if cache_keys.is_empty() {
            return Ok(0);
        }
        let threshold = self.inner.settings.read().batch_script_threshold;
        if cache_keys.len() > threshold {
            debug!(keys = cache_keys.len(), "scripted L2 batch delete");
            self.inner.store.delete_keys_scripted(cache_keys).await
        } else {
            self.inner.store.delete_keys(cache_keys).await
        }
    }

    /// Delete every key matching a glob pattern in one server-side script.
    ///
    /// The pattern must embed the hash tag of the keys it targets, such as
    /// a subject prefix followed by `*`.
    pub async fn delete_pattern(&self, pattern: &str) -> StoreResult<u64> {
        self.inner.store.delete_pattern(pattern, pattern).await
    }

    /// Delete every cached result of one subject.
    pub async fn delete_subject(&self, subject_id: &str) -> StoreResult<u64> {
        let pattern = format!("{}*", self.inner.keys.subject_prefix(subject_id));
        self.delete_pattern(&pattern).await
    }

    /// Delete every key registered under a scope's tag set. Returns the keys
    /// that were registered.
    ///
    /// Members leave the tag set only after their keys are deleted, so a
    /// failed delete can be retried against the same membership.
    pub async fn invalidate_scope(&self, scope_id: &str) -> StoreResult<Vec<String>> {
        let tag = self.inner.keys.scope_tag(scope_id);
        let members = self.inner.store.set_members(&tag).await?;
        if members.is_empty() {
            return Ok(members);
        }
        let removed = self.delete_many(&members).await?;
        self.inner.store.remove_set_members(&tag, &members).await?;
        debug!(scope_id = %scope_id, members = members.len(), removed, "scope invalidated");
        Ok(members)
    }

    pub async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.inner.store.publish(channel, message).await
    }

    pub async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        self.inner.store.subscribe(channel).await
    }
}

/// Decode a stored entry; corrupt values read as a miss.
fn decode(cache_key: &str, raw: &str) -> Option<CacheEntry> {
    match serde_json::from_str(raw) {
        Ok(entry) => Some(entry),
        Err(e) => {
            warn!(key = %cache_key, error = %e, "discarding undecodable L2 entry");
            None
        }
    }
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache")
            .field("namespace", &self.inner.keys.namespace())
            .finish()
    }
}
