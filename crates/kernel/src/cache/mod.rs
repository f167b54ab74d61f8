//! Two-tier permission cache: Moka in-process (L1) and the shared store (L2).
//!
//! Both tiers hold [`CacheEntry`] values under the string key produced by
//! [`KeySpace::cache_key`](crate::key::KeySpace::cache_key). Entries are never
//! mutated in place; invalidation always removes whole entries.

mod distributed;
mod local;

pub use self::distributed::{DistributedCache, DistributedSettings};
pub use self::local::{CacheSettings, LocalCache, LocalCacheStats};

use serde::{Deserialize, Serialize};

use crate::key::PermissionKey;

/// A cached permission check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: PermissionKey,
    pub allowed: bool,
    pub computed_at_ms: u64,
    pub ttl_secs: u64,
    /// Invalidation epoch of the node that computed the entry.
    pub version: u64,
}

impl CacheEntry {
    pub fn new(
        key: PermissionKey,
        allowed: bool,
        computed_at_ms: u64,
        ttl_secs: u64,
        version: u64,
    ) -> Self {
        Self {
            key,
            allowed,
            computed_at_ms,
            ttl_secs,
            version,
        }
    }

    pub fn expires_at_ms(&self) -> u64 {
        self.computed_at_ms
            .saturating_add(self.ttl_secs.saturating_mul(1_000))
    }

    /// Whether the entry is still within its TTL at `now_ms`.
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms()
    }

    /// Copy with the TTL capped at `ttl_secs`, keeping the original compute
    /// time so the copy never outlives the source.
    pub fn capped(&self, ttl_secs: u64) -> Self {
        Self {
            ttl_secs: self.ttl_secs.min(ttl_secs),
            ..self.clone()
        }
    }
}
