//! Distributed fixed-window rate limiting.
//!
//! Counts calls per dependency in the shared store with an atomic
//! increment-and-expire, so every node draws from one budget.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::key::KeySpace;
use crate::store::{SharedStore, bounded};

/// Fixed-window limiter keyed by dependency and window index.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// Count one call against the current window.
    ///
    /// Returns `Err(retry_after_ms)` when the window's budget is spent. If
    /// the store cannot be reached within `timeout` the call is allowed
    /// (fail open).
    pub async fn check(
        &self,
        dependency: &str,
        limit: u64,
        window_ms: u64,
        now_ms: u64,
        timeout: Duration,
    ) -> Result<(), u64> {
        let window_ms = window_ms.max(1);
        let window_index = now_ms / window_ms;
        let key = self.keys.rate_key(dependency, window_index);

        let count = match bounded(timeout, self.store.incr_window(&key, window_ms)).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, dependency = %dependency, "rate limit check failed, allowing call");
                return Ok(());
            }
        };

        if count > limit {
            let window_end = (window_index + 1) * window_ms;
            debug!(
                dependency = %dependency,
                count,
                limit,
                "rate limit exceeded"
            );
            Err(window_end - now_ms)
        } else {
            Ok(())
        }
    }

    /// Calls counted in the current window.
    pub async fn current(
        &self,
        dependency: &str,
        window_ms: u64,
        now_ms: u64,
        timeout: Duration,
    ) -> Option<u64> {
        let key = self.keys.rate_key(dependency, now_ms / window_ms.max(1));
        match bounded(timeout, self.store.get(&key)).await {
            Ok(value) => Some(value.and_then(|v| v.parse().ok()).unwrap_or(0)),
            Err(_) => None,
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    const T: Duration = Duration::from_secs(1);

    fn limiter() -> RateLimiter {
        let store = MemoryStore::with_clock(Arc::new(ManualClock::new(0)));
        RateLimiter::new(Arc::new(store), KeySpace::new("t"))
    }

    #[tokio::test]
    async fn test_rejects_over_limit_then_rolls_over() {
        let limiter = limiter();
        for _ in 0..3 {
            assert!(limiter.check("authority", 3, 1_000, 100, T).await.is_ok());
        }
        assert_eq!(limiter.check("authority", 3, 1_000, 400, T).await, Err(600));
        assert!(limiter.check("authority", 3, 1_000, 1_000, T).await.is_ok());
    }

    #[tokio::test]
    async fn test_dependencies_are_independent() {
        let limiter = limiter();
        assert!(limiter.check("a", 1, 1_000, 0, T).await.is_ok());
        assert!(limiter.check("a", 1, 1_000, 0, T).await.is_err());
        assert!(limiter.check("b", 1, 1_000, 0, T).await.is_ok());
        assert_eq!(limiter.current("a", 1_000, 10, T).await, Some(2));
    }
}
