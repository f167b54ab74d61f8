//! Prometheus metrics collection.
//!
//! Provides cache, guard and invalidation metrics in Prometheus format.

use prometheus_client::encoding::{EncodeLabelSet, text::encode};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

/// Cache lookup labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LookupLabels {
    pub tier: &'static str,
    pub outcome: &'static str,
}

/// Guarded dependency labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GuardLabels {
    pub dependency: String,
    pub kind: &'static str,
}

/// Breaker transition labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub dependency: String,
    pub to: &'static str,
}

/// Invalidation outcome labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct InvalidationLabels {
    pub outcome: &'static str,
}

/// Application metrics.
pub struct Metrics {
    registry: Registry,

    /// L1/L2 lookups by tier and outcome.
    pub cache_lookups: Family<LookupLabels, Counter>,

    /// Queries sent to the authoritative store.
    pub authority_queries: Counter,

    /// Authoritative store query duration.
    pub authority_duration_seconds: Histogram,

    /// Calls rejected or failed by the resilience layer.
    pub guard_rejections: Family<GuardLabels, Counter>,

    /// Circuit breaker state transitions.
    pub breaker_transitions: Family<TransitionLabels, Counter>,

    /// In-flight guarded calls (this node).
    pub in_flight: Family<GuardLabels, Gauge>,

    /// Invalidation tasks and events by outcome.
    pub invalidations: Family<InvalidationLabels, Counter>,

    /// Decisions answered from stale data.
    pub degraded_decisions: Counter,

    /// End-to-end permission check duration.
    pub check_duration_seconds: Histogram,
}

impl Metrics {
    /// Create a new metrics registry.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let cache_lookups = Family::<LookupLabels, Counter>::default();
        registry.register(
            "permgate_cache_lookups",
            "Permission cache lookups by tier and outcome",
            cache_lookups.clone(),
        );

        let authority_queries = Counter::default();
        registry.register(
            "permgate_authority_queries",
            "Queries sent to the authoritative store",
            authority_queries.clone(),
        );

        let authority_duration_seconds = Histogram::new(exponential_buckets(0.0005, 2.0, 14));
        registry.register(
            "permgate_authority_duration_seconds",
            "Authoritative store query duration in seconds",
            authority_duration_seconds.clone(),
        );

        let guard_rejections = Family::<GuardLabels, Counter>::default();
        registry.register(
            "permgate_guard_rejections",
            "Guarded calls rejected or failed, by dependency and kind",
            guard_rejections.clone(),
        );

        let breaker_transitions = Family::<TransitionLabels, Counter>::default();
        registry.register(
            "permgate_breaker_transitions",
            "Circuit breaker transitions by dependency and target state",
            breaker_transitions.clone(),
        );

        let in_flight = Family::<GuardLabels, Gauge>::default();
        registry.register(
            "permgate_in_flight",
            "Guarded calls currently in flight on this node",
            in_flight.clone(),
        );

        let invalidations = Family::<InvalidationLabels, Counter>::default();
        registry.register(
            "permgate_invalidations",
            "Invalidation tasks and events by outcome",
            invalidations.clone(),
        );

        let degraded_decisions = Counter::default();
        registry.register(
            "permgate_degraded_decisions",
            "Permission decisions answered from stale cached data",
            degraded_decisions.clone(),
        );

        let check_duration_seconds = Histogram::new(exponential_buckets(0.00005, 2.0, 16));
        registry.register(
            "permgate_check_duration_seconds",
            "Permission check duration in seconds",
            check_duration_seconds.clone(),
        );

        Self {
            registry,
            cache_lookups,
            authority_queries,
            authority_duration_seconds,
            guard_rejections,
            breaker_transitions,
            in_flight,
            invalidations,
            degraded_decisions,
            check_duration_seconds,
        }
    }

    pub fn record_lookup(&self, tier: &'static str, hit: bool) {
        self.cache_lookups
            .get_or_create(&LookupLabels {
                tier,
                outcome: if hit { "hit" } else { "miss" },
            })
            .inc();
    }

    pub fn record_rejection(&self, dependency: &str, kind: &'static str) {
        self.guard_rejections
            .get_or_create(&GuardLabels {
                dependency: dependency.to_string(),
                kind,
            })
            .inc();
    }

    pub fn record_transition(&self, dependency: &str, to: &'static str) {
        self.breaker_transitions
            .get_or_create(&TransitionLabels {
                dependency: dependency.to_string(),
                to,
            })
            .inc();
    }

    pub fn record_invalidation(&self, outcome: &'static str, count: u64) {
        self.invalidations
            .get_or_create(&InvalidationLabels { outcome })
            .inc_by(count);
    }

    /// Encode metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!(error = %e, "failed to encode metrics");
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_encode() {
        let metrics = Metrics::new();
        metrics.record_lookup("l1", true);
        metrics.record_rejection("authority", "circuit_open");
        metrics.degraded_decisions.inc();

        let output = metrics.encode();
        assert!(output.contains("permgate_cache_lookups_total"));
        assert!(output.contains("tier=\"l1\""));
        assert!(output.contains("permgate_guard_rejections_total"));
        assert!(output.contains("permgate_degraded_decisions_total 1"));
    }

    #[test]
    fn test_invalidation_counter_accumulates() {
        let metrics = Metrics::new();
        metrics.record_invalidation("done", 3);
        metrics.record_invalidation("done", 2);
        let value = metrics
            .invalidations
            .get_or_create(&InvalidationLabels { outcome: "done" })
            .get();
        assert_eq!(value, 5);
    }
}
