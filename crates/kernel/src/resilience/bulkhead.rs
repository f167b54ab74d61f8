//! Per-node concurrency cap.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use prometheus_client::metrics::gauge::Gauge;

/// Fail-fast concurrency limiter; never queues.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    in_flight: Arc<AtomicUsize>,
    gauge: Gauge,
}

/// Slot held for the duration of one call.
#[derive(Debug)]
pub struct BulkheadPermit {
    in_flight: Arc<AtomicUsize>,
    gauge: Gauge,
}

impl Bulkhead {
    pub fn new(gauge: Gauge) -> Self {
        Self {
            in_flight: Arc::new(AtomicUsize::new(0)),
            gauge,
        }
    }

    /// Take a slot if fewer than `max_concurrent` calls are in flight.
    pub fn try_acquire(&self, max_concurrent: usize) -> Option<BulkheadPermit> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max_concurrent).then_some(current + 1)
            })
            .ok()?;
        self.gauge.inc();
        Some(BulkheadPermit {
            in_flight: Arc::clone(&self.in_flight),
            gauge: self.gauge.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for BulkheadPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.gauge.dec();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_and_release() {
        let bulkhead = Bulkhead::new(Gauge::default());
        let a = bulkhead.try_acquire(2).unwrap();
        let _b = bulkhead.try_acquire(2).unwrap();
        assert!(bulkhead.try_acquire(2).is_none());
        drop(a);
        assert_eq!(bulkhead.in_flight(), 1);
        assert!(bulkhead.try_acquire(2).is_some());
    }

    #[test]
    fn test_lowered_cap_applies_to_new_calls() {
        let bulkhead = Bulkhead::new(Gauge::default());
        let _a = bulkhead.try_acquire(5).unwrap();
        let _b = bulkhead.try_acquire(5).unwrap();
        assert!(bulkhead.try_acquire(1).is_none());
    }
}
