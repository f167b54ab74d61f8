//! Background workers.
//!
//! Every node runs the invalidation sweeper and L1 housekeeping. Sweeps from
//! different nodes may overlap; claiming a task is atomic, so each due task
//! is propagated by exactly one of them.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::invalidation::InvalidationCoordinator;

/// Sweep the delayed invalidation queue every `interval`.
pub fn spawn_sweeper(
    coordinator: InvalidationCoordinator,
    interval: Duration,
    max_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "invalidation sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match coordinator.sweep_expired(max_age).await {
                        Ok(report) if report.claimed > 0 => {
                            debug!(claimed = report.claimed, dead = report.dead, "sweep finished");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "invalidation sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("invalidation sweeper stopping");
                        break;
                    }
                }
            }
        }
    })
}

/// Run L1 housekeeping (expiry flush and adaptive sizing) every `interval`.
pub fn spawn_cache_maintenance(
    local: LocalCache,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let local = local.clone();
                    match tokio::task::spawn_blocking(move || local.maintain()).await {
                        Ok(Some(capacity)) => info!(capacity, "L1 capacity adjusted"),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "L1 maintenance task failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("L1 maintenance stopping");
                        break;
                    }
                }
            }
        }
    })
}
