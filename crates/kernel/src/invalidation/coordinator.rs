//! Invalidation coordinator.
//!
//! Owns the delayed invalidation queue and its reverse indexes, applies
//! invalidations to both cache tiers, and exchanges batched events with peer
//! nodes. Every queue transition is one store operation, so a claimed task
//! has already left every reverse index by the time it is propagated.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{
    DeadLetterNotice, IndexDimension, InvalidationEvent, InvalidationTarget, InvalidationTask,
    Reason,
};
use crate::cache::{DistributedCache, LocalCache};
use crate::clock::Clock;
use crate::metrics::Metrics;
use crate::store::{
    ClaimedTask, QueueDepth, QueuedTask, SharedStore, StoreError, StoreResult, bounded,
};

/// Runtime-adjustable invalidation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationSettings {
    /// Attempts before a task is dead-lettered.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Tasks claimed per store round trip while sweeping.
    pub claim_batch: usize,
    /// How long a claimed task may stay in flight before a sweep reclaims it.
    pub lease_ms: u64,
    /// Bound on each store round trip.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

fn default_store_timeout_ms() -> u64 {
    1_000
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 60_000,
            claim_batch: 500,
            lease_ms: 30_000,
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

/// Outcome of one invalidation batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Tasks claimed from the queue.
    pub claimed: usize,
    /// Tasks returned from an expired lease.
    pub reclaimed: u64,
    /// L2 keys removed.
    pub keys_removed: u64,
    /// Tasks sent back to pending after a failed attempt.
    pub requeued: usize,
    /// Tasks moved to the dead-letter set.
    pub dead: usize,
    /// Targets queued for retry because immediate propagation failed.
    pub deferred: usize,
}

impl BatchReport {
    pub fn merge(&mut self, other: BatchReport) {
        self.claimed += other.claimed;
        self.reclaimed += other.reclaimed;
        self.keys_removed += other.keys_removed;
        self.requeued += other.requeued;
        self.dead += other.dead;
        self.deferred += other.deferred;
    }
}

/// Coordinator statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStats {
    pub queue: QueueDepth,
    pub epoch: u64,
    pub events_published: u64,
    pub events_applied: u64,
    pub tasks_completed: u64,
    pub tasks_requeued: u64,
    pub tasks_dead: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    applied: AtomicU64,
    completed: AtomicU64,
    requeued: AtomicU64,
    dead: AtomicU64,
}

/// Applies and distributes invalidations for one node.
#[derive(Clone)]
pub struct InvalidationCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    local: LocalCache,
    l2: DistributedCache,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    node_id: String,
    epoch: AtomicU64,
    settings: RwLock<InvalidationSettings>,
    counters: Counters,
}

impl InvalidationCoordinator {
    pub fn new(
        local: LocalCache,
        l2: DistributedCache,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        node_id: impl Into<String>,
        settings: InvalidationSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                local,
                l2,
                clock,
                metrics,
                node_id: node_id.into(),
                epoch: AtomicU64::new(0),
                settings: RwLock::new(settings),
                counters: Counters::default(),
            }),
        }
    }

    fn store(&self) -> &Arc<dyn SharedStore> {
        self.inner.l2.store()
    }

    /// Run one store call under the configured timeout.
    async fn bounded<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let limit = Duration::from_millis(self.inner.settings.read().store_timeout_ms.max(1));
        bounded(limit, call).await
    }

    pub fn local(&self) -> &LocalCache {
        &self.inner.local
    }

    pub fn distributed(&self) -> &DistributedCache {
        &self.inner.l2
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Counter bumped every time this node drops entries from its L1.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> InvalidationSettings {
        self.inner.settings.read().clone()
    }

    pub fn set_settings(&self, settings: InvalidationSettings) {
        *self.inner.settings.write() = settings;
    }

    /// Insert a task into the queue and every reverse index it belongs to.
    pub async fn enqueue(&self, task: &InvalidationTask) -> StoreResult<()> {
        let queued = self.queued(task)?;
        self.bounded(self.store().queue_push(&queued)).await?;
        debug!(
            task_id = %task.id,
            reason = %task.reason,
            due_at_ms = task.due_at_ms,
            "invalidation task enqueued"
        );
        Ok(())
    }

    /// Build and enqueue a task due after `delay`. Returns the task id.
    pub async fn schedule(
        &self,
        target: InvalidationTarget,
        reason: Reason,
        subject_id: Option<&str>,
        scope_id: Option<&str>,
        delay: Duration,
    ) -> StoreResult<String> {
        let now = self.inner.clock.now_ms();
        let due = now.saturating_add(duration_ms(delay));
        let mut task = InvalidationTask::new(target, reason, now, due);
        task.subject_id = subject_id.map(str::to_string);
        task.scope_id = scope_id.map(str::to_string);
        self.enqueue(&task).await?;
        Ok(task.id)
    }

    /// Invalidate targets right away on this node and in L2, then notify
    /// peers.
    ///
    /// The local L1 is always cleared first. If L2 or the publish fails, the
    /// targets are queued so the sweeper retries them.
    pub async fn invalidate_now(
        &self,
        targets: Vec<InvalidationTarget>,
        reason: Reason,
        subject_id: Option<&str>,
        scope_id: Option<&str>,
    ) -> StoreResult<BatchReport> {
        match self.propagate(&targets, reason).await {
            Ok(keys_removed) => Ok(BatchReport {
                keys_removed,
                ..BatchReport::default()
            }),
            Err(e) => {
                warn!(error = %e, reason = %reason, "immediate invalidation failed, deferring");
                let now = self.inner.clock.now_ms();
                for target in &targets {
                    let mut task = InvalidationTask::new(target.clone(), reason, now, now);
                    task.subject_id = subject_id.map(str::to_string);
                    task.scope_id = scope_id.map(str::to_string);
                    self.enqueue(&task).await?;
                }
                Ok(BatchReport {
                    deferred: targets.len(),
                    ..BatchReport::default()
                })
            }
        }
    }

    /// Return tasks stuck in flight to pending, then claim and propagate
    /// every task that is due.
    ///
    /// `max_age` bounds how long a task claimed here may stay in flight
    /// before another sweep reclaims it.
    pub async fn sweep_expired(&self, max_age: Duration) -> StoreResult<BatchReport> {
        let now = self.inner.clock.now_ms();
        let batch = self.inner.settings.read().claim_batch.max(1);
        let mut report = BatchReport {
            reclaimed: self.bounded(self.store().queue_reclaim(now)).await?,
            ..BatchReport::default()
        };

        let lease = now.saturating_add(duration_ms(max_age));
        loop {
            let claimed = self
                .bounded(self.store().queue_claim_due(now, lease, batch))
                .await?;
            let n = claimed.len();
            report.merge(self.run_claimed(claimed).await?);
            if n < batch {
                break;
            }
        }

        if report.claimed > 0 || report.reclaimed > 0 {
            info!(
                claimed = report.claimed,
                reclaimed = report.reclaimed,
                requeued = report.requeued,
                dead = report.dead,
                "invalidation sweep"
            );
        }
        Ok(report)
    }

    /// Claim and propagate every pending task regardless of due time.
    pub async fn process_now(&self) -> StoreResult<BatchReport> {
        let now = self.inner.clock.now_ms();
        let (batch, lease_ms) = {
            let settings = self.inner.settings.read();
            (settings.claim_batch.max(1), settings.lease_ms)
        };
        // Bounded by the depth at entry so requeued tasks wait for the next
        // sweep instead of burning their attempts here.
        let mut remaining = self.bounded(self.store().queue_depth()).await?.pending as usize;
        let mut report = BatchReport::default();
        while remaining > 0 {
            let claimed = self
                .bounded(self.store().queue_claim_due(
                    u64::MAX,
                    now.saturating_add(lease_ms),
                    batch.min(remaining),
                ))
                .await?;
            if claimed.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(claimed.len());
            report.merge(self.run_claimed(claimed).await?);
        }
        Ok(report)
    }

    pub async fn invalidate_by_reason(&self, reason: Reason) -> StoreResult<BatchReport> {
        self.invalidate_indexed(IndexDimension::Reason, reason.as_str())
            .await
    }

    pub async fn invalidate_by_subject(&self, subject_id: &str) -> StoreResult<BatchReport> {
        self.invalidate_indexed(IndexDimension::Subject, subject_id)
            .await
    }

    pub async fn invalidate_by_scope(&self, scope_id: &str) -> StoreResult<BatchReport> {
        self.invalidate_indexed(IndexDimension::Scope, scope_id)
            .await
    }

    /// Claim every pending task in one reverse index and propagate them as
    /// one batch.
    async fn invalidate_indexed(
        &self,
        dimension: IndexDimension,
        value: &str,
    ) -> StoreResult<BatchReport> {
        let index_key = self.inner.l2.keys().index_key(dimension.as_str(), value);
        let lease = self
            .inner
            .clock
            .now_ms()
            .saturating_add(self.inner.settings.read().lease_ms);
        let claimed = self
            .bounded(self.store().queue_claim_indexed(&index_key, lease))
            .await?;
        let report = self.run_claimed(claimed).await?;
        debug!(
            dimension = dimension.as_str(),
            value = %value,
            claimed = report.claimed,
            keys_removed = report.keys_removed,
            "indexed invalidation"
        );
        Ok(report)
    }

    /// Apply a peer's event to this node's L1. Returns whether anything was
    /// applied; events from this node were applied before publishing.
    pub fn apply_event(&self, event: &InvalidationEvent) -> bool {
        if event.origin == self.inner.node_id {
            return false;
        }
        self.apply_local(&event.targets);
        self.inner.counters.applied.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.record_invalidation("peer_applied", 1);
        debug!(
            event_id = %event.id,
            origin = %event.origin,
            targets = event.targets.len(),
            "applied peer invalidation"
        );
        true
    }

    /// Decode and apply a raw channel message.
    pub fn handle_message(&self, payload: &str) {
        match serde_json::from_str::<InvalidationEvent>(payload) {
            Ok(event) => {
                self.apply_event(&event);
            }
            Err(e) => warn!(error = %e, "ignoring malformed invalidation event"),
        }
    }

    /// Drop all of L1 after a gap in the event stream.
    pub fn resync(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.local.clear();
        info!("cleared L1 after invalidation channel resubscribe");
    }

    pub async fn stats(&self) -> StoreResult<CoordinatorStats> {
        let counters = &self.inner.counters;
        Ok(CoordinatorStats {
            queue: self.bounded(self.store().queue_depth()).await?,
            epoch: self.epoch(),
            events_published: counters.published.load(Ordering::Relaxed),
            events_applied: counters.applied.load(Ordering::Relaxed),
            tasks_completed: counters.completed.load(Ordering::Relaxed),
            tasks_requeued: counters.requeued.load(Ordering::Relaxed),
            tasks_dead: counters.dead.load(Ordering::Relaxed),
        })
    }

    /// Dead-lettered tasks, for manual inspection.
    pub async fn dead_letters(&self, limit: usize) -> StoreResult<Vec<InvalidationTask>> {
        let raw = self.bounded(self.store().dead_letters(limit)).await?;
        Ok(raw
            .iter()
            .filter_map(|payload| match serde_json::from_str(payload) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(error = %e, "undecodable dead letter");
                    None
                }
            })
            .collect())
    }

    /// Task ids registered in one reverse index.
    pub async fn index_members(
        &self,
        dimension: IndexDimension,
        value: &str,
    ) -> StoreResult<Vec<String>> {
        let index_key = self.inner.l2.keys().index_key(dimension.as_str(), value);
        self.bounded(self.store().index_members(&index_key)).await
    }

    /// Pending tasks registered in one reverse index.
    pub async fn indexed_tasks(
        &self,
        dimension: IndexDimension,
        value: &str,
    ) -> StoreResult<Vec<InvalidationTask>> {
        let ids = self.index_members(dimension, value).await?;
        let payloads = self.bounded(self.store().task_payloads(&ids)).await?;
        Ok(payloads
            .into_iter()
            .flatten()
            .filter_map(|payload| serde_json::from_str(&payload).ok())
            .collect())
    }

    fn queued(&self, task: &InvalidationTask) -> StoreResult<QueuedTask> {
        Ok(QueuedTask {
            id: task.id.clone(),
            due_at_ms: task.due_at_ms,
            payload: serde_json::to_string(task)?,
            index_keys: task.index_keys(self.inner.l2.keys()),
        })
    }

    /// Drop targets from this node's L1 and bump the epoch.
    fn apply_local(&self, targets: &[InvalidationTarget]) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let local = &self.inner.local;
        for target in targets {
            match target {
                InvalidationTarget::Key(key) => local.delete(key),
                InvalidationTarget::Prefix(prefix) => {
                    local.delete_prefix(prefix);
                }
                InvalidationTarget::Scope(scope_id) => {
                    local.delete_matching(|_, entry| {
                        entry.key.scope().scope_id.as_deref() == Some(scope_id.as_str())
                    });
                }
            }
        }
    }

    /// Remove targets from L2. Returns how many L2 keys were removed.
    async fn apply_shared(&self, targets: &[InvalidationTarget]) -> StoreResult<u64> {
        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        let mut removed = 0;
        for target in targets {
            match target {
                InvalidationTarget::Key(key) => {
                    if seen.insert(key.as_str()) {
                        keys.push(key.clone());
                    }
                }
                InvalidationTarget::Prefix(prefix) => {
                    removed += self.inner.l2.delete_pattern(&format!("{prefix}*")).await?;
                }
                InvalidationTarget::Scope(scope_id) => {
                    removed += self.inner.l2.invalidate_scope(scope_id).await?.len() as u64;
                }
            }
        }
        removed += self.inner.l2.delete_many(&keys).await?;
        Ok(removed)
    }

    /// Clear L1, clear L2, clear L1 again, then publish one event.
    ///
    /// The second local pass drops anything promoted from L2 while the L2
    /// delete was in flight.
    async fn propagate(&self, targets: &[InvalidationTarget], reason: Reason) -> StoreResult<u64> {
        if targets.is_empty() {
            return Ok(0);
        }
        self.apply_local(targets);
        let removed = self.bounded(self.apply_shared(targets)).await?;
        self.apply_local(targets);

        let event = InvalidationEvent {
            id: uuid::Uuid::now_v7().to_string(),
            origin: self.inner.node_id.clone(),
            reason,
            targets: targets.to_vec(),
            issued_at_ms: self.inner.clock.now_ms(),
        };
        let channel = self.inner.l2.keys().invalidation_channel();
        let payload = serde_json::to_string(&event)?;
        self.bounded(self.store().publish(&channel, &payload)).await?;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_id = %event.id,
            reason = %reason,
            targets = targets.len(),
            removed,
            "published invalidation"
        );
        Ok(removed)
    }

    /// Propagate claimed tasks as one batch per reason, then acknowledge
    /// them, or requeue or bury them on failure.
    async fn run_claimed(&self, claimed: Vec<ClaimedTask>) -> StoreResult<BatchReport> {
        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut tasks = Vec::with_capacity(claimed.len());
        for ClaimedTask { id, payload } in claimed {
            match serde_json::from_str::<InvalidationTask>(&payload) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    error!(task_id = %id, error = %e, "undecodable invalidation task, dead-lettering");
                    self.bounded(self.store().queue_bury(&id, &payload)).await?;
                    self.inner.counters.dead.fetch_add(1, Ordering::Relaxed);
                    report.dead += 1;
                }
            }
        }

        let mut by_reason: BTreeMap<&'static str, (Reason, Vec<InvalidationTarget>)> =
            BTreeMap::new();
        for task in &tasks {
            by_reason
                .entry(task.reason.as_str())
                .or_insert_with(|| (task.reason, Vec::new()))
                .1
                .push(task.target.clone());
        }

        let mut outcome: StoreResult<u64> = Ok(0);
        for (reason, targets) in by_reason.values() {
            match self.propagate(targets, *reason).await {
                Ok(removed) => {
                    if let Ok(total) = outcome.as_mut() {
                        *total += removed;
                    }
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        match outcome {
            Ok(removed) => {
                let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
                self.bounded(self.store().queue_ack(&ids)).await?;
                report.keys_removed = removed;
                self.inner
                    .counters
                    .completed
                    .fetch_add(ids.len() as u64, Ordering::Relaxed);
                self.inner
                    .metrics
                    .record_invalidation("completed", ids.len() as u64);
            }
            Err(e) => {
                warn!(error = %e, tasks = tasks.len(), "invalidation batch failed");
                for task in tasks {
                    if self.retry_or_bury(task, &e).await? {
                        report.requeued += 1;
                    } else {
                        report.dead += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Requeue a failed task with backoff, or bury it once it has used all
    /// its attempts. Returns whether it was requeued.
    async fn retry_or_bury(
        &self,
        mut task: InvalidationTask,
        cause: &StoreError,
    ) -> StoreResult<bool> {
        let settings = self.settings();
        task.attempts += 1;

        if task.attempts >= settings.max_attempts {
            let payload = serde_json::to_string(&task)?;
            self.bounded(self.store().queue_bury(&task.id, &payload))
                .await?;
            self.inner.counters.dead.fetch_add(1, Ordering::Relaxed);
            self.inner.metrics.record_invalidation("dead", 1);
            error!(
                task_id = %task.id,
                reason = %task.reason,
                attempts = task.attempts,
                error = %cause,
                "invalidation task dead-lettered"
            );
            self.notify_dead(task, cause).await;
            return Ok(false);
        }

        let now = self.inner.clock.now_ms();
        task.due_at_ms = now.saturating_add(backoff_ms(&settings, task.attempts));
        let queued = self.queued(&task)?;
        self.bounded(self.store().queue_requeue(&queued)).await?;
        self.inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.record_invalidation("requeued", 1);
        debug!(
            task_id = %task.id,
            attempts = task.attempts,
            due_at_ms = task.due_at_ms,
            "invalidation task requeued"
        );
        Ok(true)
    }

    async fn notify_dead(&self, task: InvalidationTask, cause: &StoreError) {
        let notice = DeadLetterNotice {
            task,
            node: self.inner.node_id.clone(),
            error: cause.to_string(),
        };
        let channel = self.inner.l2.keys().diagnostics_channel();
        let result = match serde_json::to_string(&notice) {
            Ok(payload) => self.bounded(self.store().publish(&channel, &payload)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to publish dead-letter notice");
        }
    }
}

/// Delay before retry number `attempts` (1-based).
fn backoff_ms(settings: &InvalidationSettings, attempts: u32) -> u64 {
    let exp = attempts.saturating_sub(1).min(20);
    settings
        .base_backoff_ms
        .saturating_mul(1 << exp)
        .min(settings.max_backoff_ms)
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

impl std::fmt::Debug for InvalidationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationCoordinator")
            .field("node_id", &self.inner.node_id)
            .field("epoch", &self.epoch())
            .finish()
    }
}
