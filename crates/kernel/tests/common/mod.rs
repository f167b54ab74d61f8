#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Every node built here runs the real kernel components over one shared
//! [`MemoryStore`] and one [`ManualClock`], so tests need neither Redis nor
//! PostgreSQL. The authoritative store is a [`StubAuthority`] backed by a
//! [`GrantTable`].

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_stream::StreamExt;

use permgate_kernel::clock::ManualClock;
use permgate_kernel::config::RuntimeSettings;
use permgate_kernel::error::PermissionError;
use permgate_kernel::key::{KeySpace, Scope};
use permgate_kernel::metrics::Metrics;
use permgate_kernel::resolver::{AUTHORITY, PermissionAuthority, PermissionResolver};
use permgate_kernel::store::{
    ClaimedTask, MemoryStore, MessageStream, QueueDepth, QueuedTask, SharedStore, StoreError,
    StoreResult,
};
use permgate_test_utils::{CallCounter, FailureSwitch, Gate, GrantTable};

/// Start of every test clock; a multiple of every rate window used.
pub const T0: u64 = 1_700_000_000_000;

pub const NAMESPACE: &str = "test";

/// Authority over a [`GrantTable`] that counts calls, fails on demand and
/// can hold calls in flight.
#[derive(Default)]
pub struct StubAuthority {
    pub grants: GrantTable,
    pub calls: CallCounter,
    pub failures: FailureSwitch,
    hold: Mutex<Option<Gate>>,
}

impl StubAuthority {
    /// Hold every following call until the returned gate opens.
    pub fn hold(&self) -> Gate {
        let gate = Gate::closed();
        *self.hold.lock() = Some(gate.clone());
        gate
    }

    pub fn release(&self) {
        if let Some(gate) = self.hold.lock().take() {
            gate.open();
        }
    }

    async fn enter(&self) -> Result<(), PermissionError> {
        self.calls.hit();
        let gate = self.hold.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        if self.failures.should_fail() {
            return Err(PermissionError::unavailable(AUTHORITY, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PermissionAuthority for StubAuthority {
    async fn fetch_permissions_for_subject(
        &self,
        subject_id: &str,
        scope: &Scope,
    ) -> Result<HashSet<String>, PermissionError> {
        self.enter().await?;
        Ok(self.grants.permissions(
            subject_id,
            scope.scope_type.as_str(),
            scope.scope_id.as_deref(),
        ))
    }

    async fn fetch_permissions_bulk(
        &self,
        subject_id: &str,
        scopes: &[Scope],
    ) -> Result<HashMap<Scope, HashSet<String>>, PermissionError> {
        self.enter().await?;
        Ok(scopes
            .iter()
            .map(|scope| {
                let granted = self.grants.permissions(
                    subject_id,
                    scope.scope_type.as_str(),
                    scope.scope_id.as_deref(),
                );
                (scope.clone(), granted)
            })
            .collect())
    }

    async fn subjects_with_role(&self, role_id: &str) -> Result<Vec<String>, PermissionError> {
        self.enter().await?;
        Ok(self.grants.subjects_with_role(role_id))
    }
}

/// Shared store wrapper that fails selected operations on demand.
#[derive(Clone)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    /// Fails reads (`get`, `get_many`).
    pub reads: FailureSwitch,
    /// Fails every kind of delete.
    pub deletes: FailureSwitch,
    /// Makes every call hang without answering.
    pub stalls: FailureSwitch,
}

impl FlakyStore {
    fn check(switch: &FailureSwitch) -> StoreResult<()> {
        if switch.should_fail() {
            return Err(StoreError::Protocol("injected failure".into()));
        }
        Ok(())
    }

    async fn stall(&self) {
        if self.stalls.should_fail() {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn ping(&self) -> StoreResult<()> {
        self.stall().await;
        self.inner.ping().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.stall().await;
        Self::check(&self.reads)?;
        self.inner.get(key).await
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.stall().await;
        Self::check(&self.reads)?;
        self.inner.get_many(keys).await
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<()> {
        self.stall().await;
        self.inner.set(key, value, ttl_ms).await
    }

    async fn set_many(
        &self,
        entries: &[(String, String)],
        tags: &[(String, String)],
        ttl_ms: u64,
    ) -> StoreResult<()> {
        self.stall().await;
        self.inner.set_many(entries, tags, ttl_ms).await
    }

    async fn delete_keys(&self, keys: &[String]) -> StoreResult<u64> {
        self.stall().await;
        Self::check(&self.deletes)?;
        self.inner.delete_keys(keys).await
    }

    async fn delete_keys_scripted(&self, keys: &[String]) -> StoreResult<u64> {
        self.stall().await;
        Self::check(&self.deletes)?;
        self.inner.delete_keys_scripted(keys).await
    }

    async fn delete_pattern(&self, routing_key: &str, pattern: &str) -> StoreResult<u64> {
        self.stall().await;
        Self::check(&self.deletes)?;
        self.inner.delete_pattern(routing_key, pattern).await
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.stall().await;
        self.inner.set_members(key).await
    }

    async fn remove_set_members(&self, key: &str, members: &[String]) -> StoreResult<()> {
        self.stall().await;
        Self::check(&self.deletes)?;
        self.inner.remove_set_members(key, members).await
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.stall().await;
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        self.stall().await;
        self.inner.subscribe(channel).await
    }

    async fn incr_window(&self, key: &str, ttl_ms: u64) -> StoreResult<u64> {
        self.stall().await;
        self.inner.incr_window(key, ttl_ms).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<bool> {
        self.stall().await;
        self.inner.compare_and_set(key, expected, value).await
    }

    async fn queue_push(&self, task: &QueuedTask) -> StoreResult<()> {
        self.stall().await;
        self.inner.queue_push(task).await
    }

    async fn queue_claim_due(
        &self,
        cutoff_ms: u64,
        lease_until_ms: u64,
        limit: usize,
    ) -> StoreResult<Vec<ClaimedTask>> {
        self.stall().await;
        self.inner
            .queue_claim_due(cutoff_ms, lease_until_ms, limit)
            .await
    }

    async fn queue_claim_indexed(
        &self,
        index_key: &str,
        lease_until_ms: u64,
    ) -> StoreResult<Vec<ClaimedTask>> {
        self.stall().await;
        self.inner
            .queue_claim_indexed(index_key, lease_until_ms)
            .await
    }

    async fn queue_ack(&self, ids: &[String]) -> StoreResult<()> {
        self.stall().await;
        self.inner.queue_ack(ids).await
    }

    async fn queue_requeue(&self, task: &QueuedTask) -> StoreResult<()> {
        self.stall().await;
        self.inner.queue_requeue(task).await
    }

    async fn queue_bury(&self, id: &str, payload: &str) -> StoreResult<()> {
        self.stall().await;
        self.inner.queue_bury(id, payload).await
    }

    async fn queue_reclaim(&self, now_ms: u64) -> StoreResult<u64> {
        self.stall().await;
        self.inner.queue_reclaim(now_ms).await
    }

    async fn queue_depth(&self) -> StoreResult<QueueDepth> {
        self.stall().await;
        self.inner.queue_depth().await
    }

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>> {
        self.stall().await;
        self.inner.index_members(index_key).await
    }

    async fn task_payloads(&self, ids: &[String]) -> StoreResult<Vec<Option<String>>> {
        self.stall().await;
        self.inner.task_payloads(ids).await
    }

    async fn dead_letters(&self, limit: usize) -> StoreResult<Vec<String>> {
        self.stall().await;
        self.inner.dead_letters(limit).await
    }
}

/// Several nodes over one store, one clock and one authority.
pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    pub store: Arc<FlakyStore>,
    pub authority: Arc<StubAuthority>,
}

impl TestCluster {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(T0));
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::with_clock(clock.clone()),
            reads: FailureSwitch::new(),
            deletes: FailureSwitch::new(),
            stalls: FailureSwitch::new(),
        });
        Self {
            clock,
            store,
            authority: Arc::new(StubAuthority::default()),
        }
    }

    pub fn keys(&self) -> KeySpace {
        KeySpace::new(NAMESPACE)
    }

    /// A node with default settings.
    pub fn node(&self, node_id: &str) -> PermissionResolver {
        self.node_with(node_id, settings())
    }

    pub fn node_with(&self, node_id: &str, settings: RuntimeSettings) -> PermissionResolver {
        PermissionResolver::assemble(
            self.store.clone(),
            self.authority.clone(),
            self.clock.clone(),
            Arc::new(Metrics::new()),
            self.keys(),
            node_id,
            settings,
        )
    }

    pub async fn subscribe(&self, channel: &str) -> MessageStream {
        self.store.subscribe(channel).await.unwrap()
    }
}

/// Default settings with single-attempt authority calls, so call counts are
/// exact.
pub fn settings() -> RuntimeSettings {
    let mut settings = RuntimeSettings::default();
    settings.resilience.default.retry_unavailable = false;
    settings
}

/// Messages already delivered to `stream`.
pub async fn drain(stream: &mut MessageStream) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(Some(message)) =
        tokio::time::timeout(Duration::from_millis(50), stream.next()).await
    {
        out.push(message);
    }
    out
}
