//! Shared key-value store used as L2, invalidation transport, and home of
//! cluster-wide resilience state.
//!
//! Two backends implement [`SharedStore`]:
//!
//! - [`RedisStore`]: Redis (single node or cluster). Every operation that must
//!   be indivisible is one Lua script invocation.
//! - [`MemoryStore`]: single-process store for one-node deployments and tests.
//!   Every operation runs inside one critical section.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, hash_tag};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use thiserror::Error;

/// Shared store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Run one store call, failing with [`StoreError::Timeout`] once `limit`
/// passes.
pub async fn bounded<T, F>(limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(StoreError::Timeout(limit)))
}

/// Stream of pub/sub payloads; ends when the subscription is lost.
pub type MessageStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// A task as stored in the delayed invalidation queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub id: String,
    pub due_at_ms: u64,
    /// Serialized task; opaque to the store.
    pub payload: String,
    /// Reverse indexes that reference this task.
    pub index_keys: Vec<String>,
}

/// A task claimed for propagation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: String,
    pub payload: String,
}

/// Sizes of the queue's three sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub processing: u64,
    pub dead: u64,
}

/// Operations the cache, invalidation and resilience layers need from the
/// shared store.
///
/// The invalidation queue is three structures that must never disagree: the
/// time-ordered pending set, the processing (leased) set, and the reverse
/// indexes. Every `queue_*` method moves a task between them atomically and
/// keeps this invariant: a task id appears in a reverse index if and only if
/// the task is pending.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Round-trip health check.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Fetch several keys in one round trip; output is aligned with `keys`.
    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Set a value; `ttl_ms == 0` stores it without expiry.
    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<()>;

    /// Set several values in one pipeline and add each `(set_key, member)`
    /// pair to its tag set, refreshing the tag set's expiry to `ttl_ms`.
    async fn set_many(
        &self,
        entries: &[(String, String)],
        tags: &[(String, String)],
        ttl_ms: u64,
    ) -> StoreResult<()>;

    /// Delete keys in one pipeline. Returns how many existed.
    async fn delete_keys(&self, keys: &[String]) -> StoreResult<u64>;

    /// Delete keys through one server-side script per shard group.
    async fn delete_keys_scripted(&self, keys: &[String]) -> StoreResult<u64>;

    /// Delete every key matching a glob pattern in one server-side script
    /// routed by `routing_key`.
    async fn delete_pattern(&self, routing_key: &str, pattern: &str) -> StoreResult<u64>;

    /// Members of a tag set.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Remove members from a tag set, deleting the set once it is empty.
    async fn remove_set_members(&self, key: &str, members: &[String]) -> StoreResult<()>;

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream>;

    /// Increment a window counter, setting its expiry on first increment.
    /// Both steps are one atomic operation.
    async fn incr_window(&self, key: &str, ttl_ms: u64) -> StoreResult<u64>;

    /// Replace `key` with `value` only if its current value equals `expected`
    /// (`None` meaning absent). Returns whether the swap happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<bool>;

    /// Insert a pending task and register it in its reverse indexes.
    async fn queue_push(&self, task: &QueuedTask) -> StoreResult<()>;

    /// Claim up to `limit` pending tasks due at or before `cutoff_ms`, moving
    /// them to the processing set leased until `lease_until_ms` and removing
    /// them from every reverse index.
    async fn queue_claim_due(
        &self,
        cutoff_ms: u64,
        lease_until_ms: u64,
        limit: usize,
    ) -> StoreResult<Vec<ClaimedTask>>;

    /// Claim every pending task referenced by one reverse index.
    async fn queue_claim_indexed(
        &self,
        index_key: &str,
        lease_until_ms: u64,
    ) -> StoreResult<Vec<ClaimedTask>>;

    /// Forget successfully propagated tasks. Ids no longer in the
    /// processing set are left untouched.
    async fn queue_ack(&self, ids: &[String]) -> StoreResult<()>;

    /// Return a processing task to pending with a new payload and due time.
    async fn queue_requeue(&self, task: &QueuedTask) -> StoreResult<()>;

    /// Move a processing task to the dead-letter set. A task no longer in
    /// the processing set is left untouched.
    async fn queue_bury(&self, id: &str, payload: &str) -> StoreResult<()>;

    /// Return processing tasks whose lease ended at or before `now_ms` to
    /// pending. Returns how many were returned.
    async fn queue_reclaim(&self, now_ms: u64) -> StoreResult<u64>;

    async fn queue_depth(&self) -> StoreResult<QueueDepth>;

    /// Task ids currently registered in a reverse index.
    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>>;

    /// Payloads of pending tasks, looked up by id.
    async fn task_payloads(&self, ids: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Up to `limit` dead-lettered payloads.
    async fn dead_letters(&self, limit: usize) -> StoreResult<Vec<String>>;
}
