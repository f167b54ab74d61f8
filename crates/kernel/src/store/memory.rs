//! In-process [`SharedStore`] for single-node deployments and tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{ClaimedTask, MessageStream, QueueDepth, QueuedTask, SharedStore, StoreResult};
use crate::clock::{Clock, SystemClock};

/// Per-channel buffer; slow subscribers lose the oldest messages.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, StoredValue>,
    sets: HashMap<String, (HashSet<String>, Option<u64>)>,
    /// Pending tasks ordered by (due time, id).
    pending: BTreeSet<(u64, String)>,
    pending_due: HashMap<String, u64>,
    /// Processing task id -> lease end.
    processing: HashMap<String, u64>,
    payloads: HashMap<String, String>,
    refs: HashMap<String, Vec<String>>,
    dead: BTreeMap<String, String>,
}

impl State {
    fn live_value(&mut self, key: &str, now: u64) -> Option<String> {
        let expired = matches!(
            self.values.get(key),
            Some(StoredValue { expires_at_ms: Some(at), .. }) if *at <= now
        );
        if expired {
            self.values.remove(key);
            return None;
        }
        self.values.get(key).map(|v| v.value.clone())
    }

    fn live_set(&mut self, key: &str, now: u64) -> Option<&mut HashSet<String>> {
        let expired = matches!(self.sets.get(key), Some((_, Some(at))) if *at <= now);
        if expired {
            self.sets.remove(key);
            return None;
        }
        self.sets.get_mut(key).map(|(members, _)| members)
    }

    fn unindex(&mut self, id: &str) {
        if let Some(index_keys) = self.refs.get(id) {
            for index_key in index_keys {
                if let Some((members, _)) = self.sets.get_mut(index_key) {
                    members.remove(id);
                    if members.is_empty() {
                        self.sets.remove(index_key);
                    }
                }
            }
        }
    }

    fn index(&mut self, id: &str) {
        if let Some(index_keys) = self.refs.get(id).cloned() {
            for index_key in index_keys {
                self.sets
                    .entry(index_key)
                    .or_default()
                    .0
                    .insert(id.to_string());
            }
        }
    }

    /// Move one pending task to processing.
    fn claim(&mut self, id: &str, lease_until_ms: u64) -> Option<ClaimedTask> {
        let due = self.pending_due.remove(id)?;
        self.pending.remove(&(due, id.to_string()));
        self.unindex(id);
        self.processing.insert(id.to_string(), lease_until_ms);
        let payload = self.payloads.get(id).cloned().unwrap_or_default();
        Some(ClaimedTask {
            id: id.to_string(),
            payload,
        })
    }

    fn push_pending(&mut self, id: &str, due_at_ms: u64) {
        if let Some(previous) = self.pending_due.insert(id.to_string(), due_at_ms) {
            self.pending.remove(&(previous, id.to_string()));
        }
        self.pending.insert((due_at_ms, id.to_string()));
        self.index(id);
    }

    /// Drop a processing task. Returns false, leaving everything in place,
    /// when the task is no longer held, such as after its lease was
    /// reclaimed and it went back to pending.
    fn forget(&mut self, id: &str) -> bool {
        if self.processing.remove(id).is_none() {
            return false;
        }
        self.payloads.remove(id);
        self.refs.remove(id);
        true
    }
}

/// Shared store kept entirely in this process.
///
/// Clones share state, so several resolver instances built on clones of one
/// `MemoryStore` behave like nodes of one cluster.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    channels: Arc<DashMap<String, broadcast::Sender<String>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            channels: Arc::new(DashMap::new()),
            clock,
        }
    }

    /// Whether a key currently holds a live value.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.state.lock().live_value(key, now).is_some()
    }

    /// Number of live plain keys.
    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .values
            .values()
            .filter(|v| v.expires_at_ms.is_none_or(|at| at > now))
            .count()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn expiry(&self, ttl_ms: u64) -> Option<u64> {
        (ttl_ms > 0).then(|| self.clock.now_ms() + ttl_ms)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_ms();
        Ok(self.state.lock().live_value(key, now))
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        Ok(keys.iter().map(|k| state.live_value(k, now)).collect())
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<()> {
        let expires_at_ms = self.expiry(ttl_ms);
        self.state.lock().values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    async fn set_many(
        &self,
        entries: &[(String, String)],
        tags: &[(String, String)],
        ttl_ms: u64,
    ) -> StoreResult<()> {
        let expires_at_ms = self.expiry(ttl_ms);
        let mut state = self.state.lock();
        for (key, value) in entries {
            state.values.insert(
                key.clone(),
                StoredValue {
                    value: value.clone(),
                    expires_at_ms,
                },
            );
        }
        for (set_key, member) in tags {
            let entry = state.sets.entry(set_key.clone()).or_default();
            entry.0.insert(member.clone());
            entry.1 = expires_at_ms;
        }
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let mut removed = 0;
        for key in keys {
            if state.live_value(key, now).is_some() {
                removed += 1;
            }
            state.values.remove(key);
        }
        Ok(removed)
    }

    async fn delete_keys_scripted(&self, keys: &[String]) -> StoreResult<u64> {
        self.delete_keys(keys).await
    }

    async fn delete_pattern(&self, _routing_key: &str, pattern: &str) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state
            .values
            .retain(|_, v| v.expires_at_ms.is_none_or(|at| at > now));
        let before = state.values.len();
        state.values.retain(|k, _| !glob_match(pattern, k));
        let removed = (before - state.values.len()) as u64;
        debug!(pattern = %pattern, removed, "memory pattern delete");
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        Ok(state
            .live_set(key, now)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_set_members(&self, key: &str, members: &[String]) -> StoreResult<()> {
        let mut state = self.state.lock();
        if let Some((set, _)) = state.sets.get_mut(key) {
            for member in members {
                set.remove(member);
            }
            if set.is_empty() {
                state.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        // No subscribers is not an error, same as Redis PUBLISH returning 0.
        let _ = self.sender(channel).send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        let receiver = self.sender(channel).subscribe();
        // A lagged receiver has lost messages; ending the stream makes the
        // listener resubscribe and resync.
        let stream = BroadcastStream::new(receiver).map_while(Result::ok);
        Ok(Box::pin(stream))
    }

    async fn incr_window(&self, key: &str, ttl_ms: u64) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        let expires_at_ms = self.expiry(ttl_ms);
        let mut state = self.state.lock();
        let current = state
            .live_value(key, now)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        let expires_at_ms = if current == 0 {
            expires_at_ms
        } else {
            state.values.get(key).and_then(|v| v.expires_at_ms)
        };
        state.values.insert(
            key.to_string(),
            StoredValue {
                value: next.to_string(),
                expires_at_ms,
            },
        );
        Ok(next)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let current = state.live_value(key, now);
        if current.as_deref() != expected {
            return Ok(false);
        }
        state.values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms: None,
            },
        );
        Ok(true)
    }

    async fn queue_push(&self, task: &QueuedTask) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.unindex(&task.id);
        state.processing.remove(&task.id);
        state.payloads.insert(task.id.clone(), task.payload.clone());
        state.refs.insert(task.id.clone(), task.index_keys.clone());
        state.push_pending(&task.id, task.due_at_ms);
        Ok(())
    }

    async fn queue_claim_due(
        &self,
        cutoff_ms: u64,
        lease_until_ms: u64,
        limit: usize,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut state = self.state.lock();
        let due: Vec<String> = state
            .pending
            .iter()
            .take_while(|(due, _)| *due <= cutoff_ms)
            .take(limit)
            .map(|(_, id)| id.clone())
            .collect();
        Ok(due
            .iter()
            .filter_map(|id| state.claim(id, lease_until_ms))
            .collect())
    }

    async fn queue_claim_indexed(
        &self,
        index_key: &str,
        lease_until_ms: u64,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut state = self.state.lock();
        let ids: Vec<String> = state
            .sets
            .get(index_key)
            .map(|(m, _)| m.iter().cloned().collect())
            .unwrap_or_default();
        let claimed: Vec<ClaimedTask> = ids
            .iter()
            .filter_map(|id| state.claim(id, lease_until_ms))
            .collect();
        state.sets.remove(index_key);
        Ok(claimed)
    }

    async fn queue_ack(&self, ids: &[String]) -> StoreResult<()> {
        let mut state = self.state.lock();
        for id in ids {
            if !state.forget(id) {
                debug!(task_id = %id, "ack skipped, task no longer in flight");
            }
        }
        Ok(())
    }

    async fn queue_requeue(&self, task: &QueuedTask) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.processing.remove(&task.id);
        state.payloads.insert(task.id.clone(), task.payload.clone());
        state.refs.insert(task.id.clone(), task.index_keys.clone());
        state.push_pending(&task.id, task.due_at_ms);
        Ok(())
    }

    async fn queue_bury(&self, id: &str, payload: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.forget(id) {
            state.dead.insert(id.to_string(), payload.to_string());
        } else {
            debug!(task_id = %id, "bury skipped, task no longer in flight");
        }
        Ok(())
    }

    async fn queue_reclaim(&self, now_ms: u64) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .processing
            .iter()
            .filter(|(_, lease)| **lease <= now_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.processing.remove(id);
            state.push_pending(id, now_ms);
        }
        Ok(expired.len() as u64)
    }

    async fn queue_depth(&self) -> StoreResult<QueueDepth> {
        let state = self.state.lock();
        Ok(QueueDepth {
            pending: state.pending.len() as u64,
            processing: state.processing.len() as u64,
            dead: state.dead.len() as u64,
        })
    }

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .sets
            .get(index_key)
            .map(|(m, _)| m.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn task_payloads(&self, ids: &[String]) -> StoreResult<Vec<Option<String>>> {
        let state = self.state.lock();
        Ok(ids.iter().map(|id| state.payloads.get(id).cloned()).collect())
    }

    async fn dead_letters(&self, limit: usize) -> StoreResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state.dead.values().take(limit).cloned().collect())
    }
}

/// Redis-style glob match supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn task(id: &str, due: u64, indexes: &[&str]) -> QueuedTask {
        QueuedTask {
            id: id.to_string(),
            due_at_ms: due,
            payload: format!("payload-{id}"),
            index_keys: indexes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("a:{u:1}:*", "a:{u:1}:server:7:abc"));
        assert!(!glob_match("a:{u:1}:*", "a:{u:12}:server:7:abc"));
        assert!(glob_match("k?y", "key"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("abc", "abcd"));
    }

    #[tokio::test]
    async fn test_values_expire_with_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = MemoryStore::with_clock(clock.clone());
        store.set("k", "v", 500).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        clock.advance_ms(500);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_window_keeps_first_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::with_clock(clock.clone());
        assert_eq!(store.incr_window("w", 100).await.unwrap(), 1);
        clock.advance_ms(60);
        assert_eq!(store.incr_window("w", 100).await.unwrap(), 2);
        clock.advance_ms(40);
        assert_eq!(store.incr_window("w", 100).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryStore::new();
        assert!(store.compare_and_set("b", None, "v1").await.unwrap());
        assert!(!store.compare_and_set("b", None, "v2").await.unwrap());
        assert!(store.compare_and_set("b", Some("v1"), "v2").await.unwrap());
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_claim_due_unindexes() {
        let store = MemoryStore::new();
        store.queue_push(&task("t1", 10, &["idx:a", "idx:b"])).await.unwrap();
        store.queue_push(&task("t2", 20, &["idx:a"])).await.unwrap();
        store.queue_push(&task("t3", 99, &["idx:b"])).await.unwrap();

        let claimed = store.queue_claim_due(20, 1_000, 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        assert!(store.index_members("idx:a").await.unwrap().is_empty());
        assert_eq!(store.index_members("idx:b").await.unwrap(), vec!["t3"]);

        let depth = store.queue_depth().await.unwrap();
        assert_eq!(depth.pending, 1);
        assert_eq!(depth.processing, 2);
    }

    #[tokio::test]
    async fn test_claim_indexed_removes_from_other_indexes() {
        let store = MemoryStore::new();
        store.queue_push(&task("t1", 10, &["idx:a", "idx:b"])).await.unwrap();
        store.queue_push(&task("t2", 10, &["idx:b"])).await.unwrap();

        let claimed = store.queue_claim_indexed("idx:a", 1_000).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, "payload-t1");
        assert!(store.index_members("idx:a").await.unwrap().is_empty());
        assert_eq!(store.index_members("idx:b").await.unwrap(), vec!["t2"]);
    }

    #[tokio::test]
    async fn test_requeue_reindexes_and_reclaim_returns_leases() {
        let store = MemoryStore::new();
        store.queue_push(&task("t1", 10, &["idx:a"])).await.unwrap();
        store.queue_claim_due(10, 50, 10).await.unwrap();
        assert_eq!(store.queue_reclaim(49).await.unwrap(), 0);
        assert_eq!(store.queue_reclaim(50).await.unwrap(), 1);
        assert_eq!(store.index_members("idx:a").await.unwrap(), vec!["t1"]);

        store.queue_claim_due(100, 200, 10).await.unwrap();
        store.queue_requeue(&task("t1", 300, &["idx:a"])).await.unwrap();
        let depth = store.queue_depth().await.unwrap();
        assert_eq!((depth.pending, depth.processing), (1, 0));
    }

    #[tokio::test]
    async fn test_bury_moves_to_dead_letters() {
        let store = MemoryStore::new();
        store.queue_push(&task("t1", 10, &["idx:a"])).await.unwrap();
        store.queue_claim_due(10, 50, 10).await.unwrap();
        store.queue_bury("t1", "dead-payload").await.unwrap();
        assert_eq!(store.dead_letters(10).await.unwrap(), vec!["dead-payload"]);
        assert_eq!(store.queue_depth().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn test_tag_sets_and_pattern_delete() {
        let store = MemoryStore::new();
        let entries = vec![
            ("p:{u:1}:a".to_string(), "1".to_string()),
            ("p:{u:1}:b".to_string(), "1".to_string()),
            ("p:{u:2}:a".to_string(), "1".to_string()),
        ];
        let tags = vec![
            ("tag:s".to_string(), "p:{u:2}:a".to_string()),
            ("tag:s".to_string(), "p:{u:1}:a".to_string()),
        ];
        store.set_many(&entries, &tags, 0).await.unwrap();

        assert_eq!(store.delete_pattern("p:{u:1}", "p:{u:1}:*").await.unwrap(), 2);
        let mut members = store.set_members("tag:s").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["p:{u:1}:a", "p:{u:2}:a"]);

        store
            .remove_set_members("tag:s", &["p:{u:1}:a".to_string()])
            .await
            .unwrap();
        assert_eq!(store.set_members("tag:s").await.unwrap(), vec!["p:{u:2}:a"]);
        store
            .remove_set_members("tag:s", &["p:{u:2}:a".to_string()])
            .await
            .unwrap();
        assert!(store.set_members("tag:s").await.unwrap().is_empty());
        assert!(store.contains("p:{u:2}:a"));
    }

    #[tokio::test]
    async fn test_ack_after_reclaim_keeps_task_pending() {
        let store = MemoryStore::new();
        store.queue_push(&task("t1", 0, &["idx:subject"])).await.unwrap();
        store.queue_claim_due(0, 10, 10).await.unwrap();
        assert_eq!(store.queue_reclaim(10).await.unwrap(), 1);

        // The first claimer finishes late, after the lease went back.
        store.queue_ack(&["t1".to_string()]).await.unwrap();
        store.queue_bury("t1", "late").await.unwrap();
        assert!(store.dead_letters(10).await.unwrap().is_empty());
        assert_eq!(store.index_members("idx:subject").await.unwrap(), vec!["t1"]);

        let claimed = store.queue_claim_due(10, 100, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, "payload-t1");
        assert!(store.index_members("idx:subject").await.unwrap().is_empty());

        store.queue_ack(&["t1".to_string()]).await.unwrap();
        let depth = store.queue_depth().await.unwrap();
        assert_eq!((depth.pending, depth.processing), (0, 0));
        assert!(store.task_payloads(&["t1".to_string()]).await.unwrap()[0].is_none());
    }

    #[tokio::test]
    async fn test_lagged_subscriber_stream_ends() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe("chan").await.unwrap();
        for i in 0..CHANNEL_CAPACITY + 8 {
            store.publish("chan", &i.to_string()).await.unwrap();
        }
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let store = MemoryStore::new();
        let mut stream = store.subscribe("chan").await.unwrap();
        store.publish("chan", "hello").await.unwrap();
        assert_eq!(stream.next().await.as_deref(), Some("hello"));
    }
}
