//! Redis-backed [`SharedStore`].
//!
//! Works against a single Redis node (through a reconnecting
//! `ConnectionManager`) or a Redis Cluster. Multi-key operations are grouped
//! by hash tag before being sent, and every operation that must be atomic is a
//! Lua script whose keys share one hash tag.

use std::collections::BTreeMap;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Client as RedisClient, Cmd, Pipeline, RedisFuture, Script, Value};
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::{
    ClaimedTask, MessageStream, QueueDepth, QueuedTask, SharedStore, StoreError, StoreResult,
};
use crate::key::KeySpace;

/// Keys per script invocation; keeps `unpack` well under Lua's stack limit.
const SCRIPT_CHUNK: usize = 1_000;

/// SCAN batch size used inside the pattern-delete script.
const SCAN_COUNT: u32 = 1_000;

/// Connection to either a single node or a cluster.
#[derive(Clone)]
enum RedisConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            RedisConnection::Single(conn) => conn.req_packed_command(cmd),
            RedisConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            RedisConnection::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Single(conn) => conn.get_db(),
            RedisConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

/// Compiled scripts; `Script` caches the SHA and falls back to EVAL on
/// `NOSCRIPT`.
struct Scripts {
    delete_keys: Script,
    delete_pattern: Script,
    remove_set_members: Script,
    incr_window: Script,
    compare_and_set: Script,
    queue_push: Script,
    queue_claim_due: Script,
    queue_claim_indexed: Script,
    queue_ack: Script,
    queue_bury: Script,
    queue_reclaim: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            delete_keys: Script::new(DELETE_KEYS_SCRIPT),
            delete_pattern: Script::new(DELETE_PATTERN_SCRIPT),
            remove_set_members: Script::new(REMOVE_SET_MEMBERS_SCRIPT),
            incr_window: Script::new(INCR_WINDOW_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
            queue_push: Script::new(&format!("{QUEUE_HELPERS}{QUEUE_PUSH_SCRIPT}")),
            queue_claim_due: Script::new(&format!("{QUEUE_HELPERS}{QUEUE_CLAIM_DUE_SCRIPT}")),
            queue_claim_indexed: Script::new(&format!(
                "{QUEUE_HELPERS}{QUEUE_CLAIM_INDEXED_SCRIPT}"
            )),
            queue_ack: Script::new(QUEUE_ACK_SCRIPT),
            queue_bury: Script::new(&format!("{QUEUE_HELPERS}{QUEUE_BURY_SCRIPT}")),
            queue_reclaim: Script::new(&format!("{QUEUE_HELPERS}{QUEUE_RECLAIM_SCRIPT}")),
        }
    }
}

/// Redis-backed shared store.
#[derive(Clone)]
pub struct RedisStore {
    conn: RedisConnection,
    /// Dedicated client for pub/sub subscriptions.
    pubsub_client: RedisClient,
    keys: KeySpace,
    scripts: std::sync::Arc<Scripts>,
}

impl RedisStore {
    /// Connect to a single Redis node.
    pub async fn connect(redis_url: &str, keys: KeySpace) -> StoreResult<Self> {
        let client = RedisClient::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        info!("connected to Redis");
        Ok(Self {
            conn: RedisConnection::Single(manager),
            pubsub_client: client,
            keys,
            scripts: std::sync::Arc::new(Scripts::new()),
        })
    }

    /// Connect to a Redis Cluster.
    ///
    /// Subscriptions go through the first node; Redis Cluster forwards
    /// `PUBLISH` to every node, so one subscriber connection sees all messages.
    pub async fn connect_cluster(nodes: &[String], keys: KeySpace) -> StoreResult<Self> {
        let first = nodes
            .first()
            .ok_or_else(|| StoreError::Protocol("no cluster nodes configured".to_string()))?;
        let cluster = ClusterClient::new(nodes.to_vec())?;
        let conn = cluster.get_async_connection().await?;
        let pubsub_client = RedisClient::open(first.as_str())?;
        info!(nodes = nodes.len(), "connected to Redis Cluster");
        Ok(Self {
            conn: RedisConnection::Cluster(conn),
            pubsub_client,
            keys,
            scripts: std::sync::Arc::new(Scripts::new()),
        })
    }

    fn conn(&self) -> RedisConnection {
        self.conn.clone()
    }

    /// Fixed queue keys, in the order the queue scripts expect them.
    fn queue_keys(&self) -> [String; 5] {
        [
            self.keys.queue(),
            self.keys.processing(),
            self.keys.task_payloads(),
            self.keys.task_refs(),
            self.keys.dead_letters(),
        ]
    }

    fn queue_script<'a>(&self, script: &'a Script) -> redis::ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        for key in self.queue_keys() {
            invocation.key(key);
        }
        invocation
    }
}

/// The part of a key Redis Cluster hashes: the first non-empty `{...}`
/// section, or the whole key.
pub fn hash_tag(key: &str) -> &str {
    let Some(open) = key.find('{') else {
        return key;
    };
    match key[open + 1..].find('}') {
        Some(len) if len > 0 => &key[open + 1..open + 1 + len],
        _ => key,
    }
}

/// Group indices of `keys` by hash tag, preserving first-seen order.
fn group_by_tag<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<Vec<usize>> {
    let mut groups: BTreeMap<&str, usize> = BTreeMap::new();
    let mut out: Vec<Vec<usize>> = Vec::new();
    for (i, key) in keys.enumerate() {
        let tag = hash_tag(key);
        let slot = *groups.entry(tag).or_insert_with(|| {
            out.push(Vec::new());
            out.len() - 1
        });
        out[slot].push(i);
    }
    out
}

fn parse_claimed(flat: Vec<String>) -> StoreResult<Vec<ClaimedTask>> {
    if flat.len() % 2 != 0 {
        return Err(StoreError::Protocol(
            "claim script returned an odd-length reply".to_string(),
        ));
    }
    Ok(flat
        .chunks_exact(2)
        .map(|pair| ClaimedTask {
            id: pair[0].clone(),
            payload: pair[1].clone(),
        })
        .collect())
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let mut out = vec![None; keys.len()];
        let mut conn = self.conn();
        for group in group_by_tag(keys.iter().map(String::as_str)) {
            let mut cmd = redis::cmd("MGET");
            for &i in &group {
                cmd.arg(&keys[i]);
            }
            let values: Vec<Option<String>> = cmd.query_async(&mut conn).await?;
            for (&i, value) in group.iter().zip(values) {
                out[i] = value;
            }
        }
        Ok(out)
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<()> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if ttl_ms > 0 {
            cmd.arg("PX").arg(ttl_ms);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_many(
        &self,
        entries: &[(String, String)],
        tags: &[(String, String)],
        ttl_ms: u64,
    ) -> StoreResult<()> {
        let mut pipes: BTreeMap<&str, Pipeline> = BTreeMap::new();
        for (key, value) in entries {
            let pipe = pipes.entry(hash_tag(key)).or_insert_with(redis::pipe);
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if ttl_ms > 0 {
                cmd.arg("PX").arg(ttl_ms);
            }
            cmd.ignore();
        }
        for (set_key, member) in tags {
            let pipe = pipes.entry(hash_tag(set_key)).or_insert_with(redis::pipe);
            pipe.cmd("SADD").arg(set_key).arg(member).ignore();
            if ttl_ms > 0 {
                pipe.cmd("PEXPIRE").arg(set_key).arg(ttl_ms).ignore();
            }
        }

        let mut conn = self.conn();
        for pipe in pipes.values() {
            let _: () = pipe.query_async(&mut conn).await?;
        }
        debug!(entries = entries.len(), ttl_ms, "pipelined L2 backfill");
        Ok(())
    }

    async fn delete_keys(&self, keys: &[String]) -> StoreResult<u64> {
        let mut conn = self.conn();
        let mut removed = 0;
        for group in group_by_tag(keys.iter().map(String::as_str)) {
            let mut pipe = redis::pipe();
            for &i in &group {
                pipe.cmd("DEL").arg(&keys[i]);
            }
            let counts: Vec<u64> = pipe.query_async(&mut conn).await?;
            removed += counts.iter().sum::<u64>();
        }
        Ok(removed)
    }

    async fn delete_keys_scripted(&self, keys: &[String]) -> StoreResult<u64> {
        let mut conn = self.conn();
        let mut removed = 0;
        for group in group_by_tag(keys.iter().map(String::as_str)) {
            for chunk in group.chunks(SCRIPT_CHUNK) {
                let mut invocation = self.scripts.delete_keys.prepare_invoke();
                for &i in chunk {
                    invocation.key(&keys[i]);
                }
                let count: u64 = invocation.invoke_async(&mut conn).await?;
                removed += count;
            }
        }
        Ok(removed)
    }

    async fn delete_pattern(&self, routing_key: &str, pattern: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let removed: u64 = self
            .scripts
            .delete_pattern
            .key(routing_key)
            .arg(pattern)
            .arg(SCAN_COUNT)
            .invoke_async(&mut conn)
            .await?;
        debug!(pattern = %pattern, removed, "pattern delete");
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }

    async fn remove_set_members(&self, key: &str, members: &[String]) -> StoreResult<()> {
        let mut conn = self.conn();
        for chunk in members.chunks(SCRIPT_CHUNK) {
            let mut invocation = self.scripts.remove_set_members.key(key);
            for member in chunk {
                invocation.arg(member);
            }
            let _: i64 = invocation.invoke_async(&mut conn).await?;
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        let mut pubsub = self.pubsub_client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| msg.get_payload::<String>().ok());
        Ok(Box::pin(stream))
    }

    async fn incr_window(&self, key: &str, ttl_ms: u64) -> StoreResult<u64> {
        let mut conn = self.conn();
        let count: u64 = self
            .scripts
            .incr_window
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let swapped: i64 = self
            .scripts
            .compare_and_set
            .key(key)
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn queue_push(&self, task: &QueuedTask) -> StoreResult<()> {
        let mut conn = self.conn();
        let mut invocation = self.queue_script(&self.scripts.queue_push);
        for index_key in &task.index_keys {
            invocation.key(index_key);
        }
        let _: i64 = invocation
            .arg(&task.id)
            .arg(task.due_at_ms)
            .arg(&task.payload)
            .arg(task.index_keys.join("\n"))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn queue_claim_due(
        &self,
        cutoff_ms: u64,
        lease_until_ms: u64,
        limit: usize,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut conn = self.conn();
        let flat: Vec<String> = self
            .queue_script(&self.scripts.queue_claim_due)
            .arg(cutoff_ms)
            .arg(lease_until_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        parse_claimed(flat)
    }

    async fn queue_claim_indexed(
        &self,
        index_key: &str,
        lease_until_ms: u64,
    ) -> StoreResult<Vec<ClaimedTask>> {
        let mut conn = self.conn();
        let flat: Vec<String> = self
            .queue_script(&self.scripts.queue_claim_indexed)
            .key(index_key)
            .arg(lease_until_ms)
            .invoke_async(&mut conn)
            .await?;
        parse_claimed(flat)
    }

    async fn queue_ack(&self, ids: &[String]) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut invocation = self.queue_script(&self.scripts.queue_ack);
        for id in ids {
            invocation.arg(id);
        }
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn queue_requeue(&self, task: &QueuedTask) -> StoreResult<()> {
        // Push also drops the id from the processing set.
        self.queue_push(task).await
    }

    async fn queue_bury(&self, id: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = self
            .queue_script(&self.scripts.queue_bury)
            .arg(id)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn queue_reclaim(&self, now_ms: u64) -> StoreResult<u64> {
        let mut conn = self.conn();
        let count: u64 = self
            .queue_script(&self.scripts.queue_reclaim)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn queue_depth(&self) -> StoreResult<QueueDepth> {
        let mut conn = self.conn();
        let (pending, processing, dead): (u64, u64, u64) = redis::pipe()
            .cmd("ZCARD")
            .arg(self.keys.queue())
            .cmd("ZCARD")
            .arg(self.keys.processing())
            .cmd("HLEN")
            .arg(self.keys.dead_letters())
            .query_async(&mut conn)
            .await?;
        Ok(QueueDepth {
            pending,
            processing,
            dead,
        })
    }

    async fn index_members(&self, index_key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(index_key)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn task_payloads(&self, ids: &[String]) -> StoreResult<Vec<Option<String>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.keys.task_payloads())
            .arg(ids)
            .query_async(&mut conn)
            .await?;
        Ok(payloads)
    }

    async fn dead_letters(&self, limit: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut payloads: Vec<String> = redis::cmd("HVALS")
            .arg(self.keys.dead_letters())
            .query_async(&mut conn)
            .await?;
        payloads.truncate(limit);
        Ok(payloads)
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("namespace", &self.keys.namespace())
            .finish()
    }
}

/// Delete every key passed in KEYS.
const DELETE_KEYS_SCRIPT: &str = r#"
if #KEYS == 0 then
    return 0
end
return redis.call("DEL", unpack(KEYS))
"#;

/// SCAN + DEL loop run entirely server-side.
///
/// KEYS[1] only routes the call to the shard owning the pattern's hash tag.
const DELETE_PATTERN_SCRIPT: &str = r#"
local cursor = "0"
local deleted = 0
repeat
    local reply = redis.call("SCAN", cursor, "MATCH", ARGV[1], "COUNT", ARGV[2])
    cursor = reply[1]
    local keys = reply[2]
    for i = 1, #keys, 500 do
        deleted = deleted + redis.call("DEL", unpack(keys, i, math.min(i + 499, #keys)))
    end
until cursor == "0"
return deleted
"#;

/// SREM the given members; an emptied set is removed by Redis itself.
const REMOVE_SET_MEMBERS_SCRIPT: &str = r#"
if #ARGV == 0 then
    return 0
end
return redis.call("SREM", KEYS[1], unpack(ARGV))
"#;

/// INCR + PEXPIRE in one step, so a crash between the two cannot leave an
/// immortal counter.
const INCR_WINDOW_SCRIPT: &str = r#"
local count = redis.call("INCR", KEYS[1])
if count == 1 then
    redis.call("PEXPIRE", KEYS[1], ARGV[1])
end
return count
"#;

/// ARGV[1] is "1" when an expected value is given in ARGV[2].
const COMPARE_AND_SET_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if ARGV[1] == "0" then
    if current then
        return 0
    end
elseif current ~= ARGV[2] then
    return 0
end
redis.call("SET", KEYS[1], ARGV[3])
return 1
"#;

/// Shared helpers for the queue scripts.
///
/// KEYS[1] pending zset, KEYS[2] processing zset, KEYS[3] payload hash,
/// KEYS[4] refs hash (task id -> newline-joined index keys), KEYS[5] dead
/// letters hash. Every key carries the same hash tag.
const QUEUE_HELPERS: &str = r#"
local function unindex(id)
    local refs = redis.call("HGET", KEYS[4], id)
    if refs then
        for index_key in string.gmatch(refs, "[^\n]+") do
            redis.call("SREM", index_key, id)
        end
    end
end

local function index(id)
    local refs = redis.call("HGET", KEYS[4], id)
    if refs then
        for index_key in string.gmatch(refs, "[^\n]+") do
            redis.call("SADD", index_key, id)
        end
    end
end

local function claim(id, lease)
    redis.call("ZREM", KEYS[1], id)
    unindex(id)
    redis.call("ZADD", KEYS[2], lease, id)
    return redis.call("HGET", KEYS[3], id) or ""
end
"#;

/// ARGV: id, due, payload, newline-joined index keys.
const QUEUE_PUSH_SCRIPT: &str = r#"
local id = ARGV[1]
unindex(id)
redis.call("ZREM", KEYS[2], id)
redis.call("HSET", KEYS[3], id, ARGV[3])
if ARGV[4] == "" then
    redis.call("HDEL", KEYS[4], id)
else
    redis.call("HSET", KEYS[4], id, ARGV[4])
end
redis.call("ZADD", KEYS[1], ARGV[2], id)
index(id)
return 1
"#;

/// ARGV: cutoff, lease end, limit.
const QUEUE_CLAIM_DUE_SCRIPT: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, tonumber(ARGV[3]))
local out = {}
for _, id in ipairs(ids) do
    local payload = claim(id, ARGV[2])
    out[#out + 1] = id
    out[#out + 1] = payload
end
return out
"#;

/// KEYS[6] is the reverse index; ARGV: lease end.
const QUEUE_CLAIM_INDEXED_SCRIPT: &str = r#"
local ids = redis.call("SMEMBERS", KEYS[6])
local out = {}
for _, id in ipairs(ids) do
    if redis.call("ZSCORE", KEYS[1], id) then
        local payload = claim(id, ARGV[1])
        out[#out + 1] = id
        out[#out + 1] = payload
    end
end
redis.call("DEL", KEYS[6])
return out
"#;

/// ARGV: task ids. Ids no longer in processing were reclaimed by a sweep
/// and stay pending.
const QUEUE_ACK_SCRIPT: &str = r#"
local acked = 0
for _, id in ipairs(ARGV) do
    if redis.call("ZREM", KEYS[2], id) == 1 then
        redis.call("HDEL", KEYS[3], id)
        redis.call("HDEL", KEYS[4], id)
        acked = acked + 1
    end
end
return acked
"#;

/// ARGV: id, final payload. Only a task still in processing is buried.
const QUEUE_BURY_SCRIPT: &str = r#"
local id = ARGV[1]
if redis.call("ZREM", KEYS[2], id) == 0 then
    return 0
end
unindex(id)
redis.call("HDEL", KEYS[3], id)
redis.call("HDEL", KEYS[4], id)
redis.call("HSET", KEYS[5], id, ARGV[2])
return 1
"#;

/// ARGV: now.
const QUEUE_RECLAIM_SCRIPT: &str = r#"
local ids = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", ARGV[1])
for _, id in ipairs(ids) do
    redis.call("ZREM", KEYS[2], id)
    redis.call("ZADD", KEYS[1], ARGV[1], id)
    index(id)
end
return #ids
"#;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_tag() {
        assert_eq!(hash_tag("pg:perm:{u:42}:server:7"), "u:42");
        assert_eq!(hash_tag("pg:{inv}:queue"), "inv");
        assert_eq!(hash_tag("plain"), "plain");
        assert_eq!(hash_tag("empty:{}:tag"), "empty:{}:tag");
    }

    #[test]
    fn test_group_by_tag() {
        let keys = ["a:{u:1}:x", "a:{u:2}:x", "a:{u:1}:y", "a:{u:3}:x"];
        let groups = group_by_tag(keys.iter().copied());
        assert_eq!(groups, vec![vec![0, 2], vec![1], vec![3]]);
    }

    #[test]
    fn test_parse_claimed() {
        let flat = vec!["t1".to_string(), "p1".to_string()];
        let claimed = parse_claimed(flat).unwrap();
        assert_eq!(claimed[0].id, "t1");
        assert!(parse_claimed(vec!["odd".to_string()]).is_err());
    }

    #[test]
    fn test_queue_scripts_share_helpers() {
        for body in [
            QUEUE_PUSH_SCRIPT,
            QUEUE_CLAIM_DUE_SCRIPT,
            QUEUE_CLAIM_INDEXED_SCRIPT,
            QUEUE_BURY_SCRIPT,
            QUEUE_RECLAIM_SCRIPT,
        ] {
            let full = format!("{QUEUE_HELPERS}{body}");
            assert!(full.contains("local function unindex"));
        }
    }
}
