//! Shared KV store
//!
//! Rate limit buckets, idempotency claims and scan records live here so that
//! every API instance sees the same state. Two backends:
//! - `RedisKvStore`: production, atomic via SET NX and Lua scripts
//! - `MemoryKvStore`: single process and tests, atomic via DashMap entry locks

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::models::{AppError, AppResult, BucketDecision, RateLimitState};

#[async_trait]
pub trait KvStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()>;

    /// Set only if absent. Returns true when this caller created the key.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Delete only if the current value equals `expected`
    async fn delete_if_eq(&self, key: &str, expected: &str) -> AppResult<bool>;

    /// Refill-then-consume on the bucket at `key`, as one atomic step
    async fn take_token(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> AppResult<BucketDecision>;

    async fn ping(&self) -> AppResult<()>;
}

// ============================================
// IN-MEMORY BACKEND
// ============================================

#[derive(Debug, Clone)]
enum MemoryValue {
    Text(String),
    Bucket(RateLimitState),
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// Process-local store. Uses tokio's clock so paused-time tests control expiry.
#[derive(Clone)]
pub struct MemoryKvStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
    epoch: Instant,
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let now = Instant::now();
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return Ok(None);
        }
        match &entry.value {
            MemoryValue::Text(text) => Ok(Some(text.clone())),
            MemoryValue::Bucket(_) => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Text(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let now = Instant::now();
        let fresh = MemoryEntry {
            value: MemoryValue::Text(value.to_string()),
            expires_at: Some(now + ttl),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> AppResult<bool> {
        let removed = self.entries.remove_if(key, |_, entry| {
            matches!(&entry.value, MemoryValue::Text(text) if text == expected)
        });
        Ok(removed.is_some())
    }

    async fn take_token(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> AppResult<BucketDecision> {
        let now = Instant::now();
        let now_ms = self.now_ms();

        // entry() holds the shard lock for the whole read-modify-write
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| MemoryEntry {
            value: MemoryValue::Bucket(RateLimitState::full(capacity, refill_per_sec, now_ms)),
            expires_at: Some(now + ttl),
        });

        let mut state = match &entry.value {
            MemoryValue::Bucket(state) if !entry.is_expired(now) => *state,
            _ => RateLimitState::full(capacity, refill_per_sec, now_ms),
        };
        state.capacity = capacity;
        state.refill_rate_per_second = refill_per_sec;

        let decision = state.refill_and_take(now_ms);
        entry.value = MemoryValue::Bucket(state);
        entry.expires_at = Some(now + ttl);
        Ok(decision)
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

// ============================================
// REDIS BACKEND
// ============================================

/// Refill-then-consume in one script; clock is the server's TIME
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local ttl_ms = tonumber(ARGV[3])

local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end

local elapsed = math.max(0, now - ts)
tokens = math.min(capacity, tokens + (elapsed / 1000) * rate)

local allowed = 0
local retry_ms = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
elseif rate > 0 then
    retry_ms = math.ceil(((1 - tokens) / rate) * 1000)
else
    retry_ms = -1
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(math.max(now, ts)))
redis.call('PEXPIRE', key, ttl_ms)
return {allowed, tostring(tokens), retry_ms}
"#;

/// Delete only when we still own the value
const DELETE_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisKvStore {
    conn: ConnectionManager,
    bucket_script: Arc<redis::Script>,
    delete_script: Arc<redis::Script>,
}

impl RedisKvStore {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("✅ Connected to Redis KV store");
        Ok(Self {
            conn,
            bucket_script: Arc::new(redis::Script::new(TOKEN_BUCKET_SCRIPT)),
            delete_script: Arc::new(redis::Script::new(DELETE_IF_EQ_SCRIPT)),
        })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        debug!("SET NX {} -> {:?}", key, reply);
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn take_token(
        &self,
        key: &str,
        capacity: f64,
        refill_per_sec: f64,
        ttl: Duration,
    ) -> AppResult<BucketDecision> {
        let mut conn = self.conn.clone();
        let (allowed, remaining, retry_ms): (i64, String, i64) = self
            .bucket_script
            .key(key)
            .arg(capacity)
            .arg(refill_per_sec)
            .arg(ttl.as_millis().max(1) as u64)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketDecision {
            allowed: allowed == 1,
            remaining: remaining.parse().unwrap_or(0.0),
            retry_after_ms: if retry_ms < 0 { u64::MAX } else { retry_ms as u64 },
        })
    }

    async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(AppError::store_unavailable(format!("unexpected PING reply {}", pong)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_claims_once() {
        let store = MemoryKvStore::new();
        assert!(store.set_nx("k", "a", Duration::from_secs(300)).await.unwrap());
        assert!(!store.set_nx("k", "b", Duration::from_secs(300)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_nx("k", "c", Duration::from_secs(300)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_eq() {
        let store = MemoryKvStore::new();
        store.set("k", "mine", None).await.unwrap();
        assert!(!store.delete_if_eq("k", "theirs").await.unwrap());
        assert!(store.delete_if_eq("k", "mine").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills_over_time() {
        let store = MemoryKvStore::new();
        let ttl = Duration::from_secs(120);
        for _ in 0..10 {
            let d = store.take_token("rl:ip:a", 10.0, 10.0 / 60.0, ttl).await.unwrap();
            assert!(d.allowed);
        }
        let rejected = store.take_token("rl:ip:a", 10.0, 10.0 / 60.0, ttl).await.unwrap();
        assert!(!rejected.allowed);
        assert!((6000..=6001).contains(&rejected.retry_after_ms));

        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(store.take_token("rl:ip:a", 10.0, 10.0 / 60.0, ttl).await.unwrap().allowed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_nx_single_winner() {
        let store = Arc::new(MemoryKvStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set_nx("claim", &i.to_string(), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryKvStore::new();
        store.set("a", "1", Some(Duration::from_secs(1))).await.unwrap();
        store.set("b", "2", None).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }
}
