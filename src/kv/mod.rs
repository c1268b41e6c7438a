//! Key-value abstraction
//!
//! One contract for string, hash, set, sorted-set and list operations with
//! optional expiry. Two backends implement it: [`RedisKv`] (durable, served
//! through a [`CachedKv`] L1) and [`MemoryKv`] (in-process fallback). [`connect`] picks one at startup; everything else
//! goes through the backend-agnostic [`Kv`] handle.

mod durable;
mod layered;
mod memory;
mod pattern;
mod sorted_set;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;

pub use durable::RedisKv;
pub use layered::{CachedKv, L1_TTL};
pub use memory::MemoryKv;
pub use pattern::glob_match;
pub use sorted_set::SortedSet;

/// KV layer errors. Never retried here; callers decide whether to log or fall through.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("WRONGTYPE: key '{0}' holds the wrong kind of value")]
    WrongType(String),

    #[error("Value at '{0}' is not an integer")]
    NotAnInteger(String),

    #[error("Invalid expire time for key '{0}'")]
    InvalidExpire(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Range selector for sorted-set reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZRange {
    /// Rank range, inclusive, negative indices count from the end
    Index { start: isize, stop: isize },
    /// Score range, inclusive on both ends
    Score { min: f64, max: f64 },
}

impl ZRange {
    pub fn all() -> Self {
        ZRange::Index { start: 0, stop: -1 }
    }

    pub fn by_score(min: f64, max: f64) -> Self {
        ZRange::Score { min, max }
    }
}

/// Backend contract. Values cross it as serialized strings; [`Kv`] owns the
/// typed (de)serialization on top.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    /// Store a string value; `ex` is a TTL in seconds. Overwrites clear any previous TTL.
    async fn set(&self, key: &str, value: String, ex: Option<u64>) -> KvResult<()>;
    async fn del(&self, keys: &[String]) -> KvResult<u64>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>>;
    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>>;
    async fn mset(&self, entries: &[(String, String)]) -> KvResult<()>;
    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64>;
    async fn expire(&self, key: &str, seconds: u64) -> KvResult<bool>;

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;
    /// Returns the number of newly created fields
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<u64>;
    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;
    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64>;

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64>;
    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64>;
    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool>;
    async fn smembers(&self, key: &str) -> KvResult<Vec<String>>;
    async fn scard(&self, key: &str) -> KvResult<u64>;
    /// Batched membership checks, one `(key, member)` pair per result
    async fn sismember_many(&self, checks: &[(String, String)]) -> KvResult<Vec<bool>>;

    /// Returns the number of newly added members
    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> KvResult<u64>;
    async fn zrange(&self, key: &str, range: ZRange, rev: bool) -> KvResult<Vec<String>>;
    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64>;
    async fn zcard(&self, key: &str) -> KvResult<u64>;
    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64>;
    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>>;

    /// Returns the list length after the push
    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<u64>;
    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>>;
    async fn llen(&self, key: &str) -> KvResult<u64>;
}

/// Backend-agnostic, typed KV handle. Cheap to clone.
#[derive(Clone)]
pub struct Kv {
    backend: Arc<dyn KvBackend>,
}

fn owned(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Kv {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Fresh in-process store, mostly for tests and tools
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> KvResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ex: Option<u64>) -> KvResult<()> {
        let raw = serde_json::to_string(value)?;
        self.backend.set(key, raw, ex).await
    }

    pub async fn del(&self, keys: &[&str]) -> KvResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.backend.del(&owned(keys)).await
    }

    pub async fn exists(&self, key: &str) -> KvResult<bool> {
        self.backend.exists(key).await
    }

    pub async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.backend.keys(pattern).await
    }

    /// Batched get. A value that fails to deserialize reads as `None`.
    pub async fn mget<T: DeserializeOwned>(&self, keys: &[String]) -> KvResult<Vec<Option<T>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let raw = self.backend.mget(keys).await?;
        Ok(raw
            .into_iter()
            .zip(keys)
            .map(|(value, key)| {
                value.and_then(|raw| match serde_json::from_str(&raw) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        debug!(key = %key, error = %e, "Skipping malformed value");
                        None
                    }
                })
            })
            .collect())
    }

    pub async fn mset<T: Serialize>(&self, entries: &[(&str, T)]) -> KvResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let raw = entries
            .iter()
            .map(|(key, value)| Ok((key.to_string(), serde_json::to_string(value)?)))
            .collect::<KvResult<Vec<_>>>()?;
        self.backend.mset(&raw).await
    }

    pub async fn incr(&self, key: &str) -> KvResult<i64> {
        self.backend.incr_by(key, 1).await
    }

    pub async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        self.backend.incr_by(key, delta).await
    }

    pub async fn expire(&self, key: &str, seconds: u64) -> KvResult<bool> {
        self.backend.expire(key, seconds).await
    }

    pub async fn hgetall<T: DeserializeOwned>(&self, key: &str) -> KvResult<HashMap<String, T>> {
        self.backend
            .hgetall(key)
            .await?
            .into_iter()
            .map(|(field, raw)| Ok((field, serde_json::from_str(&raw)?)))
            .collect()
    }

    pub async fn hset<T: Serialize + ?Sized>(&self, key: &str, field: &str, value: &T) -> KvResult<u64> {
        let raw = serde_json::to_string(value)?;
        self.backend.hset(key, &[(field.to_string(), raw)]).await
    }

    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> KvResult<Option<T>> {
        match self.backend.hget(key, field).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn hdel(&self, key: &str, fields: &[&str]) -> KvResult<u64> {
        self.backend.hdel(key, &owned(fields)).await
    }

    pub async fn sadd(&self, key: &str, members: &[&str]) -> KvResult<u64> {
        self.backend.sadd(key, &owned(members)).await
    }

    pub async fn srem(&self, key: &str, members: &[&str]) -> KvResult<u64> {
        self.backend.srem(key, &owned(members)).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        self.backend.sismember(key, member).await
    }

    pub async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        self.backend.smembers(key).await
    }

    pub async fn scard(&self, key: &str) -> KvResult<u64> {
        self.backend.scard(key).await
    }

    pub async fn sismember_many(&self, checks: &[(&str, &str)]) -> KvResult<Vec<bool>> {
        if checks.is_empty() {
            return Ok(Vec::new());
        }
        let checks: Vec<(String, String)> = checks
            .iter()
            .map(|(key, member)| (key.to_string(), member.to_string()))
            .collect();
        self.backend.sismember_many(&checks).await
    }

    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> KvResult<u64> {
        self.backend.zadd(key, &[(score, member.to_string())]).await
    }

    pub async fn zrange(&self, key: &str, range: ZRange, rev: bool) -> KvResult<Vec<String>> {
        self.backend.zrange(key, range, rev).await
    }

    pub async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.backend.zremrangebyscore(key, min, max).await
    }

    pub async fn zcard(&self, key: &str) -> KvResult<u64> {
        self.backend.zcard(key).await
    }

    pub async fn zrem(&self, key: &str, members: &[&str]) -> KvResult<u64> {
        self.backend.zrem(key, &owned(members)).await
    }

    pub async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        self.backend.zscore(key, member).await
    }

    pub async fn lpush<T: Serialize>(&self, key: &str, values: &[T]) -> KvResult<u64> {
        let raw = values
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.backend.lpush(key, &raw).await
    }

    pub async fn rpush<T: Serialize>(&self, key: &str, values: &[T]) -> KvResult<u64> {
        let raw = values
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.backend.rpush(key, &raw).await
    }

    pub async fn lrange<T: DeserializeOwned>(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<T>> {
        self.backend
            .lrange(key, start, stop)
            .await?
            .iter()
            .map(|raw| Ok(serde_json::from_str(raw)?))
            .collect()
    }

    pub async fn llen(&self, key: &str) -> KvResult<u64> {
        self.backend.llen(key).await
    }
}

/// Pick the KV backend once at startup
///
/// The durable backend is used only when a connection target is configured
/// and the runtime allows persistent outbound connections. A failed connect
/// falls back to the in-process store so the app still serves requests.
pub async fn connect(config: &Config) -> Kv {
    match (&config.kv_url, config.persistent_connections) {
        (Some(url), true) => match RedisKv::connect(url).await {
            Ok(backend) => {
                info!(backend = "redis", "KV backend selected");
                return Kv::new(Arc::new(CachedKv::new(backend)));
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to durable KV, using in-process store");
            }
        },
        (Some(_), false) => {
            debug!("Runtime forbids persistent connections, using in-process store");
        }
        (None, _) => {
            debug!("No KV connection configured, using in-process store");
        }
    }
    info!(backend = "memory", "KV backend selected");
    Kv::in_memory()
}
