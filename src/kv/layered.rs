//! L1 memory layer over a KV backend
//!
//! Reads of strings, hashes and set membership are served from a
//! process-local [`MemoryCache`] first. Every local write refreshes or drops
//! the affected L1 entries, and a read-through fill is discarded when a write
//! to the same key landed while the read was in flight, so L1 never serves
//! anything older than this process's last completed write.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{KvBackend, KvResult, ZRange};
use crate::cache::MemoryCache;

/// Upper bound on how long L1 keeps a value read from the backend
pub const L1_TTL: Duration = Duration::from_secs(30);

/// Write-stamp stripes; keys sharing a stripe only cost each other fills
const STAMP_STRIPES: usize = 64;

#[derive(Debug, Clone, PartialEq)]
enum L1Value {
    Str(String),
    Hash(HashMap<String, String>),
    Member(bool),
}

fn value_key(key: &str) -> String {
    format!("kv:v:{key}")
}

fn hash_key(key: &str) -> String {
    format!("kv:h:{key}")
}

// Length-prefixed so neither the key nor the member can contain the separator
fn member_prefix(key: &str) -> String {
    format!("kv:m:{}:{key}:", key.len())
}

fn member_key(key: &str, member: &str) -> String {
    format!("{}{member}", member_prefix(key))
}

fn l1_ttl(ex: Option<u64>) -> Duration {
    match ex {
        Some(seconds) => L1_TTL.min(Duration::from_secs(seconds)),
        None => L1_TTL,
    }
}

/// Backend wrapped with an L1 memory cache
pub struct CachedKv<B> {
    inner: B,
    l1: MemoryCache<L1Value>,
    /// Per-stripe count of completed writes. Held while L1 is touched so a
    /// fill and a write to the same key never interleave.
    stamps: [Mutex<u64>; STAMP_STRIPES],
}

impl<B: KvBackend> CachedKv<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            l1: MemoryCache::new(),
            stamps: std::array::from_fn(|_| Mutex::new(0)),
        }
    }

    fn stripe(&self, key: &str) -> MutexGuard<'_, u64> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % STAMP_STRIPES as u64) as usize;
        self.stamps[index].lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamp to take before reading `key` from the backend
    fn read_stamp(&self, key: &str) -> u64 {
        *self.stripe(key)
    }

    /// Fill L1 with a value read from the backend, unless `key` was written since `stamp`
    fn fill(&self, key: &str, stamp: u64, l1_key: &str, value: L1Value) -> bool {
        let current = self.stripe(key);
        if *current != stamp {
            trace!(key = key, "Write raced the read, skipping L1 fill");
            return false;
        }
        trace!(key = key, "Populating L1 from backend");
        self.l1.set(l1_key, value, L1_TTL);
        true
    }

    /// Record a completed write to `key` and apply its effect on L1
    fn wrote(&self, key: &str, apply: impl FnOnce(&MemoryCache<L1Value>)) {
        let mut stamp = self.stripe(key);
        *stamp = stamp.wrapping_add(1);
        apply(&self.l1);
    }

    /// Drop every L1 view of `key`
    fn invalidate(l1: &MemoryCache<L1Value>, key: &str) {
        l1.delete(&value_key(key));
        l1.delete(&hash_key(key));
        l1.delete_by_prefix(&member_prefix(key));
    }
}

#[async_trait]
impl<B: KvBackend> KvBackend for CachedKv<B> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let l1_key = value_key(key);
        if let Some(L1Value::Str(value)) = self.l1.get(&l1_key) {
            return Ok(Some(value));
        }

        let stamp = self.read_stamp(key);
        let value = self.inner.get(key).await?;
        if let Some(value) = &value {
            self.fill(key, stamp, &l1_key, L1Value::Str(value.clone()));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ex: Option<u64>) -> KvResult<()> {
        self.inner.set(key, value.clone(), ex).await?;
        self.wrote(key, |l1| {
            Self::invalidate(l1, key);
            l1.set(&value_key(key), L1Value::Str(value), l1_ttl(ex));
        });
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> KvResult<u64> {
        let removed = self.inner.del(keys).await?;
        for key in keys {
            self.wrote(key, |l1| Self::invalidate(l1, key));
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        self.inner.exists(key).await
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.inner.keys(pattern).await
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        self.inner.mget(keys).await
    }

    async fn mset(&self, entries: &[(String, String)]) -> KvResult<()> {
        self.inner.mset(entries).await?;
        for (key, value) in entries {
            self.wrote(key, |l1| {
                Self::invalidate(l1, key);
                l1.set(&value_key(key), L1Value::Str(value.clone()), L1_TTL);
            });
        }
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        let value = self.inner.incr_by(key, delta).await?;
        self.wrote(key, |l1| {
            l1.delete(&value_key(key));
        });
        Ok(value)
    }

    async fn expire(&self, key: &str, seconds: u64) -> KvResult<bool> {
        let applied = self.inner.expire(key, seconds).await?;
        self.wrote(key, |l1| Self::invalidate(l1, key));
        Ok(applied)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let l1_key = hash_key(key);
        if let Some(L1Value::Hash(hash)) = self.l1.get(&l1_key) {
            return Ok(hash);
        }

        let stamp = self.read_stamp(key);
        let hash = self.inner.hgetall(key).await?;
        if !hash.is_empty() {
            self.fill(key, stamp, &l1_key, L1Value::Hash(hash.clone()));
        }
        Ok(hash)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<u64> {
        let created = self.inner.hset(key, fields).await?;
        self.wrote(key, |l1| {
            l1.delete(&hash_key(key));
        });
        Ok(created)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64> {
        let removed = self.inner.hdel(key, fields).await?;
        self.wrote(key, |l1| {
            l1.delete(&hash_key(key));
        });
        Ok(removed)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64> {
        let added = self.inner.sadd(key, members).await?;
        self.wrote(key, |l1| {
            for member in members {
                l1.set(&member_key(key, member), L1Value::Member(true), L1_TTL);
            }
        });
        Ok(added)
    }

    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        let removed = self.inner.srem(key, members).await?;
        self.wrote(key, |l1| {
            for member in members {
                l1.delete(&member_key(key, member));
            }
        });
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        let l1_key = member_key(key, member);
        if let Some(L1Value::Member(present)) = self.l1.get(&l1_key) {
            return Ok(present);
        }

        let stamp = self.read_stamp(key);
        let present = self.inner.sismember(key, member).await?;
        self.fill(key, stamp, &l1_key, L1Value::Member(present));
        Ok(present)
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn scard(&self, key: &str) -> KvResult<u64> {
        self.inner.scard(key).await
    }

    async fn sismember_many(&self, checks: &[(String, String)]) -> KvResult<Vec<bool>> {
        let mut results: Vec<Option<bool>> = checks
            .iter()
            .map(|(key, member)| match self.l1.get(&member_key(key, member)) {
                Some(L1Value::Member(present)) => Some(present),
                _ => None,
            })
            .collect();

        let pending: Vec<usize> = (0..checks.len()).filter(|&i| results[i].is_none()).collect();
        if !pending.is_empty() {
            let stamps: Vec<u64> = pending.iter().map(|&i| self.read_stamp(&checks[i].0)).collect();
            let batch: Vec<(String, String)> = pending.iter().map(|&i| checks[i].clone()).collect();
            let fetched = self.inner.sismember_many(&batch).await?;

            for ((&i, stamp), present) in pending.iter().zip(stamps).zip(fetched) {
                let (key, member) = &checks[i];
                self.fill(key, stamp, &member_key(key, member), L1Value::Member(present));
                results[i] = Some(present);
            }
        }

        Ok(results.into_iter().map(|present| present.unwrap_or(false)).collect())
    }

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> KvResult<u64> {
        self.inner.zadd(key, members).await
    }

    async fn zrange(&self, key: &str, range: ZRange, rev: bool) -> KvResult<Vec<String>> {
        self.inner.zrange(key, range, rev).await
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.inner.zremrangebyscore(key, min, max).await
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        self.inner.zcard(key).await
    }

    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        self.inner.zrem(key, members).await
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        self.inner.zscore(key, member).await
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        self.inner.lpush(key, values).await
    }

    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        self.inner.rpush(key, values).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        self.inner.llen(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn s(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    /// L1 over an in-process store, plus a handle that writes behind L1's back
    fn layered() -> (CachedKv<MemoryKv>, MemoryKv) {
        let backend = MemoryKv::new();
        (CachedKv::new(backend.clone()), backend)
    }

    #[test]
    fn test_member_keys_are_unambiguous() {
        assert_ne!(
            member_key("analytics:visitors_set", "2024-03-15:v1"),
            member_key("analytics:visitors_set:2024-03-15", "v1")
        );
        assert_ne!(member_key("a:b", "c"), member_key("a", "b:c"));
        assert!(member_key("visitors", "v1").starts_with(&member_prefix("visitors")));
        assert!(!member_key("a:b", "c").starts_with(&member_prefix("a")));
        assert!(!member_key("ab", "c").starts_with(&member_prefix("a")));
    }

    #[test]
    fn test_l1_namespaces_are_disjoint() {
        assert_ne!(value_key("a"), hash_key("a"));
        assert!(!value_key("a").starts_with(&member_prefix("a")));
    }

    #[test]
    fn test_l1_ttl_never_outlives_key() {
        assert_eq!(l1_ttl(None), L1_TTL);
        assert_eq!(l1_ttl(Some(5)), Duration::from_secs(5));
        assert_eq!(l1_ttl(Some(3600)), L1_TTL);
    }

    #[tokio::test]
    async fn test_round_trip_through_l1() {
        let (kv, _) = layered();
        kv.set("k", "1".to_string(), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("1".to_string()));

        kv.hset("h", &[("f".to_string(), "v".to_string())]).await.unwrap();
        assert_eq!(kv.hgetall("h").await.unwrap().get("f"), Some(&"v".to_string()));

        kv.sadd("set", &s(&["a"])).await.unwrap();
        assert!(kv.sismember("set", "a").await.unwrap());
        assert!(!kv.sismember("set", "b").await.unwrap());
        assert_eq!(kv.name(), "memory");
    }

    #[tokio::test]
    async fn test_reads_fill_l1() {
        let (kv, backend) = layered();
        backend.set("k", "1".to_string(), None).await.unwrap();
        backend.sadd("set", &s(&["a"])).await.unwrap();

        assert_eq!(kv.get("k").await.unwrap(), Some("1".to_string()));
        assert!(kv.sismember("set", "a").await.unwrap());

        // Served from L1 even though the backend changed underneath
        backend.set("k", "2".to_string(), None).await.unwrap();
        backend.srem("set", &s(&["a"])).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("1".to_string()));
        assert!(kv.sismember("set", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_writes_refresh_or_invalidate_l1() {
        let (kv, backend) = layered();

        kv.set("k", "1".to_string(), None).await.unwrap();
        kv.set("k", "2".to_string(), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("2".to_string()));

        kv.incr_by("k", 3).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("5".to_string()));

        kv.mset(&[("k".to_string(), "9".to_string())]).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some("9".to_string()));

        kv.del(&s(&["k"])).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);

        kv.hset("h", &[("f".to_string(), "1".to_string())]).await.unwrap();
        assert_eq!(kv.hgetall("h").await.unwrap().len(), 1);
        kv.hset("h", &[("g".to_string(), "2".to_string())]).await.unwrap();
        assert_eq!(kv.hgetall("h").await.unwrap().len(), 2);
        kv.hdel("h", &s(&["f"])).await.unwrap();
        assert_eq!(kv.hgetall("h").await.unwrap().len(), 1);

        assert!(!kv.sismember("set", "a").await.unwrap());
        kv.sadd("set", &s(&["a"])).await.unwrap();
        assert!(kv.sismember("set", "a").await.unwrap());
        kv.srem("set", &s(&["a"])).await.unwrap();
        assert!(!kv.sismember("set", "a").await.unwrap());

        // expire drops cached views; the backend is consulted again
        kv.sadd("set", &s(&["b"])).await.unwrap();
        assert!(kv.sismember("set", "b").await.unwrap());
        backend.srem("set", &s(&["b"])).await.unwrap();
        backend.sadd("set", &s(&["c"])).await.unwrap();
        kv.expire("set", 60).await.unwrap();
        assert!(!kv.sismember("set", "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalidation_stays_within_key() {
        let (kv, backend) = layered();
        kv.sadd("a:b", &s(&["c"])).await.unwrap();
        kv.sadd("a", &s(&["b:c"])).await.unwrap();
        assert!(kv.sismember("a:b", "c").await.unwrap());
        assert!(!kv.sismember("a:b", "x").await.unwrap());

        // Cross-key lookups never share an L1 slot
        backend.srem("a", &s(&["b:c"])).await.unwrap();
        kv.del(&s(&["a"])).await.unwrap();
        assert!(!kv.sismember("a", "b:c").await.unwrap());
        assert!(kv.sismember("a:b", "c").await.unwrap());

        // Still cached for "a:b" after "a" was dropped
        backend.srem("a:b", &s(&["c"])).await.unwrap();
        assert!(kv.sismember("a:b", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_sismember_many_mixes_l1_and_backend() {
        let (kv, backend) = layered();
        kv.sadd("day:1", &s(&["v1"])).await.unwrap();
        backend.sadd("day:2", &s(&["v1"])).await.unwrap();

        let checks = vec![
            ("day:1".to_string(), "v1".to_string()),
            ("day:2".to_string(), "v1".to_string()),
            ("day".to_string(), "2:v1".to_string()),
        ];
        assert_eq!(kv.sismember_many(&checks).await.unwrap(), vec![true, true, false]);

        // The backend answers are now in L1
        backend.srem("day:2", &s(&["v1"])).await.unwrap();
        assert_eq!(kv.sismember_many(&checks).await.unwrap(), vec![true, true, false]);
    }

    #[tokio::test]
    async fn test_fill_after_racing_write_is_discarded() {
        let (kv, backend) = layered();
        backend.set("auth:access_token", "old".to_string(), None).await.unwrap();

        // A reader takes its stamp and reads "old" from the backend
        let stamp = kv.read_stamp("auth:access_token");
        let read = backend.get("auth:access_token").await.unwrap().unwrap();

        // A local delete completes before the reader fills L1
        kv.del(&s(&["auth:access_token"])).await.unwrap();
        assert!(!kv.fill(
            "auth:access_token",
            stamp,
            &value_key("auth:access_token"),
            L1Value::Str(read)
        ));
        assert_eq!(kv.get("auth:access_token").await.unwrap(), None);

        // Same for a racing overwrite
        let stamp = kv.read_stamp("k");
        kv.set("k", "new".to_string(), None).await.unwrap();
        assert!(!kv.fill("k", stamp, &value_key("k"), L1Value::Str("old".to_string())));
        assert_eq!(kv.get("k").await.unwrap(), Some("new".to_string()));

        // Without a racing write the fill lands
        let stamp = kv.read_stamp("quiet");
        assert!(kv.fill("quiet", stamp, &value_key("quiet"), L1Value::Str("x".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_l1_entry_expires_with_key() {
        let (kv, _) = layered();
        kv.set("short", "1".to_string(), Some(1)).await.unwrap();
        assert_eq!(kv.l1.get(&value_key("short")), Some(L1Value::Str("1".to_string())));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(kv.l1.get(&value_key("short")), None);
        assert_eq!(kv.get("short").await.unwrap(), None);
    }
}
