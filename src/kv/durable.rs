//! Durable KV backend
//!
//! Delegates to Redis through a reconnecting connection manager.
//! [`connect`](super::connect) wraps it in [`CachedKv`](super::CachedKv) for
//! the process-local L1.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use super::{KvBackend, KvResult, ZRange};

/// Keys per SCAN round trip
const SCAN_COUNT: u32 = 100;

/// Redis-backed KV store
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect and verify the server answers PING
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        let mut probe = conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut probe).await?;

        info!("Connected to durable KV store");
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvBackend for RedisKv {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.conn().get(key).await?)
    }

    async fn set(&self, key: &str, value: String, ex: Option<u64>) -> KvResult<()> {
        let mut conn = self.conn();
        match ex {
            Some(seconds) => conn.set_ex::<_, _, ()>(key, &value, seconds).await?,
            None => conn.set::<_, _, ()>(key, &value).await?,
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> KvResult<u64> {
        Ok(self.conn().del(keys).await?)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.conn().exists(key).await?)
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        // Explicit MGET: the typed helper switches to GET for a single key
        Ok(redis::cmd("MGET").arg(keys).query_async(&mut self.conn()).await?)
    }

    async fn mset(&self, entries: &[(String, String)]) -> KvResult<()> {
        let _: () = redis::cmd("MSET").arg(entries).query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        Ok(self.conn().incr(key, delta).await?)
    }

    async fn expire(&self, key: &str, seconds: u64) -> KvResult<bool> {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        Ok(self.conn().expire(key, seconds).await?)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        Ok(self.conn().hgetall(key).await?)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<u64> {
        Ok(redis::cmd("HSET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        Ok(self.conn().hget(key, field).await?)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64> {
        Ok(self.conn().hdel(key, fields).await?)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64> {
        Ok(self.conn().sadd(key, members).await?)
    }

    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        Ok(self.conn().srem(key, members).await?)
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        Ok(self.conn().sismember(key, member).await?)
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn scard(&self, key: &str) -> KvResult<u64> {
        Ok(self.conn().scard(key).await?)
    }

    async fn sismember_many(&self, checks: &[(String, String)]) -> KvResult<Vec<bool>> {
        if checks.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for (key, member) in checks {
            pipe.cmd("SISMEMBER").arg(key).arg(member);
        }
        Ok(pipe.query_async(&mut self.conn()).await?)
    }

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> KvResult<u64> {
        Ok(self.conn().zadd_multiple(key, members).await?)
    }

    async fn zrange(&self, key: &str, range: ZRange, rev: bool) -> KvResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = match (range, rev) {
            (ZRange::Index { start, stop }, false) => conn.zrange(key, start, stop).await?,
            (ZRange::Index { start, stop }, true) => conn.zrevrange(key, start, stop).await?,
            (ZRange::Score { min, max }, false) => conn.zrangebyscore(key, min, max).await?,
            (ZRange::Score { min, max }, true) => conn.zrevrangebyscore(key, max, min).await?,
        };
        Ok(members)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        Ok(self.conn().zrembyscore(key, min, max).await?)
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        Ok(self.conn().zcard(key).await?)
    }

    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        Ok(self.conn().zrem(key, members).await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        Ok(self.conn().zscore(key, member).await?)
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        Ok(self.conn().lpush(key, values).await?)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        Ok(self.conn().rpush(key, values).await?)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        Ok(self.conn().lrange(key, start, stop).await?)
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        Ok(self.conn().llen(key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::CachedKv;

    /// Runs against a live server when `REDIS_URL` is set, otherwise skips
    async fn live() -> Option<CachedKv<RedisKv>> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(CachedKv::new(RedisKv::connect(&url).await.ok()?))
    }

    #[tokio::test]
    async fn test_round_trip_against_redis() {
        let Some(kv) = live().await else {
            return;
        };
        let key = format!("cloudshelf:test:{}", uuid::Uuid::new_v4());
        let set_key = format!("{key}:set");

        kv.set(&key, "1".to_string(), Some(60)).await.unwrap();
        assert_eq!(kv.get(&key).await.unwrap(), Some("1".to_string()));
        assert_eq!(kv.incr_by(&key, 2).await.unwrap(), 3);
        assert_eq!(kv.get(&key).await.unwrap(), Some("3".to_string()));

        kv.sadd(&set_key, &["v1".to_string()]).await.unwrap();
        let checks = vec![(set_key.clone(), "v1".to_string()), (set_key.clone(), "v2".to_string())];
        assert_eq!(kv.sismember_many(&checks).await.unwrap(), vec![true, false]);

        kv.del(&[key.clone(), set_key.clone()]).await.unwrap();
        assert_eq!(kv.get(&key).await.unwrap(), None);
        assert!(!kv.sismember(&set_key, "v1").await.unwrap());
    }
}
