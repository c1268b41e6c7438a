//! In-process KV backend
//!
//! Native maps behind one keyspace, with per-key expiry. Expiry is enforced
//! lazily on every access and eagerly by a timer task per key; timers hold a
//! weak reference and never keep the store alive.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use super::pattern::glob_match;
use super::sorted_set::SortedSet;
use super::{KvBackend, KvError, KvResult, ZRange};

enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    ZSet(SortedSet),
    List(VecDeque<String>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::Hash(hash) => hash.is_empty(),
            Value::Set(set) => set.is_empty(),
            Value::ZSet(zset) => zset.is_empty(),
            Value::List(list) => list.is_empty(),
        }
    }
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
    /// Changes whenever the expiry changes; stale timers compare against it
    generation: u64,
}

#[derive(Default)]
struct State {
    slots: HashMap<String, Slot>,
    generation: u64,
}

impl State {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    fn purge_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self
            .slots
            .get(key)
            .is_some_and(|slot| slot.expires_at.is_some_and(|at| now >= at))
        {
            trace!(key = key, "Expired key removed on access");
            self.slots.remove(key);
        }
    }

    /// Live slot for `key`, dropping it first if it has expired
    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        self.purge_expired(key);
        self.slots.get_mut(key)
    }

    fn slot_or_insert(&mut self, key: &str, init: fn() -> Value) -> &mut Slot {
        self.purge_expired(key);
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.generation += 1;
                entry.insert(Slot {
                    value: init(),
                    expires_at: None,
                    generation: self.generation,
                })
            }
        }
    }

    /// Drop a collection key once its last element is gone
    fn drop_if_empty(&mut self, key: &str) {
        if self.slots.get(key).is_some_and(|slot| slot.value.is_empty()) {
            self.slots.remove(key);
        }
    }

    fn write_string(&mut self, key: &str, value: String, ex: Option<u64>) -> KvResult<Option<(u64, Instant)>> {
        let expires_at = ex.map(|seconds| expiry_deadline(key, seconds)).transpose()?;
        let generation = self.next_generation();
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value),
                expires_at,
                generation,
            },
        );
        Ok(expires_at.map(|at| (generation, at)))
    }
}

/// Largest TTL whose deadline still fits a signed millisecond clock, as in Redis
const MAX_EXPIRE_SECS: u64 = i64::MAX as u64 / 1000;

fn expiry_deadline(key: &str, seconds: u64) -> KvResult<Instant> {
    if seconds > MAX_EXPIRE_SECS {
        return Err(KvError::InvalidExpire(key.to_string()));
    }
    Instant::now()
        .checked_add(Duration::from_secs(seconds))
        .ok_or_else(|| KvError::InvalidExpire(key.to_string()))
}

fn wrong_type(key: &str) -> KvError {
    KvError::WrongType(key.to_string())
}

/// Resolve an inclusive Redis-style index range against `len`
fn index_range(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// In-process KV store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryKv {
    state: Arc<Mutex<State>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `key` at `deadline` unless its expiry has changed in between
    fn schedule_expiry(&self, key: &str, generation: u64, deadline: Instant) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        let key = key.to_string();
        handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(state) = weak.upgrade() else {
                return;
            };
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.slots.get(&key).is_some_and(|slot| slot.generation == generation) {
                state.slots.remove(&key);
                trace!(key = %key, "Key expired");
            }
        });
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::Str(value), .. }) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: String, ex: Option<u64>) -> KvResult<()> {
        let scheduled = self.lock().write_string(key, value, ex)?;
        if let Some((generation, deadline)) = scheduled {
            self.schedule_expiry(key, generation, deadline);
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> KvResult<u64> {
        let mut state = self.lock();
        let mut removed = 0;
        for key in keys {
            if state.slot(key).is_some() {
                state.slots.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        Ok(self.lock().slot(key).is_some())
    }

    async fn keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let now = Instant::now();
        let mut state = self.lock();
        state
            .slots
            .retain(|_, slot| slot.expires_at.map_or(true, |at| now < at));
        let mut keys: Vec<String> = state
            .slots
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        let mut state = self.lock();
        Ok(keys
            .iter()
            .map(|key| match state.slot(key) {
                Some(Slot { value: Value::Str(value), .. }) => Some(value.clone()),
                _ => None,
            })
            .collect())
    }

    async fn mset(&self, entries: &[(String, String)]) -> KvResult<()> {
        let mut state = self.lock();
        for (key, value) in entries {
            state.write_string(key, value.clone(), None)?;
        }
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut state = self.lock();
        let slot = state.slot_or_insert(key, || Value::Str("0".to_string()));
        let Value::Str(raw) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        let current: i64 = raw
            .parse()
            .map_err(|_| KvError::NotAnInteger(key.to_string()))?;
        let next = current
            .checked_add(delta)
            .ok_or_else(|| KvError::NotAnInteger(key.to_string()))?;
        *raw = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, seconds: u64) -> KvResult<bool> {
        let scheduled = {
            let mut state = self.lock();
            if state.slot(key).is_none() {
                return Ok(false);
            }
            if seconds == 0 {
                state.slots.remove(key);
                return Ok(true);
            }
            let deadline = expiry_deadline(key, seconds)?;
            let generation = state.next_generation();
            if let Some(slot) = state.slots.get_mut(key) {
                slot.expires_at = Some(deadline);
                slot.generation = generation;
            }
            (generation, deadline)
        };
        self.schedule_expiry(key, scheduled.0, scheduled.1);
        Ok(true)
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(HashMap::new()),
            Some(Slot { value: Value::Hash(hash), .. }) => Ok(hash.clone()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<u64> {
        let mut state = self.lock();
        let slot = state.slot_or_insert(key, || Value::Hash(HashMap::new()));
        let Value::Hash(hash) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        let mut created = 0;
        for (field, value) in fields {
            if hash.insert(field.clone(), value.clone()).is_none() {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::Hash(hash), .. }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> KvResult<u64> {
        let mut state = self.lock();
        let removed = match state.slot(key) {
            None => return Ok(0),
            Some(Slot { value: Value::Hash(hash), .. }) => {
                fields.iter().filter(|field| hash.remove(*field).is_some()).count() as u64
            }
            Some(_) => return Err(wrong_type(key)),
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn sadd(&self, key: &str, members: &[String]) -> KvResult<u64> {
        let mut state = self.lock();
        let slot = state.slot_or_insert(key, || Value::Set(HashSet::new()));
        let Value::Set(set) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        Ok(members.iter().filter(|member| set.insert((*member).clone())).count() as u64)
    }

    async fn srem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        let mut state = self.lock();
        let removed = match state.slot(key) {
            None => return Ok(0),
            Some(Slot { value: Value::Set(set), .. }) => {
                members.iter().filter(|member| set.remove(*member)).count() as u64
            }
            Some(_) => return Err(wrong_type(key)),
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(false),
            Some(Slot { value: Value::Set(set), .. }) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn smembers(&self, key: &str) -> KvResult<Vec<String>> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(Vec::new()),
            Some(Slot { value: Value::Set(set), .. }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scard(&self, key: &str) -> KvResult<u64> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(0),
            Some(Slot { value: Value::Set(set), .. }) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn sismember_many(&self, checks: &[(String, String)]) -> KvResult<Vec<bool>> {
        let mut state = self.lock();
        checks
            .iter()
            .map(|(key, member)| match state.slot(key) {
                None => Ok(false),
                Some(Slot { value: Value::Set(set), .. }) => Ok(set.contains(member)),
                Some(_) => Err(wrong_type(key)),
            })
            .collect()
    }

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> KvResult<u64> {
        let mut state = self.lock();
        let slot = state.slot_or_insert(key, || Value::ZSet(SortedSet::new()));
        let Value::ZSet(zset) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        Ok(members
            .iter()
            .filter(|(score, member)| zset.insert(member, *score))
            .count() as u64)
    }

    async fn zrange(&self, key: &str, range: ZRange, rev: bool) -> KvResult<Vec<String>> {
        let mut state = self.lock();
        let zset = match state.slot(key) {
            None => return Ok(Vec::new()),
            Some(Slot { value: Value::ZSet(zset), .. }) => zset,
            Some(_) => return Err(wrong_type(key)),
        };

        let members: Vec<String> = match range {
            ZRange::Index { start, stop } => {
                let Some((from, to)) = index_range(start, stop, zset.len()) else {
                    return Ok(Vec::new());
                };
                let ordered: Vec<&str> = if rev {
                    zset.members().rev().collect()
                } else {
                    zset.members().collect()
                };
                ordered[from..=to].iter().map(|m| m.to_string()).collect()
            }
            ZRange::Score { min, max } => {
                let mut hits: Vec<String> = zset
                    .range_by_score(min, max)
                    .into_iter()
                    .map(String::from)
                    .collect();
                if rev {
                    hits.reverse();
                }
                hits
            }
        };
        Ok(members)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        let mut state = self.lock();
        let removed = match state.slot(key) {
            None => return Ok(0),
            Some(Slot { value: Value::ZSet(zset), .. }) => zset.remove_range_by_score(min, max),
            Some(_) => return Err(wrong_type(key)),
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(0),
            Some(Slot { value: Value::ZSet(zset), .. }) => Ok(zset.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn zrem(&self, key: &str, members: &[String]) -> KvResult<u64> {
        let mut state = self.lock();
        let removed = match state.slot(key) {
            None => return Ok(0),
            Some(Slot { value: Value::ZSet(zset), .. }) => {
                members.iter().filter(|member| zset.remove(member)).count() as u64
            }
            Some(_) => return Err(wrong_type(key)),
        };
        state.drop_if_empty(key);
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(None),
            Some(Slot { value: Value::ZSet(zset), .. }) => Ok(zset.score(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn lpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        let mut state = self.lock();
        let slot = state.slot_or_insert(key, || Value::List(VecDeque::new()));
        let Value::List(list) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        for value in values {
            list.push_front(value.clone());
        }
        Ok(list.len() as u64)
    }

    async fn rpush(&self, key: &str, values: &[String]) -> KvResult<u64> {
        let mut state = self.lock();
        let slot = state.slot_or_insert(key, || Value::List(VecDeque::new()));
        let Value::List(list) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        list.extend(values.iter().cloned());
        Ok(list.len() as u64)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(Vec::new()),
            Some(Slot { value: Value::List(list), .. }) => Ok(match index_range(start, stop, list.len()) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        let mut state = self.lock();
        match state.slot(key) {
            None => Ok(0),
            Some(Slot { value: Value::List(list), .. }) => Ok(list.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
