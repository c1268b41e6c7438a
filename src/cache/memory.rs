//! Process-local memory cache
//!
//! LRU + TTL cache with stale-while-revalidate support. Used directly for
//! computed values and as the L1 layer in front of the durable KV backend.
//! State lives behind a short-lived mutex that is never held across an await.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Entry ceiling before LRU eviction kicks in
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Interval of the background sweep for hard-expired entries
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Fraction of the ceiling evicted at once (1/10)
const EVICTION_DIVISOR: usize = 10;

/// Stand-in for "never" when a TTL does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A cached value with its freshness window and access bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    /// Hard expiry; never served past this point
    pub expires: Instant,
    /// Soft expiry; past this point a SWR read triggers revalidation
    pub stale_at: Instant,
    pub access_count: u64,
    /// Logical access tick, higher is more recent
    pub last_access: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }

    fn is_stale(&self, now: Instant) -> bool {
        now > self.stale_at
    }
}

/// Snapshot of the diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub size: usize,
}

struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Keys with a revalidation in flight, with the tick that started it.
    /// Deleting a key drops its ticket so the late result is discarded.
    revalidating: HashMap<String, u64>,
    tick: u64,
}

impl<V> State<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

struct Inner<V> {
    state: Mutex<State<V>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
}

impl<V> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, entry| !entry.is_expired(now));
        before - state.entries.len()
    }
}

/// Shared handle to a memory cache; clones refer to the same entries
pub struct MemoryCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for MemoryCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with the default ceiling of 1000 entries
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Create a cache with a custom entry ceiling
    ///
    /// When called inside a tokio runtime a background sweep is started. The
    /// sweep only holds a weak reference and ends once the last handle drops.
    pub fn with_capacity(max_entries: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                entries: HashMap::new(),
                revalidating: HashMap::new(),
                tick: 0,
            }),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        });
        spawn_sweeper(&inner);
        Self { inner }
    }

    /// Get a value, or None on miss or hard expiry
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut state = self.inner.lock();
        let tick = state.next_tick();

        let expired = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_access = tick;
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key = key, "Memory cache HIT");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            state.entries.remove(key);
        }
        self.inner.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key = key, expired = expired, "Memory cache MISS");
        None
    }

    /// Store a value that is fresh for its whole TTL
    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        self.set_with_swr(key, value, ttl, Duration::ZERO);
    }

    /// Store a value whose last `swr` of its TTL is a stale window
    pub fn set_with_swr(&self, key: &str, value: V, ttl: Duration, swr: Duration) {
        let mut state = self.inner.lock();
        self.insert(&mut state, key, value, ttl, swr);
    }

    fn insert(&self, state: &mut State<V>, key: &str, value: V, ttl: Duration, swr: Duration) {
        let now = Instant::now();
        if !state.entries.contains_key(key) && state.entries.len() >= self.inner.max_entries {
            self.evict_lru(state);
        }

        let tick = state.next_tick();
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires: deadline(now, ttl),
                stale_at: deadline(now, ttl.saturating_sub(swr)),
                access_count: 0,
                last_access: tick,
            },
        );
        self.inner.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether a live entry exists; does not count as an access
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Remove one entry, returning whether it existed
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.inner.lock();
        state.revalidating.remove(key);
        state.entries.remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`
    pub fn delete_by_prefix(&self, prefix: &str) -> usize {
        let mut state = self.inner.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        state.revalidating.retain(|key, _| !key.starts_with(prefix));
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(prefix = prefix, removed = removed, "Invalidated memory cache prefix");
        }
        removed
    }

    /// Drop all entries and reset counters
    pub fn clear(&self) {
        {
            let mut state = self.inner.lock();
            state.entries.clear();
            state.revalidating.clear();
        }
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        self.inner.sets.store(0, Ordering::Relaxed);
        self.inner.evictions.store(0, Ordering::Relaxed);
        debug!("Cleared memory cache");
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove hard-expired entries now instead of waiting for the sweep
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            sets: self.inner.sets.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            size: self.len(),
        }
    }

    /// Cache-aside read: on miss, call `fetcher` once and store its result
    pub async fn get_or_set<F, Fut>(&self, key: &str, fetcher: F, ttl: Duration) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = fetcher().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Stale-while-revalidate read
    ///
    /// A live entry is returned immediately. If it is past its soft expiry a
    /// detached revalidation is started (at most one per key at a time); its
    /// failure is logged and the current entry is kept. A missing or hard
    /// expired entry is fetched synchronously.
    pub async fn get_with_swr<F, Fut>(
        &self,
        key: &str,
        fetcher: F,
        ttl: Duration,
        swr: Duration,
    ) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let now = Instant::now();
        let cached = {
            let mut guard = self.inner.lock();
            let state = &mut *guard;
            let tick = state.next_tick();
            match state.entries.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.access_count += 1;
                    entry.last_access = tick;
                    let stale = entry.is_stale(now);
                    let value = entry.value.clone();
                    let ticket = (stale && !state.revalidating.contains_key(key)).then(|| {
                        state.revalidating.insert(key.to_string(), tick);
                        tick
                    });
                    Some((value, ticket))
                }
                _ => None,
            }
        };

        match cached {
            Some((value, ticket)) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                if let Some(ticket) = ticket {
                    self.spawn_revalidation(key.to_string(), ticket, fetcher, ttl, swr);
                }
                Ok(value)
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                let value = fetcher().await?;
                self.set_with_swr(key, value.clone(), ttl, swr);
                Ok(value)
            }
        }
    }

    fn spawn_revalidation<F, Fut>(&self, key: String, ticket: u64, fetcher: F, ttl: Duration, swr: Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let cache = self.clone();
        debug!(key = %key, "Revalidating stale cache entry");
        tokio::spawn(async move {
            let result = fetcher().await;
            let mut state = cache.inner.lock();
            if state.revalidating.get(&key) != Some(&ticket) {
                debug!(key = %key, "Entry deleted during revalidation, dropping result");
                return;
            }
            state.revalidating.remove(&key);
            match result {
                Ok(value) => cache.insert(&mut state, &key, value, ttl, swr),
                Err(e) => warn!(key = %key, error = %e, "Background revalidation failed"),
            }
        });
    }

    /// Evict the least recently used tenth of the ceiling
    fn evict_lru(&self, state: &mut State<V>) {
        let count = (self.inner.max_entries / EVICTION_DIVISOR).max(1);

        let mut by_access: Vec<(u64, String)> = state
            .entries
            .iter()
            .map(|(key, entry)| (entry.last_access, key.clone()))
            .collect();
        by_access.sort_unstable();

        for (_, key) in by_access.into_iter().take(count) {
            state.entries.remove(&key);
        }

        self.inner.evictions.fetch_add(count as u64, Ordering::Relaxed);
        debug!(evicted = count, "Memory cache full, evicted LRU entries");
    }
}

impl<V> Default for MemoryCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_sweeper<V>(inner: &Arc<Inner<V>>)
where
    V: Send + Sync + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        debug!("No tokio runtime, memory cache sweep disabled");
        return;
    };

    let weak = Arc::downgrade(inner);
    handle.spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let removed = inner.sweep_expired();
            if removed > 0 {
                debug!(removed = removed, "Swept expired memory cache entries");
            }
        }
    });
}
