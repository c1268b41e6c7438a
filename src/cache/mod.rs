//! Process-local caching layer
//!
//! An LRU + TTL + stale-while-revalidate cache shared by the KV durable
//! backend (as its L1) and any caller that wants to memoize computed values.

pub mod memory;

pub use memory::{CacheEntry, CacheStats, MemoryCache};
