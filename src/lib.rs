//! cloudshelf - caching and resilient API layer for a cloud file browser
//!
//! A backend-agnostic KV store (Redis or in-process), a process-local
//! LRU/TTL/stale-while-revalidate cache, bearer-token lifecycle, a retrying
//! HTTP client and page-view analytics built on KV sorted sets.

pub mod analytics;
pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod kv;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use context::AppContext;
