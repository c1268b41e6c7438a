//! Runtime configuration
//!
//! Read once from the process environment at startup.

use std::env;

use tracing::warn;

/// Default remote storage API base
pub const DEFAULT_API_URL: &str = "https://api.dropboxapi.com/2";

/// Default OAuth token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

/// Runtime name that forbids persistent outbound connections
const EDGE_RUNTIME: &str = "edge";

#[derive(Debug, Clone)]
pub struct Config {
    /// Durable KV connection target
    pub kv_url: Option<String>,
    /// False on runtimes that cannot hold long-lived sockets
    pub persistent_connections: bool,
    pub api_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Refresh credential seeded into KV at startup
    pub refresh_token: Option<String>,
    /// Offset from UTC used for analytics day and hour buckets
    pub tz_offset_minutes: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kv_url: None,
            persistent_connections: true,
            api_url: DEFAULT_API_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            refresh_token: None,
            tz_offset_minutes: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from an arbitrary variable source; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let tz_offset_minutes = match var("CLOUDSHELF_TZ_OFFSET_MINUTES") {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(value = %raw, "Ignoring invalid CLOUDSHELF_TZ_OFFSET_MINUTES");
                0
            }),
            None => 0,
        };

        Self {
            kv_url: var("CLOUDSHELF_KV_URL").or_else(|| var("REDIS_URL")),
            persistent_connections: var("CLOUDSHELF_RUNTIME")
                .map(|runtime| !runtime.trim().eq_ignore_ascii_case(EDGE_RUNTIME))
                .unwrap_or(true),
            api_url: var("CLOUDSHELF_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            token_url: var("CLOUDSHELF_TOKEN_URL").unwrap_or(defaults.token_url),
            client_id: var("CLOUDSHELF_CLIENT_ID").unwrap_or_default(),
            client_secret: var("CLOUDSHELF_CLIENT_SECRET").unwrap_or_default(),
            refresh_token: var("CLOUDSHELF_REFRESH_TOKEN"),
            tz_offset_minutes,
        }
    }
}
