//! Application context
//!
//! Built once at startup and shared by every request. Tests construct a
//! fresh context per case instead of relying on globals.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::analytics::AnalyticsAggregator;
use crate::api::{HttpTransport, ReqwestTransport, ResilientFetcher, StorageClient, TokenManager};
use crate::cache::MemoryCache;
use crate::config::Config;
use crate::kv::{self, Kv};

/// How long a computed analytics report is served
const REPORT_TTL: Duration = Duration::from_secs(60);

/// Trailing part of `REPORT_TTL` during which a read triggers a background recompute
const REPORT_SWR: Duration = Duration::from_secs(30);

const REPORT_CACHE_KEY: &str = "analytics:report";

/// Shared services. Cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub kv: Kv,
    /// Process-local cache for computed values (reports, rendered listings)
    pub cache: MemoryCache<serde_json::Value>,
    pub tokens: TokenManager,
    pub fetcher: ResilientFetcher,
    pub storage: StorageClient,
    pub analytics: AnalyticsAggregator,
}

impl AppContext {
    /// Connect the KV backend and wire every service to it
    pub async fn from_config(config: &Config) -> Result<Self> {
        let kv = kv::connect(config).await;
        let transport: Arc<dyn HttpTransport> =
            Arc::new(ReqwestTransport::new().context("Failed to build HTTP transport")?);
        let ctx = Self::with_parts(config, kv, transport);

        if let Some(refresh_token) = &config.refresh_token {
            if !ctx.tokens.is_connected().await {
                match ctx.tokens.store_refresh_token(refresh_token).await {
                    Ok(()) => info!("Seeded refresh credential from environment"),
                    Err(e) => warn!(error = %e, "Failed to seed refresh credential"),
                }
            }
        }

        Ok(ctx)
    }

    /// Wire services onto an existing KV handle and transport
    pub fn with_parts(config: &Config, kv: Kv, transport: Arc<dyn HttpTransport>) -> Self {
        let tokens = TokenManager::new(
            kv.clone(),
            Arc::clone(&transport),
            config.token_url.as_str(),
            config.client_id.as_str(),
            config.client_secret.as_str(),
        );
        let fetcher = ResilientFetcher::new(transport, tokens.clone());
        let storage = StorageClient::new(fetcher.clone(), kv.clone(), config.api_url.as_str());
        let analytics = AnalyticsAggregator::new(kv.clone(), config.tz_offset_minutes);

        Self {
            kv,
            cache: MemoryCache::new(),
            tokens,
            fetcher,
            storage,
            analytics,
        }
    }

    /// Analytics report as JSON, recomputed in the background once stale
    pub async fn analytics_report(&self) -> Result<serde_json::Value> {
        let analytics = self.analytics.clone();
        self.cache
            .get_with_swr(
                REPORT_CACHE_KEY,
                move || async move {
                    let report = analytics.get_analytics_data().await?;
                    Ok(serde_json::to_value(report)?)
                },
                REPORT_TTL,
                REPORT_SWR,
            )
            .await
    }
}
