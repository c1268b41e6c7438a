//! Page-view and bandwidth analytics on KV primitives
//!
//! Per-day counters hold views, unique visitors and bytes served. Raw events
//! and lightweight per-dimension tuples go into sorted sets scored by
//! timestamp in milliseconds, pruned past the retention window on every write.

mod agent;
mod report;
mod tracker;

use serde::{Deserialize, Serialize};

pub use agent::{classify, referrer_source, visitor_id, UserAgentInfo};
pub use report::{AnalyticsReport, DailyPoint, DeviceBreakdown, HourlyBucket, Overview, Tally};
pub use tracker::{AnalyticsAggregator, PageView};

pub const RETENTION_DAYS: i64 = 90;

/// Window for the "active now" count
pub const ACTIVE_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Window scanned for pages, devices, referrers and the daily series
pub const REPORT_WINDOW_DAYS: i64 = 30;

/// Entries kept in each ranked list
pub const TOP_N: usize = 10;

pub(crate) const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Per-day unique-visitor sets only back the day's count
pub(crate) const VISITOR_SET_TTL_SECS: u64 = 48 * 60 * 60;

pub(crate) const RETENTION_SECS: u64 = RETENTION_DAYS as u64 * 24 * 60 * 60;

pub(crate) const EVENTS_KEY: &str = "analytics:events";
pub(crate) const PAGES_KEY: &str = "analytics:pages";
pub(crate) const DEVICES_KEY: &str = "analytics:devices";
pub(crate) const REFERRERS_KEY: &str = "analytics:referrers";
pub(crate) const ACTIVE_KEY: &str = "analytics:active";

pub(crate) fn views_key(day: &str) -> String {
    format!("analytics:views:{}", day)
}

pub(crate) fn visitors_key(day: &str) -> String {
    format!("analytics:visitors:{}", day)
}

pub(crate) fn visitor_set_key(day: &str) -> String {
    format!("analytics:visitors_set:{}", day)
}

pub(crate) fn bandwidth_key(day: &str) -> String {
    format!("analytics:bandwidth:{}", day)
}

/// One recorded page view. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewEvent {
    pub id: String,
    pub path: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub visitor_id: String,
    pub ip: String,
    pub user_agent: String,
    #[serde(default)]
    pub referrer: Option<String>,
    pub browser: String,
    pub os: String,
    pub device: String,
}

// Tuples carry the event id so two identical views on one day stay
// distinct sorted-set members.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PageTuple {
    pub id: String,
    pub path: String,
    pub day: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DeviceTuple {
    pub id: String,
    pub browser: String,
    pub os: String,
    pub device: String,
    pub day: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReferrerTuple {
    pub id: String,
    pub source: String,
    pub day: String,
}
