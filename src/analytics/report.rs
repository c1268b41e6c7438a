//! Time-windowed analytics queries
//!
//! Overview numbers come straight from the per-day counters. Hourly, page,
//! device and referrer breakdowns scan score ranges of the sorted sets and
//! skip any member that fails to parse.

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::tracker::AnalyticsAggregator;
use super::{
    bandwidth_key, views_key, visitors_key, DeviceTuple, PageTuple, PageViewEvent, ReferrerTuple,
    ACTIVE_KEY, ACTIVE_WINDOW_MS, DAY_MS, DEVICES_KEY, EVENTS_KEY, PAGES_KEY, REFERRERS_KEY,
    REPORT_WINDOW_DAYS, TOP_N,
};
use crate::kv::{KvResult, ZRange};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub views_today: u64,
    pub views_yesterday: u64,
    pub views_week: u64,
    pub views_month: u64,
    pub visitors_today: u64,
    pub visitors_yesterday: u64,
    pub visitors_week: u64,
    pub visitors_month: u64,
    pub bandwidth_today: u64,
    pub bandwidth_yesterday: u64,
    pub bandwidth_week: u64,
    pub bandwidth_month: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyBucket {
    pub hour: u32,
    pub views: u64,
    pub visitors: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPoint {
    pub date: String,
    pub views: u64,
    pub visitors: u64,
    pub bandwidth: u64,
}

/// One ranked entry: a page path, browser, OS, device class or referrer host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBreakdown {
    pub browsers: Vec<Tally>,
    pub os: Vec<Tally>,
    pub devices: Vec<Tally>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub overview: Overview,
    pub active_now: u64,
    /// 24 buckets for today, local hours 0..=23
    pub hourly: Vec<HourlyBucket>,
    /// Oldest day first, today last
    pub daily: Vec<DailyPoint>,
    pub popular_pages: Vec<Tally>,
    pub devices: DeviceBreakdown,
    pub referrers: Vec<Tally>,
    /// Epoch ms the report was computed at
    pub generated_at: i64,
}

/// Sort descending by count, ties by name, and keep the top N
fn rank(counts: HashMap<String, u64>) -> Vec<Tally> {
    let mut ranked: Vec<Tally> = counts
        .into_iter()
        .map(|(name, count)| Tally { name, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    ranked.truncate(TOP_N);
    ranked
}

/// Parse sorted-set members, dropping the ones that are not valid records
fn parse_members<T: DeserializeOwned>(key: &str, members: Vec<String>) -> Vec<T> {
    members
        .into_iter()
        .filter_map(|raw| match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(key = key, error = %e, "Skipping malformed analytics record");
                None
            }
        })
        .collect()
}

fn sum(values: &[u64]) -> u64 {
    values.iter().sum()
}

impl AnalyticsAggregator {
    /// Full dashboard report at the current clock time
    pub async fn get_analytics_data(&self) -> KvResult<AnalyticsReport> {
        let now = self.clock.now_ms();
        let window_start = (now - REPORT_WINDOW_DAYS * DAY_MS) as f64;

        let (overview, daily) = self.daily_counters(now).await?;
        let active_now = self.active_now(now).await?;
        let hourly = self.hourly(now).await?;

        let pages: Vec<PageTuple> = self.window(PAGES_KEY, window_start, now).await?;
        let mut page_counts = HashMap::new();
        for page in pages {
            *page_counts.entry(page.path).or_insert(0) += 1;
        }

        let devices: Vec<DeviceTuple> = self.window(DEVICES_KEY, window_start, now).await?;
        let (mut browsers, mut systems, mut classes) = (HashMap::new(), HashMap::new(), HashMap::new());
        for device in devices {
            *browsers.entry(device.browser).or_insert(0) += 1;
            *systems.entry(device.os).or_insert(0) += 1;
            *classes.entry(device.device).or_insert(0) += 1;
        }

        let referrers: Vec<ReferrerTuple> = self.window(REFERRERS_KEY, window_start, now).await?;
        let mut sources = HashMap::new();
        for referrer in referrers {
            *sources.entry(referrer.source).or_insert(0) += 1;
        }

        Ok(AnalyticsReport {
            overview,
            active_now,
            hourly,
            daily,
            popular_pages: rank(page_counts),
            devices: DeviceBreakdown {
                browsers: rank(browsers),
                os: rank(systems),
                devices: rank(classes),
            },
            referrers: rank(sources),
            generated_at: now,
        })
    }

    async fn window<T: DeserializeOwned>(&self, key: &str, start: f64, now: i64) -> KvResult<Vec<T>> {
        let members = self
            .kv
            .zrange(key, ZRange::by_score(start, now as f64), false)
            .await?;
        Ok(parse_members(key, members))
    }

    /// Overview totals plus the per-day series over the report window
    async fn daily_counters(&self, now: i64) -> KvResult<(Overview, Vec<DailyPoint>)> {
        // index 0 is today, index i is i days ago
        let days: Vec<String> = (0..REPORT_WINDOW_DAYS)
            .map(|i| self.day_of(now - i * DAY_MS))
            .collect();

        let views = self.counters(&days, views_key).await?;
        let visitors = self.counters(&days, visitors_key).await?;
        let bandwidth = self.counters(&days, bandwidth_key).await?;

        let overview = Overview {
            views_today: views[0],
            views_yesterday: views[1],
            views_week: sum(&views[..7]),
            views_month: sum(&views),
            visitors_today: visitors[0],
            visitors_yesterday: visitors[1],
            visitors_week: sum(&visitors[..7]),
            visitors_month: sum(&visitors),
            bandwidth_today: bandwidth[0],
            bandwidth_yesterday: bandwidth[1],
            bandwidth_week: sum(&bandwidth[..7]),
            bandwidth_month: sum(&bandwidth),
        };

        let daily = days
            .into_iter()
            .enumerate()
            .rev()
            .map(|(i, date)| DailyPoint {
                date,
                views: views[i],
                visitors: visitors[i],
                bandwidth: bandwidth[i],
            })
            .collect();

        Ok((overview, daily))
    }

    /// One counter per day; missing or unreadable counters read as 0
    async fn counters(&self, days: &[String], key_of: fn(&str) -> String) -> KvResult<Vec<u64>> {
        let keys: Vec<String> = days.iter().map(|day| key_of(day)).collect();
        let values: Vec<Option<u64>> = self.kv.mget(&keys).await?;
        Ok(values.into_iter().map(Option::unwrap_or_default).collect())
    }

    /// Distinct visitors seen within the active window
    async fn active_now(&self, now: i64) -> KvResult<u64> {
        let recent = self
            .kv
            .zrange(ACTIVE_KEY, ZRange::by_score((now - ACTIVE_WINDOW_MS) as f64, now as f64), false)
            .await?;
        Ok(recent.len() as u64)
    }

    /// Today's events bucketed by local hour
    async fn hourly(&self, now: i64) -> KvResult<Vec<HourlyBucket>> {
        let today_start = self.start_of_day(now) as f64;
        let events: Vec<PageViewEvent> = self.window(EVENTS_KEY, today_start, now).await?;

        let mut buckets: Vec<HourlyBucket> = (0..24)
            .map(|hour| HourlyBucket {
                hour,
                ..HourlyBucket::default()
            })
            .collect();
        let mut seen: Vec<HashSet<String>> = vec![HashSet::new(); 24];

        for event in events {
            let hour = self.hour_of(event.timestamp) as usize;
            buckets[hour].views += 1;
            if seen[hour].insert(event.visitor_id) {
                buckets[hour].visitors += 1;
            }
        }

        Ok(buckets)
    }
}
