//! Event ingestion

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::agent::{classify, referrer_source, visitor_id};
use super::{
    bandwidth_key, views_key, visitor_set_key, visitors_key, DeviceTuple, PageTuple, PageViewEvent,
    ReferrerTuple, ACTIVE_KEY, ACTIVE_WINDOW_MS, DAY_MS, DEVICES_KEY, EVENTS_KEY, PAGES_KEY,
    REFERRERS_KEY, RETENTION_DAYS, RETENTION_SECS, VISITOR_SET_TTL_SECS,
};
use crate::clock::{Clock, SystemClock};
use crate::kv::{Kv, KvResult};

/// Request facts needed to record a page view
#[derive(Debug, Clone, Default)]
pub struct PageView {
    pub path: String,
    pub ip: String,
    pub user_agent: String,
    pub referrer: Option<String>,
}

#[derive(Clone)]
pub struct AnalyticsAggregator {
    pub(super) kv: Kv,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) offset: FixedOffset,
}

impl AnalyticsAggregator {
    /// Aggregator on the system clock with day boundaries at `tz_offset_minutes` from UTC
    pub fn new(kv: Kv, tz_offset_minutes: i32) -> Self {
        Self::with_clock(kv, Arc::new(SystemClock), tz_offset_minutes)
    }

    pub fn with_clock(kv: Kv, clock: Arc<dyn Clock>, tz_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(tz_offset_minutes.saturating_mul(60)).unwrap_or_else(|| {
            warn!(tz_offset_minutes, "Timezone offset out of range, using UTC");
            Utc.fix()
        });
        Self { kv, clock, offset }
    }

    pub(super) fn local_time(&self, ms: i64) -> DateTime<FixedOffset> {
        DateTime::<Utc>::from_timestamp_millis(ms)
            .unwrap_or_default()
            .with_timezone(&self.offset)
    }

    /// Local calendar day, `YYYY-MM-DD`
    pub(super) fn day_of(&self, ms: i64) -> String {
        self.local_time(ms).format("%Y-%m-%d").to_string()
    }

    pub(super) fn hour_of(&self, ms: i64) -> u32 {
        self.local_time(ms).hour()
    }

    /// Epoch ms of the local midnight that starts the day containing `ms`
    pub(super) fn start_of_day(&self, ms: i64) -> i64 {
        let offset_ms = i64::from(self.offset.local_minus_utc()) * 1000;
        let local = ms + offset_ms;
        local - local.rem_euclid(DAY_MS) - offset_ms
    }

    /// Record a page view. Failures are logged and never reach the caller.
    pub async fn track_page_view(&self, view: PageView) {
        let path = view.path.clone();
        if let Err(e) = self.try_track_page_view(view).await {
            warn!(path = %path, error = %e, "Failed to record page view");
        }
    }

    /// Detached variant for request handlers
    pub fn spawn_track_page_view(&self, view: PageView) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.track_page_view(view).await })
    }

    /// Record a page view, surfacing KV errors
    pub async fn try_track_page_view(&self, view: PageView) -> KvResult<PageViewEvent> {
        let now = self.clock.now_ms();
        let score = now as f64;
        let day = self.day_of(now);
        let agent = classify(&view.user_agent);

        let event = PageViewEvent {
            id: Uuid::new_v4().to_string(),
            visitor_id: visitor_id(&view.ip, &view.user_agent),
            timestamp: now,
            browser: agent.browser.to_string(),
            os: agent.os.to_string(),
            device: agent.device.to_string(),
            path: view.path,
            ip: view.ip,
            user_agent: view.user_agent,
            referrer: view.referrer.filter(|r| !r.trim().is_empty()),
        };

        let views = views_key(&day);
        self.kv.incr(&views).await?;
        self.kv.expire(&views, RETENTION_SECS).await?;

        let visitor_set = visitor_set_key(&day);
        self.kv.sadd(&visitor_set, &[event.visitor_id.as_str()]).await?;
        self.kv.expire(&visitor_set, VISITOR_SET_TTL_SECS).await?;
        let unique = self.kv.scard(&visitor_set).await?;
        self.kv.set(&visitors_key(&day), &unique, Some(RETENTION_SECS)).await?;

        self.kv
            .zadd(EVENTS_KEY, score, &serde_json::to_string(&event)?)
            .await?;

        let page = PageTuple {
            id: event.id.clone(),
            path: event.path.clone(),
            day: day.clone(),
        };
        self.kv.zadd(PAGES_KEY, score, &serde_json::to_string(&page)?).await?;

        let device = DeviceTuple {
            id: event.id.clone(),
            browser: event.browser.clone(),
            os: event.os.clone(),
            device: event.device.clone(),
            day: day.clone(),
        };
        self.kv.zadd(DEVICES_KEY, score, &serde_json::to_string(&device)?).await?;

        if let Some(source) = event.referrer.as_deref().and_then(referrer_source) {
            let referrer = ReferrerTuple {
                id: event.id.clone(),
                source,
                day: day.clone(),
            };
            self.kv
                .zadd(REFERRERS_KEY, score, &serde_json::to_string(&referrer)?)
                .await?;
        }

        self.kv.zadd(ACTIVE_KEY, score, &event.visitor_id).await?;

        self.prune(now).await?;

        debug!(path = %event.path, visitor = %event.visitor_id, day = %day, "Recorded page view");
        Ok(event)
    }

    /// Add served bytes to today's counter. Failures are logged only.
    pub async fn track_bandwidth(&self, bytes: u64) {
        if let Err(e) = self.try_track_bandwidth(bytes).await {
            warn!(bytes, error = %e, "Failed to record bandwidth");
        }
    }

    pub async fn try_track_bandwidth(&self, bytes: u64) -> KvResult<i64> {
        let key = bandwidth_key(&self.day_of(self.clock.now_ms()));
        let delta = i64::try_from(bytes).unwrap_or(i64::MAX);
        let total = self.kv.incr_by(&key, delta).await?;
        self.kv.expire(&key, RETENTION_SECS).await?;
        Ok(total)
    }

    /// Drop sorted-set members older than the retention window and
    /// visitors idle longer than the active window
    async fn prune(&self, now: i64) -> KvResult<()> {
        let cutoff = (now - RETENTION_DAYS * DAY_MS) as f64;
        let mut removed = 0;
        for key in [EVENTS_KEY, PAGES_KEY, DEVICES_KEY, REFERRERS_KEY] {
            removed += self.kv.zremrangebyscore(key, 0.0, cutoff).await?;
        }
        let idle = self
            .kv
            .zremrangebyscore(ACTIVE_KEY, 0.0, (now - ACTIVE_WINDOW_MS) as f64)
            .await?;
        if removed > 0 || idle > 0 {
            debug!(removed, idle, "Pruned analytics sorted sets");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::TimeZone;

    const UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn noon() -> i64 {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap().timestamp_millis()
    }

    fn aggregator(kv: &Kv, clock: &Arc<FixedClock>) -> AnalyticsAggregator {
        AnalyticsAggregator::with_clock(kv.clone(), clock.clone(), 0)
    }

    fn view(path: &str, ip: &str) -> PageView {
        PageView {
            path: path.to_string(),
            ip: ip.to_string(),
            user_agent: UA.to_string(),
            referrer: Some("https://www.google.com/".to_string()),
        }
    }

    #[test]
    fn test_day_boundaries_follow_offset() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(0));
        let utc = AnalyticsAggregator::with_clock(kv.clone(), clock.clone(), 0);
        let tokyo = AnalyticsAggregator::with_clock(kv.clone(), clock.clone(), 9 * 60);
        let new_york = AnalyticsAggregator::with_clock(kv, clock, -5 * 60);

        let late = Utc.with_ymd_and_hms(2024, 3, 15, 20, 30, 0).unwrap().timestamp_millis();
        assert_eq!(utc.day_of(late), "2024-03-15");
        assert_eq!(tokyo.day_of(late), "2024-03-16");
        assert_eq!(tokyo.hour_of(late), 5);
        assert_eq!(new_york.hour_of(late), 15);

        let tokyo_midnight = Utc.with_ymd_and_hms(2024, 3, 15, 15, 0, 0).unwrap().timestamp_millis();
        assert_eq!(tokyo.start_of_day(late), tokyo_midnight);
        assert_eq!(utc.start_of_day(late), late - (20 * 60 + 30) * 60 * 1000);
    }

    #[tokio::test]
    async fn test_same_identity_counts_once() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(noon()));
        let analytics = aggregator(&kv, &clock);

        analytics.track_page_view(view("/", "203.0.113.7")).await;
        analytics.track_page_view(view("/docs", "203.0.113.7")).await;
        assert_eq!(kv.get::<u64>("analytics:visitors:2024-03-15").await.unwrap(), Some(1));

        analytics.track_page_view(view("/", "198.51.100.4")).await;
        assert_eq!(kv.get::<u64>("analytics:visitors:2024-03-15").await.unwrap(), Some(2));
        assert_eq!(kv.get::<u64>("analytics:views:2024-03-15").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_event_written_to_every_set() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(noon()));
        let analytics = aggregator(&kv, &clock);

        let event = analytics.try_track_page_view(view("/docs", "203.0.113.7")).await.unwrap();
        assert_eq!(event.browser, "Chrome");
        assert_eq!(event.timestamp, noon());

        assert_eq!(kv.zcard(EVENTS_KEY).await.unwrap(), 1);
        assert_eq!(kv.zcard(PAGES_KEY).await.unwrap(), 1);
        assert_eq!(kv.zcard(DEVICES_KEY).await.unwrap(), 1);
        assert_eq!(kv.zcard(REFERRERS_KEY).await.unwrap(), 1);
        assert_eq!(kv.zscore(ACTIVE_KEY, &event.visitor_id).await.unwrap(), Some(noon() as f64));

        // identical views on the same day remain distinct members
        analytics.track_page_view(view("/docs", "203.0.113.7")).await;
        assert_eq!(kv.zcard(PAGES_KEY).await.unwrap(), 2);
        assert_eq!(kv.zcard(ACTIVE_KEY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_blank_referrer_skips_referrer_set() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(noon()));
        let analytics = aggregator(&kv, &clock);

        let mut direct = view("/", "203.0.113.7");
        direct.referrer = Some(" ".to_string());
        let event = analytics.try_track_page_view(direct).await.unwrap();
        assert_eq!(event.referrer, None);
        assert_eq!(kv.zcard(REFERRERS_KEY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_prunes_past_retention() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(noon()));
        let analytics = aggregator(&kv, &clock);

        analytics.track_page_view(view("/old", "203.0.113.7")).await;
        clock.advance_ms(RETENTION_DAYS * DAY_MS);
        // exactly at the cutoff: pruned
        analytics.track_page_view(view("/new", "198.51.100.4")).await;

        let remaining = kv.zrange(EVENTS_KEY, crate::kv::ZRange::all(), false).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].contains("/new"));
        assert_eq!(kv.zcard(PAGES_KEY).await.unwrap(), 1);
        assert_eq!(kv.zcard(ACTIVE_KEY).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingestion_failure_is_swallowed() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(noon()));
        let analytics = aggregator(&kv, &clock);
        kv.sadd("analytics:views:2024-03-15", &["not-a-counter"]).await.unwrap();

        analytics.track_page_view(view("/", "203.0.113.7")).await;
        assert!(analytics.try_track_page_view(view("/", "203.0.113.7")).await.is_err());
        assert_eq!(kv.zcard(EVENTS_KEY).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_tracking_completes() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(noon()));
        let analytics = aggregator(&kv, &clock);

        analytics.spawn_track_page_view(view("/", "203.0.113.7")).await.unwrap();
        assert_eq!(kv.get::<u64>("analytics:views:2024-03-15").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_bandwidth_accumulates_per_day() {
        let kv = Kv::in_memory();
        let clock = Arc::new(FixedClock::new(noon()));
        let analytics = aggregator(&kv, &clock);

        analytics.track_bandwidth(1_000).await;
        assert_eq!(analytics.try_track_bandwidth(500).await.unwrap(), 1_500);
        clock.advance_ms(DAY_MS);
        analytics.track_bandwidth(42).await;

        assert_eq!(kv.get::<u64>("analytics:bandwidth:2024-03-15").await.unwrap(), Some(1_500));
        assert_eq!(kv.get::<u64>("analytics:bandwidth:2024-03-16").await.unwrap(), Some(42));
    }
}
