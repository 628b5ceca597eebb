// =============================================================================
// Bar Aggregator — one base feed, every timeframe
// =============================================================================
//
// Each incoming 1-minute bar (possibly an in-progress revision of the current
// minute) is folded into the open bucket of every timeframe for its symbol.
//
// Per open bucket we keep two pieces:
//   * `settled`  — the merge of every earlier source minute in the bucket;
//   * `current`  — the latest revision of the newest source minute.
// A redelivery of the newest minute replaces `current`; a newer minute first
// folds `current` into `settled`. The published bar is always
// `settled ⊕ current`, which makes redelivery idempotent for volume as well
// as for high/low.
//
// Buckets only move forward. A bar whose bucket starts before the open one,
// or an older minute inside the open bucket, is stale and dropped. A bar
// stamped further ahead of the local clock than the allowed skew is invalid:
// accepting it would mark every later real bar stale.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::market_data::calendar::SessionCalendar;
use crate::stats::FeedStats;
use crate::types::{Bar, BarUpdate, Timeframe};

const DEFAULT_MAX_FUTURE_SKEW: Duration = Duration::from_secs(300);

/// Combine two consecutive bars: `earlier` precedes `later` in time.
fn merge(earlier: &Bar, later: &Bar) -> Bar {
    Bar {
        time: earlier.time,
        open: earlier.open,
        high: earlier.high.max(later.high),
        low: earlier.low.min(later.low),
        close: later.close,
        volume: earlier.volume + later.volume,
    }
}

#[derive(Debug, Clone)]
struct OpenBucket {
    start: i64,
    settled: Option<Bar>,
    current: Bar,
}

impl OpenBucket {
    fn seed(start: i64, source: &Bar) -> Self {
        Self {
            start,
            settled: None,
            current: *source,
        }
    }

    /// The bar as published for this bucket.
    fn bar(&self) -> Bar {
        let mut bar = match &self.settled {
            Some(settled) => merge(settled, &self.current),
            None => self.current,
        };
        bar.time = self.start;
        bar
    }

    fn source_time(&self) -> i64 {
        self.current.time
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    SameBucket,
    NextBucket,
    Stale,
}

/// Owns the aggregation state of every (symbol, timeframe). Not shared: the
/// pipeline task is its only caller.
pub struct BarAggregator {
    calendar: SessionCalendar,
    open: HashMap<(String, Timeframe), OpenBucket>,
    max_future_skew: i64,
    stats: Arc<FeedStats>,
}

impl BarAggregator {
    pub fn new(calendar: SessionCalendar, stats: Arc<FeedStats>) -> Self {
        Self {
            calendar,
            open: HashMap::new(),
            max_future_skew: DEFAULT_MAX_FUTURE_SKEW.as_secs() as i64,
            stats,
        }
    }

    pub fn with_max_future_skew(mut self, skew: Duration) -> Self {
        self.max_future_skew = i64::try_from(skew.as_secs()).unwrap_or(i64::MAX);
        self
    }

    /// Fold one base bar into every timeframe for `symbol` and return the
    /// updates to publish, in timeframe order. A finalized bar for a
    /// timeframe always precedes the new open bar of that timeframe.
    pub fn ingest(&mut self, symbol: &str, source: &Bar) -> Vec<BarUpdate> {
        if let Err(e) = source.validate() {
            warn!(symbol = %symbol, error = %e, "dropping invalid base bar");
            self.stats.record_invalid_bar();
            return Vec::new();
        }
        let horizon = Utc::now().timestamp().saturating_add(self.max_future_skew);
        if source.time > horizon {
            warn!(
                symbol = %symbol,
                bar_time = source.time,
                horizon,
                "dropping base bar stamped in the future"
            );
            self.stats.record_invalid_bar();
            return Vec::new();
        }

        let mut updates = Vec::with_capacity(Timeframe::ALL.len() + 1);
        let mut stale = false;

        for timeframe in Timeframe::ALL {
            let start = self.calendar.bucket_start(timeframe, source.time);
            let key = (symbol.to_string(), timeframe);

            let Some(bucket) = self.open.get_mut(&key) else {
                let bucket = OpenBucket::seed(start, source);
                updates.push(update(symbol, timeframe, bucket.bar(), false));
                self.open.insert(key, bucket);
                continue;
            };

            match place(bucket, start, source.time) {
                Placement::SameBucket => {
                    if source.time > bucket.source_time() {
                        bucket.settled = Some(match &bucket.settled {
                            Some(settled) => merge(settled, &bucket.current),
                            None => bucket.current,
                        });
                    }
                    bucket.current = *source;
                    updates.push(update(symbol, timeframe, bucket.bar(), false));
                }
                Placement::NextBucket => {
                    updates.push(update(symbol, timeframe, bucket.bar(), true));
                    *bucket = OpenBucket::seed(start, source);
                    updates.push(update(symbol, timeframe, bucket.bar(), false));
                }
                Placement::Stale => {
                    debug!(
                        symbol = %symbol,
                        timeframe = %timeframe,
                        bar_time = source.time,
                        open_bucket = bucket.start,
                        "stale bar dropped"
                    );
                    stale = true;
                }
            }
        }

        if stale {
            self.stats.record_stale_bar();
        }
        updates
    }

    /// Current open bar for a series, if any.
    #[cfg(test)]
    pub fn open_bar(&self, symbol: &str, timeframe: Timeframe) -> Option<Bar> {
        self.open
            .get(&(symbol.to_string(), timeframe))
            .map(OpenBucket::bar)
    }
}

fn place(bucket: &OpenBucket, start: i64, source_time: i64) -> Placement {
    if start > bucket.start {
        Placement::NextBucket
    } else if start < bucket.start || source_time < bucket.source_time() {
        Placement::Stale
    } else {
        Placement::SameBucket
    }
}

fn update(symbol: &str, timeframe: Timeframe, bar: Bar, is_final: bool) -> BarUpdate {
    BarUpdate {
        symbol: symbol.to_string(),
        timeframe,
        bar,
        is_final,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap().timestamp()
    }

    fn for_timeframe(updates: &[BarUpdate], timeframe: Timeframe) -> Vec<&BarUpdate> {
        updates.iter().filter(|u| u.timeframe == timeframe).collect()
    }

    /// Exactly one final bar at `closed` followed by one open bar at `opened`.
    fn assert_rolled(updates: &[BarUpdate], timeframe: Timeframe, closed: i64, opened: i64) {
        let rolled = for_timeframe(updates, timeframe);
        assert_eq!(rolled.len(), 2, "{timeframe}");
        assert!(rolled[0].is_final, "{timeframe}");
        assert_eq!(rolled[0].bar.time, closed, "{timeframe}");
        assert!(!rolled[1].is_final, "{timeframe}");
        assert_eq!(rolled[1].bar.time, opened, "{timeframe}");
    }

    fn assert_still_open(updates: &[BarUpdate], timeframe: Timeframe) {
        let open = for_timeframe(updates, timeframe);
        assert_eq!(open.len(), 1, "{timeframe}");
        assert!(!open[0].is_final, "{timeframe}");
    }

    fn flat(time: i64, price: f64, volume: f64) -> Bar {
        Bar::new(time, price, price, price, price, volume)
    }

    fn aggregator() -> BarAggregator {
        BarAggregator::new(SessionCalendar::utc(), Arc::new(FeedStats::new()))
    }

    fn last_for(updates: &[BarUpdate], timeframe: Timeframe) -> &BarUpdate {
        updates
            .iter()
            .rev()
            .find(|u| u.timeframe == timeframe)
            .expect("update for timeframe")
    }

    #[test]
    fn five_minutes_make_one_five_minute_bar() {
        let mut agg = aggregator();
        let closes = [100.0, 101.0, 99.0, 102.0, 103.0];
        for (i, close) in closes.iter().enumerate() {
            agg.ingest("MNQ", &flat(i as i64 * 60, *close, 10.0));
        }

        let bar = agg.open_bar("MNQ", Timeframe::M5).unwrap();
        assert_eq!(bar.time, 0);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 103.0);
        assert_eq!(bar.low, 99.0);
        assert_eq!(bar.close, 103.0);
        assert_eq!(bar.volume, 50.0);
    }

    #[test]
    fn merge_takes_extremes_from_highs_and_lows() {
        let mut agg = aggregator();
        let bars = [
            Bar::new(0, 10.0, 12.0, 9.0, 11.0, 1.0),
            Bar::new(60, 11.0, 15.0, 10.0, 14.0, 2.0),
            Bar::new(120, 14.0, 14.5, 7.5, 8.0, 3.0),
            Bar::new(180, 8.0, 9.0, 8.0, 8.5, 4.0),
            Bar::new(240, 8.5, 10.0, 8.25, 9.5, 5.0),
        ];
        for bar in &bars {
            agg.ingest("ES", bar);
        }
        let m5 = agg.open_bar("ES", Timeframe::M5).unwrap();
        assert_eq!(m5, Bar::new(0, 10.0, 15.0, 7.5, 9.5, 15.0));
    }

    #[test]
    fn redelivery_replaces_instead_of_adding() {
        let mut agg = aggregator();
        agg.ingest("MNQ", &flat(0, 100.0, 10.0));
        agg.ingest("MNQ", &flat(60, 101.0, 10.0));
        // Same minute again, revised upward.
        agg.ingest("MNQ", &Bar::new(60, 101.0, 106.0, 101.0, 105.0, 25.0));
        // Exact duplicate.
        agg.ingest("MNQ", &Bar::new(60, 101.0, 106.0, 101.0, 105.0, 25.0));

        let m5 = agg.open_bar("MNQ", Timeframe::M5).unwrap();
        assert_eq!(m5.volume, 35.0);
        assert_eq!(m5.high, 106.0);
        assert_eq!(m5.close, 105.0);
        assert_eq!(m5.open, 100.0);
    }

    #[test]
    fn downward_revision_does_not_keep_stale_high() {
        let mut agg = aggregator();
        agg.ingest("MNQ", &Bar::new(0, 100.0, 110.0, 100.0, 109.0, 5.0));
        agg.ingest("MNQ", &Bar::new(0, 100.0, 104.0, 100.0, 103.0, 6.0));
        let m5 = agg.open_bar("MNQ", Timeframe::M5).unwrap();
        assert_eq!(m5.high, 104.0);
        assert_eq!(m5.volume, 6.0);
    }

    #[test]
    fn bucket_rollover_finalizes_previous_bar() {
        let mut agg = aggregator();
        for i in 0..5 {
            agg.ingest("MNQ", &flat(i * 60, 100.0 + i as f64, 1.0));
        }
        let updates = agg.ingest("MNQ", &flat(300, 200.0, 7.0));

        let m5: Vec<&BarUpdate> = updates
            .iter()
            .filter(|u| u.timeframe == Timeframe::M5)
            .collect();
        assert_eq!(m5.len(), 2);
        assert!(m5[0].is_final);
        assert_eq!(m5[0].bar.time, 0);
        assert_eq!(m5[0].bar.volume, 5.0);
        assert!(!m5[1].is_final);
        assert_eq!(m5[1].bar, Bar::new(300, 200.0, 200.0, 200.0, 200.0, 7.0));

        // 15m did not roll over.
        let m15 = last_for(&updates, Timeframe::M15);
        assert!(!m15.is_final);
        assert_eq!(m15.bar.volume, 12.0);
    }

    #[test]
    fn stale_bucket_is_dropped_and_counted() {
        let stats = Arc::new(FeedStats::new());
        let mut agg = BarAggregator::new(SessionCalendar::utc(), stats.clone());
        agg.ingest("MNQ", &flat(600, 100.0, 1.0));
        let before = agg.open_bar("MNQ", Timeframe::M5).unwrap();

        let updates = agg.ingest("MNQ", &flat(240, 50.0, 99.0));
        assert!(updates.iter().all(|u| u.timeframe != Timeframe::M5));
        assert_eq!(agg.open_bar("MNQ", Timeframe::M5).unwrap(), before);
        assert_eq!(stats.snapshot().stale_bars_dropped, 1);
    }

    #[test]
    fn older_minute_inside_open_bucket_is_stale() {
        let mut agg = aggregator();
        agg.ingest("MNQ", &flat(0, 100.0, 1.0));
        agg.ingest("MNQ", &flat(120, 102.0, 1.0));
        let before = agg.open_bar("MNQ", Timeframe::M5).unwrap();
        agg.ingest("MNQ", &flat(60, 50.0, 1.0));
        assert_eq!(agg.open_bar("MNQ", Timeframe::M5).unwrap(), before);
    }

    #[test]
    fn gaps_are_not_filled() {
        let mut agg = aggregator();
        agg.ingest("MNQ", &flat(0, 100.0, 1.0));
        // Nothing for an hour.
        let updates = agg.ingest("MNQ", &flat(3_600, 101.0, 1.0));
        let m5: Vec<&BarUpdate> = updates
            .iter()
            .filter(|u| u.timeframe == Timeframe::M5)
            .collect();
        // One final + one new open; no synthetic bars in between.
        assert_eq!(m5.len(), 2);
        assert_eq!(m5[0].bar.time, 0);
        assert_eq!(m5[1].bar.time, 3_600);
    }

    #[test]
    fn every_timeframe_gets_an_update() {
        let mut agg = aggregator();
        let updates = agg.ingest("MNQ", &flat(1_710_000_000, 100.0, 1.0));
        for tf in Timeframe::ALL {
            assert!(updates.iter().any(|u| u.timeframe == tf), "{tf}");
        }
    }

    #[test]
    fn symbols_are_independent() {
        let mut agg = aggregator();
        agg.ingest("A", &flat(600, 1.0, 1.0));
        let updates = agg.ingest("B", &flat(0, 2.0, 1.0));
        assert_eq!(updates.len(), Timeframe::ALL.len());
        assert_eq!(agg.open_bar("A", Timeframe::M5).unwrap().time, 600);
        assert_eq!(agg.open_bar("B", Timeframe::M5).unwrap().time, 0);
    }

    #[test]
    fn invalid_bar_is_rejected() {
        let stats = Arc::new(FeedStats::new());
        let mut agg = BarAggregator::new(SessionCalendar::utc(), stats.clone());
        let updates = agg.ingest("MNQ", &Bar::new(0, 10.0, 9.0, 8.0, 10.0, 1.0));
        assert!(updates.is_empty());
        assert_eq!(stats.snapshot().invalid_bars_dropped, 1);
    }

    #[test]
    fn midnight_closes_the_day_only() {
        let mut agg = aggregator();
        // Wednesday into Thursday.
        agg.ingest("MNQ", &flat(ts(2024, 3, 13, 23, 59), 100.0, 1.0));
        let updates = agg.ingest("MNQ", &flat(ts(2024, 3, 14, 0, 0), 101.0, 2.0));

        assert_rolled(&updates, Timeframe::D1, ts(2024, 3, 13, 0, 0), ts(2024, 3, 14, 0, 0));
        assert_still_open(&updates, Timeframe::W1);
        assert_still_open(&updates, Timeframe::MN1);
        assert_eq!(for_timeframe(&updates, Timeframe::W1)[0].bar.volume, 3.0);
    }

    #[test]
    fn monday_closes_the_week() {
        let mut agg = aggregator();
        // Sunday 2024-03-10 into Monday 2024-03-11.
        agg.ingest("MNQ", &flat(ts(2024, 3, 10, 23, 59), 100.0, 1.0));
        let updates = agg.ingest("MNQ", &flat(ts(2024, 3, 11, 0, 0), 101.0, 2.0));

        assert_rolled(&updates, Timeframe::W1, ts(2024, 3, 4, 0, 0), ts(2024, 3, 11, 0, 0));
        assert_rolled(&updates, Timeframe::D1, ts(2024, 3, 10, 0, 0), ts(2024, 3, 11, 0, 0));
        assert_still_open(&updates, Timeframe::MN1);
    }

    #[test]
    fn first_of_month_closes_the_month() {
        let mut agg = aggregator();
        // Thursday 2024-02-29 into Friday 2024-03-01.
        agg.ingest("MNQ", &flat(ts(2024, 2, 29, 23, 59), 100.0, 1.0));
        let updates = agg.ingest("MNQ", &flat(ts(2024, 3, 1, 0, 0), 101.0, 2.0));

        assert_rolled(&updates, Timeframe::MN1, ts(2024, 2, 1, 0, 0), ts(2024, 3, 1, 0, 0));
        assert_rolled(&updates, Timeframe::D1, ts(2024, 2, 29, 0, 0), ts(2024, 3, 1, 0, 0));
        assert_still_open(&updates, Timeframe::W1);
        let closed = for_timeframe(&updates, Timeframe::MN1)[0];
        assert_eq!(closed.bar.volume, 1.0);
    }

    #[test]
    fn month_rolls_at_evening_session_open() {
        let calendar = SessionCalendar::from_name("America/Chicago", 17).unwrap();
        let mut agg = BarAggregator::new(calendar, Arc::new(FeedStats::new()));
        // 16:59 CDT on Sunday 2024-03-31 is March; the 17:00 open trades for April 1.
        // Every calendar day has a session, so March 31 opened Saturday evening.
        agg.ingest("MNQ", &flat(ts(2024, 3, 31, 21, 59), 100.0, 1.0));
        let updates = agg.ingest("MNQ", &flat(ts(2024, 3, 31, 22, 0), 101.0, 2.0));

        let april_open = ts(2024, 3, 31, 22, 0);
        assert_rolled(&updates, Timeframe::MN1, ts(2024, 2, 29, 23, 0), april_open);
        assert_rolled(&updates, Timeframe::W1, ts(2024, 3, 24, 22, 0), april_open);
        assert_rolled(&updates, Timeframe::D1, ts(2024, 3, 30, 22, 0), april_open);
    }

    #[test]
    fn future_stamped_bar_does_not_block_later_bars() {
        let stats = Arc::new(FeedStats::new());
        let mut agg = BarAggregator::new(SessionCalendar::utc(), stats.clone());

        // Milliseconds where seconds were expected.
        let updates = agg.ingest("MNQ", &flat(1_710_000_000_000, 100.0, 1.0));
        assert!(updates.is_empty());
        assert_eq!(stats.snapshot().invalid_bars_dropped, 1);

        let mut published = 0;
        for i in 1..=60 {
            published += agg.ingest("MNQ", &flat(1_710_000_000 + i * 60, 100.0, 1.0)).len();
        }
        assert!(published >= 60 * Timeframe::ALL.len());
        assert_eq!(stats.snapshot().stale_bars_dropped, 0);
        assert_eq!(agg.open_bar("MNQ", Timeframe::M1).unwrap().time, 1_710_003_600);
    }

    #[test]
    fn skew_allows_bars_slightly_ahead_of_the_clock() {
        let mut agg = aggregator().with_max_future_skew(Duration::from_secs(120));
        let now = Utc::now().timestamp();
        assert!(!agg.ingest("MNQ", &flat(now + 60, 100.0, 1.0)).is_empty());
        assert!(agg.ingest("MNQ", &flat(now + 3_600, 100.0, 1.0)).is_empty());
    }

    #[test]
    fn out_of_range_time_is_rejected_without_panicking() {
        let stats = Arc::new(FeedStats::new());
        let mut agg = BarAggregator::new(SessionCalendar::utc(), stats.clone());
        assert!(agg.ingest("MNQ", &flat(i64::MIN, 100.0, 1.0)).is_empty());
        assert_eq!(stats.snapshot().invalid_bars_dropped, 1);
    }
}
