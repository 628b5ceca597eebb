// =============================================================================
// Timeframe Cache — per-(symbol, timeframe) bar series with fetch-on-miss
// =============================================================================
//
// Reads are served from memory once a key has been loaded from history.
// A miss goes through the REST token bucket to the historical source, and
// concurrent misses for the same key share one in-flight fetch. The fetch
// itself runs on its own task, so a reader that gives up does not cancel it
// for the others.
//
// The aggregation pipeline is the only writer of series tails
// (`apply_update`). History seeds a key at most once per successful load.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::provider::{HistoricalSource, TokenBucket};
use crate::stats::FeedStats;
use crate::types::{Bar, BarUpdate, SeriesKey, Timeframe};

type PendingLoad = Shared<BoxFuture<'static, Result<(), FeedError>>>;

#[derive(Debug, Default)]
struct Series {
    bars: VecDeque<Bar>,
    /// Seeded from history. Keys that only ever saw live bars still miss.
    loaded: bool,
}

impl Series {
    fn tail(&self, count: usize) -> Vec<Bar> {
        let start = self.bars.len().saturating_sub(count);
        self.bars.iter().skip(start).copied().collect()
    }
}

/// What the cache holds for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeriesStats {
    pub bars_loaded: usize,
    pub loaded: bool,
    /// Bucket time of the newest bar.
    pub last_update: Option<i64>,
}

pub struct TimeframeCache {
    series: RwLock<HashMap<SeriesKey, Series>>,
    inflight: Mutex<HashMap<SeriesKey, PendingLoad>>,
    capacity: usize,
    limiter: Arc<TokenBucket>,
    acquire_timeout: Duration,
    source: Arc<dyn HistoricalSource>,
    stats: Arc<FeedStats>,
}

impl TimeframeCache {
    pub fn new(
        capacity: usize,
        limiter: Arc<TokenBucket>,
        acquire_timeout: Duration,
        source: Arc<dyn HistoricalSource>,
        stats: Arc<FeedStats>,
    ) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            limiter,
            acquire_timeout,
            source,
            stats,
        }
    }

    /// The most recent `count` bars for the key, ascending by time.
    pub async fn get(
        self: &Arc<Self>,
        symbol: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Bar>, FeedError> {
        if count == 0 {
            return Err(FeedError::InvalidArgument("count must be positive".into()));
        }
        let key = SeriesKey::new(symbol, timeframe);

        let pending = {
            // Checked under the in-flight lock so a load cannot finish between
            // the read and joining it. Each read counts as exactly one hit or miss.
            let mut inflight = self.inflight.lock();
            if let Some(bars) = self.read_loaded(&key, count) {
                self.stats.record_cache_hit();
                return Ok(bars);
            }
            self.stats.record_cache_miss();
            match inflight.get(&key) {
                Some(pending) => {
                    debug!(key = %key, "joining in-flight history fetch");
                    pending.clone()
                }
                None => {
                    let pending = self.start_load(key.clone(), count.min(self.capacity));
                    inflight.insert(key.clone(), pending.clone());
                    pending
                }
            }
        };

        pending.await?;

        self.read_loaded(&key, count).ok_or_else(|| {
            FeedError::HistoricalFetch(format!("series {key} vanished after loading"))
        })
    }

    /// Write one aggregation result into its series: the open bar replaces the
    /// tail when the bucket matches, a new bucket is appended, and the oldest
    /// bars are evicted past capacity.
    pub fn apply_update(&self, update: &BarUpdate) {
        let mut map = self.series.write();
        let series = map.entry(update.key()).or_default();

        match series.bars.back_mut() {
            Some(last) if last.time == update.bar.time => *last = update.bar,
            Some(last) if last.time > update.bar.time => {
                debug!(
                    symbol = %update.symbol,
                    timeframe = %update.timeframe,
                    time = update.bar.time,
                    tail = last.time,
                    "update older than series tail ignored"
                );
                return;
            }
            _ => series.bars.push_back(update.bar),
        }

        while series.bars.len() > self.capacity {
            series.bars.pop_front();
        }
    }

    pub fn stats(&self, symbol: &str, timeframe: Timeframe) -> SeriesStats {
        let key = SeriesKey::new(symbol, timeframe);
        let map = self.series.read();
        match map.get(&key) {
            Some(series) => SeriesStats {
                bars_loaded: series.bars.len(),
                loaded: series.loaded,
                last_update: series.bars.back().map(|b| b.time),
            },
            None => SeriesStats {
                bars_loaded: 0,
                loaded: false,
                last_update: None,
            },
        }
    }

    /// Number of keys with any bars in memory.
    pub fn series_count(&self) -> usize {
        self.series.read().len()
    }

    fn read_loaded(&self, key: &SeriesKey, count: usize) -> Option<Vec<Bar>> {
        let map = self.series.read();
        map.get(key)
            .filter(|series| series.loaded)
            .map(|series| series.tail(count))
    }

    fn start_load(self: &Arc<Self>, key: SeriesKey, count: usize) -> PendingLoad {
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move { cache.load(key, count).await });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(FeedError::HistoricalFetch(format!("history fetch task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    async fn load(&self, key: SeriesKey, count: usize) -> Result<(), FeedError> {
        let result = self.fetch(&key, count).await;
        if let Ok(bars) = &result {
            self.seed(&key, bars);
        }
        self.inflight.lock().remove(&key);
        result.map(|_| ())
    }

    async fn fetch(&self, key: &SeriesKey, count: usize) -> Result<Vec<Bar>, FeedError> {
        if let Err(e) = self.limiter.acquire(1, self.acquire_timeout).await {
            warn!(key = %key, error = %e, "history fetch refused by rate limiter");
            return Err(e);
        }

        self.stats.record_history_fetch();
        match self
            .source
            .fetch_series(&key.symbol, key.timeframe, count)
            .await
        {
            Ok(bars) => Ok(bars),
            Err(e) => {
                self.stats.record_history_failure();
                warn!(key = %key, error = %e, "history fetch failed");
                Err(match e {
                    e if e.is_retryable() => e,
                    other => FeedError::HistoricalFetch(other.to_string()),
                })
            }
        }
    }

    /// Install a historical series under whatever live bars already exist.
    /// Live bars win from the earliest live bucket onward.
    fn seed(&self, key: &SeriesKey, historical: &[Bar]) {
        let mut map = self.series.write();
        let series = map.entry(key.clone()).or_default();
        let live_from = series.bars.front().map(|b| b.time);

        let mut merged: VecDeque<Bar> = VecDeque::with_capacity(historical.len() + series.bars.len());
        for bar in historical {
            let before_live = live_from.map_or(true, |t| bar.time < t);
            let ascending = merged.back().map_or(true, |last| last.time < bar.time);
            if before_live && ascending {
                merged.push_back(*bar);
            }
        }
        let live = series.bars.len();
        merged.extend(series.bars.drain(..));
        while merged.len() > self.capacity {
            merged.pop_front();
        }

        series.bars = merged;
        series.loaded = true;
        info!(
            key = %key,
            historical = historical.len(),
            live,
            total = series.bars.len(),
            "series loaded"
        );
    }
}

impl std::fmt::Debug for TimeframeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeframeCache")
            .field("capacity", &self.capacity)
            .field("series", &self.series.read().len())
            .field("inflight", &self.inflight.lock().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
