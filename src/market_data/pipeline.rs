// =============================================================================
// Aggregation Pipeline — upstream bars to cache and sessions
// =============================================================================
//
// The single writer between the upstream feed and everything downstream.
// Bars for one symbol are handled in arrival order.
// =============================================================================

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcaster::Broadcaster;
use crate::market_data::aggregator::BarAggregator;
use crate::market_data::series_cache::TimeframeCache;
use crate::types::BarEvent;

pub async fn run_aggregation(
    mut aggregator: BarAggregator,
    mut events: mpsc::Receiver<BarEvent>,
    cache: Arc<TimeframeCache>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) {
    info!("aggregation task started");
    let mut ingested: u64 = 0;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    debug!("bar event channel closed");
                    break;
                }
            },
        };

        for update in aggregator.ingest(&event.symbol, &event.bar) {
            cache.apply_update(&update);
            broadcaster.publish(&update);
        }
        ingested += 1;
    }

    info!(ingested, "aggregation task stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::FeedError;
    use crate::market_data::calendar::SessionCalendar;
    use crate::provider::{AdmissionMode, HistoricalSource, TokenBucket};
    use crate::stats::FeedStats;
    use crate::types::{Bar, SeriesKey, Timeframe};

    struct NoHistory;

    #[async_trait]
    impl HistoricalSource for NoHistory {
        async fn fetch_series(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _max_count: usize,
        ) -> Result<Vec<Bar>, FeedError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn events_flow_to_cache_and_sessions() {
        let stats = Arc::new(FeedStats::new());
        let limiter = Arc::new(TokenBucket::new("rest", 5, 1.0, AdmissionMode::Wait).unwrap());
        let cache = Arc::new(TimeframeCache::new(
            100,
            limiter,
            Duration::from_secs(1),
            Arc::new(NoHistory),
            stats.clone(),
        ));
        let hub = Arc::new(Broadcaster::new(Vec::new(), 64, stats.clone()));
        let (session, mut updates) = hub.register();
        hub.subscribe(session, SeriesKey::new("MNQ", Timeframe::M5)).unwrap();

        let (tx, rx) = mpsc::channel(16);
        let aggregator = BarAggregator::new(SessionCalendar::utc(), stats);
        let task = tokio::spawn(run_aggregation(
            aggregator,
            rx,
            cache.clone(),
            hub.clone(),
            CancellationToken::new(),
        ));

        for (i, close) in [100.0, 101.0, 99.0, 102.0, 103.0, 104.0].into_iter().enumerate() {
            let bar = Bar::new(i as i64 * 60, close, close, close, close, 10.0);
            tx.send(BarEvent { symbol: "MNQ".into(), bar }).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let five = cache.stats("MNQ", Timeframe::M5);
        assert_eq!(five.bars_loaded, 2);
        assert_eq!(five.last_update, Some(300));

        let pushed: Vec<_> = std::iter::from_fn(|| updates.try_recv().ok()).collect();
        // Five merges of the first bucket, its finalization, then the new bucket.
        assert_eq!(pushed.len(), 7);
        let closed = &pushed[5];
        assert!(closed.is_final);
        assert_eq!(closed.bar.volume, 50.0);
        assert_eq!(closed.bar.high, 103.0);
        assert_eq!(closed.bar.low, 99.0);
        assert!(!pushed[6].is_final);
        assert_eq!(pushed[6].bar.time, 300);
    }

    #[tokio::test]
    async fn cancellation_stops_the_task() {
        let stats = Arc::new(FeedStats::new());
        let limiter = Arc::new(TokenBucket::new("rest", 5, 1.0, AdmissionMode::Wait).unwrap());
        let cache = Arc::new(TimeframeCache::new(
            10,
            limiter,
            Duration::from_secs(1),
            Arc::new(NoHistory),
            stats.clone(),
        ));
        let hub = Arc::new(Broadcaster::new(Vec::new(), 4, stats.clone()));
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_aggregation(
            BarAggregator::new(SessionCalendar::utc(), stats),
            rx,
            cache,
            hub,
            cancel.clone(),
        ));

        cancel.cancel();
        task.await.unwrap();
    }
}
