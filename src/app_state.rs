// =============================================================================
// Central Application State — bar relay
// =============================================================================
//
// Ties the long-lived components together for the HTTP and WebSocket
// handlers. Each component manages its own interior mutability; AppState only
// holds Arc handles plus the upstream state receiver.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::broadcaster::Broadcaster;
use crate::market_data::TimeframeCache;
use crate::provider::rate_limit::BucketSnapshot;
use crate::provider::{HistoricalSource, TokenBucket};
use crate::runtime_config::RuntimeConfig;
use crate::stats::{FeedStats, FeedStatsSnapshot};
use crate::types::ConnectionState;

/// Shared across all request handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub cache: Arc<TimeframeCache>,
    pub broadcaster: Arc<Broadcaster>,
    pub rest_bucket: Arc<TokenBucket>,
    pub subscription_bucket: Arc<TokenBucket>,
    pub stats: Arc<FeedStats>,
    pub upstream_state: watch::Receiver<ConnectionState>,
    pub shutdown: CancellationToken,
    /// Used for uptime calculations.
    pub start_time: std::time::Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub upstream: ConnectionState,
    pub sessions: usize,
    pub series: usize,
    pub uptime_secs: u64,
    pub counters: FeedStatsSnapshot,
    pub quotas: Vec<BucketSnapshot>,
}

impl AppState {
    /// Build the buckets, cache and broadcaster described by `config`.
    pub fn new(
        config: RuntimeConfig,
        source: Arc<dyn HistoricalSource>,
        upstream_state: watch::Receiver<ConnectionState>,
    ) -> Result<Self> {
        let stats = Arc::new(FeedStats::new());
        let rest_bucket = Arc::new(config.rest_quota.bucket("rest")?);
        let subscription_bucket = Arc::new(config.subscription_quota.bucket("subscription")?);

        let cache = Arc::new(TimeframeCache::new(
            config.series_capacity,
            rest_bucket.clone(),
            config.acquire_timeout(),
            source,
            stats.clone(),
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            config.symbols.iter().cloned(),
            config.session_queue_depth,
            stats.clone(),
        ));

        Ok(Self {
            config,
            cache,
            broadcaster,
            rest_bucket,
            subscription_bucket,
            stats,
            upstream_state,
            shutdown: CancellationToken::new(),
            start_time: std::time::Instant::now(),
        })
    }

    pub fn upstream(&self) -> ConnectionState {
        *self.upstream_state.borrow()
    }

    pub fn health(&self) -> HealthReport {
        let upstream = self.upstream();
        HealthReport {
            status: if upstream == ConnectionState::Connected {
                "ok"
            } else {
                "degraded"
            },
            upstream,
            sessions: self.broadcaster.session_count(),
            series: self.cache.series_count(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            counters: self.stats.snapshot(),
            quotas: vec![self.rest_bucket.snapshot(), self.subscription_bucket.snapshot()],
        }
    }
}
