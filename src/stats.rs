// =============================================================================
// Feed Counters — lock-free observability for the pipeline
// =============================================================================
//
// Every component bumps its own counters; the health endpoint serialises a
// snapshot. Nothing here influences control flow.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct FeedStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    history_fetches: AtomicU64,
    history_failures: AtomicU64,
    stale_bars_dropped: AtomicU64,
    invalid_bars_dropped: AtomicU64,
    malformed_messages: AtomicU64,
    client_messages_dropped: AtomicU64,
    upstream_reconnects: AtomicU64,
}

/// Serialisable copy of [`FeedStats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FeedStatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub history_fetches: u64,
    pub history_failures: u64,
    pub stale_bars_dropped: u64,
    pub invalid_bars_dropped: u64,
    pub malformed_messages: u64,
    pub client_messages_dropped: u64,
    pub upstream_reconnects: u64,
}

impl FeedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_history_fetch(&self) {
        self.history_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_history_failure(&self) {
        self.history_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_bar(&self) {
        self.stale_bars_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_bar(&self) {
        self.invalid_bars_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed_message(&self) {
        self.malformed_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_client_drop(&self) {
        self.client_messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.upstream_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            history_fetches: self.history_fetches.load(Ordering::Relaxed),
            history_failures: self.history_failures.load(Ordering::Relaxed),
            stale_bars_dropped: self.stale_bars_dropped.load(Ordering::Relaxed),
            invalid_bars_dropped: self.invalid_bars_dropped.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
            client_messages_dropped: self.client_messages_dropped.load(Ordering::Relaxed),
            upstream_reconnects: self.upstream_reconnects.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for FeedStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
