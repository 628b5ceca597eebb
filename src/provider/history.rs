// =============================================================================
// Historical Series Client — provider REST API
// =============================================================================
//
// GET /v3/symbols/{symbol}/series returns up to `data_points` bars for one
// bar type/interval. The API key is sent as a bearer header and is never
// logged or serialised.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Url;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::FeedError;
use crate::provider::HistoricalSource;
use crate::types::{Bar, Timeframe};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider `(bar_type, bar_interval)` for each timeframe.
fn bar_params(timeframe: Timeframe) -> (&'static str, u32) {
    match timeframe {
        Timeframe::M1 => ("minute", 1),
        Timeframe::M5 => ("minute", 5),
        Timeframe::M15 => ("minute", 15),
        Timeframe::M30 => ("minute", 30),
        Timeframe::H1 => ("minute", 60),
        Timeframe::H4 => ("minute", 240),
        Timeframe::D1 => ("day", 1),
        Timeframe::W1 => ("week", 1),
        Timeframe::MN1 => ("month", 1),
    }
}

/// `{base}/v3/symbols/{symbol}/series` with the bar parameters as a query.
/// The symbol is a single percent-encoded path segment.
fn series_endpoint(
    base_url: &str,
    symbol: &str,
    timeframe: Timeframe,
    max_count: usize,
) -> Result<Url, FeedError> {
    let (bar_type, bar_interval) = bar_params(timeframe);
    let mut url = Url::parse(base_url)
        .map_err(|e| FeedError::HistoricalFetch(format!("invalid history base url {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| FeedError::HistoricalFetch(format!("history base url {base_url} cannot take a path")))?
        .pop_if_empty()
        .extend(["v3", "symbols", symbol, "series"]);
    url.query_pairs_mut()
        .append_pair("bar_type", bar_type)
        .append_pair("bar_interval", &bar_interval.to_string())
        .append_pair("data_points", &max_count.to_string())
        .append_pair("extended", "true");
    Ok(url)
}

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    series: Vec<SeriesPoint>,
}

/// Provider timestamps arrive as floating-point seconds.
#[derive(Debug, Deserialize)]
struct SeriesPoint {
    time: f64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

/// Decode a series body, drop malformed points, and return bars ascending
/// by time with duplicates removed (last occurrence wins).
fn parse_series(body: &str, max_count: usize) -> Result<Vec<Bar>, FeedError> {
    let response: SeriesResponse = serde_json::from_str(body)
        .map_err(|e| FeedError::HistoricalFetch(format!("invalid series payload: {e}")))?;

    let mut bars: Vec<Bar> = Vec::with_capacity(response.series.len());
    for point in response.series {
        let Some(time) = Bar::wire_time(point.time) else {
            warn!(time = point.time, "skipping historical bar with unusable time");
            continue;
        };
        let bar = Bar::new(
            time,
            point.open,
            point.high,
            point.low,
            point.close,
            point.volume,
        );
        if let Err(e) = bar.validate() {
            warn!(error = %e, "skipping malformed historical bar");
            continue;
        }
        bars.push(bar);
    }

    bars.sort_by_key(|b| b.time);
    bars.reverse();
    bars.dedup_by_key(|b| b.time);
    bars.reverse();

    if bars.len() > max_count {
        let overflow = bars.len() - max_count;
        bars.drain(0..overflow);
    }
    Ok(bars)
}

/// REST client for the provider's historical series endpoint.
#[derive(Clone)]
pub struct HistoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl HistoryClient {
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if !api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {api_key}"))
                .context("provider API key is not a valid header value")?;
            default_headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into();
        debug!(base_url = %base_url, "HistoryClient initialised");
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl HistoricalSource for HistoryClient {
    #[instrument(skip(self), name = "history::fetch_series")]
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        max_count: usize,
    ) -> Result<Vec<Bar>, FeedError> {
        let url = series_endpoint(&self.base_url, symbol, timeframe, max_count)?;

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(FeedError::HistoricalFetch(format!(
                "GET /v3/symbols/{symbol}/series returned {status}: {body}"
            )));
        }

        let bars = parse_series(&body, max_count)?;
        debug!(symbol, %timeframe, count = bars.len(), "series fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for HistoryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryClient")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
