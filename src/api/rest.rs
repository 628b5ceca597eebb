// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`:
//   GET /health            upstream state, counters, quotas
//   GET /bars              most recent bars for (symbol, timeframe)
//   GET /stats/timeframe   what the cache holds for one key
//   GET /ws                live bar updates (see `ws` module)
//
// CORS is configured permissively; tighten `allow_origin` in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;
use crate::error::FeedError;
use crate::market_data::series_cache::SeriesStats;
use crate::types::{Bar, Timeframe};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/bars", get(bars))
        .route("/api/v1/stats/timeframe", get(timeframe_stats))
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error mapping
// =============================================================================

/// A `FeedError` rendered as `{"error": .., "retryable": ..}`.
pub struct ApiError(pub FeedError);

impl From<FeedError> for ApiError {
    fn from(e: FeedError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FeedError::InvalidArgument(_) | FeedError::MalformedMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            FeedError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            FeedError::TransientUpstream(_)
            | FeedError::HistoricalFetch(_)
            | FeedError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status != StatusCode::BAD_REQUEST {
            warn!(status = %status, error = %self.0, "request failed");
        }
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "retryable": self.0.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// Bars
// =============================================================================

#[derive(Debug, Deserialize)]
struct BarsQuery {
    symbol: String,
    timeframe: String,
    count: Option<usize>,
}

#[derive(Debug, Serialize)]
struct BarsResponse {
    symbol: String,
    timeframe: Timeframe,
    count: usize,
    bars: Vec<Bar>,
}

fn parse_key(symbol: &str, timeframe: &str) -> Result<(String, Timeframe), FeedError> {
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(FeedError::InvalidArgument("symbol is required".into()));
    }
    Ok((symbol.to_string(), timeframe.parse()?))
}

async fn bars(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BarsQuery>,
) -> Result<Json<BarsResponse>, ApiError> {
    let (symbol, timeframe) = parse_key(&query.symbol, &query.timeframe)?;
    let max = state.config.max_bar_count;
    let count = query.count.unwrap_or(state.config.default_bar_count);
    if count == 0 || count > max {
        return Err(FeedError::InvalidArgument(format!("count must be within 1..={max}")).into());
    }

    let bars = state.cache.get(&symbol, timeframe, count).await?;
    Ok(Json(BarsResponse {
        symbol,
        timeframe,
        count: bars.len(),
        bars,
    }))
}

// =============================================================================
// Timeframe stats
// =============================================================================

#[derive(Debug, Deserialize)]
struct StatsQuery {
    symbol: String,
    timeframe: String,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    symbol: String,
    timeframe: Timeframe,
    #[serde(flatten)]
    series: SeriesStats,
}

async fn timeframe_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let (symbol, timeframe) = parse_key(&query.symbol, &query.timeframe)?;
    let series = state.cache.stats(&symbol, timeframe);
    Ok(Json(StatsResponse {
        symbol,
        timeframe,
        series,
    }))
}

// =============================================================================
// Tests
// =============================================================================
