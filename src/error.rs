// =============================================================================
// Feed error taxonomy
// =============================================================================
//
// Every failure the pipeline can surface falls into one of these kinds. Only
// the aggregation loop's callers see them; the loop itself never dies on
// any of them.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    /// Connection drop, heartbeat timeout, or transport failure.
    #[error("upstream unavailable: {0}")]
    TransientUpstream(String),

    /// A token bucket refused admission.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Provider payload that could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The historical collaborator call failed; nothing was cached.
    #[error("historical fetch failed: {0}")]
    HistoricalFetch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("pipeline is shutting down")]
    Shutdown,
}

impl FeedError {
    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream(_) | Self::QuotaExceeded(_) | Self::HistoricalFetch(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransientUpstream(value.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(value: reqwest::Error) -> Self {
        Self::HistoricalFetch(value.to_string())
    }
}
