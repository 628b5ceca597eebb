// =============================================================================
// Provider — everything that talks to the external data source
// =============================================================================
//
// The historical REST client, the real-time websocket link and its wire
// codec, the quota buckets, and the manager that owns the single upstream
// connection.
// =============================================================================

pub mod history;
pub mod protocol;
pub mod rate_limit;
pub mod upstream;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::FeedError;
use crate::types::{Bar, Timeframe};

pub use history::HistoryClient;
pub use rate_limit::{AdmissionMode, TokenBucket};
pub use upstream::{UpstreamManager, UpstreamSettings};

/// The historical-data collaborator.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Up to `max_count` most recent bars, ascending by time.
    async fn fetch_series(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        max_count: usize,
    ) -> Result<Vec<Bar>, FeedError>;
}

/// Opens a fresh link to the real-time provider.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ProviderLink>, FeedError>;
}

/// One open provider connection, reduced to text frames.
#[async_trait]
pub trait ProviderLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError>;

    /// Next text frame; `None` once the peer closed the connection.
    async fn recv_text(&mut self) -> Option<Result<String, FeedError>>;

    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Websocket transport
// ---------------------------------------------------------------------------

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn ProviderLink>, FeedError> {
        info!(url = %self.url, "connecting to provider websocket");
        let (stream, _response) = connect_async(self.url.as_str()).await?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl ProviderLink for WsLink {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv_text(&mut self) -> Option<Result<String, FeedError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        return Some(Err(FeedError::MalformedMessage(
                            "non-utf8 binary frame".into(),
                        )))
                    }
                },
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "provider sent close frame");
                    return None;
                }
                // tungstenite answers pings itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "error while closing provider websocket");
        }
    }
}
