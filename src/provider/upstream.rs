// =============================================================================
// Upstream Connection Manager — the single provider connection
// =============================================================================
//
// One task owns the connection and its state machine:
//
//   Disconnected → Connecting → Connected → Reconnecting → Connecting → …
//
// Other components never touch it directly. Bars leave through an mpsc
// channel, the desired symbol set arrives through a watch channel, and the
// current state is published on another watch channel.
//
// Reconnect delays grow as base · 2^attempt (capped). The attempt counter
// resets only when a connection stayed up past the grace period. After
// `max_attempts` consecutive failures the manager stops in Disconnected.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FeedError;
use crate::provider::protocol::{self, Inbound, HEARTBEAT_PING};
use crate::provider::rate_limit::TokenBucket;
use crate::provider::{Connector, ProviderLink};
use crate::stats::FeedStats;
use crate::types::{BarEvent, ConnectionState};

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub api_key: String,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Longest wait for a subscription token while (re)connecting.
    pub subscribe_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            grace_period: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(45),
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

impl UpstreamSettings {
    /// Delay before reconnect number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// How one connection ended.
enum SessionEnd {
    Shutdown,
    Dropped { uptime: Duration, reason: FeedError },
}

enum LinkEvent {
    Cancelled,
    Frame(Option<Result<String, FeedError>>),
    Heartbeat,
    SymbolsChanged,
    SymbolsClosed,
}

pub struct UpstreamManager {
    connector: Arc<dyn Connector>,
    settings: UpstreamSettings,
    quota: Arc<TokenBucket>,
    bars_tx: mpsc::Sender<BarEvent>,
    symbols_rx: watch::Receiver<BTreeSet<String>>,
    state_tx: watch::Sender<ConnectionState>,
    stats: Arc<FeedStats>,
    cancel: CancellationToken,
}

impl UpstreamManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: UpstreamSettings,
        quota: Arc<TokenBucket>,
        bars_tx: mpsc::Sender<BarEvent>,
        symbols_rx: watch::Receiver<BTreeSet<String>>,
        state_tx: watch::Sender<ConnectionState>,
        stats: Arc<FeedStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            settings,
            quota,
            bars_tx,
            symbols_rx,
            state_tx,
            stats,
            cancel,
        }
    }

    /// Drive the connection until shutdown or until reconnects are exhausted.
    /// Returns the terminal state, which is always `Disconnected`.
    pub async fn run(mut self) -> ConnectionState {
        let mut attempt: u32 = 0;

        while !self.cancel.is_cancelled() {
            self.set_state(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect() => result,
            };

            let end = match connected {
                Ok(link) => self.drive(link).await,
                Err(reason) => SessionEnd::Dropped {
                    uptime: Duration::ZERO,
                    reason,
                },
            };

            let (uptime, reason) = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Dropped { uptime, reason } => (uptime, reason),
            };

            if uptime >= self.settings.grace_period {
                attempt = 0;
            }
            if attempt >= self.settings.max_attempts {
                error!(
                    attempts = attempt,
                    error = %reason,
                    "provider reconnects exhausted — giving up"
                );
                break;
            }

            let delay = self.settings.backoff(attempt);
            attempt += 1;
            self.stats.record_reconnect();
            self.set_state(ConnectionState::Reconnecting { attempt });
            warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "provider connection lost — reconnecting"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("upstream manager stopped");
        ConnectionState::Disconnected
    }

    async fn drive(&mut self, mut link: Box<dyn ProviderLink>) -> SessionEnd {
        let mut last_sent = self.symbols_rx.borrow_and_update().clone();

        if !last_sent.is_empty() {
            if let Err(reason) = self.send_subscription(link.as_mut(), &last_sent, true).await {
                link.close().await;
                return match reason {
                    FeedError::Shutdown => SessionEnd::Shutdown,
                    reason => SessionEnd::Dropped {
                        uptime: Duration::ZERO,
                        reason,
                    },
                };
            }
        }

        let connected_at = Instant::now();
        self.set_state(ConnectionState::Connected);
        info!(symbols = ?last_sent, "provider connected");

        let mut last_inbound = Instant::now();
        let mut pending = false;
        let mut symbols_open = true;
        let mut heartbeat = tokio::time::interval_at(
            connected_at + self.settings.heartbeat_interval,
            self.settings.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => LinkEvent::Cancelled,
                frame = link.recv_text() => LinkEvent::Frame(frame),
                _ = heartbeat.tick() => LinkEvent::Heartbeat,
                changed = self.symbols_rx.changed(), if symbols_open => match changed {
                    Ok(()) => LinkEvent::SymbolsChanged,
                    Err(_) => LinkEvent::SymbolsClosed,
                },
            };

            match event {
                LinkEvent::Cancelled => {
                    link.close().await;
                    return SessionEnd::Shutdown;
                }
                LinkEvent::Frame(None) => {
                    break FeedError::TransientUpstream("provider closed the connection".into());
                }
                LinkEvent::Frame(Some(Err(FeedError::MalformedMessage(detail)))) => {
                    warn!(detail = %detail, "dropping malformed provider frame");
                    self.stats.record_malformed_message();
                }
                LinkEvent::Frame(Some(Err(e))) => break e,
                LinkEvent::Frame(Some(Ok(text))) => {
                    last_inbound = Instant::now();
                    if let Err(FeedError::Shutdown) = self.handle_frame(&text).await {
                        link.close().await;
                        return SessionEnd::Shutdown;
                    }
                }
                LinkEvent::Heartbeat => {
                    let silent_for = last_inbound.elapsed();
                    if silent_for >= self.settings.heartbeat_timeout {
                        break FeedError::TransientUpstream(format!(
                            "no provider traffic for {}s",
                            silent_for.as_secs()
                        ));
                    }
                    if let Err(e) = link.send_text(HEARTBEAT_PING.to_string()).await {
                        break e;
                    }
                    debug!("heartbeat sent");
                    if pending {
                        match self.resubscribe(link.as_mut(), &mut last_sent).await {
                            Ok(done) => pending = !done,
                            Err(e) => break e,
                        }
                    }
                }
                LinkEvent::SymbolsChanged => {
                    match self.resubscribe(link.as_mut(), &mut last_sent).await {
                        Ok(done) => pending = !done,
                        Err(e) => break e,
                    }
                }
                LinkEvent::SymbolsClosed => {
                    debug!("symbol demand channel closed");
                    symbols_open = false;
                }
            }
        };

        link.close().await;
        SessionEnd::Dropped {
            uptime: connected_at.elapsed(),
            reason,
        }
    }

    async fn handle_frame(&self, text: &str) -> Result<(), FeedError> {
        match protocol::decode(text) {
            Ok(Inbound::Heartbeat) => debug!("heartbeat reply received"),
            Ok(Inbound::Status(message)) => info!(status = %message, "provider status"),
            Ok(Inbound::Bars { symbol, bars }) => {
                debug!(symbol = %symbol, count = bars.len(), "provider bars received");
                for bar in bars {
                    let event = BarEvent {
                        symbol: symbol.clone(),
                        bar,
                    };
                    self.bars_tx
                        .send(event)
                        .await
                        .map_err(|_| FeedError::Shutdown)?;
                }
            }
            Err(e) => {
                warn!(error = %e, "dropping undecodable provider frame");
                self.stats.record_malformed_message();
            }
        }
        Ok(())
    }

    /// Send the full desired list if it differs from what the provider has.
    /// Returns `Ok(false)` when the subscription quota deferred the update.
    async fn resubscribe(
        &mut self,
        link: &mut dyn ProviderLink,
        last_sent: &mut BTreeSet<String>,
    ) -> Result<bool, FeedError> {
        let desired = self.symbols_rx.borrow_and_update().clone();
        if desired == *last_sent {
            return Ok(true);
        }
        match self.send_subscription(link, &desired, false).await {
            Ok(()) => {
                *last_sent = desired;
                Ok(true)
            }
            Err(FeedError::QuotaExceeded(detail)) => {
                debug!(detail = %detail, "subscription update deferred by quota");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_subscription(
        &self,
        link: &mut dyn ProviderLink,
        symbols: &BTreeSet<String>,
        wait: bool,
    ) -> Result<(), FeedError> {
        if wait {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FeedError::Shutdown),
                admitted = self.quota.acquire(1, self.settings.subscribe_timeout) => admitted?,
            }
        } else {
            self.quota.try_acquire(1)?;
        }
        let message = protocol::subscribe_message(&self.settings.api_key, symbols)?;
        link.send_text(message).await?;
        info!(symbols = ?symbols, "subscription sent");
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "upstream state changed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
