// =============================================================================
// WebSocket Handler — live bar updates
// =============================================================================
//
// Clients connect to `/api/v1/ws` and receive:
//   1. `{"type":"connection_status", ...}` immediately, and again whenever
//      the upstream connection changes state.
//   2. `{"type":"bar_update", ...}` for every (symbol, timeframe) they
//      subscribed to, open and final bars alike.
//
// Client text frames are actions:
//   {"action":"subscribe","symbol":"CME_MINI:MNQ1!","timeframe":"5m"}
//   {"action":"unsubscribe","symbol":"CME_MINI:MNQ1!","timeframe":"5m"}
// each answered with an `ack` (or an `error`).
//
// The session is registered with the broadcaster for its whole lifetime and
// removed on disconnect, which may shrink the upstream subscription.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::broadcaster::{Broadcaster, SessionId};
use crate::types::{BarUpdate, ConnectionState, SeriesKey, Timeframe};

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ClientAction {
    Subscribe { symbol: String, timeframe: String },
    Unsubscribe { symbol: String, timeframe: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    ConnectionStatus {
        status: ConnectionState,
    },
    Ack {
        action: &'static str,
        symbol: String,
        timeframe: Timeframe,
    },
    Error {
        message: String,
    },
    BarUpdate(&'a BarUpdate),
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("WebSocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (id, mut updates) = state.broadcaster.register();
    let (mut sender, mut receiver) = socket.split();
    let mut upstream = state.upstream_state.clone();
    let mut upstream_open = true;

    let status = *upstream.borrow_and_update();
    if let Err(e) = send(&mut sender, &ServerMessage::ConnectionStatus { status }).await {
        warn!(session = %id, error = %e, "failed to send initial status");
        state.broadcaster.disconnect(id);
        return;
    }

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                debug!(session = %id, "shutdown — closing WebSocket");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }

            update = updates.recv() => {
                let Some(update) = update else {
                    debug!(session = %id, "session queue closed");
                    break;
                };
                if let Err(e) = send(&mut sender, &ServerMessage::BarUpdate(&update)).await {
                    debug!(session = %id, error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            changed = upstream.changed(), if upstream_open => {
                if changed.is_err() {
                    upstream_open = false;
                    continue;
                }
                let status = *upstream.borrow_and_update();
                if let Err(e) = send(&mut sender, &ServerMessage::ConnectionStatus { status }).await {
                    debug!(session = %id, error = %e, "WebSocket send failed — disconnecting");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_client_text(&state.broadcaster, id, &text);
                        if let Err(e) = send(&mut sender, &reply).await {
                            debug!(session = %id, error = %e, "WebSocket send failed — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(error = %e, "Failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!(session = %id, "WebSocket Close frame received — disconnecting");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(session = %id, "WebSocket binary message ignored");
                    }
                    Some(Err(e)) => {
                        warn!(session = %id, error = %e, "WebSocket receive error — disconnecting");
                        break;
                    }
                    None => {
                        info!(session = %id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.disconnect(id);
}

// =============================================================================
// Helpers
// =============================================================================

fn handle_client_text(broadcaster: &Broadcaster, id: SessionId, text: &str) -> ServerMessage<'static> {
    let action: ClientAction = match serde_json::from_str(text) {
        Ok(action) => action,
        Err(e) => {
            debug!(session = %id, error = %e, "unrecognised client message");
            return ServerMessage::Error {
                message: format!("unrecognised message: {e}"),
            };
        }
    };

    let (name, symbol, timeframe) = match &action {
        ClientAction::Subscribe { symbol, timeframe } => ("subscribe", symbol, timeframe),
        ClientAction::Unsubscribe { symbol, timeframe } => ("unsubscribe", symbol, timeframe),
    };
    let timeframe: Timeframe = match timeframe.parse() {
        Ok(tf) => tf,
        Err(e) => return ServerMessage::Error { message: format!("{e}") },
    };
    let symbol = symbol.trim().to_string();
    if symbol.is_empty() {
        return ServerMessage::Error {
            message: "symbol is required".into(),
        };
    }

    let key = SeriesKey::new(symbol.clone(), timeframe);
    match action {
        ClientAction::Subscribe { .. } => {
            if let Err(e) = broadcaster.subscribe(id, key) {
                return ServerMessage::Error { message: e.to_string() };
            }
        }
        ClientAction::Unsubscribe { .. } => {
            broadcaster.unsubscribe(id, &key);
        }
    }

    ServerMessage::Ack {
        action: name,
        symbol,
        timeframe,
    }
}

async fn send<S>(sender: &mut S, message: &ServerMessage<'_>) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await,
        Err(e) => {
            // Serialisation errors are not network errors; don't disconnect.
            warn!(error = %e, "Failed to serialize WebSocket message");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::FeedStats;
    use crate::types::Bar;

    fn hub() -> Broadcaster {
        Broadcaster::new(Vec::new(), 8, Arc::new(FeedStats::new()))
    }

    #[test]
    fn subscribe_action_is_acked_and_routed() {
        let hub = hub();
        let (id, mut rx) = hub.register();
        let reply = handle_client_text(
            &hub,
            id,
            r#"{"action":"subscribe","symbol":"MNQ","timeframe":"4H"}"#,
        );
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["action"], "subscribe");
        assert_eq!(json["timeframe"], "4H");

        let update = BarUpdate {
            symbol: "MNQ".into(),
            timeframe: Timeframe::H4,
            bar: Bar::new(0, 1.0, 1.0, 1.0, 1.0, 1.0),
            is_final: true,
        };
        assert_eq!(hub.publish(&update), 1);
        assert!(rx.try_recv().is_ok());

        handle_client_text(
            &hub,
            id,
            r#"{"action":"unsubscribe","symbol":"MNQ","timeframe":"4H"}"#,
        );
        assert_eq!(hub.publish(&update), 0);
    }

    #[test]
    fn bad_actions_get_error_replies() {
        let hub = hub();
        let (id, _rx) = hub.register();
        for text in [
            "hello",
            r#"{"action":"subscribe","symbol":"MNQ","timeframe":"3m"}"#,
            r#"{"action":"subscribe","symbol":"  ","timeframe":"5m"}"#,
            r#"{"action":"explode"}"#,
        ] {
            let json = serde_json::to_value(handle_client_text(&hub, id, text)).unwrap();
            assert_eq!(json["type"], "error", "{text}");
        }
    }

    #[test]
    fn bar_update_wire_shape() {
        let update = BarUpdate {
            symbol: "MNQ".into(),
            timeframe: Timeframe::D1,
            bar: Bar::new(86_400, 1.0, 2.0, 0.5, 1.5, 7.0),
            is_final: false,
        };
        let json = serde_json::to_value(ServerMessage::BarUpdate(&update)).unwrap();
        assert_eq!(json["type"], "bar_update");
        assert_eq!(json["symbol"], "MNQ");
        assert_eq!(json["timeframe"], "1D");
        assert_eq!(json["is_final"], false);
        assert_eq!(json["bar"]["time"], 86_400);

        let status = serde_json::to_value(ServerMessage::ConnectionStatus {
            status: ConnectionState::Reconnecting { attempt: 2 },
        })
        .unwrap();
        assert_eq!(status["type"], "connection_status");
        assert_eq!(status["status"]["state"], "reconnecting");
        assert_eq!(status["status"]["attempt"], 2);
    }
}
