// =============================================================================
// Provider Wire Codec — real-time websocket frames
// =============================================================================
//
// Outbound: a subscription message that always carries the complete list of
// desired symbols, and the literal `ping` heartbeat.
// Inbound: the literal `pong`, status objects carrying a `message` field, and
// series payloads `{"code": .., "series": [bar, ..]}`.
// =============================================================================

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;
use crate::types::Bar;

pub const HEARTBEAT_PING: &str = "ping";
pub const HEARTBEAT_PONG: &str = "pong";

#[derive(Debug, Serialize)]
struct SubscriptionItem<'a> {
    code: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    bar_type: &'static str,
    bar_interval: u32,
}

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    api_key: &'a str,
    subscriptions: Vec<SubscriptionItem<'a>>,
}

/// One base-resolution (1-minute) series subscription per symbol.
pub fn subscribe_message(api_key: &str, symbols: &BTreeSet<String>) -> Result<String, FeedError> {
    let request = SubscribeRequest {
        api_key,
        subscriptions: symbols
            .iter()
            .map(|code| SubscriptionItem {
                code,
                kind: "series",
                bar_type: "minute",
                bar_interval: 1,
            })
            .collect(),
    };
    serde_json::to_string(&request)
        .map_err(|e| FeedError::InvalidArgument(format!("cannot encode subscription: {e}")))
}

#[derive(Debug, Deserialize)]
struct WireBar {
    time: f64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    series: Option<Vec<WireBar>>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Heartbeat,
    Status(String),
    Bars { symbol: String, bars: Vec<Bar> },
}

pub fn decode(text: &str) -> Result<Inbound, FeedError> {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case(HEARTBEAT_PONG) {
        return Ok(Inbound::Heartbeat);
    }

    let envelope: WireEnvelope = serde_json::from_str(trimmed)
        .map_err(|e| FeedError::MalformedMessage(format!("not a provider frame: {e}")))?;

    if let Some(message) = envelope.message {
        return Ok(Inbound::Status(message));
    }

    match (envelope.code, envelope.series) {
        (Some(symbol), Some(series)) => {
            let bars = series
                .into_iter()
                .map(|b| -> Result<Bar, FeedError> {
                    let time = Bar::wire_time(b.time).ok_or_else(|| {
                        FeedError::MalformedMessage(format!(
                            "bar time {} for {symbol} is out of range",
                            b.time
                        ))
                    })?;
                    Ok(Bar::new(time, b.open, b.high, b.low, b.close, b.volume))
                })
                .collect::<Result<Vec<_>, FeedError>>()?;
            Ok(Inbound::Bars { symbol, bars })
        }
        (None, Some(_)) => Err(FeedError::MalformedMessage(
            "series payload without a symbol code".into(),
        )),
        _ => Err(FeedError::MalformedMessage(
            "frame carries neither status nor series".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_lists_every_symbol_at_one_minute() {
        let symbols: BTreeSet<String> = ["NQ", "ES"].iter().map(|s| s.to_string()).collect();
        let text = subscribe_message("key-123", &symbols).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["api_key"], "key-123");
        let subs = value["subscriptions"].as_array().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0]["code"], "ES");
        assert_eq!(subs[1]["code"], "NQ");
        for sub in subs {
            assert_eq!(sub["type"], "series");
            assert_eq!(sub["bar_type"], "minute");
            assert_eq!(sub["bar_interval"], 1);
        }
    }

    #[test]
    fn decodes_heartbeat_and_status() {
        assert_eq!(decode("pong").unwrap(), Inbound::Heartbeat);
        assert_eq!(
            decode(r#"{"message": "Connected to W:ASIA-SOUTHEAST"}"#).unwrap(),
            Inbound::Status("Connected to W:ASIA-SOUTHEAST".into())
        );
    }

    #[test]
    fn decodes_series_payload() {
        let text = r#"{
            "code": "CME_MINI:MNQ1!",
            "bar_end": 1733432399.0,
            "series": [
                {"time": 1733432340.0, "open": 242.89, "high": 243.09,
                 "low": 242.82, "close": 243.08, "volume": 533779.0}
            ]
        }"#;
        match decode(text).unwrap() {
            Inbound::Bars { symbol, bars } => {
                assert_eq!(symbol, "CME_MINI:MNQ1!");
                assert_eq!(bars.len(), 1);
                assert_eq!(bars[0].time, 1_733_432_340);
                assert_eq!(bars[0].close, 243.08);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(decode("{not json"), Err(FeedError::MalformedMessage(_))));
        assert!(matches!(decode(r#"{"series": []}"#), Err(FeedError::MalformedMessage(_))));
        assert!(matches!(decode(r#"{"foo": 1}"#), Err(FeedError::MalformedMessage(_))));
    }

    #[test]
    fn unrepresentable_bar_time_is_malformed() {
        let text = r#"{"code": "MNQ", "series": [
            {"time": -1e19, "open": 1, "high": 1, "low": 1, "close": 1, "volume": 1}
        ]}"#;
        assert!(matches!(decode(text), Err(FeedError::MalformedMessage(_))));

        let text = r#"{"code": "MNQ", "series": [
            {"time": 1e300, "open": 1, "high": 1, "low": 1, "close": 1, "volume": 1}
        ]}"#;
        assert!(matches!(decode(text), Err(FeedError::MalformedMessage(_))));
    }
}
