// =============================================================================
// Shared types used across the bar relay
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Earliest bar time accepted (the epoch).
pub const MIN_BAR_TIME: i64 = 0;
/// Latest bar time accepted: 9999-12-31T23:59:59Z.
pub const MAX_BAR_TIME: i64 = 253_402_300_799;

/// One OHLCV record. `time` is epoch seconds at the start of its bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Bar {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Whole epoch seconds from a provider timestamp, or `None` when the value
    /// is not finite or falls outside the accepted range.
    pub fn wire_time(raw: f64) -> Option<i64> {
        if !raw.is_finite() {
            return None;
        }
        let secs = raw.trunc();
        if secs < MIN_BAR_TIME as f64 || secs > MAX_BAR_TIME as f64 {
            return None;
        }
        Some(secs as i64)
    }

    /// Check the time range, the OHLC envelope and that every field is a
    /// usable number.
    pub fn validate(&self) -> Result<(), FeedError> {
        if !(MIN_BAR_TIME..=MAX_BAR_TIME).contains(&self.time) {
            return Err(FeedError::InvalidArgument(format!(
                "bar time {} is out of range",
                self.time
            )));
        }
        let fields = [self.open, self.high, self.low, self.close, self.volume];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(FeedError::InvalidArgument(format!(
                "bar at {} has non-finite fields",
                self.time
            )));
        }
        if self.volume < 0.0 {
            return Err(FeedError::InvalidArgument(format!(
                "bar at {} has negative volume",
                self.time
            )));
        }
        let body_hi = self.open.max(self.close);
        let body_lo = self.open.min(self.close);
        if self.high < body_hi || self.low > body_lo {
            return Err(FeedError::InvalidArgument(format!(
                "bar at {} violates high >= open/close >= low",
                self.time
            )));
        }
        Ok(())
    }
}

/// Every timeframe the relay maintains. `M1` is the provider's base resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1H")]
    H1,
    #[serde(rename = "4H")]
    H4,
    #[serde(rename = "1D")]
    D1,
    #[serde(rename = "1W")]
    W1,
    #[serde(rename = "1M")]
    MN1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 9] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
        Self::W1,
        Self::MN1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1H",
            Self::H4 => "4H",
            Self::D1 => "1D",
            Self::W1 => "1W",
            Self::MN1 => "1M",
        }
    }

    /// Bucket width in seconds for fixed-duration timeframes; `None` for the
    /// calendar ones whose length depends on the trading session.
    pub fn fixed_secs(self) -> Option<i64> {
        match self {
            Self::M1 => Some(60),
            Self::M5 => Some(300),
            Self::M15 => Some(900),
            Self::M30 => Some(1_800),
            Self::H1 => Some(3_600),
            Self::H4 => Some(14_400),
            Self::D1 | Self::W1 | Self::MN1 => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| FeedError::InvalidArgument(format!("unknown timeframe: {s}")))
    }
}

/// Composite key that identifies one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// A base-resolution bar as it arrives from the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct BarEvent {
    pub symbol: String,
    pub bar: Bar,
}

/// Output of the aggregator: one merged or finalized bar for one series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BarUpdate {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub bar: Bar,
    pub is_final: bool,
}

impl BarUpdate {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.symbol.clone(), self.timeframe)
    }
}

/// Lifecycle of the single upstream provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_labels_parse_back() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
        assert!("2h".parse::<Timeframe>().is_err());
        // Minute and month differ only by case.
        assert_eq!("1m".parse::<Timeframe>().unwrap(), Timeframe::M1);
        assert_eq!("1M".parse::<Timeframe>().unwrap(), Timeframe::MN1);
    }

    #[test]
    fn timeframe_serde_uses_wire_labels() {
        let json = serde_json::to_string(&Timeframe::H4).unwrap();
        assert_eq!(json, "\"4H\"");
        let tf: Timeframe = serde_json::from_str("\"1W\"").unwrap();
        assert_eq!(tf, Timeframe::W1);
    }

    #[test]
    fn bar_validation() {
        assert!(Bar::new(0, 10.0, 12.0, 9.0, 11.0, 5.0).validate().is_ok());
        assert!(Bar::new(0, 10.0, 10.5, 9.0, 11.0, 5.0).validate().is_err());
        assert!(Bar::new(0, 10.0, 12.0, 9.0, 11.0, -1.0).validate().is_err());
        assert!(Bar::new(0, f64::NAN, 12.0, 9.0, 11.0, 1.0).validate().is_err());
        assert!(Bar::new(i64::MIN, 10.0, 12.0, 9.0, 11.0, 5.0).validate().is_err());
        assert!(Bar::new(-60, 10.0, 12.0, 9.0, 11.0, 5.0).validate().is_err());
        assert!(Bar::new(MAX_BAR_TIME + 1, 10.0, 12.0, 9.0, 11.0, 5.0).validate().is_err());
    }

    #[test]
    fn wire_time_rejects_unrepresentable_values() {
        assert_eq!(Bar::wire_time(1_733_432_340.0), Some(1_733_432_340));
        assert_eq!(Bar::wire_time(1_733_432_340.9), Some(1_733_432_340));
        assert_eq!(Bar::wire_time(-1e19), None);
        assert_eq!(Bar::wire_time(1e19), None);
        assert_eq!(Bar::wire_time(f64::NAN), None);
        assert_eq!(Bar::wire_time(f64::INFINITY), None);
    }

    #[test]
    fn connection_state_serialises_tagged() {
        let json = serde_json::to_value(ConnectionState::Reconnecting { attempt: 2 }).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["attempt"], 2);
    }
}
