// =============================================================================
// Runtime Configuration — bar relay settings
// =============================================================================
//
// Loaded once at startup from a JSON file. All fields carry
// `#[serde(default)]` so a partial (or empty) file still yields a complete
// configuration. The provider credential never lives in the file: it comes
// from the environment and is skipped by serde.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::market_data::SessionCalendar;
use crate::provider::{AdmissionMode, TokenBucket, UpstreamSettings};

pub const DEFAULT_CONFIG_PATH: &str = "bar_relay.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_provider_ws_url() -> String {
    "wss://realtime.insightsentry.com/live".to_string()
}

fn default_history_base_url() -> String {
    "https://api.insightsentry.com".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["CME_MINI:MNQ1!".to_string()]
}

fn default_series_capacity() -> usize {
    5_000
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_heartbeat_timeout_secs() -> u64 {
    45
}

fn default_session_queue_depth() -> usize {
    256
}

fn default_event_channel_depth() -> usize {
    4_096
}

fn default_max_future_skew_secs() -> u64 {
    300
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_bar_count() -> usize {
    1_000
}

fn default_max_bar_count() -> usize {
    20_000
}

// =============================================================================
// Sub-sections
// =============================================================================

/// `limit` admissions per `window_secs`, as a token bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuotaParams {
    pub limit: u32,
    pub window_secs: u64,
    #[serde(default = "default_admission_mode")]
    pub mode: AdmissionMode,
}

fn default_admission_mode() -> AdmissionMode {
    AdmissionMode::Wait
}

fn default_rest_quota() -> QuotaParams {
    QuotaParams {
        limit: 25,
        window_secs: 60,
        mode: AdmissionMode::Wait,
    }
}

fn default_subscription_quota() -> QuotaParams {
    QuotaParams {
        limit: 10,
        window_secs: 300,
        mode: AdmissionMode::Wait,
    }
}

impl QuotaParams {
    pub fn bucket(&self, name: &str) -> Result<TokenBucket> {
        TokenBucket::per_window(name, self.limit, Duration::from_secs(self.window_secs), self.mode)
            .with_context(|| format!("invalid {name} quota"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectParams {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// A connection that stays up this long resets the attempt counter.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_grace_period_secs() -> u64 {
    30
}

impl Default for ReconnectParams {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: default_max_attempts(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// Trading-session calendar for the 1D / 1W / 1M buckets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalendarParams {
    /// IANA zone name, e.g. `America/Chicago`.
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    /// Local hour at which a trading day opens (0 = midnight).
    #[serde(default)]
    pub session_start_hour: u32,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Default for CalendarParams {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
            session_start_hour: 0,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_provider_ws_url")]
    pub provider_ws_url: String,

    #[serde(default = "default_history_base_url")]
    pub history_base_url: String,

    /// Provider credential. Environment only; never written out.
    #[serde(skip)]
    pub api_key: String,

    /// Symbols kept subscribed regardless of client demand.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Bars retained per (symbol, timeframe).
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,

    #[serde(default = "default_rest_quota")]
    pub rest_quota: QuotaParams,

    #[serde(default = "default_subscription_quota")]
    pub subscription_quota: QuotaParams,

    /// Longest wait for a REST token before the read fails.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    #[serde(default)]
    pub reconnect: ReconnectParams,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_session_queue_depth")]
    pub session_queue_depth: usize,

    /// Buffer between the upstream task and the aggregation task.
    #[serde(default = "default_event_channel_depth")]
    pub event_channel_depth: usize,

    #[serde(default)]
    pub calendar: CalendarParams,

    /// How far ahead of the local clock a live bar may be stamped before it
    /// is dropped as invalid.
    #[serde(default = "default_max_future_skew_secs")]
    pub max_future_skew_secs: u64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_bar_count")]
    pub default_bar_count: usize,

    #[serde(default = "default_max_bar_count")]
    pub max_bar_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider_ws_url: default_provider_ws_url(),
            history_base_url: default_history_base_url(),
            api_key: String::new(),
            symbols: default_symbols(),
            series_capacity: default_series_capacity(),
            rest_quota: default_rest_quota(),
            subscription_quota: default_subscription_quota(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            reconnect: ReconnectParams::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            session_queue_depth: default_session_queue_depth(),
            event_channel_depth: default_event_channel_depth(),
            calendar: CalendarParams::default(),
            max_future_skew_secs: default_max_future_skew_secs(),
            bind_addr: default_bind_addr(),
            default_bar_count: default_bar_count(),
            max_bar_count: default_max_bar_count(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            series_capacity = config.series_capacity,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `BAR_RELAY_*` overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("BAR_RELAY_API_KEY") {
            self.api_key = key.trim().to_string();
        }
        if let Some(syms) = lookup("BAR_RELAY_SYMBOLS") {
            let symbols: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Some(addr) = lookup("BAR_RELAY_BIND_ADDR") {
            self.bind_addr = addr.trim().to_string();
        }
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.series_capacity == 0 {
            bail!("series_capacity must be positive");
        }
        for (name, quota) in [("rest", &self.rest_quota), ("subscription", &self.subscription_quota)] {
            if quota.limit == 0 || quota.window_secs == 0 {
                bail!("{name}_quota needs a positive limit and window");
            }
        }
        if self.reconnect.base_delay_secs == 0 || self.reconnect.max_delay_secs == 0 {
            bail!("reconnect delays must be positive");
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_timeout_secs == 0 {
            bail!("heartbeat interval and timeout must be positive");
        }
        if self.session_queue_depth == 0 || self.event_channel_depth == 0 {
            bail!("queue depths must be positive");
        }
        if self.default_bar_count == 0 || self.default_bar_count > self.max_bar_count {
            bail!("default_bar_count must be within 1..=max_bar_count");
        }
        self.session_calendar()?;
        Ok(())
    }

    pub fn session_calendar(&self) -> Result<SessionCalendar> {
        SessionCalendar::from_name(&self.calendar.time_zone, self.calendar.session_start_hour)
            .context("invalid trading calendar")
    }

    pub fn max_future_skew(&self) -> Duration {
        Duration::from_secs(self.max_future_skew_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn upstream_settings(&self) -> UpstreamSettings {
        UpstreamSettings {
            api_key: self.api_key.clone(),
            base_delay: Duration::from_secs(self.reconnect.base_delay_secs),
            max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
            max_attempts: self.reconnect.max_attempts,
            grace_period: Duration::from_secs(self.reconnect.grace_period_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            subscribe_timeout: self.acquire_timeout(),
        }
    }
}

impl std::fmt::Debug for RuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeConfig")
            .field("provider_ws_url", &self.provider_ws_url)
            .field("history_base_url", &self.history_base_url)
            .field("api_key", &"<redacted>")
            .field("symbols", &self.symbols)
            .field("series_capacity", &self.series_capacity)
            .field("rest_quota", &self.rest_quota)
            .field("subscription_quota", &self.subscription_quota)
            .field("reconnect", &self.reconnect)
            .field("calendar", &self.calendar)
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}
