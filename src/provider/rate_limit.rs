// =============================================================================
// Token Bucket — admission control for provider quotas
// =============================================================================
//
// The provider enforces two independent ceilings:
//   - REST history calls:     25 per minute on the default plan.
//   - Subscription messages:  a handful per 5-minute window.
//
// Each ceiling gets its own bucket of capacity C refilled continuously at
// R tokens/second. Waiting callers queue on a fair mutex, so admission is in
// order of arrival. A bucket never holds more than C tokens, so no burst can
// exceed C calls.
// =============================================================================

use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::FeedError;

/// What `acquire` does when no token is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Queue (FIFO) until a token refills, bounded by the caller's timeout.
    Wait,
    /// Refuse immediately with `QuotaExceeded`.
    FailFast,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Serialisable view of a bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub name: String,
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub available: Option<f64>,
}

pub struct TokenBucket {
    name: String,
    capacity: u32,
    refill_per_sec: f64,
    mode: AdmissionMode,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A full bucket of `capacity` tokens refilled at `refill_per_sec`.
    pub fn new(
        name: impl Into<String>,
        capacity: u32,
        refill_per_sec: f64,
        mode: AdmissionMode,
    ) -> Result<Self, FeedError> {
        let name = name.into();
        if capacity == 0 || !(refill_per_sec.is_finite() && refill_per_sec > 0.0) {
            return Err(FeedError::InvalidArgument(format!(
                "bucket {name} needs a positive capacity and refill rate"
            )));
        }
        debug!(bucket = %name, capacity, refill_per_sec, ?mode, "token bucket created");
        Ok(Self {
            name,
            capacity,
            refill_per_sec,
            mode,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        })
    }

    /// `limit` calls per `window`, e.g. 25 per minute.
    pub fn per_window(
        name: impl Into<String>,
        limit: u32,
        window: Duration,
        mode: AdmissionMode,
    ) -> Result<Self, FeedError> {
        let secs = window.as_secs_f64();
        if secs <= 0.0 {
            return Err(FeedError::InvalidArgument("rate window must be non-zero".into()));
        }
        Self::new(name, limit, f64::from(limit) / secs, mode)
    }

    /// Take `cost` tokens according to the bucket's admission mode.
    pub async fn acquire(&self, cost: u32, timeout: Duration) -> Result<(), FeedError> {
        self.check_cost(cost)?;
        match self.mode {
            AdmissionMode::FailFast => self.try_acquire(cost),
            AdmissionMode::Wait => {
                match tokio::time::timeout(timeout, self.acquire_queued(cost)).await {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        warn!(
                            bucket = %self.name,
                            cost,
                            timeout_ms = timeout.as_millis() as u64,
                            "token wait timed out"
                        );
                        Err(self.exceeded(cost))
                    }
                }
            }
        }
    }

    /// Take `cost` tokens now or fail. Callers already queued keep priority:
    /// if anyone is waiting, this refuses rather than jump the line.
    pub fn try_acquire(&self, cost: u32) -> Result<(), FeedError> {
        self.check_cost(cost)?;
        let Ok(mut state) = self.state.try_lock() else {
            debug!(bucket = %self.name, "bucket busy with queued callers");
            return Err(self.exceeded(cost));
        };
        state.refill(f64::from(self.capacity), self.refill_per_sec);
        if state.tokens >= f64::from(cost) {
            state.tokens -= f64::from(cost);
            debug!(bucket = %self.name, remaining = state.tokens, "token consumed");
            Ok(())
        } else {
            warn!(
                bucket = %self.name,
                available = state.tokens,
                cost,
                "request blocked — would exceed quota"
            );
            Err(self.exceeded(cost))
        }
    }

    async fn acquire_queued(&self, cost: u32) {
        let cost = f64::from(cost);
        let mut state = self.state.lock().await;
        loop {
            state.refill(f64::from(self.capacity), self.refill_per_sec);
            if state.tokens >= cost {
                state.tokens -= cost;
                debug!(bucket = %self.name, remaining = state.tokens, "token consumed");
                return;
            }
            let deficit = cost - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.refill_per_sec);
            debug!(bucket = %self.name, wait_ms = wait.as_millis() as u64, "waiting for token refill");
            tokio::time::sleep(wait).await;
        }
    }

    /// Tokens currently available, or `None` while callers hold the queue.
    pub fn available(&self) -> Option<f64> {
        let mut state = self.state.try_lock().ok()?;
        state.refill(f64::from(self.capacity), self.refill_per_sec);
        Some(state.tokens)
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot {
            name: self.name.clone(),
            capacity: self.capacity,
            refill_per_sec: self.refill_per_sec,
            available: self.available(),
        }
    }

    fn check_cost(&self, cost: u32) -> Result<(), FeedError> {
        if cost == 0 {
            return Err(FeedError::InvalidArgument("token cost must be positive".into()));
        }
        if cost > self.capacity {
            return Err(self.exceeded(cost));
        }
        Ok(())
    }

    fn exceeded(&self, cost: u32) -> FeedError {
        FeedError::QuotaExceeded(format!("{} bucket cannot admit {cost} now", self.name))
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .field("mode", &self.mode)
            .finish()
    }
}
