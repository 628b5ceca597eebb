// =============================================================================
// Session Calendar — bucket boundaries for every timeframe
// =============================================================================
//
// Fixed timeframes (1m through 4H) are plain modulo arithmetic on epoch
// seconds. Calendar timeframes (1D, 1W, 1M) follow the instrument's trading
// session: a session opening at 17:00 local time belongs to the *next*
// calendar date, weeks start at the Monday session and months at the session
// of the first calendar day. Bucket starts are always returned as UTC epoch
// seconds and never exceed the input time.
// =============================================================================

use chrono::offset::LocalResult;
use chrono::{DateTime, Datelike, Days, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::FeedError;
use crate::types::Timeframe;

/// Longest local-time gap we step across when a session open falls into a
/// DST spring-forward hole.
const MAX_DST_SHIFT_MINUTES: i64 = 180;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCalendar {
    tz: Tz,
    session_start_hour: u32,
}

impl SessionCalendar {
    pub fn new(tz: Tz, session_start_hour: u32) -> Result<Self, FeedError> {
        if session_start_hour >= 24 {
            return Err(FeedError::InvalidArgument(format!(
                "session start hour must be below 24, got {session_start_hour}"
            )));
        }
        Ok(Self {
            tz,
            session_start_hour,
        })
    }

    /// Parse an IANA zone name such as `America/Chicago`.
    pub fn from_name(zone: &str, session_start_hour: u32) -> Result<Self, FeedError> {
        let tz: Tz = zone
            .parse()
            .map_err(|e| FeedError::InvalidArgument(format!("unknown time zone {zone}: {e}")))?;
        Self::new(tz, session_start_hour)
    }

    /// Plain UTC days, Monday weeks and calendar months.
    pub fn utc() -> Self {
        Self {
            tz: Tz::UTC,
            session_start_hour: 0,
        }
    }

    pub fn bucket_start(&self, timeframe: Timeframe, time: i64) -> i64 {
        if let Some(width) = timeframe.fixed_secs() {
            return time.saturating_sub(time.rem_euclid(width));
        }

        let date = self.trading_date(time);
        let anchor = match timeframe {
            Timeframe::W1 => {
                let back = u64::from(date.weekday().num_days_from_monday());
                date.checked_sub_days(Days::new(back)).unwrap_or(date)
            }
            Timeframe::MN1 => date.with_day(1).unwrap_or(date),
            _ => date,
        };
        self.session_open(anchor).min(time)
    }

    /// The session date an instant belongs to.
    fn trading_date(&self, time: i64) -> NaiveDate {
        let utc = DateTime::<Utc>::from_timestamp(time, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let local = utc.with_timezone(&self.tz).naive_local();
        if self.session_start_hour == 0 {
            return local.date();
        }
        let shift = Duration::hours(24 - i64::from(self.session_start_hour));
        (local + shift).date()
    }

    /// UTC instant at which the session for `trading_date` opens.
    fn session_open(&self, trading_date: NaiveDate) -> i64 {
        let open_date = if self.session_start_hour == 0 {
            trading_date
        } else {
            trading_date.pred_opt().unwrap_or(trading_date)
        };
        let naive = open_date
            .and_hms_opt(self.session_start_hour, 0, 0)
            .unwrap_or_else(|| open_date.and_time(chrono::NaiveTime::MIN));
        self.resolve_local(naive)
    }

    fn resolve_local(&self, naive: NaiveDateTime) -> i64 {
        let mut candidate = naive;
        for _ in 0..=MAX_DST_SHIFT_MINUTES {
            match self.tz.from_local_datetime(&candidate) {
                LocalResult::Single(dt) => return dt.timestamp(),
                LocalResult::Ambiguous(earliest, _) => return earliest.timestamp(),
                LocalResult::None => candidate += Duration::minutes(1),
            }
        }
        // Unreachable for real zones; fall back to treating the wall time as UTC.
        Utc.from_utc_datetime(&naive).timestamp()
    }
}

impl Default for SessionCalendar {
    fn default() -> Self {
        Self::utc()
    }
}
