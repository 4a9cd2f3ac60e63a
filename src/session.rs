// =============================================================================
// Trading session window — open/close times and the forced-exit window
// =============================================================================
//
// The forced-exit window runs from `close - liquidation_offset` to `close`.
// Once the window opens, strategy sell logic is bypassed and every open
// position is liquidated at market.
// =============================================================================

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// UTC session boundaries for one trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSession {
    /// Session open, e.g. 09:00.
    pub open: NaiveTime,
    /// Session close, e.g. 15:30.
    pub close: NaiveTime,
    /// Minutes before close at which forced liquidation begins.
    pub liquidation_offset_min: i64,
}

impl TradingSession {
    pub fn new(open: NaiveTime, close: NaiveTime, liquidation_offset_min: i64) -> Self {
        Self {
            open,
            close,
            liquidation_offset_min,
        }
    }

    /// Session close instant on the calendar day of `now`.
    pub fn close_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive().and_time(self.close).and_utc()
    }

    /// Session open instant on the calendar day of `now`.
    pub fn open_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.date_naive().and_time(self.open).and_utc()
    }

    /// Instant at which the forced-exit window opens on the day of `now`.
    pub fn liquidation_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.close_at(now) - Duration::minutes(self.liquidation_offset_min)
    }

    /// Whether the market is open at `now` (open inclusive, close exclusive).
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now >= self.open_at(now) && now < self.close_at(now)
    }

    /// Whether `now` falls inside the forced-exit window.
    pub fn in_liquidation_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.liquidation_at(now) && now < self.close_at(now)
    }

    /// Whether new entries are still allowed: the session is open and the
    /// forced-exit window has not started yet.
    pub fn accepts_entries(&self, now: DateTime<Utc>) -> bool {
        self.is_open(now) && !self.in_liquidation_window(now)
    }
}

impl Default for TradingSession {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(9, 0, 0).expect("valid time"),
            close: NaiveTime::from_hms_opt(15, 30, 0).expect("valid time"),
            liquidation_offset_min: 15,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> TradingSession {
        TradingSession::default()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    #[test]
    fn open_and_close_bounds() {
        let s = session();
        assert!(!s.is_open(at(8, 59)));
        assert!(s.is_open(at(9, 0)));
        assert!(s.is_open(at(15, 29)));
        assert!(!s.is_open(at(15, 30)));
    }

    #[test]
    fn liquidation_window_opens_fifteen_minutes_before_close() {
        let s = session();
        assert!(!s.in_liquidation_window(at(15, 14)));
        assert!(s.in_liquidation_window(at(15, 15)));
        assert!(s.in_liquidation_window(at(15, 29)));
        assert!(!s.in_liquidation_window(at(15, 30)));
    }

    #[test]
    fn entries_refused_inside_the_window() {
        let s = session();
        assert!(s.accepts_entries(at(10, 0)));
        assert!(!s.accepts_entries(at(15, 20)));
        assert!(!s.accepts_entries(at(16, 0)));
    }
}
