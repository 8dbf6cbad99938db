//! Trading calendars.
//!
//! Gap and coverage checks need to know when a feed is *supposed* to be
//! quiet. That is market policy, not engine logic, so it is injected as a
//! capability. Two implementations ship: the weekly FX session and an
//! always-open calendar for 24/7 feeds and tests. Holidays and DST edges
//! are deliberately out of scope.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc, Weekday};

use crate::config::CalendarKind;

/// When a market is expected to produce bars.
pub trait TradingCalendar: Send + Sync {
    /// True if the market is expected to be trading at `ts`.
    fn is_active(&self, ts: DateTime<Utc>) -> bool;

    /// Number of `step`-wide windows inside `[start, end)` whose start
    /// falls in an active session.
    fn active_steps_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> i64 {
        if end <= start || step <= Duration::zero() {
            return 0;
        }
        let mut count = 0;
        let mut t = start;
        while t < end {
            if self.is_active(t) {
                count += 1;
            }
            t += step;
        }
        count
    }
}

/// Weekly FX session: closed from Friday 22:00 UTC until Sunday 22:00 UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct FxWeekCalendar;

impl TradingCalendar for FxWeekCalendar {
    fn is_active(&self, ts: DateTime<Utc>) -> bool {
        match ts.weekday() {
            Weekday::Sat => false,
            Weekday::Fri => ts.hour() < 22,
            Weekday::Sun => ts.hour() >= 22,
            _ => true,
        }
    }
}

/// A market with no scheduled closures.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl TradingCalendar for AlwaysOpen {
    fn is_active(&self, _ts: DateTime<Utc>) -> bool {
        true
    }
}

/// Build the configured calendar.
pub fn from_kind(kind: CalendarKind) -> Box<dyn TradingCalendar> {
    match kind {
        CalendarKind::FxWeek => Box::new(FxWeekCalendar),
        CalendarKind::AlwaysOpen => Box::new(AlwaysOpen),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn fx_week_closes_over_the_weekend() {
        let cal = FxWeekCalendar;
        // Friday 2024-06-07
        assert!(cal.is_active(Utc.with_ymd_and_hms(2024, 6, 7, 21, 59, 0).unwrap()));
        assert!(!cal.is_active(Utc.with_ymd_and_hms(2024, 6, 7, 22, 0, 0).unwrap()));
        // Saturday fully closed
        assert!(!cal.is_active(Utc.with_ymd_and_hms(2024, 6, 8, 12, 0, 0).unwrap()));
        // Sunday reopens at 22:00
        assert!(!cal.is_active(Utc.with_ymd_and_hms(2024, 6, 9, 21, 59, 0).unwrap()));
        assert!(cal.is_active(Utc.with_ymd_and_hms(2024, 6, 9, 22, 0, 0).unwrap()));
        // Midweek open
        assert!(cal.is_active(Utc.with_ymd_and_hms(2024, 6, 11, 3, 0, 0).unwrap()));
    }

    #[test]
    fn active_steps_skip_closed_windows() {
        let cal = FxWeekCalendar;
        // Friday 21:00 -> Saturday 00:00: only 21:00-22:00 is active.
        let start = Utc.with_ymd_and_hms(2024, 6, 7, 21, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 8, 0, 0, 0).unwrap();
        assert_eq!(cal.active_steps_between(start, end, Duration::minutes(1)), 60);

        let always = AlwaysOpen;
        assert_eq!(
            always.active_steps_between(start, end, Duration::minutes(1)),
            180
        );
    }

    #[test]
    fn empty_or_inverted_ranges_count_zero() {
        let cal = AlwaysOpen;
        let t = Utc.with_ymd_and_hms(2024, 6, 7, 21, 0, 0).unwrap();
        assert_eq!(cal.active_steps_between(t, t, Duration::minutes(1)), 0);
        assert_eq!(
            cal.active_steps_between(t, t - Duration::minutes(5), Duration::minutes(1)),
            0
        );
    }
}
