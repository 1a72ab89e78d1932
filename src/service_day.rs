//! Network-local time handling: service-day boundaries and cyclic
//! time-of-day features.
//!
//! The monitored network operates on Sydney civil time. A "service day" is
//! bounded by a quiet-hours reset (03:00 local by default) rather than
//! literal midnight, so overnight gaps never couple one operating day's
//! statistics to the next.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Australia::Sydney;
use chrono_tz::Tz;

/// Local hour at which a new service day begins.
pub const DEFAULT_RESET_AT_HOUR: u32 = 3;

/// Converts epoch seconds to the network's local civil time.
pub fn local_time(ts: i64) -> DateTime<Tz> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .unwrap_or_default()
        .with_timezone(&Sydney)
}

/// Returns `true` if `cur_ts` falls on a later local calendar date than
/// `prev_ts` and the local hour has passed the reset hour. `None` for
/// `prev_ts` (no prior observation) is never a new service day.
pub fn is_new_service_day(prev_ts: Option<i64>, cur_ts: i64, reset_at_hour: u32) -> bool {
    let Some(prev_ts) = prev_ts else {
        return false;
    };
    let prev = local_time(prev_ts);
    let cur = local_time(cur_ts);
    cur.date_naive() != prev.date_naive() && cur.hour() >= reset_at_hour
}

/// Maps a timestamp to its operating day. Times before the reset hour belong
/// to the previous calendar date.
pub fn service_day(ts: i64, reset_at_hour: u32) -> NaiveDate {
    let dt = local_time(ts);
    let date = dt.date_naive();
    if dt.hour() < reset_at_hour {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}

/// Cyclic time-of-day encoding plus a weekday/weekend indicator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeFeatures {
    pub sin_hour: f64,
    pub cos_hour: f64,
    /// 1 on Saturday/Sunday, 0 otherwise.
    pub day_type: u8,
}

/// Computes [`TimeFeatures`] for a snapshot timestamp.
pub fn time_features(ts: i64) -> TimeFeatures {
    let t = local_time(ts);
    let angle = 2.0 * std::f64::consts::PI * f64::from(t.hour()) / 24.0;
    TimeFeatures {
        sin_hour: angle.sin(),
        cos_hour: angle.cos(),
        day_type: u8::from(t.weekday().num_days_from_monday() >= 5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-05-02 16:00:00 UTC, which is 2024-05-03 02:00 in Sydney (AEST).
    const SYDNEY_0200: i64 = 1_714_665_600;
    // 2024-05-02 18:00:00 UTC, 2024-05-03 04:00 Sydney.
    const SYDNEY_0400: i64 = 1_714_672_800;
    // 2024-05-03 17:30:00 UTC, 2024-05-04 03:30 Sydney.
    const NEXT_DAY_0330: i64 = 1_714_757_400;

    #[test]
    fn test_no_prior_observation_is_not_new_day() {
        assert!(!is_new_service_day(None, NEXT_DAY_0330, 3));
    }

    #[test]
    fn test_same_date_is_not_new_day() {
        assert!(!is_new_service_day(Some(SYDNEY_0200), SYDNEY_0400, 3));
    }

    #[test]
    fn test_cross_date_after_reset_hour_is_new_day() {
        assert!(is_new_service_day(Some(SYDNEY_0400), NEXT_DAY_0330, 3));
    }

    #[test]
    fn test_cross_date_before_reset_hour_is_not_new_day() {
        // 02:00 local on the next date: calendar date changed but we are
        // still inside the previous service day.
        assert!(!is_new_service_day(Some(SYDNEY_0400), SYDNEY_0200 + 86_400, 3));
    }

    #[test]
    fn test_service_day_rolls_back_before_reset_hour() {
        let early = service_day(SYDNEY_0200, 3); // 02:00 local
        let later = service_day(SYDNEY_0400, 3); // 04:00 local
        assert_eq!(early.succ_opt().unwrap(), later);
    }

    #[test]
    fn test_time_features_at_0400_local() {
        let f = time_features(SYDNEY_0400);
        let angle = 2.0 * std::f64::consts::PI * 4.0 / 24.0;
        assert!((f.sin_hour - angle.sin()).abs() < 1e-12);
        assert!((f.cos_hour - angle.cos()).abs() < 1e-12);
        // 2024-05-03 is a Friday
        assert_eq!(f.day_type, 0);
    }

    #[test]
    fn test_day_type_weekend() {
        let f = time_features(NEXT_DAY_0330); // Saturday local
        assert_eq!(f.day_type, 1);
    }
}
