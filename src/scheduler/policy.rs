//! Update scheduling policies and next-run arithmetic.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest interval the scheduler accepts, in days.
pub const MAX_INTERVAL_DAYS: u32 = 365;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("interval days out of range: {0} (expected 1..={MAX_INTERVAL_DAYS})")]
    DaysOutOfRange(u32),

    #[error("fixed update time out of range: {hour:02}:{minute:02}")]
    TimeOutOfRange { hour: u8, minute: u8 },
}

/// When the next automatic update happens. Exactly one variant is active;
/// there is no disabled sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum UpdatePolicy {
    /// Every `days` calendar days, keeping the time of day of the anchor run.
    Interval { days: u32 },
    /// Daily at `hour:minute` UTC.
    FixedTime { hour: u8, minute: u8 },
}

impl UpdatePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        match *self {
            UpdatePolicy::Interval { days } => {
                if days < 1 || days > MAX_INTERVAL_DAYS {
                    return Err(PolicyError::DaysOutOfRange(days));
                }
            }
            UpdatePolicy::FixedTime { hour, minute } => {
                if hour > 23 || minute > 59 {
                    return Err(PolicyError::TimeOutOfRange { hour, minute });
                }
            }
        }
        Ok(())
    }

    /// Next run strictly after `anchor`.
    ///
    /// Interval policies add whole calendar days, so the anchor's time of
    /// day is preserved and repeated advancement cannot drift. Fixed-time
    /// policies pick today's `hour:minute` when it is still ahead of the
    /// anchor and roll to tomorrow otherwise.
    pub fn next_run_after(&self, anchor: DateTime<Utc>) -> Result<DateTime<Utc>, PolicyError> {
        self.validate()?;
        match *self {
            UpdatePolicy::Interval { days } => Ok(anchor + Duration::days(i64::from(days))),
            UpdatePolicy::FixedTime { hour, minute } => {
                let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)
                    .ok_or(PolicyError::TimeOutOfRange { hour, minute })?;
                let mut candidate = anchor.date_naive().and_time(time).and_utc();
                if candidate <= anchor {
                    candidate += Duration::days(1);
                }
                Ok(candidate)
            }
        }
    }

    /// First run when no previous schedule exists.
    pub fn first_run(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, PolicyError> {
        self.validate()?;
        match *self {
            UpdatePolicy::Interval { days } => Ok(now + Duration::days(i64::from(days))),
            UpdatePolicy::FixedTime { .. } => self.next_run_after(now),
        }
    }

    /// Advance past a consumed schedule slot.
    ///
    /// Anchored on the slot that was due (not on the completion moment), so
    /// interval runs keep their time of day and a slow attempt does not
    /// shift the cadence. Rolls forward by whole steps until the result is
    /// strictly in the future.
    pub fn advance(
        &self,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, PolicyError> {
        let mut next = self.next_run_after(scheduled)?;
        while next <= now {
            next = self.next_run_after(next)?;
        }
        Ok(next)
    }

    /// Upper bound on the distance between two consecutive runs.
    pub fn max_step(&self) -> Duration {
        match *self {
            UpdatePolicy::Interval { days } => Duration::days(i64::from(days)),
            UpdatePolicy::FixedTime { .. } => Duration::days(1),
        }
    }
}

impl std::fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            UpdatePolicy::Interval { days } => write!(f, "every {days} day(s)"),
            UpdatePolicy::FixedTime { hour, minute } => {
                write!(f, "daily at {hour:02}:{minute:02} UTC")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_interval_preserves_time_of_day() {
        let policy = UpdatePolicy::Interval { days: 7 };
        let next = policy.next_run_after(utc(2024, 1, 1, 10, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 10, 0));
    }

    #[test]
    fn test_fixed_time_rolls_to_next_day_when_passed() {
        let policy = UpdatePolicy::FixedTime { hour: 3, minute: 30 };
        let next = policy.next_run_after(utc(2024, 1, 1, 4, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 2, 3, 30));
    }

    #[test]
    fn test_fixed_time_same_day_when_not_passed() {
        let policy = UpdatePolicy::FixedTime { hour: 3, minute: 30 };
        let next = policy.next_run_after(utc(2024, 1, 1, 2, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 3, 30));
    }

    #[test]
    fn test_fixed_time_exact_boundary_is_not_due_again() {
        let policy = UpdatePolicy::FixedTime { hour: 3, minute: 30 };
        let next = policy.next_run_after(utc(2024, 1, 1, 3, 30)).unwrap();
        assert_eq!(next, utc(2024, 1, 2, 3, 30));
    }

    #[test]
    fn test_fixed_time_is_at_most_a_day_out() {
        let policy = UpdatePolicy::FixedTime { hour: 0, minute: 0 };
        let anchor = utc(2024, 6, 15, 0, 0);
        let next = policy.next_run_after(anchor).unwrap();
        assert!(next > anchor);
        assert!(next - anchor <= Duration::days(1));
    }

    #[test]
    fn test_interval_crosses_month_boundary() {
        let policy = UpdatePolicy::Interval { days: 3 };
        let next = policy.next_run_after(utc(2024, 1, 30, 22, 15)).unwrap();
        assert_eq!(next, utc(2024, 2, 2, 22, 15));
    }

    #[test]
    fn test_advance_rolls_past_now() {
        let policy = UpdatePolicy::Interval { days: 7 };
        let scheduled = utc(2024, 1, 1, 10, 0);
        // Three weeks late: the next slot must still land on the cadence.
        let now = utc(2024, 1, 22, 11, 0);
        let next = policy.advance(scheduled, now).unwrap();
        assert_eq!(next, utc(2024, 1, 29, 10, 0));
    }

    #[test]
    fn test_advance_is_strictly_future() {
        let policy = UpdatePolicy::FixedTime { hour: 3, minute: 30 };
        let scheduled = utc(2024, 1, 1, 3, 30);
        let now = utc(2024, 1, 2, 3, 30);
        let next = policy.advance(scheduled, now).unwrap();
        assert_eq!(next, utc(2024, 1, 3, 3, 30));
        assert!(next > now);
    }

    #[test]
    fn test_first_run_interval_counts_from_now() {
        let policy = UpdatePolicy::Interval { days: 2 };
        let now = utc(2024, 1, 1, 18, 45);
        assert_eq!(policy.first_run(now).unwrap(), utc(2024, 1, 3, 18, 45));
    }

    #[test]
    fn test_validate_rejects_zero_days() {
        let policy = UpdatePolicy::Interval { days: 0 };
        assert_eq!(policy.validate(), Err(PolicyError::DaysOutOfRange(0)));
    }

    #[test]
    fn test_validate_rejects_oversized_interval() {
        let policy = UpdatePolicy::Interval { days: 366 };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_time() {
        let policy = UpdatePolicy::FixedTime { hour: 24, minute: 0 };
        assert_eq!(
            policy.validate(),
            Err(PolicyError::TimeOutOfRange { hour: 24, minute: 0 })
        );
        assert!(UpdatePolicy::FixedTime { hour: 3, minute: 60 }.validate().is_err());
    }

    #[test]
    fn test_next_run_rejects_invalid_policy() {
        let policy = UpdatePolicy::Interval { days: 0 };
        assert!(policy.next_run_after(utc(2024, 1, 1, 0, 0)).is_err());
    }

    #[test]
    fn test_policy_serde_roundtrip() {
        let interval = UpdatePolicy::Interval { days: 7 };
        let json = serde_json::to_string(&interval).unwrap();
        assert!(json.contains(r#""kind":"interval""#));
        assert_eq!(serde_json::from_str::<UpdatePolicy>(&json).unwrap(), interval);

        let fixed = UpdatePolicy::FixedTime { hour: 3, minute: 30 };
        let json = serde_json::to_string(&fixed).unwrap();
        assert!(json.contains(r#""kind":"fixedTime""#));
        assert_eq!(serde_json::from_str::<UpdatePolicy>(&json).unwrap(), fixed);
    }
}
