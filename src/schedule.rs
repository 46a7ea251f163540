//! Cron schedule evaluation for dataset regeneration
//!
//! Services declare rebuilds with a standard 5-field cron expression
//! (minute hour day-of-month month day-of-week). The `cron` crate consumes
//! 6/7-field expressions with a leading seconds field, so user input is
//! normalized by prepending `0` before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::Error;

/// A parsed rebuild schedule
#[derive(Clone, Debug)]
pub struct UpdateSchedule {
    inner: Schedule,
}

impl UpdateSchedule {
    /// Parse a 5-field cron expression
    ///
    /// Anything other than exactly five whitespace-separated fields is
    /// rejected up front so a 6-field (seconds-bearing) expression cannot
    /// silently shift meaning after normalization.
    pub fn parse(expr: &str) -> Result<Self, Error> {
        let fields = expr.split_whitespace().count();
        if fields != 5 {
            return Err(Error::schedule(format!(
                "expression '{expr}' has {fields} fields, expected 5 (minute hour dom month dow)"
            )));
        }
        let normalized = format!("0 {}", expr.trim());
        let inner = Schedule::from_str(&normalized)
            .map_err(|e| Error::schedule(format!("invalid expression '{expr}': {e}")))?;
        Ok(Self { inner })
    }

    /// The next fire time strictly after `t`
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&t).next()
    }

    /// Whether a rebuild is due: the schedule fired at least once in
    /// `(last, now]`
    pub fn is_due(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.next_after(last) {
            Some(next) => now >= next,
            None => false,
        }
    }

    /// Duration from `now` until the next fire, for timer-based requeue
    ///
    /// Clamped below at one second so a fire instant that just passed does
    /// not produce a zero-delay hot loop.
    pub fn until_next_fire(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let next = self.next_after(now)?;
        let secs = (next - now).num_seconds().max(1);
        Some(std::time::Duration::from_secs(secs as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn hourly() -> UpdateSchedule {
        UpdateSchedule::parse("0 * * * *").unwrap()
    }

    #[test]
    fn five_field_expressions_parse() {
        assert!(UpdateSchedule::parse("0 * * * *").is_ok());
        assert!(UpdateSchedule::parse("30 3 * * 1").is_ok());
        assert!(UpdateSchedule::parse("*/15 * * * *").is_ok());
    }

    #[test]
    fn wrong_field_counts_are_rejected() {
        for expr in ["* * *", "0 0 * * * *", "", "every hour"] {
            let err = UpdateSchedule::parse(expr).unwrap_err();
            assert!(
                matches!(err, Error::Schedule(_)),
                "expected schedule error for {expr:?}"
            );
        }
    }

    #[test]
    fn garbage_fields_are_rejected() {
        assert!(UpdateSchedule::parse("a b c d e").is_err());
    }

    #[test]
    fn next_after_hour_boundary() {
        let t = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 0).unwrap();
        let next = hourly().next_after(t).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn next_after_is_strictly_after() {
        // A generation created exactly on a fire instant schedules the
        // following one, not itself again.
        let on_the_hour = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let next = hourly().next_after(on_the_hour).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 15, 11, 0, 0).unwrap());
    }

    #[test]
    fn due_iff_now_reaches_next_fire() {
        let last = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let sched = hourly();

        let before = Utc.with_ymd_and_hms(2025, 1, 15, 10, 59, 59).unwrap();
        assert!(!sched.is_due(last, before));

        let exactly = Utc.with_ymd_and_hms(2025, 1, 15, 11, 0, 0).unwrap();
        assert!(sched.is_due(last, exactly));

        let late = Utc.with_ymd_and_hms(2025, 1, 16, 4, 0, 0).unwrap();
        assert!(sched.is_due(last, late));
    }

    #[test]
    fn until_next_fire_never_returns_zero() {
        let just_before = Utc
            .with_ymd_and_hms(2025, 1, 15, 10, 59, 59)
            .unwrap()
            .with_nanosecond(999_999_999)
            .unwrap();
        let wait = hourly().until_next_fire(just_before).unwrap();
        assert!(wait >= std::time::Duration::from_secs(1));
    }
}
