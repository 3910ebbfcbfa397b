use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local};
use croner::Cron;

use crate::error::{Result, SchedulerError};

/// Source of fire times for a cron job.
///
/// The runtime only ever asks for the first fire time strictly after a given
/// instant, so implementations stay stateless.
pub trait Trigger: Send + Sync {
    fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>>;
}

/// A parsed 5-field crontab expression, evaluated in local time.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    /// Parse `minute hour day-of-month month day-of-week`.
    ///
    /// Six-field (seconds) patterns and `@daily`-style aliases are rejected.
    pub fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {fields}"),
            ));
        }
        let cron = Cron::new(expression)
            .parse()
            .map_err(|e| invalid(expression, e.to_string()))?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Trigger for CronSchedule {
    fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        self.cron.find_next_occurrence(after, false).ok()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

/// Fires every `period` regardless of the wall clock.
#[derive(Debug, Clone, Copy)]
pub struct FixedInterval(pub Duration);

impl Trigger for FixedInterval {
    fn next_after(&self, after: &DateTime<Local>) -> Option<DateTime<Local>> {
        let period = chrono::Duration::from_std(self.0).ok()?;
        after.checked_add_signed(period)
    }
}

/// Next fire time of `expression` after now.
pub fn next_fire_time(expression: &str) -> Result<DateTime<Local>> {
    let schedule = CronSchedule::parse(expression)?;
    schedule
        .next_after(&Local::now())
        .ok_or_else(|| invalid(expression, "expression never fires"))
}

fn invalid(expression: &str, reason: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidSchedule {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 10, h, m, s).single().unwrap()
    }

    #[test]
    fn every_minute_fires_on_next_minute_boundary() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        let next = s.next_after(&at(10, 15, 30)).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 16, 0));
    }

    #[test]
    fn fire_time_is_strictly_after() {
        let s = CronSchedule::parse("30 10 * * *").unwrap();
        let next = s.next_after(&at(10, 30, 0)).unwrap();
        assert_eq!(
            next.date_naive(),
            at(0, 0, 0).date_naive().succ_opt().unwrap()
        );
        assert_eq!((next.hour(), next.minute()), (10, 30));
    }

    #[test]
    fn steps_and_ranges() {
        let s = CronSchedule::parse("*/15 9-17 * * 1-5").unwrap();
        // 2026-03-10 is a Tuesday.
        let next = s.next_after(&at(9, 1, 0)).unwrap();
        assert_eq!((next.hour(), next.minute()), (9, 15));
        assert_eq!(s.expression(), "*/15 9-17 * * 1-5");
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        for expr in ["", "* * * *", "0 * * * * *", "@daily"] {
            let err = CronSchedule::parse(expr).unwrap_err();
            assert!(
                matches!(err, SchedulerError::InvalidSchedule { .. }),
                "{expr:?} gave {err}"
            );
        }
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("* 25 * * *").is_err());
        assert!(CronSchedule::parse("not a cron expr here").is_err());
    }

    #[test]
    fn fixed_interval_adds_period() {
        let t = FixedInterval(Duration::from_millis(1500));
        let from = at(8, 0, 0);
        let next = t.next_after(&from).unwrap();
        assert_eq!((next - from).num_milliseconds(), 1500);
    }

    #[test]
    fn next_fire_time_is_in_the_future() {
        let next = next_fire_time("0 0 * * *").unwrap();
        assert!(next > Local::now());
        assert!(next_fire_time("bogus").is_err());
    }
}
