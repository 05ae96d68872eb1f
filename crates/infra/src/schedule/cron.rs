//! Cron expression parsing and next-occurrence computation (UTC).

use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },
}

/// A parsed cron schedule.
///
/// Accepts the classic 5-field form (`min hour dom month dow`) and the
/// 6/7-field form with a leading seconds field (and optional year). A 5-field
/// expression fires on second 0.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: ::cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |reason: String| ScheduleError::InvalidExpression {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        let mut normalized: Vec<&str> = match fields.len() {
            5 => std::iter::once("0").chain(fields.iter().copied()).collect(),
            6 | 7 => fields,
            n => return Err(invalid(format!("expected 5, 6 or 7 fields, got {n}"))),
        };
        // Quartz-style "no specific value" marker.
        for field in normalized.iter_mut() {
            if *field == "?" {
                *field = "*";
            }
        }

        let schedule = ::cron::Schedule::from_str(&normalized.join(" "))
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First occurrence strictly after `from`, or `None` if the schedule never
    /// fires again.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).find(|at| *at > from)
    }
}

impl FromStr for CronSchedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl core::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn every_minute_with_seconds_field() {
        let schedule = CronSchedule::parse("0 0/1 * * * ?").unwrap();
        assert_eq!(schedule.next_after(at(0, 0, 30)), Some(at(0, 1, 0)));
    }

    #[test]
    fn five_field_expression_fires_on_second_zero() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(schedule.next_after(at(0, 0, 30)), Some(at(0, 15, 0)));
        assert_eq!(schedule.expression(), "*/15 * * * *");
    }

    #[test]
    fn next_is_strictly_after_an_exact_match() {
        let schedule = CronSchedule::parse("0 * * * * *").unwrap();
        assert_eq!(schedule.next_after(at(0, 1, 0)), Some(at(0, 2, 0)));
    }

    #[test]
    fn daily_schedule_rolls_over_midnight() {
        let schedule = CronSchedule::parse("0 30 2 * * *").unwrap();
        let next = schedule.next_after(at(3, 0, 0)).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 2, 30, 0).unwrap());
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for expr in ["", "* * *", "61 * * * * *", "not a cron at all x"] {
            let err = CronSchedule::parse(expr).unwrap_err();
            assert!(matches!(err, ScheduleError::InvalidExpression { .. }), "{expr}");
        }
    }

    proptest! {
        #[test]
        fn occurrences_are_strictly_increasing(offset in 0i64..10_000_000, minute in 1u32..30) {
            let schedule = CronSchedule::parse(&format!("0 */{minute} * * * *")).unwrap();
            let from = at(0, 0, 0) + Duration::seconds(offset);

            let first = schedule.next_after(from).unwrap();
            let second = schedule.next_after(first).unwrap();
            prop_assert!(first > from);
            prop_assert!(second > first);
            prop_assert!(first - from <= Duration::hours(1));
        }
    }
}
