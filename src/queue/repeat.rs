//! Cron schedules and standing repeat definitions

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::{JobId, JobPayload, RepeatSpec};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("cron expression '{0}' has no upcoming firing")]
    Exhausted(String),
}

/// Parsed cron expression bound to a timezone
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
    tz: Tz,
}

impl CronSchedule {
    /// Parse a cron expression and an IANA timezone name
    ///
    /// Five-field expressions (`min hour dom month dow`) follow Unix cron: they
    /// fire at second 0 and number weekdays 0-7 with Sunday as 0 or 7. Six and
    /// seven-field expressions are passed through unchanged.
    pub fn parse(expr: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let normalized = normalize(expr);
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
        let tz = Tz::from_str(timezone.trim())
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;

        Ok(Self {
            expr: expr.to_string(),
            schedule,
            tz,
        })
    }

    /// First firing strictly after `after_ms` (Unix millis)
    pub fn next_after_ms(&self, after_ms: i64) -> Result<i64, ScheduleError> {
        let after = Utc
            .timestamp_millis_opt(after_ms)
            .single()
            .ok_or_else(|| ScheduleError::Exhausted(self.expr.clone()))?
            .with_timezone(&self.tz);

        self.schedule
            .after(&after)
            .next()
            .map(|at| at.timestamp_millis())
            .ok_or_else(|| ScheduleError::Exhausted(self.expr.clone()))
    }
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn normalize(expr: &str) -> String {
    let mut fields: Vec<String> = expr.split_whitespace().map(String::from).collect();
    if fields.len() == 5 {
        fields[4] = unix_weekdays(&fields[4]);
        fields.insert(0, "0".to_string());
    }
    fields.join(" ")
}

/// Rewrite a Unix day-of-week field (0-7, Sunday is 0 or 7) with day names
///
/// The cron parser numbers days 1-7 from Sunday. Parts that are already
/// names, or that do not parse as Unix days, are passed through for the
/// parser to judge.
fn unix_weekdays(field: &str) -> String {
    if field == "*" || field == "?" {
        return field.to_string();
    }

    let mut days = BTreeSet::new();
    let mut other = Vec::new();
    for part in field.split(',') {
        match unix_weekday_part(part) {
            Some(set) => days.extend(set),
            None => other.push(part.to_string()),
        }
    }

    days.into_iter()
        .map(|day| WEEKDAYS[day].to_string())
        .chain(other)
        .collect::<Vec<_>>()
        .join(",")
}

/// `d`, `a-b`, `*/s`, `a-b/s` or `a/s`
fn unix_weekday_part(part: &str) -> Option<BTreeSet<usize>> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => (range, step.parse::<usize>().ok().filter(|s| *s > 0)?),
        None => (part, 1),
    };
    let (start, end) = match range.split_once('-') {
        _ if range == "*" => (0, 6),
        Some((start, end)) => (unix_day(start)?, unix_day(end)?),
        None if step > 1 => (unix_day(range)?, 7),
        None => {
            let day = unix_day(range)?;
            (day, day)
        }
    };
    if start > end {
        return None;
    }
    Some((start..=end).step_by(step).map(|day| day % 7).collect())
}

fn unix_day(raw: &str) -> Option<usize> {
    raw.parse::<usize>().ok().filter(|day| *day <= 7)
}

/// Standing schedule that regenerates a job at every cron firing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatDefinition {
    pub spec: RepeatSpec,
    pub payload: JobPayload,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    /// Instance waiting for the next firing, if one has been materialized
    pub pending: Option<JobId>,
    pub created_at_ms: i64,
}

impl RepeatDefinition {
    pub fn schedule(&self) -> Result<CronSchedule, ScheduleError> {
        CronSchedule::parse(&self.spec.cron, &self.spec.timezone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn ms(tz: Tz, y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        tz.with_ymd_and_hms(y, mo, d, h, mi, 0)
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn test_five_field_daily() {
        let schedule = CronSchedule::parse("15 10 * * *", "America/Los_Angeles").unwrap();
        let tz = chrono_tz::America::Los_Angeles;

        let before = ms(tz, 2024, 3, 1, 9, 0);
        let next = schedule.next_after_ms(before).unwrap();
        assert_eq!(next, ms(tz, 2024, 3, 1, 10, 15));

        // Strictly after: a firing time yields the following day
        let following = schedule.next_after_ms(next).unwrap();
        let at = Utc.timestamp_millis_opt(following).unwrap().with_timezone(&tz);
        assert_eq!((at.day(), at.hour(), at.minute()), (2, 10, 15));
    }

    #[test]
    fn test_six_field_passthrough() {
        let schedule = CronSchedule::parse("*/5 * * * * *", "UTC").unwrap();
        let base = ms(chrono_tz::UTC, 2024, 1, 1, 0, 0);
        assert_eq!(schedule.next_after_ms(base).unwrap(), base + 5_000);
    }

    #[test]
    fn test_five_field_weekdays_follow_unix_numbering() {
        let utc = chrono_tz::UTC;
        // 2024-01-01 is a Monday
        let monday = ms(utc, 2024, 1, 1, 0, 0);

        let sunday = CronSchedule::parse("* * * * 0", "UTC").unwrap();
        assert_eq!(sunday.next_after_ms(monday).unwrap(), ms(utc, 2024, 1, 7, 0, 0));

        let also_sunday = CronSchedule::parse("0 10 * * 7", "UTC").unwrap();
        assert_eq!(also_sunday.next_after_ms(monday).unwrap(), ms(utc, 2024, 1, 7, 10, 0));

        let mondays = CronSchedule::parse("* * * * 1", "UTC").unwrap();
        assert_eq!(mondays.next_after_ms(monday).unwrap(), monday + 60_000);

        let weekdays = CronSchedule::parse("0 10 * * 1-5", "UTC").unwrap();
        let saturday = ms(utc, 2024, 1, 6, 0, 0);
        assert_eq!(weekdays.next_after_ms(saturday).unwrap(), ms(utc, 2024, 1, 8, 10, 0));

        let weekend = CronSchedule::parse("0 10 * * 6,0", "UTC").unwrap();
        assert_eq!(weekend.next_after_ms(monday).unwrap(), ms(utc, 2024, 1, 6, 10, 0));
    }

    #[test]
    fn test_weekday_field_rewrite() {
        assert_eq!(normalize("15 10 * * *"), "0 15 10 * * *");
        assert_eq!(normalize("0 10 * * 1-5"), "0 0 10 * * MON,TUE,WED,THU,FRI");
        assert_eq!(normalize("0 10 * * 0,7"), "0 0 10 * * SUN");
        assert_eq!(normalize("0 10 * * */2"), "0 0 10 * * SUN,TUE,THU,SAT");
        assert_eq!(normalize("0 10 * * MON-FRI"), "0 0 10 * * MON-FRI");
        assert_eq!(normalize("*/5 * * * * *"), "*/5 * * * * *");
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            CronSchedule::parse("not a cron", "UTC"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("0 10 * * 8", "UTC"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("15 10 * * *", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }
}
