//! Five-field cron expressions evaluated in a schedule's timezone
//!
//! `minute hour day-of-month month day-of-week`, with `*`, lists, ranges,
//! steps (`*/15`, `10-50/10`) and month/day names. Day-of-week accepts 0-7
//! where both 0 and 7 are Sunday. When both day fields are restricted a
//! time matches if either does.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct CronParseError {
    pub expression: String,
    pub reason: String,
}

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Search horizon for the next occurrence
const MAX_SEARCH_DAYS: i64 = 366 * 5;

/// A parsed cron expression; each field is a bitmask of allowed values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fail = |reason: String| CronParseError {
            expression: expression.to_string(),
            reason,
        };

        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(fail(format!("expected 5 fields, got {}", fields.len())));
        }

        let minutes = parse_field(fields[0], 0, 59, &[], 0).map_err(&fail)?;
        let hours = parse_field(fields[1], 0, 23, &[], 0).map_err(&fail)?;
        let days_of_month = parse_field(fields[2], 1, 31, &[], 0).map_err(&fail)?;
        let months = parse_field(fields[3], 1, 12, MONTH_NAMES, 1).map_err(&fail)?;
        let mut days_of_week = parse_field(fields[4], 0, 7, DAY_NAMES, 0).map_err(&fail)?;
        // 7 is Sunday
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: expression.trim().to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Whether a wall-clock time matches, ignoring seconds
    pub fn matches_local(&self, local: &NaiveDateTime) -> bool {
        bit(self.months, local.month())
            && self.day_matches(local.date())
            && bit(self.hours, local.hour())
            && bit(self.minutes, local.minute())
    }

    /// First occurrence strictly after `after`, evaluated in `tz`.
    ///
    /// Wall-clock times skipped by a DST change are skipped; repeated ones
    /// fire once, at the earlier instant.
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let start = after.with_timezone(&tz).naive_local();
        let mut candidate = start
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?
            + Duration::minutes(1);
        let horizon = start + Duration::days(MAX_SEARCH_DAYS);

        while candidate <= horizon {
            if !bit(self.months, candidate.month()) {
                candidate = first_of_next_month(candidate.date())?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !bit(self.hours, candidate.hour()) {
                candidate = candidate.date().and_hms_opt(candidate.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, candidate.minute()) {
                candidate += Duration::minutes(1);
                continue;
            }

            let resolved = match tz.from_local_datetime(&candidate) {
                LocalResult::Single(t) => Some(t),
                LocalResult::Ambiguous(earliest, latest) => {
                    if earliest.with_timezone(&Utc) > after {
                        Some(earliest)
                    } else {
                        Some(latest)
                    }
                }
                LocalResult::None => None,
            };
            if let Some(t) = resolved {
                let utc = t.with_timezone(&Utc);
                if utc > after {
                    return Some(utc);
                }
            }
            candidate += Duration::minutes(1);
        }
        None
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Parse an IANA timezone name such as `Europe/Berlin`
pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| format!("unknown timezone '{}'", name))
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn parse_value(token: &str, names: &[&str], name_base: u32) -> Result<u32, String> {
    if let Ok(value) = token.parse::<u32>() {
        return Ok(value);
    }
    let upper = token.to_ascii_uppercase();
    names
        .iter()
        .position(|n| *n == upper)
        .map(|i| i as u32 + name_base)
        .ok_or_else(|| format!("'{}' is not a number or name", token))
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: &[&str],
    name_base: u32,
) -> Result<u64, String> {
    let mut mask = 0u64;

    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in '{}'", field));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}'", step))?;
                if step == 0 {
                    return Err("step must be at least 1".to_string());
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, names, name_base)?, parse_value(b, names, name_base)?)
        } else {
            let value = parse_value(range, names, name_base)?;
            // `5/10` means from 5 to the end of the range
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };

        if start < min || end > max || start > end {
            return Err(format!(
                "'{}' is outside {}-{}",
                range, min, max
            ));
        }

        let mut value = start;
        while value <= end {
            mask |= 1u64 << value;
            value += step;
        }
    }

    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, after: &str, tz: &str) -> DateTime<Utc> {
        CronExpression::parse(expr)
            .unwrap()
            .next_after(utc(after), parse_timezone(tz).unwrap())
            .unwrap()
    }

    #[test]
    fn test_every_minute_is_strictly_after() {
        assert_eq!(next("* * * * *", "2024-03-01T10:00:00Z", "UTC"), utc("2024-03-01T10:01:00Z"));
        assert_eq!(next("* * * * *", "2024-03-01T10:00:30Z", "UTC"), utc("2024-03-01T10:01:00Z"));
    }

    #[test]
    fn test_steps_and_ranges() {
        assert_eq!(next("*/15 * * * *", "2024-03-01T10:16:00Z", "UTC"), utc("2024-03-01T10:30:00Z"));
        assert_eq!(next("0 9-17/4 * * *", "2024-03-01T10:00:00Z", "UTC"), utc("2024-03-01T13:00:00Z"));
        assert_eq!(next("30 2 1 * *", "2024-12-15T00:00:00Z", "UTC"), utc("2025-01-01T02:30:00Z"));
    }

    #[test]
    fn test_names_and_sunday_as_seven() {
        // 2024-03-01 is a Friday
        assert_eq!(next("0 8 * * MON", "2024-03-01T00:00:00Z", "UTC"), utc("2024-03-04T08:00:00Z"));
        assert_eq!(next("0 8 * * 7", "2024-03-01T00:00:00Z", "UTC"), utc("2024-03-03T08:00:00Z"));
        assert_eq!(next("0 0 1 jun *", "2024-03-01T00:00:00Z", "UTC"), utc("2024-06-01T00:00:00Z"));
    }

    #[test]
    fn test_day_fields_are_ored_when_both_restricted() {
        // 13th of the month or any Friday; 2024-03-01 is a Friday
        assert_eq!(next("0 0 13 * 5", "2024-03-01T00:00:00Z", "UTC"), utc("2024-03-08T00:00:00Z"));
    }

    #[test]
    fn test_timezone_is_applied() {
        // 09:00 in New York during EST is 14:00 UTC
        assert_eq!(
            next("0 9 * * *", "2024-01-10T12:00:00Z", "America/New_York"),
            utc("2024-01-10T14:00:00Z")
        );
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        // 02:30 does not exist in New York on 2024-03-10
        assert_eq!(
            next("30 2 * * *", "2024-03-10T00:00:00Z", "America/New_York"),
            utc("2024-03-11T06:30:00Z")
        );
    }

    #[test]
    fn test_impossible_date_yields_none() {
        let expr = CronExpression::parse("0 0 31 2 *").unwrap();
        assert!(expr.next_after(utc("2024-01-01T00:00:00Z"), Tz::UTC).is_none());
    }

    #[test]
    fn test_invalid_expressions() {
        for bad in ["* * * *", "60 * * * *", "* 24 * * *", "*/0 * * * *", "5-1 * * * *", "* * * FOO *", "1,,2 * * * *"] {
            assert!(CronExpression::parse(bad).is_err(), "{} should not parse", bad);
        }
        assert!(parse_timezone("Mars/Olympus").is_err());
    }
}
