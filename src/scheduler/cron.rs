//! Cron expressions on top of the `cron` crate
//!
//! Accepts standard five-field expressions
//! (`minute hour day-of-month month day-of-week`) and the usual `@` macros.
//! The `cron` crate wants a leading seconds field and numbers weekdays
//! 1-7 from Sunday, so expressions are rewritten before parsing. Day-of-month
//! and day-of-week are OR-ed when both are restricted, as in Vixie cron.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Upper bound on how far ahead [`CronExpr::next_after`] looks
const SEARCH_HORIZON_DAYS: i64 = 5 * 366;

const MONTH_NAMES: &[&str] = &[
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: &[&str] = &["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Error, PartialEq)]
pub enum CronError {
    #[error("Expected 5 fields, found {0}")]
    FieldCount(usize),

    #[error("Unknown macro '{0}'")]
    UnknownMacro(String),

    #[error("Invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid cron expression '{expression}': {reason}")]
    Expression { expression: String, reason: String },
}

/// A parsed cron schedule
///
/// Holds one `cron::Schedule`, or two when day-of-month and day-of-week
/// are both restricted and either may match.
pub struct CronExpr {
    source: String,
    /// Six-field expressions handed to the `cron` crate
    rewritten: Vec<String>,
    schedules: Vec<Schedule>,
}

impl CronExpr {
    /// Parses a five-field expression or an `@` macro
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            match trimmed.to_ascii_lowercase().as_str() {
                "@hourly" => "0 * * * *",
                "@daily" | "@midnight" => "0 0 * * *",
                "@weekly" => "0 0 * * 0",
                "@monthly" => "0 0 1 * *",
                "@yearly" | "@annually" => "0 0 1 1 *",
                _ => return Err(CronError::UnknownMacro(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        let [minute, hour, dom, month, dow] = [fields[0], fields[1], fields[2], fields[3], fields[4]];

        for (name, field) in [
            ("minute", minute),
            ("hour", hour),
            ("day-of-month", dom),
            ("month", month),
        ] {
            check_steps(name, field)?;
        }
        let month = month_numbers(month);
        let weekdays = weekday_list(dow)?;

        let dom_restricted = !(dom.starts_with('*') || dom == "?");
        let dow_restricted = !(dow.starts_with('*') || dow == "?");

        let rewritten = if dom_restricted && dow_restricted {
            vec![
                format!("0 {} {} {} {} *", minute, hour, dom, month),
                format!("0 {} {} * {} {}", minute, hour, month, weekdays),
            ]
        } else {
            vec![format!("0 {} {} {} {} {}", minute, hour, dom, month, weekdays)]
        };

        let schedules = rewritten
            .iter()
            .map(|expr| {
                Schedule::from_str(expr).map_err(|e| CronError::Expression {
                    expression: trimmed.to_string(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: trimmed.to_string(),
            rewritten,
            schedules,
        })
    }

    /// Maps a monitor frequency preset to its expression
    ///
    /// `hourly` runs on the hour, `daily` at 02:00 and `weekly` at 02:00 on
    /// Sundays.
    pub fn from_frequency(frequency: &str) -> Option<Self> {
        let expression = match frequency.trim().to_ascii_lowercase().as_str() {
            "hourly" => "0 * * * *",
            "daily" => "0 2 * * *",
            "weekly" => "0 2 * * 0",
            _ => return None,
        };
        Self::parse(expression).ok()
    }

    /// Accepts either a frequency preset or a cron expression
    pub fn from_schedule(schedule: &str) -> Result<Self, CronError> {
        match Self::from_frequency(schedule) {
            Some(expr) => Ok(expr),
            None => Self::parse(schedule),
        }
    }

    /// The expression as written
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First occurrence strictly after `now`
    ///
    /// Returns `None` when nothing matches within five years, which only
    /// happens for impossible dates such as February 30th.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let horizon = now + Duration::days(SEARCH_HORIZON_DAYS);
        self.schedules
            .iter()
            .filter_map(|schedule| schedule.after(&now).next())
            .filter(|next| *next <= horizon)
            .min()
    }
}

impl PartialEq for CronExpr {
    fn eq(&self, other: &Self) -> bool {
        self.rewritten == other.rewritten
    }
}

impl Eq for CronExpr {}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronExpr")
            .field("source", &self.source)
            .field("rewritten", &self.rewritten)
            .finish()
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Rejects zero steps, which the `cron` crate does not reject itself
fn check_steps(name: &'static str, field: &str) -> Result<(), CronError> {
    for part in field.split(',') {
        if let Some((_, step)) = part.split_once('/') {
            if step.trim().parse::<u32>().ok() == Some(0) {
                return Err(CronError::InvalidField {
                    field: name,
                    value: field.to_string(),
                    reason: "step must be positive".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Replaces three-letter month names with their numbers
fn month_numbers(field: &str) -> String {
    let mut field = field.to_ascii_lowercase();
    for (index, name) in MONTH_NAMES.iter().enumerate() {
        field = field.replace(name, &(index + 1).to_string());
    }
    field
}

/// Rewrites a crontab day-of-week field (0-7, 0 and 7 both Sunday) as an
/// explicit list in the `cron` crate's numbering (1-7 from Sunday)
fn weekday_list(field: &str) -> Result<String, CronError> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let invalid = |reason: String| CronError::InvalidField {
        field: "day-of-week",
        value: field.to_string(),
        reason,
    };

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| invalid(format!("bad step '{}'", step)))?;
                if step == 0 {
                    return Err(invalid("step must be positive".to_string()));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range == "*" {
            (0, 6)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (weekday(lo).map_err(&invalid)?, weekday(hi).map_err(&invalid)?)
        } else {
            let day = weekday(range).map_err(&invalid)?;
            // `a/n` runs from `a` to Saturday
            if part.contains('/') {
                (day, 6)
            } else {
                (day, day)
            }
        };

        if start > end {
            return Err(invalid(format!("range {}-{} is reversed", start, end)));
        }
        for day in (start..=end).step_by(step) {
            days[day % 7] = true;
        }
    }

    let list: Vec<String> = days
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(day, _)| (day + 1).to_string())
        .collect();
    Ok(list.join(","))
}

fn weekday(token: &str) -> Result<usize, String> {
    let lower = token.trim().to_ascii_lowercase();
    if let Some(index) = DAY_NAMES.iter().position(|name| lower.starts_with(name)) {
        return Ok(index);
    }
    match lower.parse::<usize>() {
        // 7 is Sunday again; folded by the caller
        Ok(day) if day <= 7 => Ok(day),
        Ok(day) => Err(format!("{} is outside 0-7", day)),
        Err(_) => Err(format!("'{}' is not a weekday", token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        CronExpr::parse(expr).unwrap().next_after(now)
    }

    #[test]
    fn test_every_five_minutes() {
        assert_eq!(next("*/5 * * * *", at(2024, 1, 1, 10, 3)), Some(at(2024, 1, 1, 10, 5)));
        // Strictly after `now`
        assert_eq!(next("*/5 * * * *", at(2024, 1, 1, 10, 5)), Some(at(2024, 1, 1, 10, 10)));
    }

    #[test]
    fn test_seconds_are_truncated() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 10, 4, 59).unwrap();
        assert_eq!(next("* * * * *", now), Some(at(2024, 1, 1, 10, 5)));
    }

    #[test]
    fn test_missed_triggers_do_not_accumulate() {
        // Three hours late: the next occurrence is still in the future
        let now = at(2024, 1, 1, 13, 0);
        assert_eq!(next("0 * * * *", now), Some(at(2024, 1, 1, 14, 0)));
    }

    #[test]
    fn test_daily_rolls_over_month_and_year() {
        assert_eq!(next("30 2 * * *", at(2024, 12, 31, 3, 0)), Some(at(2025, 1, 1, 2, 30)));
    }

    #[test]
    fn test_lists_ranges_and_names() {
        let expr = "0 9-17/4 * jan,jun mon-fri";
        // 2024-01-06 is a Saturday
        assert_eq!(next(expr, at(2024, 1, 6, 0, 0)), Some(at(2024, 1, 8, 9, 0)));
        assert_eq!(next(expr, at(2024, 1, 8, 9, 0)), Some(at(2024, 1, 8, 13, 0)));
        assert_eq!(next(expr, at(2024, 1, 8, 17, 0)), Some(at(2024, 1, 9, 9, 0)));
    }

    #[test]
    fn test_numeric_weekdays_count_from_sunday() {
        // 2024-01-03 is a Wednesday
        assert_eq!(next("0 0 * * 1", at(2024, 1, 3, 0, 0)), Some(at(2024, 1, 8, 0, 0)));
        assert_eq!(next("0 0 * * 1-5", at(2024, 1, 6, 0, 0)), Some(at(2024, 1, 8, 0, 0)));
        assert_eq!(next("0 0 * * 6", at(2024, 1, 3, 0, 0)), Some(at(2024, 1, 6, 0, 0)));
    }

    #[test]
    fn test_sunday_as_seven() {
        // 2024-01-07 is a Sunday
        assert_eq!(next("0 0 * * 7", at(2024, 1, 3, 0, 0)), Some(at(2024, 1, 7, 0, 0)));
        assert_eq!(next("0 0 * * 0", at(2024, 1, 3, 0, 0)), Some(at(2024, 1, 7, 0, 0)));
        assert_eq!(
            CronExpr::parse("0 0 * * 7").unwrap(),
            CronExpr::parse("0 0 * * 0").unwrap()
        );
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // The 15th or any Monday, whichever comes first
        let expr = "0 0 15 * mon";
        assert_eq!(next(expr, at(2024, 1, 9, 0, 0)), Some(at(2024, 1, 15, 0, 0)));
        assert_eq!(next(expr, at(2024, 1, 2, 0, 0)), Some(at(2024, 1, 8, 0, 0)));
    }

    #[test]
    fn test_macros() {
        assert_eq!(next("@hourly", at(2024, 1, 1, 10, 30)), Some(at(2024, 1, 1, 11, 0)));
        assert_eq!(next("@daily", at(2024, 1, 1, 10, 30)), Some(at(2024, 1, 2, 0, 0)));
        // 2024-01-07 is a Sunday
        assert_eq!(next("@weekly", at(2024, 1, 1, 10, 30)), Some(at(2024, 1, 7, 0, 0)));
        assert_eq!(next("@monthly", at(2024, 1, 1, 10, 30)), Some(at(2024, 2, 1, 0, 0)));
        assert_eq!(next("@yearly", at(2024, 1, 1, 10, 30)), Some(at(2025, 1, 1, 0, 0)));
        assert!(matches!(
            CronExpr::parse("@fortnightly"),
            Err(CronError::UnknownMacro(_))
        ));
    }

    #[test]
    fn test_frequency_presets() {
        let daily = CronExpr::from_frequency("daily").unwrap();
        assert_eq!(daily.next_after(at(2024, 1, 1, 3, 0)), Some(at(2024, 1, 2, 2, 0)));
        assert!(CronExpr::from_frequency("monthly").is_none());

        assert!(CronExpr::from_schedule("weekly").is_ok());
        assert!(CronExpr::from_schedule("*/15 * * * *").is_ok());
        assert!(CronExpr::from_schedule("sometimes").is_err());
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 0 29 2 *", at(2025, 3, 1, 0, 0)), Some(at(2028, 2, 29, 0, 0)));
    }

    #[test]
    fn test_impossible_date_has_no_occurrence() {
        assert_eq!(next("0 0 30 2 *", at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_invalid_expressions() {
        assert_eq!(CronExpr::parse("* * *"), Err(CronError::FieldCount(3)));
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 24 * * *").is_err());
        assert!(CronExpr::parse("* * 0 * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err());
        assert!(CronExpr::parse("* * * foo *").is_err());
        assert!(CronExpr::parse("* * * * 8").is_err());
        assert!(CronExpr::parse("* * * * fri-mon").is_err());
    }

    #[test]
    fn test_display_keeps_source() {
        assert_eq!(CronExpr::parse(" */5 * * * * ").unwrap().to_string(), "*/5 * * * *");
    }
}
