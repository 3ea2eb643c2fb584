//! Five-field cron expression parsing and evaluation.
//!
//! Format: `minute hour day month weekday`, with `*`, single values, lists
//! (`1,3,5`), ranges (`1-5`), and steps (`*/15`). Weekdays are 0-6 with
//! Sunday as 0, so `1-5` reads as Monday through Friday.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

use crate::error::{Result, SchedulerError};

/// Minutes scanned ahead by [`CronExpression::next_after`]. An expression
/// that matches nothing within a year (e.g. February 30th) never fires.
const SCAN_LIMIT_MINUTES: i64 = 366 * 24 * 60;

/// A parsed cron expression. All five fields must match for a fire.
#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

#[derive(Debug, Clone)]
enum CronField {
    /// `*` — matches every value.
    Any,
    Value(u32),
    List(Vec<u32>),
    Range(u32, u32),
    /// `*/n` — every n-th value counted from the field's minimum.
    Step { base: u32, step: u32 },
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Value(v) => *v == value,
            Self::List(values) => values.contains(&value),
            Self::Range(start, end) => value >= *start && value <= *end,
            Self::Step { base, step } => value >= *base && (value - base) % step == 0,
        }
    }
}

impl CronExpression {
    /// Parse a five-field expression, checking every value against its
    /// field's range.
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron expression '{expression}' must have 5 fields (minute hour day month weekday)"
            )));
        }

        Ok(Self {
            minute: parse_field(parts[0], "minute", 0, 59)?,
            hour: parse_field(parts[1], "hour", 0, 23)?,
            day: parse_field(parts[2], "day", 1, 31)?,
            month: parse_field(parts[3], "month", 1, 12)?,
            weekday: parse_field(parts[4], "weekday", 0, 6)?,
        })
    }

    /// Whether this expression fires at `time` (seconds are ignored).
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.day.matches(time.day())
            && self.month.matches(time.month())
            && self.weekday.matches(time.weekday().num_days_from_sunday())
    }

    /// The first whole minute strictly after `after` at which the
    /// expression fires, or `None` when nothing matches within a year.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = after.with_second(0)?.with_nanosecond(0)?;
        let mut cursor = floor + Duration::minutes(1);
        for _ in 0..SCAN_LIMIT_MINUTES {
            if self.matches(&cursor) {
                return Some(cursor);
            }
            cursor += Duration::minutes(1);
        }
        None
    }
}

fn parse_field(field: &str, name: &str, min: u32, max: u32) -> Result<CronField> {
    let out_of_range = |value: u32| {
        SchedulerError::InvalidSchedule(format!(
            "cron {name} value {value} is outside {min}-{max}"
        ))
    };
    let bad_number = |raw: &str| {
        SchedulerError::InvalidSchedule(format!("cron {name} field has a bad number: '{raw}'"))
    };

    if field == "*" {
        return Ok(CronField::Any);
    }

    if let Some(raw) = field.strip_prefix("*/") {
        let step: u32 = raw.parse().map_err(|_| bad_number(raw))?;
        if step == 0 || step > max {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron {name} step must be 1-{max}"
            )));
        }
        return Ok(CronField::Step { base: min, step });
    }

    if field.contains('-') {
        let (start_raw, end_raw) = field
            .split_once('-')
            .filter(|(s, e)| !s.is_empty() && !e.is_empty() && !e.contains('-'))
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!(
                    "cron {name} field has a bad range: '{field}'"
                ))
            })?;
        let start: u32 = start_raw.parse().map_err(|_| bad_number(start_raw))?;
        let end: u32 = end_raw.parse().map_err(|_| bad_number(end_raw))?;
        if start < min || end > max {
            return Err(out_of_range(if start < min { start } else { end }));
        }
        if start > end {
            return Err(SchedulerError::InvalidSchedule(format!(
                "cron {name} range {start}-{end} is inverted"
            )));
        }
        return Ok(CronField::Range(start, end));
    }

    if field.contains(',') {
        let mut values = Vec::new();
        for raw in field.split(',') {
            let value: u32 = raw.parse().map_err(|_| bad_number(raw))?;
            if value < min || value > max {
                return Err(out_of_range(value));
            }
            values.push(value);
        }
        return Ok(CronField::List(values));
    }

    let value: u32 = field.parse().map_err(|_| bad_number(field))?;
    if value < min || value > max {
        return Err(out_of_range(value));
    }
    Ok(CronField::Value(value))
}
