use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Defines when and how often a task should run.
///
/// Stored as a JSON string in the `tasks.schedule` column; the scheduler
/// evaluates it to concrete fire times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Run repeatedly with a fixed interval in seconds. The first fire is
    /// one interval after registration, not aligned to any boundary.
    Interval { every_secs: u64 },

    /// Run every day at the given hour and minute (UTC).
    Daily { hour: u8, minute: u8 },

    /// Run on a specific weekday (0 = Monday … 6 = Sunday) at the given time (UTC).
    Weekly { weekday: u8, hour: u8, minute: u8 },

    /// Run on a specific day of the month (1–31) at the given time (UTC).
    /// Months without that day are skipped (a day-31 schedule never fires in
    /// April).
    Monthly { day: u8, hour: u8, minute: u8 },

    /// Run according to a 5-field cron expression
    /// (minute hour day-of-month month day-of-week, UTC).
    Cron { expression: String },
}

impl Schedule {
    /// Parse a human interval expression into an `Interval` schedule.
    ///
    /// Accepts `"30s"`, `"5m"`, `"1h"`, `"1d"`; a bare number is minutes.
    pub fn parse_interval(expr: &str) -> Result<Schedule> {
        let expr = expr.trim();
        let (digits, unit) = match expr.chars().last() {
            Some(c) if c.is_ascii_digit() => (expr, 60u64), // bare number = minutes
            Some('s') => (&expr[..expr.len() - 1], 1),
            Some('m') => (&expr[..expr.len() - 1], 60),
            Some('h') => (&expr[..expr.len() - 1], 3600),
            Some('d') => (&expr[..expr.len() - 1], 86_400),
            _ => {
                return Err(CoreError::InvalidSchedule(format!(
                    "bad interval expression: {expr:?}"
                )))
            }
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| CoreError::InvalidSchedule(format!("bad interval expression: {expr:?}")))?;
        if n == 0 {
            return Err(CoreError::InvalidSchedule(
                "interval must be greater than zero".to_string(),
            ));
        }
        Ok(Schedule::Interval {
            every_secs: n * unit,
        })
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Once { at } => write!(f, "once at {}", at.to_rfc3339()),
            Schedule::Interval { every_secs } => write!(f, "every {every_secs}s"),
            Schedule::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02}"),
            Schedule::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let day = match weekday {
                    0 => "mon",
                    1 => "tue",
                    2 => "wed",
                    3 => "thu",
                    4 => "fri",
                    5 => "sat",
                    _ => "sun",
                };
                write!(f, "weekly on {day} at {hour:02}:{minute:02}")
            }
            Schedule::Monthly { day, hour, minute } => {
                write!(f, "monthly on day {day} at {hour:02}:{minute:02}")
            }
            Schedule::Cron { expression } => write!(f, "cron {expression}"),
        }
    }
}
