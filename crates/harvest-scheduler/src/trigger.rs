use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use tracing::warn;

use harvest_core::Schedule;

use crate::cron::CronExpression;
use crate::error::{Result, SchedulerError};

/// Months to scan forward for a monthly day-of-month that exists. Day 31
/// fires at most every other month, so this bound is never reached by a
/// schedule that can fire at all.
const MONTHLY_SCAN_LIMIT: u32 = 48;

/// Compute the next UTC fire time for `schedule` strictly after `after`.
///
/// Returns `None` when the schedule is exhausted (a `Once` whose instant has
/// passed). Pure — no clock access, no persistence — so the same inputs
/// always yield the same answer.
pub fn next_fire_time(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once { at } => {
            // Fire only if the instant is still in the future.
            if *at > after {
                Some(*at)
            } else {
                None
            }
        }

        Schedule::Interval { every_secs } => {
            Some(after + Duration::seconds(i64::try_from(*every_secs).ok()?))
        }

        Schedule::Daily { hour, minute } => {
            // Build today's candidate at HH:MM:00 UTC.
            let candidate = Utc
                .with_ymd_and_hms(
                    after.year(),
                    after.month(),
                    after.day(),
                    *hour as u32,
                    *minute as u32,
                    0,
                )
                .single()?;
            if candidate > after {
                Some(candidate)
            } else {
                // Today's window has passed — advance to tomorrow.
                Some(candidate + Duration::days(1))
            }
        }

        Schedule::Weekly {
            weekday,
            hour,
            minute,
        } => {
            // 0=Monday … 6=Sunday, matching chrono's `num_days_from_monday`.
            let current = after.weekday().num_days_from_monday() as i64;
            let target = (*weekday as i64).clamp(0, 6);
            let days_ahead = (target - current).rem_euclid(7);

            let candidate_day = after + Duration::days(days_ahead);
            let candidate = Utc
                .with_ymd_and_hms(
                    candidate_day.year(),
                    candidate_day.month(),
                    candidate_day.day(),
                    *hour as u32,
                    *minute as u32,
                    0,
                )
                .single()?;

            if candidate > after {
                Some(candidate)
            } else {
                // The time on the target weekday has already passed this week.
                Some(candidate + Duration::days(7))
            }
        }

        Schedule::Monthly { day, hour, minute } => {
            let mut year = after.year();
            let mut month = after.month();
            for _ in 0..MONTHLY_SCAN_LIMIT {
                // Months without this day (e.g. the 31st in April) produce no
                // candidate and are skipped, not clamped.
                if let Some(candidate) = Utc
                    .with_ymd_and_hms(year, month, *day as u32, *hour as u32, *minute as u32, 0)
                    .single()
                {
                    if candidate > after {
                        return Some(candidate);
                    }
                }
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
            }
            None
        }

        Schedule::Cron { expression } => match CronExpression::parse(expression) {
            Ok(parsed) => parsed.next_after(&after),
            Err(e) => {
                // Expressions are validated at registration, so this only
                // trips on rows written by an older build.
                warn!("stored cron expression no longer parses: {e}");
                None
            }
        },
    }
}

/// Validate a schedule definition at registration time.
///
/// A schedule that passes here can always be evaluated later; `Once` in the
/// past is accepted (it is exhausted, not malformed) and rejected by the
/// service when a task is created or resumed with no future fire.
pub fn validate(schedule: &Schedule) -> Result<()> {
    match schedule {
        Schedule::Once { .. } => Ok(()),

        Schedule::Interval { every_secs } => {
            if *every_secs == 0 {
                return Err(SchedulerError::InvalidSchedule(
                    "interval must be at least one second".to_string(),
                ));
            }
            if i64::try_from(*every_secs).is_err() {
                return Err(SchedulerError::InvalidSchedule(format!(
                    "interval of {every_secs} seconds is out of range"
                )));
            }
            Ok(())
        }

        Schedule::Daily { hour, minute } => check_time(*hour, *minute),

        Schedule::Weekly {
            weekday,
            hour,
            minute,
        } => {
            if *weekday > 6 {
                return Err(SchedulerError::InvalidSchedule(
                    "weekday must be 0 (Monday) through 6 (Sunday)".to_string(),
                ));
            }
            check_time(*hour, *minute)
        }

        Schedule::Monthly { day, hour, minute } => {
            if *day < 1 || *day > 31 {
                return Err(SchedulerError::InvalidSchedule(
                    "day of month must be 1 through 31".to_string(),
                ));
            }
            check_time(*hour, *minute)
        }

        Schedule::Cron { expression } => {
            CronExpression::parse(expression)?;
            Ok(())
        }
    }
}

fn check_time(hour: u8, minute: u8) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(SchedulerError::InvalidSchedule(format!(
            "time {hour:02}:{minute:02} is out of range"
        )));
    }
    Ok(())
}
