use chrono::{DateTime, Utc};
use serde::Serialize;

/// Point-in-time snapshot of the scheduler for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerHealth {
    /// Whether the fire loop is running.
    pub running: bool,
    /// Number of armed (registered, schedulable) tasks.
    pub active_job_count: usize,
    /// The soonest planned fire across all armed tasks, if any.
    pub earliest_next_fire: Option<DateTime<Utc>>,
}
