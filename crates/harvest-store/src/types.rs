use serde::{Deserialize, Serialize};

use chrono::{DateTime, Utc};
use harvest_core::{ExecutionId, Schedule, TaskId};

/// Lifecycle state of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Row created, script not yet invoked.
    Pending,
    /// Script invocation in flight.
    Running,
    /// Script finished successfully.
    Completed,
    /// Script returned or raised an error.
    Failed,
    /// Invocation exceeded the task's deadline.
    Timeout,
    /// An operator cancelled the invocation mid-run.
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are immutable once written.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// What caused an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    /// The task's own schedule fired.
    Scheduler,
    /// An operator triggered the task by hand.
    Manual,
    /// A retry timer fired after a failed attempt.
    Retry,
}

impl std::fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TriggeredBy::Scheduler => "scheduler",
            TriggeredBy::Manual => "manual",
            TriggeredBy::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TriggeredBy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduler" => Ok(TriggeredBy::Scheduler),
            "manual" => Ok(TriggeredBy::Manual),
            "retry" => Ok(TriggeredBy::Retry),
            other => Err(format!("unknown trigger source: {other}")),
        }
    }
}

/// A persisted task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// UUID v4 string — primary key.
    pub id: TaskId,
    /// Human-readable label.
    pub name: String,
    /// Script resolved through the registry at fire time.
    pub script_id: String,
    /// When to run.
    pub schedule: Schedule,
    /// Opaque JSON object handed to the script verbatim.
    pub parameters: serde_json::Value,
    /// Inactive tasks are never armed.
    pub is_active: bool,
    /// Whether failed attempts are retried with backoff.
    pub retry_on_failure: bool,
    /// Upper bound on retries per trigger (0 disables retries).
    pub max_retries: u32,
    /// Per-attempt deadline in seconds; 0 means no limit.
    pub timeout_secs: u64,
    /// ISO-8601 timestamp of the most recent attempt start, if any.
    pub last_execution_at: Option<String>,
    /// ISO-8601 timestamp of the next planned fire, if armed.
    pub next_execution_at: Option<String>,
    /// ISO-8601 timestamp of task creation.
    pub created_at: String,
    /// ISO-8601 timestamp of the last metadata update.
    pub updated_at: String,
}

/// Fields required to create a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub script_id: String,
    pub schedule: Schedule,
    pub parameters: serde_json::Value,
    pub is_active: bool,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl NewTask {
    /// A task with the usual defaults: active, 3 retries with backoff, no timeout.
    pub fn new(name: impl Into<String>, script_id: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            script_id: script_id.into(),
            schedule,
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            is_active: true,
            retry_on_failure: true,
            max_retries: 3,
            timeout_secs: 0,
        }
    }
}

/// Partial update for a task; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub schedule: Option<Schedule>,
    pub parameters: Option<serde_json::Value>,
    pub retry_on_failure: Option<bool>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
}

/// One recorded execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    /// Weak reference — the task may have been deleted since.
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    pub triggered_by: TriggeredBy,
    /// Set when `triggered_by` is manual, or when an operator cancelled the run.
    pub operator_id: Option<String>,
    /// 0 for the first attempt of a trigger; increments per retry.
    pub retry_count: u32,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration_secs: Option<f64>,
    /// Script-reported row count before the run.
    pub rows_before: Option<i64>,
    /// Script-reported row count after the run.
    pub rows_after: Option<i64>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub created_at: String,
}

/// Terminal outcome fields written by `mark_terminal`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub rows_before: Option<i64>,
    pub rows_after: Option<i64>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
}

/// Filter for execution history queries. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub task_id: Option<TaskId>,
    pub status: Option<ExecutionStatus>,
    /// Attempts created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Attempts created before this instant.
    pub until: Option<DateTime<Utc>>,
}

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of execution history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPage {
    pub executions: Vec<Execution>,
    /// Total rows matching the filter, ignoring pagination.
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// Aggregate execution statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub total_count: u64,
    pub success_count: u64,
    /// Failed + timed-out attempts.
    pub failed_count: u64,
    /// Percentage of completed attempts; 0 when there is no history.
    pub success_rate: f64,
    /// Mean duration over attempts with a recorded duration; 0 when none.
    pub avg_duration_secs: f64,
    /// Attempts created since UTC midnight.
    pub today_count: u64,
}
