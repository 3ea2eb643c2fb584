use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The provided schedule definition is invalid (bad field ranges,
    /// unparseable cron expression, zero interval).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A task with this ID is already registered with the scheduler.
    #[error("Task already registered: {id}")]
    DuplicateTask { id: String },

    /// No task with the given ID is known to the scheduler or the store.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// A manual trigger was refused because an attempt is already in flight.
    #[error("Task {id} already has a running execution")]
    AlreadyRunning { id: String },

    /// A cancel request found nothing in flight for the task.
    #[error("Task {id} has no running execution")]
    NoRunningExecution { id: String },

    /// The task references a script ID the registry does not know.
    #[error("Script not found: {id}")]
    ScriptNotFound { id: String },

    /// `start` was called twice on the same service.
    #[error("Scheduler is already running")]
    AlreadyStarted,

    /// Persistence failure bubbled up from the store.
    #[error("Store error: {0}")]
    Store(#[from] harvest_store::StoreError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
