use thiserror::Error;

/// Errors that can occur in the task and execution stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored JSON column (schedule, parameters) failed to (de)serialise.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No task with the given ID exists.
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// No execution with the given ID exists (or it is not in the expected state).
    #[error("Execution not found: {id}")]
    ExecutionNotFound { id: String },

    /// `mark_terminal` was called on a row that already reached a terminal
    /// state. Indicates a duplicate completion callback.
    #[error("Execution {id} is already terminal ({status})")]
    AlreadyTerminal { id: String, status: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
