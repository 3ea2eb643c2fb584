use thiserror::Error;

/// Errors produced while resolving or running a script.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// No script with the given ID is registered.
    #[error("Script not found: {id}")]
    NotFound { id: String },

    /// The script ran and reported failure (non-zero exit, bad output).
    #[error("Script failed: {message}")]
    Failed {
        message: String,
        /// Captured diagnostics (stderr for shell scripts), if any.
        trace: Option<String>,
    },

    /// The invocation was cancelled through its cancellation token.
    #[error("Script invocation cancelled")]
    Cancelled,

    /// The script could not be spawned or its output could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ScriptError>;
