use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// What a successful script run reports back.
///
/// Row counts are optional — not every acquisition script knows the size of
/// the dataset it touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScriptOutcome {
    /// Rows in the target dataset before the run.
    pub rows_before: Option<i64>,
    /// Rows in the target dataset after the run.
    pub rows_after: Option<i64>,
}

/// A runnable unit of work the scheduler can invoke.
///
/// Implementations must be cancellation-aware: when `cancel` fires the
/// script should stop promptly and return [`ScriptError::Cancelled`].
/// The scheduler enforces a hard deadline on top, so a script that ignores
/// its token is still reined in, just less gracefully.
///
/// [`ScriptError::Cancelled`]: crate::error::ScriptError::Cancelled
#[async_trait]
pub trait Script: std::fmt::Debug + Send + Sync {
    /// Stable identifier tasks refer to.
    fn id(&self) -> &str;

    /// Deadline to apply when the task itself does not set one.
    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the script with the task's parameters.
    async fn execute(
        &self,
        parameters: &serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<ScriptOutcome>;
}
