//! `harvest-store` — SQLite persistence for tasks and execution history.
//!
//! Two stores share one schema:
//!
//! * [`TaskStore`] — CRUD for persisted task definitions. The scheduler
//!   reloads active tasks from here on startup.
//! * [`ExecutionStore`] — append-only log of every execution attempt.
//!   Terminal rows are immutable; history is never deleted.
//!
//! Each store wraps its own `Mutex<Connection>` so the scheduler loop and
//! management callers never contend on a single handle.

pub mod db;
pub mod error;
pub mod executions;
pub mod tasks;
pub mod types;

pub use error::{Result, StoreError};
pub use executions::ExecutionStore;
pub use tasks::TaskStore;
pub use types::{
    Execution, ExecutionFilter, ExecutionOutcome, ExecutionPage, ExecutionStats, ExecutionStatus,
    NewTask, Page, Task, TaskPatch, TriggeredBy,
};
