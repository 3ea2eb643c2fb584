//! `harvest-scheduler` — Tokio-based task scheduler with SQLite-backed
//! execution history.
//!
//! # Overview
//!
//! Armed tasks live in an in-memory registry with their fire times in a
//! min-heap. The [`engine::TaskScheduler`] fire loop sleeps until the
//! earliest entry is due, then runs the task's script under a per-task run
//! lock: a fire that lands while the previous attempt is still running is
//! skipped, not queued. Every attempt is persisted by `harvest-store`
//! before and after it runs, and failed or timed-out attempts are retried
//! with exponential backoff up to the task's retry budget.
//!
//! [`service::SchedulerService`] wraps the engine with lifecycle
//! (start/stop/reload, orphan recovery, arming from the store) and the
//! task-management operations the daemon exposes.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                              |
//! |------------|--------------------------------------------------------|
//! | `Once`     | Single fire at an absolute UTC instant                 |
//! | `Interval` | Repeat every N seconds, anchored at registration       |
//! | `Daily`    | Fire at HH:MM UTC every day                            |
//! | `Weekly`   | Fire at HH:MM UTC on a weekday (0 = Monday)            |
//! | `Monthly`  | Fire at HH:MM UTC on a day-of-month; short months skip |
//! | `Cron`     | Five-field cron expression, minute resolution          |

pub mod cron;
pub mod engine;
pub mod error;
pub mod retry;
pub mod service;
pub mod trigger;
pub mod types;

pub use cron::CronExpression;
pub use engine::TaskScheduler;
pub use error::{Result, SchedulerError};
pub use retry::RetryPolicy;
pub use service::SchedulerService;
pub use trigger::{next_fire_time, validate};
pub use types::SchedulerHealth;
