//! `harvest-core` — shared vocabulary for the harvest workspace.
//!
//! Holds the types every other crate speaks: task/execution identifiers,
//! the [`Schedule`](schedule::Schedule) definition shared between the
//! persistence layer and the scheduler, and the TOML + env configuration
//! loader.

pub mod config;
pub mod error;
pub mod schedule;
pub mod types;

pub use config::HarvestConfig;
pub use error::{CoreError, Result};
pub use schedule::Schedule;
pub use types::{ExecutionId, TaskId};
