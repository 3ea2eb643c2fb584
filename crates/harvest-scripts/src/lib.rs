//! `harvest-scripts` — the runnable side of a task.
//!
//! A [`Script`] is an async unit of work identified by a stable ID. Tasks
//! store only the ID; at fire time the scheduler resolves it through the
//! [`ScriptRegistry`] and invokes it with the task's JSON parameters and a
//! cancellation token.
//!
//! [`ShellScript`] is the built-in implementation: one `sh -c` command line
//! per registered script, parameters exported as environment variables.

pub mod error;
pub mod registry;
pub mod script;
pub mod shell;

pub use error::{Result, ScriptError};
pub use registry::ScriptRegistry;
pub use script::{Script, ScriptOutcome};
pub use shell::ShellScript;
