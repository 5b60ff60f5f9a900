//! Batch execution: task expansion, the worker pool, resume, and summary.
//!
//! - [`tasks`]: parse and validate task files, group by `config_id`,
//!   expand into [`RunTask`]s.
//! - [`resume`]: [`ResumeScanner`] classifies runs as done, failed, or
//!   never started.
//! - [`pool`]: [`Orchestrator`] runs what is left in parallel.
//! - [`summary`]: per-group and overall statistics.

pub mod pool;
pub mod resume;
pub mod summary;
pub mod tasks;

pub use pool::{BatchOutcome, DEFAULT_WORKERS, Orchestrator};
pub use resume::{ResumePlan, ResumeScanner, ResumeState};
pub use summary::{BatchSummary, RunStats};
pub use tasks::{RunTask, TaskDecl, TaskFileError};
