//! Stable exit codes for `cinch-bench` commands.

/// Every task completed (or, for `resume`, nothing is left to run).
pub const OK: i32 = 0;
/// At least one task ended fatally or with an error, or the command itself failed.
pub const FAILED: i32 = 1;
/// The batch was interrupted by SIGINT before all tasks ran (128 + SIGINT).
pub const INTERRUPTED: i32 = 130;
