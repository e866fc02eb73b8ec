//! Stable exit codes for stepwise CLI commands.

/// Command succeeded; for `run`, every step completed.
pub const OK: i32 = 0;
/// Invalid input, config, or plan file, or another setup error.
pub const INVALID: i32 = 1;
/// `run` finished but at least one step failed.
pub const PLAN_FAILED: i32 = 2;
/// `run` stopped early at the operator's request.
pub const STOPPED: i32 = 3;
/// A detached command finished with a non-zero exit code.
pub const PROCESS_FAILED: i32 = 4;
/// Interrupted by a signal after stopping tracked processes.
pub const INTERRUPTED: i32 = 130;
