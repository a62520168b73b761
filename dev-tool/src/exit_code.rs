//! Process exit codes of the dev-tool.

/// Everything went fine.
pub const NO_ERROR: i32 = 0;

/// The command ran but reported a problem, e.g. no users could be evaluated.
pub const NON_FATAL_ERROR: i32 = 1;

/// The command failed.
pub const FATAL_ERROR: i32 = 2;
