//! Stable exit codes for the forklift CLI.
//!
//! Scripted and cron callers branch on these, so values never change.

/// Upstream integrated and published (or nothing needed publishing).
pub const OK: i32 = 0;
/// Guard, configuration, git, or infrastructure failure before publishing.
pub const FAILED: i32 = 1;
/// The sandbox exceeded its wall-clock budget and was terminated.
pub const TIMEOUT: i32 = 2;
/// The agent exited without integrating upstream.
pub const UNVERIFIED: i32 = 3;
/// The agent left a `STUCK.md` marker asking for human help.
pub const STUCK: i32 = 4;
/// Rewrite or lease-protected push failed.
pub const PUBLISH_FAILED: i32 = 5;
/// The operator interrupted the run.
pub const CANCELLED: i32 = 130;
