//! Stable exit codes for the `agent-runner` CLI.

use crate::core::types::StopReason;

/// The agent completed.
pub const COMPLETED: i32 = 0;
/// The agent failed (spawn failure, non-zero exit, schema never validated).
pub const ERROR: i32 = 1;
/// Options or configuration were rejected before anything was spawned.
pub const CONFIG: i32 = 2;
/// A stop condition ended the run early.
pub const STOP_CONDITION: i32 = 3;
/// The run timed out or was cancelled.
pub const CANCELLED: i32 = 4;

pub fn for_stop_reason(reason: StopReason) -> i32 {
    match reason {
        StopReason::Completed => COMPLETED,
        StopReason::Error => ERROR,
        StopReason::StopCondition => STOP_CONDITION,
        StopReason::Cancelled => CANCELLED,
    }
}
