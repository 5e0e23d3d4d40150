//! Stable exit codes for conductor CLI commands.

/// Command succeeded and the workflow can proceed.
pub const OK: i32 = 0;
/// Invalid input, layout, config or state transition, or any other error.
pub const INVALID: i32 = 1;
/// A gate blocks, a step is blocked or failed, or the auto-fix loop aborted.
pub const HALTED: i32 = 2;
/// `conductor next` found no eligible task.
pub const EXHAUSTED: i32 = 3;
/// Waiting on the operator: human sign-off or an exhausted auto-fix budget decision.
pub const AWAITING_HUMAN: i32 = 4;
