//! Typed error taxonomy for conditions callers must branch on.
//!
//! Everything else travels as plain `anyhow::Error` with context. Callers that
//! need to distinguish these classes downcast with `err.downcast_ref::<EngineError>()`.

use thiserror::Error;

use crate::core::types::{Finding, Step};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Store contents are unreadable, malformed, or reference missing artifacts.
    #[error("state corruption at {path}: {detail}")]
    StateCorruption { path: String, detail: String },

    /// A gate reported blocking findings.
    #[error("gate '{gate}' failed with {} finding(s)", findings.len())]
    GateFailure { gate: String, findings: Vec<Finding> },

    #[error("worker job '{job}' timed out after {timeout_secs}s")]
    WorkerTimeout { job: String, timeout_secs: u64 },

    #[error("worker job '{job}' failed: {detail}")]
    WorkerFailure { job: String, detail: String },

    /// Two jobs claimed the same write path. Resolved by serializing them.
    #[error("jobs '{first}' and '{second}' both own {path}")]
    ConflictDetected {
        first: String,
        second: String,
        path: String,
    },

    #[error("auto-fix budget of {max_iterations} iteration(s) exhausted with {remaining} finding(s) left")]
    MaxIterationsExceeded {
        max_iterations: u32,
        remaining: usize,
    },

    #[error("operator aborted step {step}")]
    UserAbort { step: Step },

    #[error("{writer} may not write '{path}'")]
    OwnershipViolation { writer: String, path: String },

    #[error("phase '{phase}' is complete and archived")]
    PhaseArchived { phase: String },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid state path: {0}")]
    InvalidPath(String),
}
