//! Step transition rules.
//!
//! Steps only move forward through `design -> analyze -> implement -> verify`.
//! Moving backward requires an explicit `reset`; jumping forward past a step
//! requires an explicit `skip_to`. Both are operator actions.

use serde::{Deserialize, Serialize};

use crate::core::types::{Step, StepStatus};

/// Why `step.current` changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionReason {
    Start,
    Advance,
    Reset,
    SkipTo,
    Heal,
}

/// One recorded change of `step.current` (appended to `step.history`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Option<Step>,
    pub to: Step,
    pub reason: TransitionReason,
}

/// Current position in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCursor {
    pub current: Step,
    pub status: StepStatus,
}

/// Result of trying to leave the current step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Move to the next step; it is entered with `status = in-progress`.
    Next(Transition),
    /// `verify` completed; the phase is done.
    PipelineComplete,
}

/// Advance past a completed step.
pub fn advance(cursor: StepCursor) -> Result<Advance, String> {
    if cursor.status != StepStatus::Complete {
        return Err(format!(
            "step {} is {}, not complete",
            cursor.current,
            cursor.status.as_str()
        ));
    }
    Ok(match cursor.current.next() {
        Some(next) => Advance::Next(Transition {
            from: Some(cursor.current),
            to: next,
            reason: TransitionReason::Advance,
        }),
        None => Advance::PipelineComplete,
    })
}

/// Explicit operator reset to `target`, which must not be ahead of the current step.
pub fn reset(cursor: StepCursor, target: Step) -> Result<Transition, String> {
    if target > cursor.current {
        return Err(format!(
            "cannot reset forward from {} to {} (use skip-to)",
            cursor.current, target
        ));
    }
    Ok(Transition {
        from: Some(cursor.current),
        to: target,
        reason: TransitionReason::Reset,
    })
}

/// Explicit operator skip to a later step.
pub fn skip_to(cursor: StepCursor, target: Step) -> Result<Transition, String> {
    if target <= cursor.current {
        return Err(format!(
            "cannot skip from {} to {} (target must be later; use reset)",
            cursor.current, target
        ));
    }
    Ok(Transition {
        from: Some(cursor.current),
        to: target,
        reason: TransitionReason::SkipTo,
    })
}

/// Completion evidence observed on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepEvidence {
    /// All design artifacts exist. Their quality is the design gate's concern.
    pub design_artifacts: bool,
    /// The analysis report exists.
    pub analysis_report: bool,
    /// Every task in the task list is complete or deferred.
    pub tasks_done: bool,
}

/// Derive the step a phase must be in from artifact evidence alone.
pub fn derive_step(evidence: StepEvidence) -> Step {
    if !evidence.design_artifacts {
        return Step::Design;
    }
    if !evidence.analysis_report {
        return Step::Analyze;
    }
    if !evidence.tasks_done {
        return Step::Implement;
    }
    Step::Verify
}

/// True if the artifacts a step consumes are present.
///
/// Only the design artifacts are hard prerequisites: `skip-to` may legally bypass
/// `analyze`, so its report cannot be required by later steps.
pub fn prerequisites_met(step: Step, evidence: StepEvidence) -> bool {
    match step {
        Step::Design => true,
        Step::Analyze | Step::Implement | Step::Verify => evidence.design_artifacts,
    }
}
