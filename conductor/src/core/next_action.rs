//! Recommended next action, derived only from a persisted-state snapshot.

use serde::Serialize;

use crate::core::gates::GateReport;
use crate::core::step_machine::StepCursor;
use crate::core::task_graph::{QueueState, QueueStatus};
use crate::core::types::{PhaseStatus, RecoveryAction, Step, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum NextAction {
    StartPhase,
    GenerateArtifacts { missing: Vec<String> },
    /// Design artifacts exist and the gate passes; the driver reports the step complete.
    CompleteStep { step: Step },
    RunAnalysis,
    ImplementTasks { tasks: Vec<String> },
    ResolveBlockedTasks { tasks: Vec<String> },
    RunAutoFix { gate: String },
    /// The step reported complete but its gate still blocks.
    ResolveGate { gate: String, findings: usize },
    DecideAutoFix { remaining: usize },
    AwaitHuman,
    Recover {
        step: Step,
        status: StepStatus,
        recovery: Vec<RecoveryAction>,
    },
    PhaseComplete,
}

pub const RECOVERY_ACTIONS: [RecoveryAction; 4] = [
    RecoveryAction::Retry,
    RecoveryAction::Skip,
    RecoveryAction::Diagnose,
    RecoveryAction::Abort,
];

/// Snapshot consumed by [`next_action`].
#[derive(Debug, Clone, Copy)]
pub struct ActionInputs<'a> {
    pub phase: Option<PhaseStatus>,
    pub cursor: Option<StepCursor>,
    pub missing_design: &'a [String],
    pub queue: Option<&'a QueueState>,
    /// Report of the gate bound to the current step.
    pub gate: Option<&'a GateReport>,
    /// Findings left by an exhausted auto-fix loop awaiting an operator decision.
    pub autofix_pending: Option<usize>,
}

pub fn next_action(inputs: &ActionInputs<'_>) -> NextAction {
    match inputs.phase {
        None | Some(PhaseStatus::NotStarted) => return NextAction::StartPhase,
        Some(PhaseStatus::Complete) => return NextAction::PhaseComplete,
        Some(PhaseStatus::AwaitingHuman) => return NextAction::AwaitHuman,
        Some(PhaseStatus::InProgress) => {}
    }
    if let Some(remaining) = inputs.autofix_pending {
        return NextAction::DecideAutoFix { remaining };
    }
    let Some(cursor) = inputs.cursor else {
        return NextAction::StartPhase;
    };

    match cursor.status {
        StepStatus::Blocked | StepStatus::Failed => {
            return NextAction::Recover {
                step: cursor.current,
                status: cursor.status,
                recovery: RECOVERY_ACTIONS.to_vec(),
            };
        }
        StepStatus::Complete => {
            if let Some(gate) = inputs.gate.filter(|g| g.blocking) {
                return NextAction::ResolveGate {
                    gate: gate.gate.clone(),
                    findings: gate.findings.len(),
                };
            }
            return NextAction::CompleteStep {
                step: cursor.current,
            };
        }
        StepStatus::InProgress => {}
    }

    let gate_passes = inputs.gate.is_some_and(|g| g.pass);
    match cursor.current {
        Step::Design if !inputs.missing_design.is_empty() => NextAction::GenerateArtifacts {
            missing: inputs.missing_design.to_vec(),
        },
        Step::Design | Step::Verify if gate_passes => NextAction::CompleteStep {
            step: cursor.current,
        },
        Step::Design | Step::Verify => NextAction::RunAutoFix {
            gate: cursor.current.gate_name().to_string(),
        },
        Step::Analyze => match inputs.gate {
            Some(gate) if gate.pass => NextAction::CompleteStep {
                step: Step::Analyze,
            },
            Some(gate) if report_incomplete(gate) => NextAction::RunAnalysis,
            Some(_) => NextAction::RunAutoFix {
                gate: Step::Analyze.gate_name().to_string(),
            },
            None => NextAction::RunAnalysis,
        },
        Step::Implement => match inputs.queue {
            Some(queue) => match queue.status {
                QueueStatus::Active => NextAction::ImplementTasks {
                    tasks: queue.eligible.clone(),
                },
                QueueStatus::ExhaustedBlocked => NextAction::ResolveBlockedTasks {
                    tasks: queue.blocked.clone(),
                },
                QueueStatus::ExhaustedComplete => NextAction::CompleteStep {
                    step: Step::Implement,
                },
            },
            None => NextAction::ResolveGate {
                gate: Step::Implement.gate_name().to_string(),
                findings: inputs.gate.map_or(1, |g| g.findings.len()),
            },
        },
    }
}

/// True if the analyze gate failed because the report itself is missing or thin.
fn report_incomplete(gate: &GateReport) -> bool {
    gate.findings
        .iter()
        .any(|f| f.id.starts_with("analyze-missing-") || f.id.starts_with("analyze-trivial-"))
}
