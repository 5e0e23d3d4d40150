//! Typed views of the state document subtrees.
//!
//! The store itself is untyped (path-addressed JSON); these records are what
//! the engine reads and writes at well-known paths.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::phase::PhaseRecord;
use crate::core::step_machine::{StepCursor, Transition};
use crate::core::task_graph::TaskRecord;
use crate::core::types::{Finding, Step, StepStatus};

pub const STATE_VERSION: u64 = 1;

pub const PHASE: &str = "phase";
pub const PHASE_STATUS: &str = "phase.status";
pub const STEP: &str = "step";
pub const STEP_CURRENT: &str = "step.current";
pub const STEP_STATUS: &str = "step.status";
pub const STEP_HISTORY: &str = "step.history";
pub const TASKS: &str = "tasks";
pub const DEFERRED: &str = "deferred";
pub const DEFERRED_TASKS: &str = "deferred.tasks";
pub const DEFERRED_GOALS: &str = "deferred.goals";
pub const AUTOFIX: &str = "autofix";
pub const AUTOFIX_ITERATION: &str = "autofix.iteration";
pub const AUTOFIX_AWAITING: &str = "autofix.awaiting_decision";
pub const AUTOFIX_REMAINING: &str = "autofix.remaining";
pub const AUTOFIX_GATE: &str = "autofix.gate";
pub const AUTOFIX_ABORTED: &str = "autofix.aborted";
pub const HUMAN: &str = "human";
pub const HUMAN_SIGNOFF: &str = "human.signoff";
pub const ARCHIVE: &str = "archive";

/// A fresh document.
pub fn empty_document() -> Value {
    json!({ "version": STATE_VERSION })
}

/// `step` subtree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub current: Step,
    pub status: StepStatus,
    #[serde(default)]
    pub history: Vec<Transition>,
}

impl StepRecord {
    pub fn cursor(&self) -> StepCursor {
        StepCursor {
            current: self.current,
            status: self.status,
        }
    }
}

/// `autofix` subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutofixRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(default)]
    pub awaiting_decision: bool,
    /// The operator aborted this loop; the step stays blocked until retried.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining: Vec<Finding>,
}

/// `deferred` subtree: operator deferrals with reasons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredRecord {
    #[serde(default)]
    pub tasks: BTreeMap<String, String>,
    #[serde(default)]
    pub goals: BTreeMap<String, String>,
}

/// Snapshot copied to `archive.<phase-id>` when a phase completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedPhase {
    pub phase: PhaseRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepRecord>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskRecord>,
    #[serde(default)]
    pub deferred: DeferredRecord,
}
