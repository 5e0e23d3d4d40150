//! Shared deterministic types for the engine core.
//!
//! These types define stable contracts between core components and the
//! persisted state document. They must not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One stage of the fixed delivery pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Design,
    Analyze,
    Implement,
    Verify,
}

impl Step {
    /// All steps in pipeline order.
    pub const ALL: [Step; 4] = [Step::Design, Step::Analyze, Step::Implement, Step::Verify];

    pub fn index(self) -> usize {
        match self {
            Step::Design => 0,
            Step::Analyze => 1,
            Step::Implement => 2,
            Step::Verify => 3,
        }
    }

    /// The step that follows `self`, or `None` after `verify`.
    pub fn next(self) -> Option<Step> {
        Step::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Design => "design",
            Step::Analyze => "analyze",
            Step::Implement => "implement",
            Step::Verify => "verify",
        }
    }

    /// Name of the gate that must pass before leaving this step.
    pub fn gate_name(self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "design" => Ok(Step::Design),
            "analyze" => Ok(Step::Analyze),
            "implement" => Ok(Step::Implement),
            "verify" => Ok(Step::Verify),
            other => Err(format!("unknown step '{other}'")),
        }
    }
}

/// Status of the current step. Delegated to whichever component runs the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    InProgress,
    Complete,
    Blocked,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::InProgress => "in-progress",
            StepStatus::Complete => "complete",
            StepStatus::Blocked => "blocked",
            StepStatus::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in-progress" => Ok(StepStatus::InProgress),
            "complete" => Ok(StepStatus::Complete),
            "blocked" => Ok(StepStatus::Blocked),
            "failed" => Ok(StepStatus::Failed),
            other => Err(format!("unknown step status '{other}'")),
        }
    }
}

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseStatus {
    NotStarted,
    InProgress,
    AwaitingHuman,
    Complete,
}

/// Finding severity. Ordered so that `Critical` is the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Where a finding applies: an artifact plus an optional anchor inside it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub artifact: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
}

impl Location {
    pub fn artifact(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            anchor: None,
        }
    }

    pub fn anchored(artifact: impl Into<String>, anchor: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            anchor: Some(anchor.into()),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.anchor {
            Some(anchor) => write!(f, "{}#{}", self.artifact, anchor),
            None => f.write_str(&self.artifact),
        }
    }
}

/// A detected issue with severity, location, and suggested remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub category: String,
    pub severity: Severity,
    pub location: Location,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl Finding {
    pub fn new(
        id: impl Into<String>,
        category: impl Into<String>,
        severity: Severity,
        location: Location,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            category: category.into(),
            severity,
            location,
            description: description.into(),
            remediation: None,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

/// A phase goal as listed when the phase was selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub text: String,
}

/// Completion state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Complete,
    Blocked,
}

/// An atomic unit of implementation work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    /// Declared file-path targets (the task's write set).
    pub targets: Vec<String>,
    pub depends_on: Vec<String>,
    pub parallel: bool,
    /// Free-form bracket labels other than `[P]` (e.g. story tags).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    /// Zero-based `##` section the task was declared in.
    pub section: usize,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
}

/// Recovery actions offered to the operator whenever the engine halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryAction {
    Retry,
    Skip,
    Diagnose,
    Abort,
}

/// Itemized report for any halt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReport {
    pub step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Finding>,
    pub reason: String,
    pub recovery: Vec<RecoveryAction>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_order_is_fixed() {
        assert_eq!(Step::Design.next(), Some(Step::Analyze));
        assert_eq!(Step::Analyze.next(), Some(Step::Implement));
        assert_eq!(Step::Implement.next(), Some(Step::Verify));
        assert_eq!(Step::Verify.next(), None);
        assert!(Step::Design < Step::Verify);
    }

    #[test]
    fn severity_orders_critical_highest() {
        let mut all = vec![Severity::High, Severity::Critical, Severity::Low, Severity::Medium];
        all.sort();
        assert_eq!(
            all,
            vec![Severity::Low, Severity::Medium, Severity::High, Severity::Critical]
        );
    }

    #[test]
    fn step_status_serializes_kebab_case() {
        let json = serde_json::to_string(&StepStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in-progress\"");
        assert_eq!("blocked".parse::<StepStatus>(), Ok(StepStatus::Blocked));
    }

    #[test]
    fn location_display_includes_anchor() {
        assert_eq!(Location::anchored("spec.md", "FR-001").to_string(), "spec.md#FR-001");
        assert_eq!(Location::artifact("plan.md").to_string(), "plan.md");
    }
}
