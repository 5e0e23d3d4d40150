//! Named completion gates.
//!
//! A gate is a pure predicate over a [`GateInputs`] snapshot that returns
//! findings; an empty list means pass. Any `critical` finding blocks step
//! advancement; other severities only block in strict mode.

use serde::{Deserialize, Serialize};

use crate::core::coverage::{CoverageStatus, GoalCoverageEntry};
use crate::core::findings::{has_critical, sort_findings};
use crate::core::task_graph::TaskGraph;
use crate::core::types::{Finding, Location, Severity, TaskState};

/// Severity assigned to findings whose weight is a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityPolicy {
    /// A goal with requirements whose tasks are not all complete.
    pub partial_coverage: Severity,
    /// An artifact that exists but has too little content.
    pub trivial_artifact: Severity,
    /// A file in the phase directory that no gate knows about.
    pub unreferenced_artifact: Severity,
}

impl Default for SeverityPolicy {
    fn default() -> Self {
        Self {
            partial_coverage: Severity::High,
            trivial_artifact: Severity::Critical,
            unreferenced_artifact: Severity::Low,
        }
    }
}

/// Existence and size of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactStatus {
    pub name: String,
    pub exists: bool,
    /// Bytes of non-heading, non-whitespace content.
    pub content_bytes: usize,
}

impl ArtifactStatus {
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: false,
            content_bytes: 0,
        }
    }

    pub fn is_populated(&self, min_bytes: usize) -> bool {
        self.exists && self.content_bytes >= min_bytes
    }
}

/// Everything a gate may look at, captured once per evaluation.
#[derive(Debug, Clone)]
pub struct GateInputs {
    pub design: Vec<ArtifactStatus>,
    pub analysis: ArtifactStatus,
    pub verification: ArtifactStatus,
    /// Artifact name used in task finding locations.
    pub task_list: String,
    /// Artifact name used in coverage finding locations.
    pub coverage_map: String,
    pub tasks: Option<TaskGraph>,
    /// Parse or invariant errors of the task list, if it exists but is invalid.
    pub task_errors: Vec<String>,
    pub coverage: Vec<GoalCoverageEntry>,
    /// Parse error of the coverage map, if it exists but is not valid JSON.
    pub coverage_map_error: Option<String>,
    pub analysis_findings: Vec<Finding>,
    pub compliance_findings: Vec<Finding>,
    /// Files in the phase directory not produced by any known step.
    pub unreferenced: Vec<String>,
    pub min_populated_bytes: usize,
    pub policy: SeverityPolicy,
}

pub trait Gate {
    fn name(&self) -> &'static str;
    fn evaluate(&self, inputs: &GateInputs) -> Vec<Finding>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub gate: String,
    pub pass: bool,
    pub blocking: bool,
    pub findings: Vec<Finding>,
}

/// Evaluate `gate` and package the result. Findings are in canonical order, so
/// repeated evaluation of the same inputs yields identical reports.
pub fn run_gate(gate: &dyn Gate, inputs: &GateInputs, strict: bool) -> GateReport {
    let mut findings = gate.evaluate(inputs);
    sort_findings(&mut findings);
    let pass = findings.is_empty();
    GateReport {
        gate: gate.name().to_string(),
        pass,
        blocking: has_critical(&findings) || (strict && !pass),
        findings,
    }
}

pub const GATE_NAMES: [&str; 6] = [
    "design",
    "analyze",
    "implement",
    "coverage",
    "memory-compliance",
    "verify",
];

pub fn gate_by_name(name: &str) -> Option<Box<dyn Gate>> {
    match name {
        "design" => Some(Box::new(DesignGate)),
        "analyze" => Some(Box::new(AnalyzeGate)),
        "implement" => Some(Box::new(ImplementGate)),
        "coverage" => Some(Box::new(CoverageGate)),
        "memory-compliance" => Some(Box::new(ComplianceGate)),
        "verify" => Some(Box::new(VerifyGate)),
        _ => None,
    }
}

/// A machine-readable artifact that exists but could not be parsed.
pub fn malformed_artifact(artifact: &str, detail: &str) -> Finding {
    Finding::new(
        format!("malformed-{artifact}"),
        "malformed-artifact",
        Severity::Critical,
        Location::artifact(artifact),
        format!("artifact {artifact} could not be parsed: {detail}"),
    )
    .with_remediation(format!("regenerate {artifact}"))
}

fn artifact_findings(
    gate: &str,
    artifact: &ArtifactStatus,
    inputs: &GateInputs,
    out: &mut Vec<Finding>,
) {
    if !artifact.exists {
        out.push(
            Finding::new(
                format!("{gate}-missing-{}", artifact.name),
                "missing-artifact",
                Severity::Critical,
                Location::artifact(&artifact.name),
                format!("artifact {} missing", artifact.name),
            )
            .with_remediation(format!("generate {}", artifact.name)),
        );
    } else if !artifact.is_populated(inputs.min_populated_bytes) {
        out.push(
            Finding::new(
                format!("{gate}-trivial-{}", artifact.name),
                "underspecification",
                inputs.policy.trivial_artifact,
                Location::artifact(&artifact.name),
                format!(
                    "artifact {} has {} content bytes (minimum {})",
                    artifact.name, artifact.content_bytes, inputs.min_populated_bytes
                ),
            )
            .with_remediation(format!("populate {}", artifact.name)),
        );
    }
}

/// Every design artifact exists and is non-trivially populated.
pub struct DesignGate;

impl Gate for DesignGate {
    fn name(&self) -> &'static str {
        "design"
    }

    fn evaluate(&self, inputs: &GateInputs) -> Vec<Finding> {
        let mut findings = Vec::new();
        for artifact in &inputs.design {
            artifact_findings(self.name(), artifact, inputs, &mut findings);
        }
        findings
    }
}

/// The analysis report exists; findings recorded by the analysis pass are
/// carried through unchanged.
pub struct AnalyzeGate;

impl Gate for AnalyzeGate {
    fn name(&self) -> &'static str {
        "analyze"
    }

    fn evaluate(&self, inputs: &GateInputs) -> Vec<Finding> {
        let mut findings = Vec::new();
        artifact_findings(self.name(), &inputs.analysis, inputs, &mut findings);
        findings.extend(inputs.analysis_findings.iter().cloned());
        findings
    }
}

/// Zero pending tasks. Deferred tasks are exempt; blocked tasks are reported
/// with their reason.
pub struct ImplementGate;

impl Gate for ImplementGate {
    fn name(&self) -> &'static str {
        "implement"
    }

    fn evaluate(&self, inputs: &GateInputs) -> Vec<Finding> {
        let mut findings = Vec::new();
        let Some(graph) = &inputs.tasks else {
            let description = if inputs.task_errors.is_empty() {
                format!("task list {} missing", inputs.task_list)
            } else {
                format!(
                    "task list {} invalid: {}",
                    inputs.task_list,
                    inputs.task_errors.join("; ")
                )
            };
            findings.push(Finding::new(
                "implement-task-list",
                "missing-artifact",
                Severity::Critical,
                Location::artifact(&inputs.task_list),
                description,
            ));
            return findings;
        };

        for task in graph.outstanding() {
            let location = Location::anchored(&inputs.task_list, &task.id);
            let finding = match task.state {
                TaskState::Blocked => Finding::new(
                    format!("implement-blocked-{}", task.id),
                    "blocked-task",
                    Severity::Critical,
                    location,
                    format!(
                        "task {} blocked: {}",
                        task.id,
                        task.block_reason.as_deref().unwrap_or("no reason recorded")
                    ),
                )
                .with_remediation("unblock the task or defer it with a reason"),
                _ => Finding::new(
                    format!("implement-pending-{}", task.id),
                    "incomplete-task",
                    Severity::Critical,
                    location,
                    format!("task {} incomplete", task.id),
                )
                .with_remediation("complete the task or defer it with a reason"),
            };
            findings.push(finding);
        }
        findings
    }
}

/// Every goal is covered or deferred.
pub struct CoverageGate;

impl Gate for CoverageGate {
    fn name(&self) -> &'static str {
        "coverage"
    }

    fn evaluate(&self, inputs: &GateInputs) -> Vec<Finding> {
        let mut findings = Vec::new();
        if let Some(detail) = &inputs.coverage_map_error {
            findings.push(malformed_artifact(&inputs.coverage_map, detail));
        }
        for entry in &inputs.coverage {
            let location = Location::anchored(&inputs.coverage_map, &entry.goal);
            match entry.status {
                CoverageStatus::Covered | CoverageStatus::Deferred => {}
                CoverageStatus::Missing => findings.push(
                    Finding::new(
                        format!("coverage-missing-{}", entry.goal),
                        "coverage-gap",
                        Severity::Critical,
                        location,
                        format!("goal {} has no mapped requirement", entry.goal),
                    )
                    .with_remediation("map the goal to at least one requirement or defer it"),
                ),
                CoverageStatus::Partial => findings.push(
                    Finding::new(
                        format!("coverage-partial-{}", entry.goal),
                        "coverage-gap",
                        inputs.policy.partial_coverage,
                        location,
                        partial_description(entry, inputs.tasks.as_ref()),
                    )
                    .with_remediation("link every requirement to completed tasks"),
                ),
            }
        }
        findings
    }
}

fn partial_description(entry: &GoalCoverageEntry, graph: Option<&TaskGraph>) -> String {
    let open: Vec<&str> = entry
        .tasks
        .iter()
        .filter(|id| {
            graph
                .and_then(|g| g.get(id))
                .is_none_or(|t| t.state != TaskState::Complete)
        })
        .map(String::as_str)
        .collect();
    if open.is_empty() {
        format!("goal {} has requirements without tasks", entry.goal)
    } else {
        format!(
            "goal {} partially covered; open tasks: {}",
            entry.goal,
            open.join(", ")
        )
    }
}

/// Findings reported by the standards/memory compliance pass.
pub struct ComplianceGate;

impl Gate for ComplianceGate {
    fn name(&self) -> &'static str {
        "memory-compliance"
    }

    fn evaluate(&self, inputs: &GateInputs) -> Vec<Finding> {
        inputs.compliance_findings.clone()
    }
}

/// Coverage and compliance, plus the verification report and a sweep for
/// unreferenced artifacts.
pub struct VerifyGate;

impl Gate for VerifyGate {
    fn name(&self) -> &'static str {
        "verify"
    }

    fn evaluate(&self, inputs: &GateInputs) -> Vec<Finding> {
        let mut findings = CoverageGate.evaluate(inputs);
        findings.extend(ComplianceGate.evaluate(inputs));
        artifact_findings(self.name(), &inputs.verification, inputs, &mut findings);
        for name in &inputs.unreferenced {
            findings.push(Finding::new(
                format!("verify-unreferenced-{name}"),
                "unreferenced-artifact",
                inputs.policy.unreferenced_artifact,
                Location::artifact(name),
                format!("artifact {name} is not referenced by any step"),
            ));
        }
        findings
    }
}
