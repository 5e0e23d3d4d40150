//! Goal -> requirement -> task coverage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::task_graph::TaskGraph;
use crate::core::types::{Goal, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageStatus {
    Covered,
    Partial,
    Missing,
    Deferred,
}

/// Requirement mapping supplied alongside the design artifacts (`coverage.json`).
///
/// ```json
/// { "goals": { "G1": ["R1", "R2"] }, "requirements": { "R1": ["T010"], "R2": [] } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageMap {
    pub goals: BTreeMap<String, Vec<String>>,
    pub requirements: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalCoverageEntry {
    pub goal: String,
    pub requirements: Vec<String>,
    pub tasks: Vec<String>,
    pub status: CoverageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub covered: usize,
    pub partial: usize,
    pub missing: usize,
    pub deferred: usize,
}

/// Compute coverage for every goal, in goal order.
///
/// A goal is `covered` when it maps to at least one requirement and every
/// requirement maps to at least one task, all complete. Tasks missing from the
/// graph (or no graph at all) count as incomplete. Deferral overrides the
/// computed status.
pub fn compute_coverage(
    goals: &[Goal],
    map: &CoverageMap,
    graph: Option<&TaskGraph>,
    deferred_goals: &BTreeMap<String, String>,
) -> Vec<GoalCoverageEntry> {
    let complete = |id: &str| {
        graph
            .and_then(|g| g.get(id))
            .is_some_and(|t| t.state == TaskState::Complete)
    };

    goals
        .iter()
        .map(|goal| {
            let requirements = map.goals.get(&goal.id).cloned().unwrap_or_default();
            let mut tasks = Vec::new();
            let mut all_done = true;
            for requirement in &requirements {
                let mapped = map
                    .requirements
                    .get(requirement)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                if mapped.is_empty() {
                    all_done = false;
                }
                for task in mapped {
                    if !complete(task) {
                        all_done = false;
                    }
                    if !tasks.contains(task) {
                        tasks.push(task.clone());
                    }
                }
            }

            let computed = if requirements.is_empty() {
                CoverageStatus::Missing
            } else if all_done {
                CoverageStatus::Covered
            } else {
                CoverageStatus::Partial
            };
            let deferred_reason = deferred_goals.get(&goal.id).cloned();
            GoalCoverageEntry {
                goal: goal.id.clone(),
                requirements,
                tasks,
                status: if deferred_reason.is_some() {
                    CoverageStatus::Deferred
                } else {
                    computed
                },
                deferred_reason,
            }
        })
        .collect()
}

pub fn summarize(entries: &[GoalCoverageEntry]) -> CoverageSummary {
    let mut summary = CoverageSummary::default();
    for entry in entries {
        match entry.status {
            CoverageStatus::Covered => summary.covered += 1,
            CoverageStatus::Partial => summary.partial += 1,
            CoverageStatus::Missing => summary.missing += 1,
            CoverageStatus::Deferred => summary.deferred += 1,
        }
    }
    summary
}
