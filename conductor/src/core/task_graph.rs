//! Dependency-aware task queue.
//!
//! Selection is deterministic: candidates are ordered by natural id (`T2 < T10`)
//! and the lowest eligible id always wins.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::invariants::validate_invariants;
use crate::core::ownership::first_overlap;
use crate::core::types::{Task, TaskState};
use crate::error::EngineError;

/// Overall queue condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueStatus {
    /// At least one task is eligible.
    Active,
    /// Nothing remains (every task complete or deferred).
    ExhaustedComplete,
    /// Tasks remain but none can run (blocked, or waiting on blocked tasks).
    ExhaustedBlocked,
}

/// Snapshot of the queue returned after every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueState {
    pub status: QueueStatus,
    pub eligible: Vec<String>,
    /// Tasks that became eligible as a result of the last mutation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub newly_eligible: Vec<String>,
    pub blocked: Vec<String>,
    pub completed: usize,
    pub remaining: usize,
}

/// Counts used by status reports and the implement gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub total: usize,
    pub complete: usize,
    pub blocked: usize,
    pub deferred: usize,
    pub pending: usize,
}

/// Persisted per-task record (`tasks.<id>` in the state store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Compare task ids naturally: alphabetic prefix, then numeric part, then the rest.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    id_key(a).cmp(&id_key(b))
}

fn id_key(id: &str) -> (String, u64, String) {
    let prefix_len = id.find(|c: char| c.is_ascii_digit()).unwrap_or(id.len());
    let (prefix, tail) = id.split_at(prefix_len);
    let digits_len = tail
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(tail.len());
    let (digits, rest) = tail.split_at(digits_len);
    (
        prefix.to_ascii_uppercase(),
        digits.parse().unwrap_or(0),
        rest.to_string(),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGraph {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
    deferred: BTreeMap<String, String>,
}

impl TaskGraph {
    /// Build a graph from parsed tasks, rejecting lists that violate invariants.
    pub fn new(mut tasks: Vec<Task>) -> Result<Self, Vec<String>> {
        let errors = validate_invariants(&tasks);
        if !errors.is_empty() {
            return Err(errors);
        }
        tasks.sort_by(|a, b| compare_ids(&a.id, &b.id));
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Ok(Self {
            tasks,
            index,
            deferred: BTreeMap::new(),
        })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Overlay persisted task records onto artifact-derived state.
    ///
    /// Completion is the union of both sources, so a task never regresses from
    /// complete. Records for unknown ids are ignored.
    pub fn apply_records(&mut self, records: &BTreeMap<String, TaskRecord>) {
        for (id, record) in records {
            let Some(&i) = self.index.get(id) else {
                continue;
            };
            let task = &mut self.tasks[i];
            if task.state == TaskState::Complete {
                continue;
            }
            task.state = record.state;
            task.block_reason = match record.state {
                TaskState::Blocked => record.reason.clone(),
                _ => None,
            };
        }
    }

    /// Record operator deferrals (`id -> reason`). Unknown ids are ignored.
    pub fn apply_deferred(&mut self, deferred: &BTreeMap<String, String>) {
        for (id, reason) in deferred {
            if self.contains(id) {
                self.deferred.insert(id.clone(), reason.clone());
            }
        }
    }

    pub fn is_deferred(&self, id: &str) -> bool {
        self.deferred.contains_key(id)
    }

    pub fn deferred(&self) -> &BTreeMap<String, String> {
        &self.deferred
    }

    fn is_complete(&self, id: &str) -> bool {
        self.get(id)
            .is_some_and(|t| t.state == TaskState::Complete)
    }

    /// Pending, not deferred, and every dependency complete.
    pub fn is_eligible(&self, task: &Task) -> bool {
        task.state == TaskState::Pending
            && !self.is_deferred(&task.id)
            && task.depends_on.iter().all(|dep| self.is_complete(dep))
    }

    fn eligible(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| self.is_eligible(t))
    }

    /// Lowest-id eligible task.
    pub fn next_task(&self) -> Option<&Task> {
        self.eligible().next()
    }

    /// Lowest-id eligible task plus every other eligible `[P]` task whose file
    /// targets are disjoint from the batch so far.
    pub fn next_batch(&self) -> Vec<&Task> {
        let mut batch: Vec<&Task> = Vec::new();
        let mut owned: BTreeSet<String> = BTreeSet::new();
        for task in self.eligible() {
            if !batch.is_empty() && !task.parallel {
                continue;
            }
            let targets: BTreeSet<String> = task.targets.iter().cloned().collect();
            if first_overlap(&targets, &owned).is_some() {
                continue;
            }
            owned.extend(targets);
            batch.push(task);
        }
        batch
    }

    /// Mark a task complete and report what became eligible.
    pub fn mark_complete(&mut self, id: &str) -> Result<QueueState, EngineError> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| EngineError::UnknownTask(id.to_string()))?;
        let before = self.eligible_ids();
        let task = &mut self.tasks[i];
        task.state = TaskState::Complete;
        task.block_reason = None;
        Ok(self.queue_state_since(&before))
    }

    /// Mark a task blocked. Completed tasks cannot be blocked.
    pub fn mark_blocked(&mut self, id: &str, reason: &str) -> Result<QueueState, EngineError> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| EngineError::UnknownTask(id.to_string()))?;
        let before = self.eligible_ids();
        let task = &mut self.tasks[i];
        if task.state == TaskState::Complete {
            return Err(EngineError::InvalidTransition(format!(
                "task {id} is complete and cannot be blocked"
            )));
        }
        task.state = TaskState::Blocked;
        task.block_reason = Some(reason.to_string());
        Ok(self.queue_state_since(&before))
    }

    fn eligible_ids(&self) -> Vec<String> {
        self.eligible().map(|t| t.id.clone()).collect()
    }

    pub fn queue_state(&self) -> QueueState {
        let current = self.eligible_ids();
        self.queue_state_since(&current)
    }

    fn queue_state_since(&self, before: &[String]) -> QueueState {
        let eligible = self.eligible_ids();
        let newly_eligible = eligible
            .iter()
            .filter(|id| !before.contains(id))
            .cloned()
            .collect();
        let progress = self.progress();
        let remaining = progress.total - progress.complete - progress.deferred;
        let status = if remaining == 0 {
            QueueStatus::ExhaustedComplete
        } else if eligible.is_empty() {
            QueueStatus::ExhaustedBlocked
        } else {
            QueueStatus::Active
        };
        QueueState {
            status,
            eligible,
            newly_eligible,
            blocked: self
                .tasks
                .iter()
                .filter(|t| t.state == TaskState::Blocked && !self.is_deferred(&t.id))
                .map(|t| t.id.clone())
                .collect(),
            completed: progress.complete,
            remaining,
        }
    }

    pub fn progress(&self) -> TaskProgress {
        let mut progress = TaskProgress {
            total: self.tasks.len(),
            ..TaskProgress::default()
        };
        for task in &self.tasks {
            if task.state == TaskState::Complete {
                progress.complete += 1;
            } else if self.is_deferred(&task.id) {
                progress.deferred += 1;
            } else if task.state == TaskState::Blocked {
                progress.blocked += 1;
            } else {
                progress.pending += 1;
            }
        }
        progress
    }

    /// Tasks that are neither complete nor deferred (pending or blocked).
    pub fn outstanding(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(|t| t.state != TaskState::Complete && !self.is_deferred(&t.id))
    }

    /// Persisted records for every task that is not pending.
    pub fn records(&self) -> BTreeMap<String, TaskRecord> {
        self.tasks
            .iter()
            .filter(|t| t.state != TaskState::Pending)
            .map(|t| {
                (
                    t.id.clone(),
                    TaskRecord {
                        state: t.state,
                        reason: t.block_reason.clone(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{parallel_task, task};
    use proptest::prelude::*;

    fn ids(tasks: &[&Task]) -> Vec<String> {
        tasks.iter().map(|t| t.id.clone()).collect()
    }

    fn scenario_graph() -> TaskGraph {
        TaskGraph::new(vec![
            task("T001", &[]),
            task("T002", &["T001"]),
            parallel_task("T003", &[]),
        ])
        .expect("graph")
    }

    #[test]
    fn ids_sort_naturally() {
        assert_eq!(compare_ids("T2", "T10"), Ordering::Less);
        assert_eq!(compare_ids("T010", "T9"), Ordering::Greater);
        assert_eq!(compare_ids("T001", "T001"), Ordering::Equal);
    }

    #[test]
    fn batch_returns_independent_parallel_tasks() {
        let graph = scenario_graph();
        assert_eq!(ids(&graph.next_batch()), vec!["T001", "T003"]);
        assert_eq!(graph.next_task().map(|t| t.id.as_str()), Some("T001"));
    }

    #[test]
    fn completing_dependency_unlocks_dependent() {
        let mut graph = scenario_graph();
        let state = graph.mark_complete("T001").expect("mark");
        assert_eq!(state.newly_eligible, vec!["T002".to_string()]);
        assert_eq!(state.remaining, 2);
        assert_eq!(graph.next_task().map(|t| t.id.as_str()), Some("T002"));
    }

    #[test]
    fn unmet_dependencies_are_never_selected() {
        let graph = scenario_graph();
        assert!(graph.next_batch().iter().all(|t| t.id != "T002"));
    }

    #[test]
    fn batch_skips_parallel_tasks_with_overlapping_targets() {
        let mut a = parallel_task("T001", &[]);
        a.targets = vec!["src/a.rs".to_string()];
        let mut b = parallel_task("T002", &[]);
        b.targets = vec!["src/a.rs".to_string()];
        let mut c = parallel_task("T003", &[]);
        c.targets = vec!["src/c.rs".to_string()];
        let graph = TaskGraph::new(vec![a, b, c]).expect("graph");
        assert_eq!(ids(&graph.next_batch()), vec!["T001", "T003"]);
    }

    #[test]
    fn blocked_task_does_not_halt_independent_branch() {
        let mut graph = TaskGraph::new(vec![
            task("T001", &[]),
            task("T002", &["T001"]),
            task("T003", &[]),
        ])
        .expect("graph");
        let state = graph.mark_blocked("T001", "needs credentials").expect("block");
        assert_eq!(state.status, QueueStatus::Active);
        assert_eq!(state.eligible, vec!["T003".to_string()]);
        assert_eq!(state.blocked, vec!["T001".to_string()]);
        assert_eq!(
            graph.get("T001").and_then(|t| t.block_reason.as_deref()),
            Some("needs credentials")
        );
    }

    #[test]
    fn all_remaining_blocked_reports_exhausted_blocked() {
        let mut graph =
            TaskGraph::new(vec![task("T001", &[]), task("T002", &["T001"])]).expect("graph");
        let state = graph.mark_blocked("T001", "upstream outage").expect("block");
        assert_eq!(state.status, QueueStatus::ExhaustedBlocked);
        assert_eq!(state.remaining, 2);
    }

    #[test]
    fn all_complete_reports_exhausted_complete() {
        let mut graph = TaskGraph::new(vec![task("T001", &[])]).expect("graph");
        let state = graph.mark_complete("T001").expect("mark");
        assert_eq!(state.status, QueueStatus::ExhaustedComplete);
        assert!(graph.next_task().is_none());
    }

    #[test]
    fn deferred_tasks_are_skipped_and_not_remaining() {
        let mut graph = TaskGraph::new(vec![task("T001", &[]), task("T002", &[])]).expect("graph");
        graph.apply_deferred(&BTreeMap::from([(
            "T001".to_string(),
            "out of scope".to_string(),
        )]));
        assert_eq!(graph.next_task().map(|t| t.id.as_str()), Some("T002"));
        let state = graph.mark_complete("T002").expect("mark");
        assert_eq!(state.status, QueueStatus::ExhaustedComplete);
    }

    #[test]
    fn blocking_completed_task_is_rejected() {
        let mut graph = TaskGraph::new(vec![task("T001", &[])]).expect("graph");
        graph.mark_complete("T001").expect("mark");
        let err = graph.mark_blocked("T001", "late").unwrap_err();
        assert!(err.to_string().contains("cannot be blocked"));
    }

    #[test]
    fn unknown_task_is_an_error() {
        let mut graph = scenario_graph();
        let err = graph.mark_complete("T404").unwrap_err();
        assert!(matches!(err, EngineError::UnknownTask(id) if id == "T404"));
    }

    #[test]
    fn records_never_regress_completion() {
        let mut done = task("T001", &[]);
        done.state = TaskState::Complete;
        let mut graph = TaskGraph::new(vec![done]).expect("graph");
        graph.apply_records(&BTreeMap::from([(
            "T001".to_string(),
            TaskRecord {
                state: TaskState::Blocked,
                reason: Some("stale".to_string()),
            },
        )]));
        assert_eq!(graph.get("T001").map(|t| t.state), Some(TaskState::Complete));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Complete(usize),
        Block(usize),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..6).prop_map(Op::Complete),
            (0usize..6).prop_map(Op::Block),
        ]
    }

    proptest! {
        /// The number of complete tasks never decreases across mark operations.
        #[test]
        fn completion_is_non_decreasing(ops in prop::collection::vec(arb_op(), 0..30)) {
            let mut graph = TaskGraph::new(vec![
                task("T001", &[]),
                task("T002", &["T001"]),
                parallel_task("T003", &[]),
                task("T004", &["T002", "T003"]),
                parallel_task("T005", &[]),
                task("T006", &["T005"]),
            ])
            .expect("graph");
            let mut last = 0usize;
            for op in ops {
                let _ = match op {
                    Op::Complete(i) => graph.mark_complete(&format!("T00{}", i + 1)),
                    Op::Block(i) => graph.mark_blocked(&format!("T00{}", i + 1), "blocked"),
                };
                let completed = graph.progress().complete;
                prop_assert!(completed >= last);
                last = completed;
            }
        }
    }
}
