//! Bounded detect, fix, re-detect loop.
//!
//! The iteration counter lives in the store (`autofix.iteration`) and is
//! written before and after every iteration, so an interrupted loop resumes at
//! the iteration it was in rather than starting over.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{Coordinator, DispatchReport, JobOutput, JobRole, Worker, WorkerJob};
use crate::core::findings::group_by_artifact;
use crate::core::fix_strategy::{FixStrategy, FixStrategyTable};
use crate::core::next_action::RECOVERY_ACTIONS;
use crate::core::state_doc::{
    AUTOFIX, AUTOFIX_AWAITING, AUTOFIX_GATE, AUTOFIX_ITERATION, AUTOFIX_REMAINING, AutofixRecord,
    STEP_STATUS,
};
use crate::core::state_paths::Writer;
use crate::core::types::{Finding, HaltReport, RecoveryAction, Step, StepStatus};
use crate::error::EngineError;
use crate::io::collaborators::{FixOutcome, FixRequest, Fixer};
use crate::io::journal::{AutofixJournalEntry, write_entry};
use crate::io::state_store::StateStore;

const COMPONENT: Writer<'static> = Writer::Component("autofix");

/// Source of findings for one loop, typically a gate re-evaluation.
pub trait Detector {
    fn detect(&self) -> Result<Vec<Finding>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutofixStatus {
    Clean,
    BudgetExhausted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutofixOutcome {
    pub status: AutofixStatus,
    /// Iterations run so far in this loop, including ones before a resume.
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remaining: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltReport>,
}

/// Operator answer to an exhausted budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutofixDecision {
    Continue,
    Abort,
}

/// One loop over one gate.
pub struct AutofixLoop<'a> {
    pub store: &'a StateStore,
    pub coordinator: &'a Coordinator,
    pub fixer: Arc<dyn Fixer>,
    pub strategies: &'a FixStrategyTable,
    pub phase_dir: &'a Path,
    pub journal_dir: PathBuf,
    pub max_iterations: u32,
    pub gate: &'a str,
    /// The step whose gate this is. A clean loop marks it complete.
    pub owning_step: Option<Step>,
    pub current_step: Option<Step>,
}

impl AutofixLoop<'_> {
    #[instrument(skip_all, fields(gate = self.gate))]
    pub fn run(&self, initial: Vec<Finding>, detector: &dyn Detector) -> Result<AutofixOutcome> {
        let record: AutofixRecord = self.store.get_as(AUTOFIX)?.unwrap_or_default();
        if record.aborted {
            debug!("loop aborted by operator, waiting for a retry");
            let iteration = record.iteration.unwrap_or(1).saturating_sub(1);
            return Ok(self.user_aborted(iteration, record.remaining));
        }
        if record.awaiting_decision {
            debug!("budget already exhausted, waiting for a decision");
            let iteration = record.iteration.unwrap_or(1).saturating_sub(1);
            return Ok(self.exhausted(iteration, record.remaining));
        }

        let mut iteration = match record.gate.as_deref() {
            Some(gate) if gate != self.gate => 1,
            _ => record.iteration.unwrap_or(1),
        };
        let mut findings = initial;

        while !findings.is_empty() && iteration <= self.max_iterations {
            self.store.set_many(
                COMPONENT,
                vec![
                    (AUTOFIX_ITERATION, json!(iteration)),
                    (AUTOFIX_GATE, json!(self.gate)),
                ],
            )?;
            info!(iteration, findings = findings.len(), "auto-fix iteration");

            let report = self.dispatch_fixes(&findings);
            if report.is_aborted() {
                self.journal(iteration, &findings, report.clone(), &findings)?;
                return self.abort_after_dispatch(iteration, findings, &report);
            }

            let after = detector.detect()?;
            self.journal(iteration, &findings, report, &after)?;
            findings = after;
            iteration += 1;
            self.store
                .set_as(COMPONENT, AUTOFIX_ITERATION, json!(iteration))?;
        }

        let ran = iteration.saturating_sub(1);
        if findings.is_empty() {
            self.store.set_as(COMPONENT, AUTOFIX, Value::Null)?;
            if self.completes_step() {
                self.store
                    .set_as(Writer::ActiveStep, STEP_STATUS, json!(StepStatus::Complete))?;
            }
            info!(iterations = ran, "auto-fix clean");
            return Ok(AutofixOutcome {
                status: AutofixStatus::Clean,
                iteration: ran,
                remaining: Vec::new(),
                halt: None,
            });
        }

        self.store.set_many(
            COMPONENT,
            vec![
                (AUTOFIX_AWAITING, json!(true)),
                (AUTOFIX_REMAINING, serde_json::to_value(&findings)?),
            ],
        )?;
        warn!(remaining = findings.len(), "auto-fix budget exhausted");
        Ok(self.exhausted(ran, findings))
    }

    /// Apply the operator's decision after the budget ran out.
    pub fn resolve(&self, decision: AutofixDecision) -> Result<AutofixOutcome> {
        let record: AutofixRecord = self.store.get_as(AUTOFIX)?.unwrap_or_default();
        if !record.awaiting_decision {
            return Err(EngineError::InvalidTransition(
                "no auto-fix decision is pending".to_string(),
            )
            .into());
        }
        let iteration = record.iteration.unwrap_or(1).saturating_sub(1);
        match decision {
            AutofixDecision::Continue => {
                self.store.set_as(COMPONENT, AUTOFIX, Value::Null)?;
                if self.completes_step() {
                    self.store
                        .set_as(Writer::ActiveStep, STEP_STATUS, json!(StepStatus::Complete))?;
                }
                info!(remaining = record.remaining.len(), "continuing past unresolved findings");
                Ok(AutofixOutcome {
                    status: AutofixStatus::BudgetExhausted,
                    iteration,
                    remaining: record.remaining,
                    halt: None,
                })
            }
            AutofixDecision::Abort => {
                let aborted = AutofixRecord {
                    iteration: record.iteration,
                    gate: Some(self.gate.to_string()),
                    awaiting_decision: false,
                    aborted: true,
                    remaining: record.remaining,
                };
                self.store.set_serialized(COMPONENT, AUTOFIX, &aborted)?;
                self.store
                    .set_as(Writer::ActiveStep, STEP_STATUS, json!(StepStatus::Blocked))?;
                let outcome = self.user_aborted(iteration, aborted.remaining);
                if let Some(halt) = &outcome.halt {
                    warn!(reason = %halt.reason, "auto-fix aborted by operator");
                }
                Ok(outcome)
            }
        }
    }

    fn user_aborted(&self, iteration: u32, remaining: Vec<Finding>) -> AutofixOutcome {
        let step = self.current_step.unwrap_or(Step::Design);
        AutofixOutcome {
            status: AutofixStatus::Aborted,
            iteration,
            remaining: remaining.clone(),
            halt: Some(HaltReport {
                step: self.current_step,
                gate: Some(self.gate.to_string()),
                tasks: Vec::new(),
                findings: remaining,
                reason: EngineError::UserAbort { step }.to_string(),
                recovery: vec![RecoveryAction::Retry, RecoveryAction::Skip],
            }),
        }
    }

    fn completes_step(&self) -> bool {
        self.owning_step.is_some() && self.owning_step == self.current_step
    }

    /// One fix job per target artifact; each job owns exactly that artifact.
    fn dispatch_fixes(&self, findings: &[Finding]) -> DispatchReport {
        let groups = group_by_artifact(findings);
        let jobs: Vec<WorkerJob> = groups
            .keys()
            .map(|artifact| {
                let path = self.phase_dir.join(artifact);
                WorkerJob::new(fix_job_id(artifact), JobRole::Fix)
                    .owning([path.display().to_string()])
            })
            .collect();
        let worker = FixWorker {
            fixer: Arc::clone(&self.fixer),
            strategies: self.strategies.clone(),
            phase_dir: self.phase_dir.to_path_buf(),
            groups: groups
                .into_iter()
                .map(|(artifact, group)| (fix_job_id(&artifact), group))
                .collect(),
        };
        self.coordinator.dispatch(jobs, Arc::new(worker))
    }

    fn journal(
        &self,
        iteration: u32,
        before: &[Finding],
        dispatch: DispatchReport,
        after: &[Finding],
    ) -> Result<()> {
        write_entry(
            &self.journal_dir,
            &AutofixJournalEntry {
                iteration,
                gate: self.gate.to_string(),
                findings_before: before.to_vec(),
                dispatch,
                findings_after: after.to_vec(),
            },
        )?;
        Ok(())
    }

    fn abort_after_dispatch(
        &self,
        iteration: u32,
        findings: Vec<Finding>,
        report: &DispatchReport,
    ) -> Result<AutofixOutcome> {
        self.store
            .set_as(Writer::ActiveStep, STEP_STATUS, json!(StepStatus::Blocked))?;
        let reason = report
            .abort_reason
            .clone()
            .unwrap_or_else(|| "fix batch aborted".to_string());
        warn!(%reason, iteration, "auto-fix halted");
        Ok(AutofixOutcome {
            status: AutofixStatus::Aborted,
            iteration,
            remaining: findings.clone(),
            halt: Some(HaltReport {
                step: self.current_step,
                gate: Some(self.gate.to_string()),
                tasks: Vec::new(),
                findings,
                reason,
                recovery: RECOVERY_ACTIONS.to_vec(),
            }),
        })
    }

    fn exhausted(&self, iteration: u32, remaining: Vec<Finding>) -> AutofixOutcome {
        let reason = EngineError::MaxIterationsExceeded {
            max_iterations: self.max_iterations,
            remaining: remaining.len(),
        };
        AutofixOutcome {
            status: AutofixStatus::BudgetExhausted,
            iteration,
            remaining: remaining.clone(),
            halt: Some(HaltReport {
                step: self.current_step,
                gate: Some(self.gate.to_string()),
                tasks: Vec::new(),
                findings: remaining,
                reason: format!("{reason}; continue anyway or abort"),
                recovery: vec![RecoveryAction::Skip, RecoveryAction::Abort],
            }),
        }
    }
}

fn fix_job_id(artifact: &str) -> String {
    format!("fix-{artifact}")
}

/// Hands each finding of its artifact group to the fixer, one at a time.
struct FixWorker {
    fixer: Arc<dyn Fixer>,
    strategies: FixStrategyTable,
    phase_dir: PathBuf,
    groups: BTreeMap<String, Vec<Finding>>,
}

impl Worker for FixWorker {
    fn run(&self, job: &WorkerJob) -> Result<JobOutput> {
        let findings = self
            .groups
            .get(&job.id)
            .ok_or_else(|| anyhow!("no findings assigned to {}", job.id))?;
        let mut notes = Vec::new();
        for finding in findings {
            let strategy = self.strategies.strategy_for(&finding.category);
            if strategy == FixStrategy::Escalate {
                notes.push(format!("{} escalated", finding.id));
                continue;
            }
            let request = FixRequest {
                finding: finding.clone(),
                strategy,
                artifact_path: self.phase_dir.join(&finding.location.artifact),
            };
            match self.fixer.fix(&request)? {
                FixOutcome::Fixed => notes.push(format!("{} fixed ({strategy})", finding.id)),
                FixOutcome::Failed(detail) => {
                    notes.push(format!("{} not fixed: {detail}", finding.id));
                }
            }
        }
        Ok(JobOutput {
            findings: Vec::new(),
            notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_doc::AUTOFIX_ABORTED;
    use crate::core::types::{Location, Severity};
    use crate::io::config::TimeoutConfig;
    use crate::io::journal::read_entries;
    use crate::test_support::{ScriptedDetector, ScriptedFixer};
    use proptest::prelude::*;

    struct Harness {
        temp: tempfile::TempDir,
        store: StateStore,
        coordinator: Coordinator,
        strategies: FixStrategyTable,
    }

    impl Harness {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let store = StateStore::new(temp.path().join("state.json"));
            store
                .set_as(Writer::Engine, STEP_STATUS, json!("in-progress"))
                .expect("seed");
            Self {
                temp,
                store,
                coordinator: Coordinator::new(TimeoutConfig::default(), 0.5),
                strategies: FixStrategyTable::default(),
            }
        }

        fn journal_dir(&self) -> PathBuf {
            self.temp.path().join("journal")
        }

        fn looper(&self, fixer: Arc<dyn Fixer>) -> AutofixLoop<'_> {
            AutofixLoop {
                store: &self.store,
                coordinator: &self.coordinator,
                fixer,
                strategies: &self.strategies,
                phase_dir: self.temp.path(),
                journal_dir: self.journal_dir(),
                max_iterations: 5,
                gate: "design",
                owning_step: Some(Step::Design),
                current_step: Some(Step::Design),
            }
        }
    }

    fn finding(id: &str, artifact: &str) -> Finding {
        Finding::new(
            id,
            "ambiguity",
            Severity::High,
            Location::anchored(artifact, id),
            "vague",
        )
    }

    /// Verifies the two-iteration clean run clears the counter and completes the step.
    #[test]
    fn resolves_in_two_iterations() {
        let harness = Harness::new();
        let fixer = ScriptedFixer::fixing_all();
        let detector = ScriptedDetector::new(vec![vec![finding("F3", "plan.md")], Vec::new()]);
        let initial = vec![
            finding("F1", "spec.md"),
            finding("F2", "plan.md"),
            finding("F3", "plan.md"),
        ];

        let outcome = harness
            .looper(Arc::new(fixer.clone()))
            .run(initial, &detector)
            .expect("run");

        assert_eq!(outcome.status, AutofixStatus::Clean);
        assert_eq!(outcome.iteration, 2);
        assert_eq!(harness.store.get(AUTOFIX).expect("get"), None);
        assert_eq!(
            harness.store.get(STEP_STATUS).expect("get"),
            Some(json!("complete"))
        );
        // Artifact groups run concurrently, so only the multiset of calls is stable.
        let mut calls = fixer.calls();
        calls.sort();
        assert_eq!(calls, vec!["F1", "F2", "F3", "F3"]);

        let entries = read_entries(&harness.journal_dir()).expect("journal");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].findings_before.len(), 3);
        assert_eq!(entries[0].dispatch.batches.len(), 1);
        assert!(entries[1].findings_after.is_empty());
    }

    #[test]
    fn exhausted_budget_waits_for_a_decision() {
        let harness = Harness::new();
        let stubborn = vec![finding("F1", "spec.md")];
        let detector = ScriptedDetector::repeating(stubborn.clone());
        let looper = harness.looper(Arc::new(ScriptedFixer::fixing_all()));

        let outcome = looper.run(stubborn.clone(), &detector).expect("run");
        assert_eq!(outcome.status, AutofixStatus::BudgetExhausted);
        assert_eq!(outcome.iteration, 5);
        assert_eq!(outcome.remaining, stubborn);
        assert_eq!(
            harness.store.get(AUTOFIX_AWAITING).expect("get"),
            Some(json!(true))
        );

        // Calling again does not run more iterations.
        let again = looper.run(stubborn.clone(), &detector).expect("rerun");
        assert_eq!(again.status, AutofixStatus::BudgetExhausted);
        assert_eq!(detector.calls(), 5);

        let resolved = looper.resolve(AutofixDecision::Abort).expect("resolve");
        assert_eq!(resolved.status, AutofixStatus::Aborted);
        assert_eq!(
            harness.store.get(STEP_STATUS).expect("get"),
            Some(json!("blocked"))
        );
        assert_eq!(
            harness.store.get(AUTOFIX_ABORTED).expect("get"),
            Some(json!(true))
        );

        // An aborted loop stays aborted until the step is retried.
        let after_abort = looper
            .run(vec![finding("F2", "plan.md")], &detector)
            .expect("run after abort");
        assert_eq!(after_abort.status, AutofixStatus::Aborted);
        assert_eq!(after_abort.remaining, stubborn);
        assert_eq!(detector.calls(), 5);
        assert!(looper.resolve(AutofixDecision::Continue).is_err());
    }

    #[test]
    fn continue_marks_step_complete() {
        let harness = Harness::new();
        let looper = harness.looper(Arc::new(ScriptedFixer::fixing_all()));
        let stubborn = vec![finding("F1", "spec.md")];
        looper
            .run(stubborn.clone(), &ScriptedDetector::repeating(stubborn))
            .expect("run");

        looper.resolve(AutofixDecision::Continue).expect("resolve");
        assert_eq!(
            harness.store.get(STEP_STATUS).expect("get"),
            Some(json!("complete"))
        );
        assert!(looper.resolve(AutofixDecision::Continue).is_err());
    }

    /// Verifies an interrupted loop resumes at the persisted iteration.
    #[test]
    fn resumes_from_persisted_iteration() {
        let harness = Harness::new();
        harness
            .store
            .set_many(
                COMPONENT,
                vec![(AUTOFIX_ITERATION, json!(4)), (AUTOFIX_GATE, json!("design"))],
            )
            .expect("seed");
        let stubborn = vec![finding("F1", "spec.md")];
        let detector = ScriptedDetector::repeating(stubborn.clone());

        let outcome = harness
            .looper(Arc::new(ScriptedFixer::fixing_all()))
            .run(stubborn, &detector)
            .expect("run");

        assert_eq!(outcome.status, AutofixStatus::BudgetExhausted);
        assert_eq!(detector.calls(), 2);
    }

    #[test]
    fn fixer_error_aborts_and_blocks_step() {
        let harness = Harness::new();
        let fixer = ScriptedFixer::fixing_all().erroring("F1");
        let outcome = harness
            .looper(Arc::new(fixer))
            .run(
                vec![finding("F1", "spec.md")],
                &ScriptedDetector::new(Vec::new()),
            )
            .expect("run");

        assert_eq!(outcome.status, AutofixStatus::Aborted);
        assert!(outcome.halt.is_some_and(|h| h.gate.as_deref() == Some("design")));
        assert_eq!(
            harness.store.get(STEP_STATUS).expect("get"),
            Some(json!("blocked"))
        );
    }

    #[test]
    fn escalated_categories_skip_the_fixer() {
        let harness = Harness::new();
        let fixer = ScriptedFixer::fixing_all();
        let mut unknown = finding("F1", "spec.md");
        unknown.category = "legal-review".to_string();
        harness
            .looper(Arc::new(fixer.clone()))
            .run(vec![unknown], &ScriptedDetector::new(vec![Vec::new()]))
            .expect("run");
        assert!(fixer.calls().is_empty());
    }

    #[test]
    fn gate_findings_outside_owning_step_do_not_complete_it() {
        let harness = Harness::new();
        let mut looper = harness.looper(Arc::new(ScriptedFixer::fixing_all()));
        looper.gate = "coverage";
        looper.owning_step = None;
        looper.current_step = Some(Step::Implement);
        let outcome = looper
            .run(
                vec![finding("F1", "coverage.json")],
                &ScriptedDetector::new(vec![Vec::new()]),
            )
            .expect("run");
        assert_eq!(outcome.status, AutofixStatus::Clean);
        assert_eq!(
            harness.store.get(STEP_STATUS).expect("get"),
            Some(json!("in-progress"))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// The loop always stops within the budget, whatever the detector reports.
        #[test]
        fn loop_terminates_within_budget(counts in proptest::collection::vec(0usize..4, 0..8)) {
            let harness = Harness::new();
            let rounds: Vec<Vec<Finding>> = counts
                .iter()
                .map(|n| (0..*n).map(|i| finding(&format!("F{i}"), "spec.md")).collect())
                .collect();
            let detector = ScriptedDetector::new(rounds);
            let outcome = harness
                .looper(Arc::new(ScriptedFixer::fixing_all()))
                .run(vec![finding("F0", "spec.md")], &detector)
                .expect("run");
            prop_assert!(outcome.iteration <= 5);
            prop_assert!(detector.calls() <= 5);
            prop_assert!(matches!(
                outcome.status,
                AutofixStatus::Clean | AutofixStatus::BudgetExhausted
            ));
        }
    }
}
