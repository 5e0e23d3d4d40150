//! End-to-end phase lifecycle through the library API.
//!
//! Each test drives a scratch project with scripted collaborators and checks
//! the persisted state after every entry point, the way a driver that may be
//! interrupted at any moment would observe it.

use std::fs;
use std::sync::Arc;

use serde_json::json;

use conductor::autofix::{AutofixDecision, AutofixStatus};
use conductor::core::coverage::CoverageStatus;
use conductor::core::next_action::NextAction;
use conductor::core::types::{PhaseStatus, Step, StepStatus};
use conductor::error::EngineError;
use conductor::io::journal::read_entries;
use conductor::lifecycle::{Engine, PhaseStart};
use conductor::test_support::{
    ScriptedFixer, ScriptedGenerator, TestProject, goal, populated,
};

const TASKS: &str = "\
# Tasks

## Setup
- [ ] T001 Create the project skeleton in `src/lib.rs`
- [ ] T002 Add the login handler in `src/login.rs` (depends on T001)
- [ ] T003 [P] Document the login flow in `docs/login.md`
";

const COVERAGE: &str = r#"{
  "goals": { "G1": ["R1"] },
  "requirements": { "R1": ["T001", "T002", "T003"] }
}"#;

fn engine(project: &TestProject, fixer: ScriptedFixer) -> Engine {
    project
        .engine_with(
            Arc::new(fixer),
            Box::new(ScriptedGenerator::new().with_file("tasks.md", TASKS)),
        )
        .expect("engine")
}

fn start(engine: &Engine) {
    engine
        .start_phase(PhaseStart {
            name: "login".to_string(),
            goals: vec![goal("G1")],
            ..PhaseStart::default()
        })
        .expect("start");
}

/// Project with phase 001 started and its design artifacts in place, sitting in `implement`.
fn at_implement() -> (TestProject, Engine) {
    let project = TestProject::new().expect("project");
    let engine = engine(&project, ScriptedFixer::fixing_all());
    start(&engine);
    project.write_design("001", TASKS).expect("design");
    project
        .write_artifact("001", "coverage.json", COVERAGE)
        .expect("coverage");
    project
        .write_artifact("001", "analysis.md", &populated("Analysis"))
        .expect("analysis");
    engine.skip_to(Step::Implement).expect("skip");
    (project, engine)
}

/// Verifies a phase runs from start to archive with the expected next action at each stop.
#[test]
fn phase_runs_from_start_to_archive() {
    let project = TestProject::new().expect("project");
    let engine = engine(&project, ScriptedFixer::fixing_all());

    assert_eq!(engine.status().expect("status").next_action, NextAction::StartPhase);
    let report = engine
        .start_phase(PhaseStart {
            name: "login".to_string(),
            goals: vec![goal("G1")],
            ..PhaseStart::default()
        })
        .expect("start");
    let phase = report.phase.expect("phase");
    assert_eq!(phase.id, "001");
    assert_eq!(phase.dir, "specs/001");
    assert!(project.phase_dir("001").is_dir());
    assert_eq!(
        report.next_action,
        NextAction::GenerateArtifacts {
            missing: vec![
                "spec.md".to_string(),
                "plan.md".to_string(),
                "tasks.md".to_string()
            ]
        }
    );

    project
        .write_artifact("001", "coverage.json", COVERAGE)
        .expect("coverage");
    let generated = engine.generate().expect("generate");
    assert!(generated.missing.is_empty());
    let report = engine.status().expect("status");
    assert_eq!(report.step.expect("step").current, Step::Analyze);
    assert_eq!(report.next_action, NextAction::RunAnalysis);

    project
        .write_artifact("001", "analysis.md", &populated("Analysis"))
        .expect("analysis");
    assert_eq!(
        engine.status().expect("status").next_action,
        NextAction::CompleteStep {
            step: Step::Analyze
        }
    );
    let report = engine.set_step_status(StepStatus::Complete).expect("complete");
    assert_eq!(report.step.expect("step").current, Step::Implement);
    assert_eq!(
        report.next_action,
        NextAction::ImplementTasks {
            tasks: vec!["T001".to_string(), "T003".to_string()]
        }
    );

    engine
        .mark_task(&["T001".to_string(), "T002".to_string(), "T003".to_string()], None)
        .expect("mark");
    let report = engine.status().expect("status");
    assert_eq!(report.step.expect("step").current, Step::Verify);
    assert_eq!(
        report.next_action,
        NextAction::RunAutoFix {
            gate: "verify".to_string()
        }
    );

    project
        .write_artifact("001", "verification.md", &populated("Verification"))
        .expect("verification");
    let report = engine.set_step_status(StepStatus::Complete).expect("complete");
    assert_eq!(report.next_action, NextAction::AwaitHuman);
    assert_eq!(report.phase.expect("phase").status, PhaseStatus::AwaitingHuman);

    engine
        .set_state("human.signoff", json!("confirmed"))
        .expect("sign off");
    let report = engine.status().expect("status");
    assert_eq!(report.next_action, NextAction::PhaseComplete);
    assert_eq!(report.phase.expect("phase").status, PhaseStatus::Complete);
    assert_eq!(
        engine.get_state("archive").expect("get").expect("archive")["001"]["phase"]["status"],
        json!("complete")
    );

    let err = engine.mark_task(&["T001".to_string()], None).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::PhaseArchived { .. })
    ));

    let report = engine
        .start_phase(PhaseStart {
            name: "follow-up".to_string(),
            ..PhaseStart::default()
        })
        .expect("second phase");
    assert_eq!(report.phase.expect("phase").id, "002");
}

/// Verifies batch selection and unlocking through the engine (T001/T003 batch, then T002).
#[test]
fn next_task_follows_dependencies() {
    let (_project, engine) = at_implement();

    let batch = engine.next_task(true).expect("batch");
    let ids: Vec<&str> = batch.tasks.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["T001", "T003"]);

    let marked = engine.mark_task(&["T001".to_string()], None).expect("mark");
    assert_eq!(marked.queue.newly_eligible, vec!["T002".to_string()]);
    assert_eq!(marked.progress.complete, 1);

    let next = engine.next_task(false).expect("next");
    assert_eq!(next.tasks.len(), 1);
    assert_eq!(next.tasks[0].id, "T002");
}

/// Verifies blocking the last open task blocks the step and reports a halt naming it.
#[test]
fn blocked_tasks_halt_implement() {
    let (_project, engine) = at_implement();
    engine
        .mark_task(&["T001".to_string(), "T003".to_string()], None)
        .expect("mark");
    let marked = engine
        .mark_task(&["T002".to_string()], Some("waiting on credentials"))
        .expect("block");
    assert_eq!(
        marked.step.expect("step").status,
        StepStatus::Blocked
    );

    let report = engine.status().expect("status");
    assert!(matches!(report.next_action, NextAction::Recover { .. }));
    let halt = report.halt.expect("halt");
    assert_eq!(halt.tasks, vec!["T002".to_string()]);
    assert!(!report.health.healthy);

    let gate = engine.check_gate("implement", false).expect("gate");
    assert!(!gate.pass);
    assert!(gate.findings[0].description.contains("waiting on credentials"));

    let report = engine.defer_task("T002", "credentials next quarter").expect("defer");
    assert_eq!(report.step.expect("step").current, Step::Verify);
}

/// Verifies the implement gate lists every pending task (T004, T007).
#[test]
fn implement_gate_itemizes_pending_tasks() {
    let project = TestProject::new().expect("project");
    let engine = engine(&project, ScriptedFixer::fixing_all());
    start(&engine);
    project
        .write_design(
            "001",
            "## Work\n\
             - [x] T003 Wire the request router in `src/router.rs`\n\
             - [ ] T004 [P] Add the session store in `src/session.rs`\n\
             - [ ] T007 [P] Add the audit log in `src/audit.rs`\n",
        )
        .expect("design");

    let report = engine.check_gate("implement", false).expect("gate");
    assert!(!report.pass);
    let descriptions: Vec<&str> = report.findings.iter().map(|f| f.description.as_str()).collect();
    assert_eq!(
        descriptions,
        vec!["task T004 incomplete", "task T007 incomplete"]
    );
    assert_eq!(engine.check_gate("implement", false).expect("gate"), report);
}

/// Verifies auto-fix repairs a thin artifact, journals the iteration and advances the step.
#[test]
fn autofix_repairs_design_and_advances() {
    let project = TestProject::new().expect("project");
    let fixer = ScriptedFixer::fixing_all().repairing(populated("Spec"));
    let engine = engine(&project, fixer.clone());
    start(&engine);
    project.write_design("001", TASKS).expect("design");
    project
        .write_artifact("001", "spec.md", "# Spec\n\nTBD\n")
        .expect("thin spec");

    let gate = engine.check_gate("design", false).expect("gate");
    assert!(gate.blocking);

    let outcome = engine.run_auto_fix(None).expect("autofix");
    assert_eq!(outcome.status, AutofixStatus::Clean);
    assert_eq!(outcome.iteration, 1);
    assert_eq!(fixer.calls(), vec!["design-trivial-spec.md".to_string()]);
    assert_eq!(engine.get_state("autofix").expect("get"), None);

    let report = engine.status().expect("status");
    assert_eq!(report.step.expect("step").current, Step::Analyze);

    let journal = read_entries(&project.paths().autofix_journal_dir("001")).expect("journal");
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].gate, "design");
    assert!(journal[0].findings_after.is_empty());
}

/// Verifies an exhausted budget waits for the operator, and continue-anyway advances.
#[test]
fn exhausted_budget_waits_for_decision() {
    let project = TestProject::new().expect("project");
    let engine = engine(&project, ScriptedFixer::fixing_all());
    start(&engine);
    project.write_design("001", TASKS).expect("design");
    project
        .write_artifact("001", "plan.md", "# Plan\n\nlater\n")
        .expect("thin plan");

    let outcome = engine.run_auto_fix(None).expect("autofix");
    assert_eq!(outcome.status, AutofixStatus::BudgetExhausted);
    assert_eq!(outcome.iteration, 5);
    assert_eq!(outcome.remaining.len(), 1);

    let report = engine.status().expect("status");
    assert_eq!(report.next_action, NextAction::DecideAutoFix { remaining: 1 });
    assert!(report.halt.is_some());

    // Re-running does not spend more iterations.
    let again = engine.run_auto_fix(None).expect("autofix");
    assert_eq!(again.status, AutofixStatus::BudgetExhausted);
    assert_eq!(
        read_entries(&project.paths().autofix_journal_dir("001"))
            .expect("journal")
            .len(),
        5
    );

    engine.resolve(AutofixDecision::Continue).expect("continue");
    let report = engine.status().expect("status");
    assert_eq!(report.step.expect("step").current, Step::Analyze);
    assert_eq!(engine.get_state("autofix").expect("get"), None);
}

/// Verifies abort blocks the step until the operator resets it.
#[test]
fn aborted_budget_blocks_until_reset() {
    let project = TestProject::new().expect("project");
    let engine = engine(&project, ScriptedFixer::fixing_all());
    start(&engine);
    project.write_design("001", TASKS).expect("design");
    project
        .write_artifact("001", "plan.md", "# Plan\n\nlater\n")
        .expect("thin plan");
    engine.run_auto_fix(None).expect("autofix");

    let outcome = engine.resolve(AutofixDecision::Abort).expect("abort");
    assert_eq!(outcome.status, AutofixStatus::Aborted);
    let report = engine.status().expect("status");
    assert_eq!(report.step.expect("step").status, StepStatus::Blocked);
    assert!(matches!(report.next_action, NextAction::Recover { .. }));

    let err = engine.resolve(AutofixDecision::Continue).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::InvalidTransition(_))
    ));

    let report = engine.reset(Step::Design).expect("reset");
    assert_eq!(report.step.expect("step").status, StepStatus::InProgress);
}

/// Verifies completing every task after an operator abort leaves `implement`
/// blocked, and only an explicit status report lets it advance.
#[test]
fn abort_holds_implement_blocked_through_task_marks() {
    let (_project, engine) = at_implement();
    let outcome = engine.run_auto_fix(Some("implement")).expect("autofix");
    assert_eq!(outcome.status, AutofixStatus::BudgetExhausted);
    engine.resolve(AutofixDecision::Abort).expect("abort");

    let marked = engine
        .mark_task(&["T001".to_string(), "T002".to_string(), "T003".to_string()], None)
        .expect("mark");
    assert_eq!(marked.progress.complete, 3);
    let step = marked.step.expect("step");
    assert_eq!(step.current, Step::Implement);
    assert_eq!(step.status, StepStatus::Blocked);

    let report = engine.status().expect("status");
    assert_eq!(report.step.expect("step").current, Step::Implement);
    let halt = report.halt.expect("halt");
    assert!(halt.reason.contains("aborted"));
    assert_eq!(engine.get_state("autofix.aborted").expect("get"), Some(json!(true)));

    let again = engine.run_auto_fix(Some("implement")).expect("autofix");
    assert_eq!(again.status, AutofixStatus::Aborted);

    let report = engine.set_step_status(StepStatus::Complete).expect("complete");
    assert_eq!(report.step.expect("step").current, Step::Verify);
    assert_eq!(engine.get_state("autofix").expect("get"), None);
}

/// Verifies an unparsable coverage map becomes a blocking finding instead of
/// an error from every entry point.
#[test]
fn malformed_coverage_map_is_a_finding() {
    let (project, engine) = at_implement();
    project
        .write_artifact("001", "coverage.json", "{ \"goals\": ")
        .expect("coverage");

    let report = engine.status().expect("status");
    assert!(!report.health.healthy);
    assert_eq!(report.health.artifact_errors.len(), 1);
    assert!(report.health.artifact_errors[0].starts_with("coverage.json:"));
    assert_eq!(engine.get_state("phase.id").expect("get"), Some(json!("001")));

    let gate = engine.check_gate("coverage", false).expect("gate");
    assert!(gate.blocking);
    assert!(
        gate.findings
            .iter()
            .any(|f| f.category == "malformed-artifact" && f.location.artifact == "coverage.json")
    );

    project
        .write_artifact("001", "compliance.json", "[{\"id\": 7}]")
        .expect("compliance");
    let gate = engine.check_gate("memory-compliance", false).expect("gate");
    assert_eq!(gate.findings[0].id, "malformed-compliance.json");

    project
        .write_artifact("001", "coverage.json", COVERAGE)
        .expect("coverage");
    project
        .write_artifact("001", "compliance.json", "[]")
        .expect("compliance");
    assert!(engine.status().expect("status").health.artifact_errors.is_empty());
}

/// Verifies a state file that is not UTF-8 is backed up and rebuilt like any
/// other corrupt document.
#[test]
fn non_utf8_state_is_healed() {
    let (project, engine) = at_implement();
    fs::write(&project.paths().state_path, [0xff, 0xfe, 0x00, b'{']).expect("corrupt");

    let report = engine.status().expect("status");
    assert!(!report.health.healed.is_empty());
    assert_eq!(report.phase.expect("phase").id, "001");
    assert_eq!(report.step.expect("step").current, Step::Implement);
    let backup = project.paths().conductor_dir.join("state.corrupt.json");
    assert_eq!(fs::read(backup).expect("backup"), vec![0xff, 0xfe, 0x00, b'{']);
}

/// Verifies a partially mapped goal reports `partial` and deferral clears it from the gate.
#[test]
fn coverage_reports_partial_goals() {
    let (project, engine) = at_implement();
    project
        .write_artifact(
            "001",
            "coverage.json",
            r#"{"goals": {"G1": ["R1", "R2"]}, "requirements": {"R1": ["T001"], "R2": []}}"#,
        )
        .expect("coverage");
    engine.mark_task(&["T001".to_string()], None).expect("mark");

    let coverage = engine.coverage().expect("coverage");
    assert_eq!(coverage.goals[0].status, CoverageStatus::Partial);
    assert_eq!(coverage.summary.partial, 1);

    let err = engine.defer_goal("G9", "not ours").unwrap_err();
    assert!(err.to_string().contains("G9"));
    let coverage = engine.defer_goal("G1", "moved to phase 2").expect("defer");
    assert_eq!(coverage.goals[0].status, CoverageStatus::Deferred);
    assert!(engine.check_gate("coverage", false).expect("gate").pass);
}

/// Verifies a fresh engine over the same files reaches the same next action.
#[test]
fn fresh_process_resumes_with_same_next_action() {
    let (project, engine) = at_implement();
    engine.mark_task(&["T001".to_string()], None).expect("mark");
    let before = engine.status().expect("status");
    drop(engine);

    let resumed = project
        .engine_with(
            Arc::new(ScriptedFixer::fixing_all()),
            Box::new(ScriptedGenerator::new()),
        )
        .expect("engine");
    let after = resumed.status().expect("status");
    assert_eq!(after.next_action, before.next_action);
    assert_eq!(after.step, before.step);
    assert_eq!(after.tasks, before.tasks);
}

/// Verifies a corrupt document is backed up and the phase is rebuilt from artifacts.
#[test]
fn corrupt_state_is_healed_from_artifacts() {
    let (project, engine) = at_implement();
    fs::write(&project.paths().state_path, "{ not json").expect("corrupt");

    let report = engine.status().expect("status");
    assert!(!report.health.healthy);
    assert!(!report.health.healed.is_empty());
    let phase = report.phase.expect("phase");
    assert_eq!(phase.id, "001");
    assert_eq!(phase.goals[0].id, "G1");
    assert_eq!(report.step.expect("step").current, Step::Implement);
    assert!(
        project
            .paths()
            .conductor_dir
            .join("state.corrupt.json")
            .is_file()
    );

    let again = engine.status().expect("status");
    assert!(again.health.healed.is_empty());
}

/// Verifies a step whose design inputs vanished is re-derived instead of trusted.
#[test]
fn step_without_prerequisites_is_rederived() {
    let (project, engine) = at_implement();
    fs::remove_file(project.phase_dir("001").join("spec.md")).expect("remove");

    let report = engine.status().expect("status");
    assert_eq!(report.step.expect("step").current, Step::Design);
    assert!(report.health.healed[0].contains("implement"));
}

/// Verifies only one phase may be active and insertion ids slot between majors.
#[test]
fn phase_ids_allocate_and_collide() {
    let project = TestProject::new().expect("project");
    let engine = engine(&project, ScriptedFixer::fixing_all());
    start(&engine);
    let err = engine
        .start_phase(PhaseStart {
            name: "second".to_string(),
            ..PhaseStart::default()
        })
        .unwrap_err();
    assert!(err.to_string().contains("still active"));

    fs::create_dir_all(project.root().join("specs").join("003")).expect("dir");
    let store = project.store();
    store
        .set_as(
            conductor::core::state_paths::Writer::Engine,
            "phase.status",
            json!("complete"),
        )
        .expect("close");
    let report = engine
        .start_phase(PhaseStart {
            name: "hotfix".to_string(),
            after: Some("001".to_string()),
            ..PhaseStart::default()
        })
        .expect("insert");
    assert_eq!(report.phase.expect("phase").id, "001.1");
}

/// Verifies driver writes cannot touch engine-owned paths.
#[test]
fn driver_cannot_write_engine_paths() {
    let (_project, engine) = at_implement();
    let err = engine.set_state("step.current", json!("verify")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<EngineError>(),
        Some(EngineError::OwnershipViolation { .. })
    ));
    engine.set_state("notes.owner", json!("ops")).expect("driver path");
    assert_eq!(engine.get_state("notes.owner").expect("get"), Some(json!("ops")));
}
