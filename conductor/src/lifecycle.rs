//! Phase lifecycle: the engine entry points.
//!
//! Every entry point first calls [`Engine::sync`], which heals the state
//! document against the artifacts on disk and applies any advance the persisted
//! state already earned. Nothing is cached between invocations, so a fresh
//! process always reaches the same decisions as the one that was interrupted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument, warn};

use crate::autofix::{AutofixDecision, AutofixLoop, AutofixOutcome, Detector};
use crate::coordinator::{Coordinator, DispatchPlan, WorkerJob};
use crate::core::coverage::{CoverageSummary, GoalCoverageEntry, compute_coverage, summarize};
use crate::core::gates::{
    GATE_NAMES, GateInputs, GateReport, gate_by_name, malformed_artifact, run_gate,
};
use crate::core::next_action::{ActionInputs, NextAction, RECOVERY_ACTIONS, next_action};
use crate::core::phase::{PhaseId, PhaseRecord};
use crate::core::state_doc::{
    ARCHIVE, AUTOFIX, ArchivedPhase, AutofixRecord, DEFERRED, DEFERRED_GOALS, DEFERRED_TASKS,
    DeferredRecord, HUMAN, PHASE, PHASE_STATUS, STEP, STEP_STATUS, StepRecord, TASKS,
    empty_document,
};
use crate::core::state_paths::Writer;
use crate::core::step_machine::{
    Advance, StepEvidence, Transition, TransitionReason, advance, derive_step, prerequisites_met,
    reset as reset_transition, skip_to as skip_transition,
};
use crate::core::task_graph::{QueueState, QueueStatus, TaskGraph, TaskProgress, TaskRecord};
use crate::core::types::{
    Finding, Goal, HaltReport, PhaseStatus, RecoveryAction, Step, StepStatus, Task, TaskState,
};
use crate::error::EngineError;
use crate::io::artifacts::{
    inspect, inspect_design, load_coverage_map, load_findings, load_task_list, missing_design,
    unreferenced,
};
use crate::io::collaborators::{Collaborators, GenerateRequest, HumanDecision, HumanGateRequest};
use crate::io::config::{EngineConfig, load_config};
use crate::io::init::ConductorPaths;
use crate::io::state_store::StateStore;

/// The lifecycle controller for one project root.
pub struct Engine {
    paths: ConductorPaths,
    config: EngineConfig,
    store: StateStore,
    collaborators: Collaborators,
}

/// Request to open a new phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseStart {
    /// Explicit id. Must not collide with the current or an archived phase.
    pub id: Option<String>,
    /// Allocate an insertion slot after this id instead of the next major.
    pub after: Option<String>,
    pub name: String,
    pub goals: Vec<Goal>,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub current: Step,
    pub status: StepStatus,
}

impl From<&StepRecord> for StepView {
    fn from(record: &StepRecord) -> Self {
        Self {
            current: record.current,
            status: record.status,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Health {
    pub healthy: bool,
    /// Repairs applied by this invocation.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub healed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub task_list_errors: Vec<String>,
    /// Machine-readable artifacts that exist but do not parse.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifact_errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub phase: Option<PhaseRecord>,
    pub step: Option<StepView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TaskProgress>,
    pub health: Health,
    pub next_action: NextAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt: Option<HaltReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NextTasks {
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueState>,
    /// Why `tasks` is empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkResult {
    pub queue: QueueState,
    pub progress: TaskProgress,
    pub step: Option<StepView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateResult {
    pub requested: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoverageReport {
    pub goals: Vec<GoalCoverageEntry>,
    pub summary: CoverageSummary,
}

/// Typed decode of the state document.
#[derive(Debug, Clone, Default)]
struct Snapshot {
    phase: Option<PhaseRecord>,
    step: Option<StepRecord>,
    tasks: BTreeMap<String, TaskRecord>,
    deferred: DeferredRecord,
    autofix: AutofixRecord,
    archive: BTreeMap<String, ArchivedPhase>,
}

impl Snapshot {
    fn from_document(doc: &Value) -> Result<Self, EngineError> {
        Ok(Self {
            phase: decode(doc, PHASE)?,
            step: decode(doc, STEP)?,
            tasks: decode(doc, TASKS)?.unwrap_or_default(),
            deferred: decode(doc, DEFERRED)?.unwrap_or_default(),
            autofix: decode(doc, AUTOFIX)?.unwrap_or_default(),
            archive: decode(doc, ARCHIVE)?.unwrap_or_default(),
        })
    }
}

fn decode<T: DeserializeOwned>(doc: &Value, key: &str) -> Result<Option<T>, EngineError> {
    doc.get(key)
        .map(|value| {
            serde_json::from_value(value.clone()).map_err(|err| EngineError::StateCorruption {
                path: key.to_string(),
                detail: err.to_string(),
            })
        })
        .transpose()
}

/// Everything the gates see for one phase, read fresh from disk.
struct PhaseView {
    dir: PathBuf,
    missing_design: Vec<String>,
    artifact_errors: Vec<String>,
    inputs: GateInputs,
}

impl PhaseView {
    fn graph(&self) -> Option<&TaskGraph> {
        self.inputs.tasks.as_ref()
    }

    fn evidence(&self) -> StepEvidence {
        StepEvidence {
            design_artifacts: self.inputs.design.iter().all(|a| a.exists),
            analysis_report: self.inputs.analysis.exists,
            tasks_done: self
                .graph()
                .is_some_and(|g| g.queue_state().status == QueueStatus::ExhaustedComplete),
        }
    }

    fn gate(&self, name: &str, strict: bool) -> Result<GateReport> {
        let gate = gate_by_name(name).ok_or_else(|| {
            anyhow!(
                "unknown gate '{name}' (expected one of {})",
                GATE_NAMES.join(", ")
            )
        })?;
        Ok(run_gate(gate.as_ref(), &self.inputs, strict))
    }
}

/// Re-evaluates one gate against the current artifacts.
struct GateDetector<'a> {
    engine: &'a Engine,
    gate: &'a str,
}

impl Detector for GateDetector<'_> {
    fn detect(&self) -> Result<Vec<Finding>> {
        let snap = self.engine.snapshot()?;
        let phase = require_active(&snap)?;
        let view = self.engine.view(&snap, &phase)?;
        Ok(view.gate(self.gate, self.engine.config.strict_gates)?.findings)
    }
}

impl Engine {
    /// Open an initialized project with collaborators built from its config.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let paths = ConductorPaths::new(root);
        if !paths.conductor_dir.is_dir() {
            return Err(anyhow!(
                "{} is not initialized (run `conductor init`)",
                paths.root.display()
            ));
        }
        let config = load_config(&paths.config_path)?;
        let store = StateStore::new(&paths.state_path);
        let collaborators = Collaborators::from_config(&config, &paths.root, &store);
        Ok(Self {
            paths,
            config,
            store,
            collaborators,
        })
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn paths(&self) -> &ConductorPaths {
        &self.paths
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Heal the document and apply any advance the persisted state allows.
    /// Returns a note per repair.
    #[instrument(skip_all)]
    pub fn sync(&self) -> Result<Vec<String>> {
        let (snap, mut notes) = self.snapshot_healing()?;
        let Some(phase) = snap.phase.clone().filter(PhaseRecord::is_active) else {
            return Ok(notes);
        };

        let dir = self.paths.phase_dir(&phase.dir);
        if !dir.is_dir() {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create phase dir {}", dir.display()))?;
            let note = format!("phase directory {} was missing and has been recreated", phase.dir);
            warn!(%note, "healed phase directory");
            notes.push(note);
        }

        let view = self.view(&snap, &phase)?;
        let (step, healed) = self.heal_step(&snap, &view, &mut notes)?;
        let strict = self.config.strict_gates;

        if phase.status == PhaseStatus::AwaitingHuman {
            if healed {
                self.store
                    .set_as(Writer::Engine, PHASE_STATUS, json!(PhaseStatus::InProgress))?;
                notes.push("phase returned to in-progress after step healing".to_string());
                return Ok(notes);
            }
            let report = view.gate(Step::Verify.gate_name(), strict)?;
            self.consult_human(&phase, &snap, &step, report)?;
            return Ok(notes);
        }

        if step.status == StepStatus::Complete {
            let report = view.gate(step.current.gate_name(), strict)?;
            if report.blocking {
                debug!(gate = %report.gate, "step complete but gate blocks; not advancing");
            } else {
                self.advance_from(&phase, &snap, step, report)?;
            }
        }
        Ok(notes)
    }

    /// Current phase, step, task progress, health and next action.
    pub fn status(&self) -> Result<StatusReport> {
        let healed = self.sync()?;
        let snap = self.snapshot()?;
        let mut health = Health {
            healed,
            ..Health::default()
        };

        let Some(phase) = snap.phase.clone() else {
            health.healthy = health.healed.is_empty();
            return Ok(StatusReport {
                phase: None,
                step: None,
                tasks: None,
                health,
                next_action: NextAction::StartPhase,
                halt: None,
            });
        };
        let step = snap.step.as_ref().map(StepView::from);
        if !phase.is_active() {
            health.healthy = health.healed.is_empty();
            return Ok(StatusReport {
                phase: Some(phase),
                step,
                tasks: None,
                health,
                next_action: NextAction::PhaseComplete,
                halt: None,
            });
        }

        let view = self.view(&snap, &phase)?;
        health.task_list_errors = view.inputs.task_errors.clone();
        health.artifact_errors = view.artifact_errors.clone();
        let cursor = snap.step.as_ref().map(StepRecord::cursor);
        let queue = view.graph().map(TaskGraph::queue_state);
        let gate = cursor
            .map(|c| view.gate(c.current.gate_name(), self.config.strict_gates))
            .transpose()?;
        let autofix_pending = snap
            .autofix
            .awaiting_decision
            .then_some(snap.autofix.remaining.len());
        let next = next_action(&ActionInputs {
            phase: Some(phase.status),
            cursor,
            missing_design: &view.missing_design,
            queue: queue.as_ref(),
            gate: gate.as_ref(),
            autofix_pending,
        });
        let halt = halt_report(
            snap.step.as_ref(),
            &snap.autofix,
            gate.as_ref(),
            queue.as_ref(),
            self.config.max_fix_iterations,
        );
        health.healthy = health.healed.is_empty()
            && health.task_list_errors.is_empty()
            && health.artifact_errors.is_empty()
            && halt.is_none();

        Ok(StatusReport {
            phase: Some(phase),
            step,
            tasks: view.graph().map(TaskGraph::progress),
            health,
            next_action: next,
            halt,
        })
    }

    /// The next eligible task, or the whole next parallel batch.
    pub fn next_task(&self, batch: bool) -> Result<NextTasks> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        let view = self.view(&snap, &phase)?;

        let Some(graph) = view.graph() else {
            let reason = if view.inputs.task_errors.is_empty() {
                format!("task list {} not found", self.config.artifacts.task_list)
            } else {
                format!("task list invalid: {}", view.inputs.task_errors.join("; "))
            };
            return Ok(NextTasks {
                tasks: Vec::new(),
                queue: None,
                reason: Some(reason),
            });
        };
        let queue = graph.queue_state();

        let current = snap.step.as_ref().map(|s| s.current);
        if current != Some(Step::Implement) {
            let reason = match current {
                Some(step) => format!("current step is {step}, not implement"),
                None => "no step in progress".to_string(),
            };
            return Ok(NextTasks {
                tasks: Vec::new(),
                queue: Some(queue),
                reason: Some(reason),
            });
        }

        let tasks: Vec<Task> = if batch {
            graph.next_batch().into_iter().cloned().collect()
        } else {
            graph.next_task().cloned().into_iter().collect()
        };
        let reason = tasks.is_empty().then(|| {
            let reason = match queue.status {
                QueueStatus::ExhaustedComplete => "all tasks are complete",
                QueueStatus::ExhaustedBlocked => "remaining tasks are blocked",
                QueueStatus::Active => "no task is eligible",
            };
            reason.to_string()
        });
        Ok(NextTasks {
            tasks,
            queue: Some(queue),
            reason,
        })
    }

    /// Mark tasks complete, or blocked with `reason`.
    #[instrument(skip_all, fields(tasks = ids.len(), blocked = blocked.is_some()))]
    pub fn mark_task(&self, ids: &[String], blocked: Option<&str>) -> Result<MarkResult> {
        if ids.is_empty() {
            return Err(EngineError::InvalidTransition("no task ids given".to_string()).into());
        }
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        let view = self.view(&snap, &phase)?;
        let mut graph = view.inputs.tasks.ok_or_else(|| {
            EngineError::InvalidTransition(format!(
                "task list {} is missing or invalid",
                self.config.artifacts.task_list
            ))
        })?;

        let before = graph.queue_state().eligible;
        for id in ids {
            match blocked {
                Some(reason) => graph.mark_blocked(id, reason)?,
                None => graph.mark_complete(id)?,
            };
        }
        self.store
            .set_serialized(Writer::Engine, TASKS, &graph.records())?;

        let mut queue = graph.queue_state();
        queue.newly_eligible = queue
            .eligible
            .iter()
            .filter(|id| !before.contains(id))
            .cloned()
            .collect();
        info!(
            completed = queue.completed,
            remaining = queue.remaining,
            status = ?queue.status,
            "tasks marked"
        );

        if let Some(step) = &snap.step {
            self.settle_implement(step, &snap.autofix, &queue)?;
        }
        self.sync()?;
        Ok(MarkResult {
            progress: graph.progress(),
            queue,
            step: self.snapshot()?.step.as_ref().map(StepView::from),
        })
    }

    /// Evaluate one gate against the active (or just archived) phase.
    pub fn check_gate(&self, name: &str, strict: bool) -> Result<GateReport> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = snap
            .phase
            .clone()
            .ok_or_else(|| EngineError::InvalidTransition("no phase started".to_string()))?;
        let view = self.view(&snap, &phase)?;
        view.gate(name, strict || self.config.strict_gates)
    }

    pub fn get_state(&self, path: &str) -> Result<Option<Value>> {
        self.sync()?;
        self.store.get(path)
    }

    /// Driver write; engine- and component-owned paths are rejected.
    pub fn set_state(&self, path: &str, value: Value) -> Result<()> {
        self.sync()?;
        self.store.set_as(Writer::Driver, path, value)?;
        self.sync()?;
        Ok(())
    }

    /// Run the bounded auto-fix loop for `gate`, defaulting to the gate of the
    /// current step (or the gate of a loop already in flight).
    pub fn run_auto_fix(&self, gate: Option<&str>) -> Result<AutofixOutcome> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        let step = require_step(&snap)?;
        let gate = gate
            .map(str::to_string)
            .or_else(|| snap.autofix.gate.clone())
            .unwrap_or_else(|| step.current.gate_name().to_string());
        if gate_by_name(&gate).is_none() {
            return Err(anyhow!(
                "unknown gate '{gate}' (expected one of {})",
                GATE_NAMES.join(", ")
            ));
        }

        let detector = GateDetector {
            engine: self,
            gate: &gate,
        };
        let initial = if snap.autofix.awaiting_decision || snap.autofix.aborted {
            Vec::new()
        } else {
            detector.detect()?
        };
        let coordinator = Coordinator::from_config(&self.config);
        let dir = self.paths.phase_dir(&phase.dir);
        let outcome = self
            .autofix_loop(&coordinator, &phase, &dir, &gate, step.current)
            .run(initial, &detector)?;
        self.sync()?;
        Ok(outcome)
    }

    /// Answer an exhausted auto-fix budget. `continue` advances past the gate
    /// even though it still blocks.
    pub fn resolve(&self, decision: AutofixDecision) -> Result<AutofixOutcome> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        let step = require_step(&snap)?;
        let gate = snap
            .autofix
            .gate
            .clone()
            .unwrap_or_else(|| step.current.gate_name().to_string());
        let coordinator = Coordinator::from_config(&self.config);
        let dir = self.paths.phase_dir(&phase.dir);
        let outcome = self
            .autofix_loop(&coordinator, &phase, &dir, &gate, step.current)
            .resolve(decision)?;

        if decision == AutofixDecision::Continue {
            let snap = self.snapshot()?;
            if let Some(step) = snap.step.clone()
                && step.status == StepStatus::Complete
            {
                let view = self.view(&snap, &phase)?;
                let report = view.gate(step.current.gate_name(), self.config.strict_gates)?;
                if report.blocking {
                    info!(gate = %report.gate, "advancing past blocking gate on operator decision");
                }
                self.advance_from(&phase, &snap, step, report)?;
            }
        }
        self.sync()?;
        Ok(outcome)
    }

    /// Open a new phase. Only one phase may be active at a time.
    #[instrument(skip_all, fields(name = %request.name))]
    pub fn start_phase(&self, request: PhaseStart) -> Result<StatusReport> {
        let (snap, _) = self.snapshot_healing()?;
        if let Some(current) = snap.phase.as_ref().filter(|p| p.is_active()) {
            return Err(EngineError::InvalidTransition(format!(
                "phase {} is still active; finish or archive it first",
                current.id
            ))
            .into());
        }
        if request.name.trim().is_empty() {
            return Err(EngineError::InvalidTransition("phase name must not be empty".into()).into());
        }
        let mut goal_ids = BTreeSet::new();
        for goal in &request.goals {
            if !goal_ids.insert(goal.id.as_str()) {
                return Err(EngineError::InvalidTransition(format!(
                    "goal '{}' is listed twice",
                    goal.id
                ))
                .into());
            }
        }

        let taken: BTreeSet<PhaseId> = snap
            .archive
            .keys()
            .map(String::as_str)
            .chain(snap.phase.as_ref().map(|p| p.id.as_str()))
            .filter_map(|id| id.parse().ok())
            .collect();
        let mut existing = taken.clone();
        existing.extend(self.phase_dirs()?);

        let id = match (request.id, request.after) {
            (Some(raw), _) => {
                let id: PhaseId = raw.parse().map_err(EngineError::InvalidTransition)?;
                if taken.contains(&id) {
                    return Err(EngineError::InvalidTransition(format!(
                        "phase id {id} already exists"
                    ))
                    .into());
                }
                id
            }
            (None, Some(after)) => {
                let after: PhaseId = after.parse().map_err(EngineError::InvalidTransition)?;
                after.insert_after(&existing)
            }
            (None, None) => PhaseId::next_major(&existing),
        };

        let dir = format!("{}/{id}", self.config.artifacts.phase_root);
        let abs = self.paths.phase_dir(&dir);
        fs::create_dir_all(&abs).with_context(|| format!("create phase dir {}", abs.display()))?;

        let record = PhaseRecord {
            id: id.to_string(),
            name: request.name,
            goals: request.goals,
            branch: request.branch,
            dir,
            status: PhaseStatus::InProgress,
        };
        let step = StepRecord {
            current: Step::Design,
            status: StepStatus::InProgress,
            history: vec![Transition {
                from: None,
                to: Step::Design,
                reason: TransitionReason::Start,
            }],
        };
        self.store.set_many(
            Writer::Engine,
            vec![
                (PHASE, serde_json::to_value(&record)?),
                (STEP, serde_json::to_value(&step)?),
                (TASKS, Value::Null),
                (DEFERRED, Value::Null),
                (AUTOFIX, Value::Null),
                (HUMAN, Value::Null),
            ],
        )?;
        info!(phase = %record.id, dir = %record.dir, goals = record.goals.len(), "phase started");
        self.status()
    }

    /// Move back to `target` (or re-enter the current step).
    pub fn reset(&self, target: Step) -> Result<StatusReport> {
        self.move_step(target, false)
    }

    /// Jump forward to `target`; its prerequisites must already be met.
    pub fn skip_to(&self, target: Step) -> Result<StatusReport> {
        self.move_step(target, true)
    }

    /// Report the active step's status, as the component running it.
    pub fn set_step_status(&self, status: StepStatus) -> Result<StatusReport> {
        self.sync()?;
        let snap = self.snapshot()?;
        require_active(&snap)?;
        let step = require_step(&snap)?;
        self.store
            .set_as(Writer::ActiveStep, STEP_STATUS, json!(status))?;
        if snap.autofix.aborted && status != StepStatus::Blocked {
            self.store.set_as(Writer::Engine, AUTOFIX, Value::Null)?;
            info!(step = %step.current, "operator abort cleared");
        }
        info!(step = %step.current, status = status.as_str(), "step status reported");
        self.status()
    }

    /// Ask the generator for the missing design artifacts.
    pub fn generate(&self) -> Result<GenerateResult> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        let step = require_step(&snap)?;
        if step.current != Step::Design {
            return Err(EngineError::InvalidTransition(format!(
                "generate runs during design; current step is {}",
                step.current
            ))
            .into());
        }
        let view = self.view(&snap, &phase)?;
        let requested = view.missing_design.clone();
        if !requested.is_empty() {
            info!(missing = ?requested, "requesting design artifacts");
            self.collaborators.generator.generate(&GenerateRequest {
                phase_dir: view.dir.clone(),
                goals: phase.goals.clone(),
                missing: requested.clone(),
            })?;
        }

        let missing = missing_design(&view.dir, &self.config.artifacts);
        if missing.is_empty() && step.status == StepStatus::InProgress {
            self.store
                .set_as(Writer::ActiveStep, STEP_STATUS, json!(StepStatus::Complete))?;
        } else if !missing.is_empty() {
            warn!(?missing, "generator left design artifacts missing");
        }
        self.sync()?;
        Ok(GenerateResult { requested, missing })
    }

    pub fn coverage(&self) -> Result<CoverageReport> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = snap
            .phase
            .clone()
            .ok_or_else(|| EngineError::InvalidTransition("no phase started".to_string()))?;
        let view = self.view(&snap, &phase)?;
        let goals = view.inputs.coverage;
        Ok(CoverageReport {
            summary: summarize(&goals),
            goals,
        })
    }

    /// Exclude a task from the queue. Deferral is the only way to finish
    /// `implement` with a task left undone.
    pub fn defer_task(&self, id: &str, reason: &str) -> Result<StatusReport> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        let view = self.view(&snap, &phase)?;
        let graph = view.graph().ok_or_else(|| {
            EngineError::InvalidTransition(format!(
                "task list {} is missing or invalid",
                self.config.artifacts.task_list
            ))
        })?;
        let task = graph
            .get(id)
            .ok_or_else(|| EngineError::UnknownTask(id.to_string()))?;
        if task.state == TaskState::Complete {
            return Err(
                EngineError::InvalidTransition(format!("task {id} is already complete")).into(),
            );
        }

        let mut deferred = snap.deferred.tasks.clone();
        deferred.insert(id.to_string(), reason.to_string());
        self.store
            .set_serialized(Writer::Driver, DEFERRED_TASKS, &deferred)?;
        info!(task = id, reason, "task deferred");

        let mut graph = graph.clone();
        graph.apply_deferred(&deferred);
        if let Some(step) = &snap.step {
            self.settle_implement(step, &snap.autofix, &graph.queue_state())?;
        }
        self.status()
    }

    /// Exclude a goal from coverage requirements.
    pub fn defer_goal(&self, id: &str, reason: &str) -> Result<CoverageReport> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        if !phase.goals.iter().any(|g| g.id == id) {
            return Err(EngineError::InvalidTransition(format!(
                "phase {} has no goal '{id}'",
                phase.id
            ))
            .into());
        }
        let mut deferred = snap.deferred.goals.clone();
        deferred.insert(id.to_string(), reason.to_string());
        self.store
            .set_serialized(Writer::Driver, DEFERRED_GOALS, &deferred)?;
        info!(goal = id, reason, "goal deferred");
        self.coverage()
    }

    /// Batch plan the coordinator would use for `jobs`, without running them.
    pub fn dispatch_preview(&self, jobs: &[WorkerJob]) -> DispatchPlan {
        Coordinator::from_config(&self.config).preview(jobs)
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let doc = self.store.load()?;
        Ok(Snapshot::from_document(&doc)?)
    }

    /// Load the snapshot, repairing a corrupt document first if needed.
    fn snapshot_healing(&self) -> Result<(Snapshot, Vec<String>)> {
        match self.snapshot() {
            Ok(snap) => Ok((snap, Vec::new())),
            Err(err) => match err.downcast_ref::<EngineError>() {
                Some(cause @ EngineError::StateCorruption { .. }) => {
                    let notes = self.heal_corruption(cause)?;
                    Ok((self.snapshot()?, notes))
                }
                _ => Err(err),
            },
        }
    }

    /// Back up the corrupt document, keep every top-level key that still
    /// decodes, and re-adopt the phase directory if the phase itself was lost.
    #[instrument(skip_all)]
    fn heal_corruption(&self, cause: &EngineError) -> Result<Vec<String>> {
        let path = self.store.path();
        let backup = path.with_extension("corrupt.json");
        let raw = fs::read(path).with_context(|| format!("read state {}", path.display()))?;
        fs::write(&backup, &raw).with_context(|| format!("write {}", backup.display()))?;
        warn!(%cause, backup = %backup.display(), "state document corrupt; healing");
        let mut notes = vec![format!("{cause}; original saved to {}", backup.display())];

        let mut doc = empty_document();
        if let Ok(Value::Object(original)) = serde_json::from_slice::<Value>(&raw) {
            for (key, value) in original {
                if key == "version" {
                    continue;
                }
                if self.salvageable(&key, &value) {
                    doc[key.as_str()] = value;
                } else {
                    notes.push(format!("dropped unreadable '{key}'"));
                }
            }
        } else {
            notes.push("document was not a JSON object; rebuilt from artifacts".to_string());
        }

        if doc.get(PHASE).is_none() {
            let archive: BTreeMap<String, ArchivedPhase> =
                decode(&doc, ARCHIVE).ok().flatten().unwrap_or_default();
            if let Some(phase) = self.adopt_phase_dir(&archive)? {
                notes.push(format!("re-adopted phase {} from {}", phase.id, phase.dir));
                doc[PHASE] = serde_json::to_value(&phase)?;
                if let Some(map) = doc.as_object_mut() {
                    map.remove(STEP);
                }
            }
        }
        self.store.write(&doc)?;
        Ok(notes)
    }

    fn salvageable(&self, key: &str, value: &Value) -> bool {
        let mut single = Map::new();
        single.insert("version".to_string(), json!(1));
        single.insert(key.to_string(), value.clone());
        let single = Value::Object(single);
        if self.store.validate(&single).is_err() {
            return false;
        }
        match key {
            PHASE => decode::<PhaseRecord>(&single, key).is_ok(),
            STEP => decode::<StepRecord>(&single, key).is_ok(),
            TASKS => decode::<BTreeMap<String, TaskRecord>>(&single, key).is_ok(),
            DEFERRED => decode::<DeferredRecord>(&single, key).is_ok(),
            AUTOFIX => decode::<AutofixRecord>(&single, key).is_ok(),
            ARCHIVE => decode::<BTreeMap<String, ArchivedPhase>>(&single, key).is_ok(),
            _ => true,
        }
    }

    /// The highest-numbered unarchived phase directory, as an in-progress phase.
    fn adopt_phase_dir(
        &self,
        archive: &BTreeMap<String, ArchivedPhase>,
    ) -> Result<Option<PhaseRecord>> {
        let Some(id) = self
            .phase_dirs()?
            .into_iter()
            .filter(|id| !archive.contains_key(id.as_str()))
            .max()
        else {
            return Ok(None);
        };
        let dir = format!("{}/{id}", self.config.artifacts.phase_root);
        let (map, _) = load_coverage_map(
            &self
                .paths
                .phase_dir(&dir)
                .join(&self.config.artifacts.coverage_map),
        )?
        .into_parts();
        let goals = map
            .goals
            .keys()
            .map(|goal| Goal {
                id: goal.clone(),
                text: goal.clone(),
            })
            .collect();
        Ok(Some(PhaseRecord {
            id: id.to_string(),
            name: id.to_string(),
            goals,
            branch: None,
            dir,
            status: PhaseStatus::InProgress,
        }))
    }

    /// Ids of the directories under the phase root that parse as phase ids.
    fn phase_dirs(&self) -> Result<Vec<PhaseId>> {
        let root = self.paths.phase_dir(&self.config.artifacts.phase_root);
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&root).with_context(|| format!("read {}", root.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", root.display()))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<PhaseId>().ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Re-derive the step when it is missing or its prerequisites are gone.
    fn heal_step(
        &self,
        snap: &Snapshot,
        view: &PhaseView,
        notes: &mut Vec<String>,
    ) -> Result<(StepRecord, bool)> {
        let evidence = view.evidence();
        if let Some(step) = &snap.step
            && prerequisites_met(step.current, evidence)
        {
            return Ok((step.clone(), false));
        }

        let derived = derive_step(evidence);
        let from = snap.step.as_ref().map(|s| s.current);
        let mut history = snap
            .step
            .as_ref()
            .map(|s| s.history.clone())
            .unwrap_or_default();
        history.push(Transition {
            from,
            to: derived,
            reason: TransitionReason::Heal,
        });
        let record = StepRecord {
            current: derived,
            status: StepStatus::InProgress,
            history,
        };
        self.store.set_many(
            Writer::Engine,
            vec![
                (STEP, serde_json::to_value(&record)?),
                (AUTOFIX, Value::Null),
            ],
        )?;

        let note = match from {
            Some(from) => {
                format!("step {from} lacks its prerequisites; re-derived {derived} from artifacts")
            }
            None => format!("step was missing; derived {derived} from artifacts"),
        };
        warn!(%note, "healed step");
        notes.push(note);
        Ok((record, true))
    }

    fn advance_from(
        &self,
        phase: &PhaseRecord,
        snap: &Snapshot,
        step: StepRecord,
        report: GateReport,
    ) -> Result<()> {
        match advance(step.cursor()).map_err(EngineError::InvalidTransition)? {
            Advance::Next(transition) => {
                info!(from = %step.current, to = %transition.to, "step advanced");
                let mut record = step;
                record.current = transition.to;
                record.status = StepStatus::InProgress;
                record.history.push(transition);
                self.store.set_many(
                    Writer::Engine,
                    vec![
                        (STEP, serde_json::to_value(&record)?),
                        (AUTOFIX, Value::Null),
                    ],
                )
            }
            Advance::PipelineComplete => self.consult_human(phase, snap, &step, report),
        }
    }

    fn consult_human(
        &self,
        phase: &PhaseRecord,
        snap: &Snapshot,
        step: &StepRecord,
        report: GateReport,
    ) -> Result<()> {
        let decision = self.collaborators.human.review(&HumanGateRequest {
            phase: phase.id.clone(),
            gate: report.gate,
            findings: report.findings,
        })?;
        match decision {
            HumanDecision::Confirmed | HumanDecision::Skipped => {
                self.archive_phase(phase, snap, step, decision)
            }
            HumanDecision::Pending if phase.status != PhaseStatus::AwaitingHuman => {
                info!(phase = %phase.id, "awaiting human sign-off");
                self.store
                    .set_as(Writer::Engine, PHASE_STATUS, json!(PhaseStatus::AwaitingHuman))
            }
            HumanDecision::Pending => Ok(()),
        }
    }

    fn archive_phase(
        &self,
        phase: &PhaseRecord,
        snap: &Snapshot,
        step: &StepRecord,
        decision: HumanDecision,
    ) -> Result<()> {
        let mut record = phase.clone();
        record.status = PhaseStatus::Complete;
        // Phase ids contain dots, so the archive map is written whole.
        let mut archive = snap.archive.clone();
        archive.insert(
            record.id.clone(),
            ArchivedPhase {
                phase: record.clone(),
                step: Some(step.clone()),
                tasks: snap.tasks.clone(),
                deferred: snap.deferred.clone(),
            },
        );
        self.store.set_many(
            Writer::Engine,
            vec![
                (PHASE, serde_json::to_value(&record)?),
                (ARCHIVE, serde_json::to_value(&archive)?),
                (HUMAN, Value::Null),
                (AUTOFIX, Value::Null),
            ],
        )?;
        info!(phase = %record.id, ?decision, "phase complete and archived");
        Ok(())
    }

    /// Keep `implement`'s status in line with its queue. An operator abort
    /// holds the step blocked whatever the queue does.
    fn settle_implement(
        &self,
        step: &StepRecord,
        autofix: &AutofixRecord,
        queue: &QueueState,
    ) -> Result<()> {
        if step.current != Step::Implement {
            return Ok(());
        }
        if autofix.aborted {
            debug!("implement held blocked by operator abort");
            return Ok(());
        }
        let status = match queue.status {
            QueueStatus::ExhaustedComplete => StepStatus::Complete,
            QueueStatus::ExhaustedBlocked => StepStatus::Blocked,
            QueueStatus::Active if step.status == StepStatus::Blocked => StepStatus::InProgress,
            QueueStatus::Active => return Ok(()),
        };
        if status != step.status {
            debug!(status = status.as_str(), "implement status follows queue");
            self.store
                .set_as(Writer::ActiveStep, STEP_STATUS, json!(status))?;
        }
        Ok(())
    }

    fn move_step(&self, target: Step, skip: bool) -> Result<StatusReport> {
        self.sync()?;
        let snap = self.snapshot()?;
        let phase = require_active(&snap)?;
        let step = require_step(&snap)?;
        let transition = if skip {
            let transition = skip_transition(step.cursor(), target)
                .map_err(EngineError::InvalidTransition)?;
            let view = self.view(&snap, &phase)?;
            if !prerequisites_met(target, view.evidence()) {
                return Err(EngineError::InvalidTransition(format!(
                    "cannot skip to {target}: its prerequisite artifacts are missing"
                ))
                .into());
            }
            transition
        } else {
            reset_transition(step.cursor(), target)
                .map_err(EngineError::InvalidTransition)?
        };

        let mut record = step;
        record.current = target;
        record.status = StepStatus::InProgress;
        record.history.push(transition);
        let mut writes = vec![
            (STEP, serde_json::to_value(&record)?),
            (AUTOFIX, Value::Null),
        ];
        if phase.status == PhaseStatus::AwaitingHuman {
            writes.push((PHASE_STATUS, json!(PhaseStatus::InProgress)));
        }
        self.store.set_many(Writer::Engine, writes)?;
        info!(to = %target, skip, "step moved by operator");
        self.status()
    }

    fn autofix_loop<'a>(
        &'a self,
        coordinator: &'a Coordinator,
        phase: &PhaseRecord,
        dir: &'a Path,
        gate: &'a str,
        current: Step,
    ) -> AutofixLoop<'a> {
        AutofixLoop {
            store: &self.store,
            coordinator,
            fixer: self.collaborators.fixer.clone(),
            strategies: &self.config.fix_strategies,
            phase_dir: dir,
            journal_dir: self.paths.autofix_journal_dir(&phase.id),
            max_iterations: self.config.max_fix_iterations,
            gate,
            owning_step: Step::ALL.into_iter().find(|s| s.gate_name() == gate),
            current_step: Some(current),
        }
    }

    fn view(&self, snap: &Snapshot, phase: &PhaseRecord) -> Result<PhaseView> {
        let artifacts = &self.config.artifacts;
        let dir = self.paths.phase_dir(&phase.dir);
        let (mut graph, task_errors) =
            load_task_list(&dir.join(&artifacts.task_list))?.into_parts();
        if let Some(graph) = graph.as_mut() {
            graph.apply_records(&snap.tasks);
            graph.apply_deferred(&snap.deferred.tasks);
        }
        let (map, coverage_map_error) =
            load_coverage_map(&dir.join(&artifacts.coverage_map))?.into_parts();
        let (mut analysis_findings, analysis_error) =
            load_findings(&dir.join(&artifacts.analysis_findings))?.into_parts();
        if let Some(detail) = &analysis_error {
            analysis_findings.push(malformed_artifact(&artifacts.analysis_findings, detail));
        }
        let (mut compliance_findings, compliance_error) =
            load_findings(&dir.join(&artifacts.compliance_report))?.into_parts();
        if let Some(detail) = &compliance_error {
            compliance_findings.push(malformed_artifact(&artifacts.compliance_report, detail));
        }
        let artifact_errors = [
            (&artifacts.coverage_map, &coverage_map_error),
            (&artifacts.analysis_findings, &analysis_error),
            (&artifacts.compliance_report, &compliance_error),
        ]
        .into_iter()
        .filter_map(|(name, error)| error.as_ref().map(|detail| format!("{name}: {detail}")))
        .collect();
        let coverage = compute_coverage(&phase.goals, &map, graph.as_ref(), &snap.deferred.goals);
        let inputs = GateInputs {
            design: inspect_design(&dir, artifacts)?,
            analysis: inspect(&dir, &artifacts.analysis_report)?,
            verification: inspect(&dir, &artifacts.verification_report)?,
            task_list: artifacts.task_list.clone(),
            coverage_map: artifacts.coverage_map.clone(),
            tasks: graph,
            task_errors,
            coverage,
            coverage_map_error,
            analysis_findings,
            compliance_findings,
            unreferenced: unreferenced(&dir, artifacts)?,
            min_populated_bytes: artifacts.min_populated_bytes,
            policy: self.config.severity,
        };
        Ok(PhaseView {
            missing_design: missing_design(&dir, artifacts),
            artifact_errors,
            dir,
            inputs,
        })
    }
}

/// The active phase, or the reason there is none.
fn require_active(snap: &Snapshot) -> Result<PhaseRecord, EngineError> {
    match &snap.phase {
        None => Err(EngineError::InvalidTransition(
            "no phase started".to_string(),
        )),
        Some(phase) if phase.status == PhaseStatus::Complete => Err(EngineError::PhaseArchived {
            phase: phase.id.clone(),
        }),
        Some(phase) => Ok(phase.clone()),
    }
}

fn require_step(snap: &Snapshot) -> Result<StepRecord, EngineError> {
    snap.step
        .clone()
        .ok_or_else(|| EngineError::InvalidTransition("no step in progress".to_string()))
}

/// Itemized halt for `status`, if the phase cannot make progress on its own.
fn halt_report(
    step: Option<&StepRecord>,
    autofix: &AutofixRecord,
    gate: Option<&GateReport>,
    queue: Option<&QueueState>,
    max_iterations: u32,
) -> Option<HaltReport> {
    let step = step?;
    if autofix.awaiting_decision {
        let reason = EngineError::MaxIterationsExceeded {
            max_iterations,
            remaining: autofix.remaining.len(),
        };
        return Some(HaltReport {
            step: Some(step.current),
            gate: autofix.gate.clone(),
            tasks: Vec::new(),
            findings: autofix.remaining.clone(),
            reason: format!("{reason}; continue anyway or abort"),
            recovery: vec![RecoveryAction::Skip, RecoveryAction::Abort],
        });
    }

    let blocked_tasks = || queue.map(|q| q.blocked.clone()).unwrap_or_default();
    if autofix.aborted && step.status == StepStatus::Blocked {
        return Some(HaltReport {
            step: Some(step.current),
            gate: autofix.gate.clone(),
            tasks: blocked_tasks(),
            findings: autofix.remaining.clone(),
            reason: EngineError::UserAbort { step: step.current }.to_string(),
            recovery: vec![RecoveryAction::Retry, RecoveryAction::Skip],
        });
    }
    let blocking = gate.filter(|g| g.blocking);
    match step.status {
        StepStatus::Blocked | StepStatus::Failed => Some(HaltReport {
            step: Some(step.current),
            gate: Some(step.current.gate_name().to_string()),
            tasks: blocked_tasks(),
            findings: blocking.map(|g| g.findings.clone()).unwrap_or_default(),
            reason: format!("step {} is {}", step.current, step.status.as_str()),
            recovery: RECOVERY_ACTIONS.to_vec(),
        }),
        StepStatus::Complete => blocking.map(|g| HaltReport {
            step: Some(step.current),
            gate: Some(g.gate.clone()),
            tasks: Vec::new(),
            findings: g.findings.clone(),
            reason: EngineError::GateFailure {
                gate: g.gate.clone(),
                findings: g.findings.clone(),
            }
            .to_string(),
            recovery: RECOVERY_ACTIONS.to_vec(),
        }),
        StepStatus::InProgress => (step.current == Step::Implement
            && queue.is_some_and(|q| q.status == QueueStatus::ExhaustedBlocked))
        .then(|| HaltReport {
            step: Some(step.current),
            gate: None,
            tasks: blocked_tasks(),
            findings: Vec::new(),
            reason: "every remaining task is blocked or waits on a blocked task".to_string(),
            recovery: RECOVERY_ACTIONS.to_vec(),
        }),
    }
}
