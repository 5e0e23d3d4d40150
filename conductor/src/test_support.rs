//! Test-only builders, scripted collaborators and a scratch project.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::autofix::Detector;
use crate::coordinator::{JobOutput, Worker, WorkerJob};
use crate::core::gates::{ArtifactStatus, GateInputs, SeverityPolicy};
use crate::core::types::{Finding, Goal, Task, TaskState};
use crate::io::collaborators::{
    Collaborators, ContentGenerator, FixOutcome, FixRequest, Fixer, GenerateRequest,
    StoreHumanGate,
};
use crate::io::config::{EngineConfig, write_config};
use crate::io::init::{ConductorPaths, InitOptions, init_conductor};
use crate::io::state_store::StateStore;
use crate::lifecycle::Engine;

/// A pending, sequential task with no targets.
pub fn task(id: &str, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        description: format!("{id} description"),
        targets: Vec::new(),
        depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
        parallel: false,
        labels: Vec::new(),
        section: 0,
        state: TaskState::Pending,
        block_reason: None,
    }
}

/// Like [`task`] but marked `[P]`.
pub fn parallel_task(id: &str, deps: &[&str]) -> Task {
    Task {
        parallel: true,
        ..task(id, deps)
    }
}

pub fn goal(id: &str) -> Goal {
    Goal {
        id: id.to_string(),
        text: format!("{id} text"),
    }
}

/// Gate inputs for an empty phase with default names and policy.
pub fn gate_inputs() -> GateInputs {
    GateInputs {
        design: Vec::new(),
        analysis: ArtifactStatus::missing("analysis.md"),
        verification: ArtifactStatus::missing("verification.md"),
        task_list: "tasks.md".to_string(),
        coverage_map: "coverage.json".to_string(),
        tasks: None,
        task_errors: Vec::new(),
        coverage: Vec::new(),
        coverage_map_error: None,
        analysis_findings: Vec::new(),
        compliance_findings: Vec::new(),
        unreferenced: Vec::new(),
        min_populated_bytes: 64,
        policy: SeverityPolicy::default(),
    }
}

/// Markdown body comfortably above the populated-artifact threshold.
pub fn populated(title: &str) -> String {
    format!(
        "# {title}\n\n{title} describes the behavior in enough detail to be reviewed, \
         including inputs, outputs and the failure cases that matter.\n"
    )
}

/// What a [`ScriptedWorker`] does for one job id.
#[derive(Debug, Clone)]
pub enum WorkerScript {
    Succeed(JobOutput),
    Fail(String),
    Sleep(Duration),
    Panic,
}

impl WorkerScript {
    pub fn findings(findings: Vec<Finding>) -> Self {
        Self::Succeed(JobOutput {
            findings,
            notes: Vec::new(),
        })
    }
}

/// Worker driven by a per-job script. Unscripted jobs succeed with no output.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    scripts: BTreeMap<String, WorkerScript>,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, job: impl Into<String>, script: WorkerScript) -> Self {
        self.scripts.insert(job.into(), script);
        self
    }
}

impl Worker for ScriptedWorker {
    fn run(&self, job: &WorkerJob) -> Result<JobOutput> {
        match self.scripts.get(&job.id) {
            None => Ok(JobOutput::default()),
            Some(WorkerScript::Succeed(output)) => Ok(output.clone()),
            Some(WorkerScript::Fail(detail)) => Err(anyhow!(detail.clone())),
            Some(WorkerScript::Sleep(duration)) => {
                thread::sleep(*duration);
                Ok(JobOutput::default())
            }
            Some(WorkerScript::Panic) => panic!("scripted panic in job {}", job.id),
        }
    }
}

/// Fixer that records every finding it is asked about.
///
/// Clones share the call log, so a test can hand one clone to the engine and
/// inspect the other.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFixer {
    erroring: BTreeSet<String>,
    repair: Option<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFixer {
    /// Reports every finding fixed without touching any file.
    pub fn fixing_all() -> Self {
        Self::default()
    }

    /// Return an error (a failed job) for `finding`.
    pub fn erroring(mut self, finding: &str) -> Self {
        self.erroring.insert(finding.to_string());
        self
    }

    /// Overwrite the target artifact with `contents` on every call.
    pub fn repairing(mut self, contents: impl Into<String>) -> Self {
        self.repair = Some(contents.into());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Fixer for ScriptedFixer {
    fn fix(&self, request: &FixRequest) -> Result<FixOutcome> {
        let id = request.finding.id.clone();
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(id.clone());
        }
        if self.erroring.contains(&id) {
            return Err(anyhow!("scripted fixer error for {id}"));
        }
        if let Some(contents) = &self.repair {
            fs::write(&request.artifact_path, contents)
                .with_context(|| format!("write {}", request.artifact_path.display()))?;
        }
        Ok(FixOutcome::Fixed)
    }
}

/// Detector that returns scripted rounds in order, then nothing.
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    rounds: Mutex<VecDeque<Vec<Finding>>>,
    repeat: Option<Vec<Finding>>,
    calls: AtomicUsize,
}

impl ScriptedDetector {
    pub fn new(rounds: Vec<Vec<Finding>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into()),
            ..Self::default()
        }
    }

    /// Returns the same findings forever.
    pub fn repeating(findings: Vec<Finding>) -> Self {
        Self {
            repeat: Some(findings),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self) -> Result<Vec<Finding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(findings) = &self.repeat {
            return Ok(findings.clone());
        }
        let mut rounds = self
            .rounds
            .lock()
            .map_err(|_| anyhow!("detector rounds poisoned"))?;
        Ok(rounds.pop_front().unwrap_or_default())
    }
}

/// Generator that writes the requested files from a fixed table, falling back
/// to a populated placeholder for names it does not know.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    files: BTreeMap<String, String>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, contents: impl Into<String>) -> Self {
        self.files.insert(name.to_string(), contents.into());
        self
    }
}

impl ContentGenerator for ScriptedGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<()> {
        for name in &request.missing {
            let contents = self
                .files
                .get(name)
                .cloned()
                .unwrap_or_else(|| populated(name));
            let path = request.phase_dir.join(name);
            fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        }
        Ok(())
    }
}

/// A scratch project root with `.conductor/` initialized.
pub struct TestProject {
    temp: tempfile::TempDir,
    paths: ConductorPaths,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp project")?;
        let paths = init_conductor(temp.path(), &InitOptions { force: false })?;
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ConductorPaths {
        &self.paths
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.paths.state_path)
    }

    pub fn write_config(&self, config: &EngineConfig) -> Result<()> {
        write_config(&self.paths.config_path, config)
    }

    /// Engine with collaborators from config.
    pub fn engine(&self) -> Result<Engine> {
        Engine::open(self.root())
    }

    /// Engine with scripted fixer and generator; sign-off is read from the store.
    pub fn engine_with(
        &self,
        fixer: Arc<dyn Fixer>,
        generator: Box<dyn ContentGenerator>,
    ) -> Result<Engine> {
        let collaborators = Collaborators {
            fixer,
            generator,
            human: Box::new(StoreHumanGate::new(self.store())),
        };
        Ok(Engine::open(self.root())?.with_collaborators(collaborators))
    }

    /// Artifact directory of phase `id` under the default phase root.
    pub fn phase_dir(&self, id: &str) -> PathBuf {
        self.root().join("specs").join(id)
    }

    pub fn write_artifact(&self, phase: &str, name: &str, contents: &str) -> Result<PathBuf> {
        let dir = self.phase_dir(phase);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Populated `spec.md` and `plan.md` plus the given task list.
    pub fn write_design(&self, phase: &str, tasks_md: &str) -> Result<()> {
        self.write_artifact(phase, "spec.md", &populated("Spec"))?;
        self.write_artifact(phase, "plan.md", &populated("Plan"))?;
        self.write_artifact(phase, "tasks.md", tasks_md)?;
        Ok(())
    }
}
