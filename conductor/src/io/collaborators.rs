//! External collaborator adapters.
//!
//! The engine never generates or repairs content itself. It hands a request to
//! a collaborator and inspects the artifacts afterwards. Each collaborator is a
//! trait so orchestration can be tested with scripted fakes; the production
//! implementations run a configured command with the request as JSON on stdin.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::fix_strategy::FixStrategy;
use crate::core::state_doc::HUMAN_SIGNOFF;
use crate::core::types::{Finding, Goal};
use crate::io::config::{CommandConfig, EngineConfig};
use crate::io::process::run_configured;
use crate::io::state_store::StateStore;

/// One finding to repair. The fixer may only mutate `artifact_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRequest {
    pub finding: Finding,
    pub strategy: FixStrategy,
    pub artifact_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "lowercase")]
pub enum FixOutcome {
    Fixed,
    Failed(String),
}

pub trait Fixer: Send + Sync {
    fn fix(&self, request: &FixRequest) -> Result<FixOutcome>;
}

/// Request to produce missing design artifacts for a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub phase_dir: PathBuf,
    pub goals: Vec<Goal>,
    pub missing: Vec<String>,
}

pub trait ContentGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HumanDecision {
    Confirmed,
    Skipped,
    Pending,
}

/// Criteria shown to the operator before a phase may complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanGateRequest {
    pub phase: String,
    pub gate: String,
    pub findings: Vec<Finding>,
}

pub trait HumanGate {
    fn review(&self, request: &HumanGateRequest) -> Result<HumanDecision>;
}

/// Runs the configured fixer command once per finding.
///
/// Exit status 0 means fixed. Any other exit, or a timeout, is a failed fix;
/// the finding stays and is picked up by the next detection pass.
pub struct CommandFixer {
    config: CommandConfig,
    workdir: PathBuf,
}

impl CommandFixer {
    pub fn new(config: CommandConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workdir: workdir.into(),
        }
    }
}

impl Fixer for CommandFixer {
    #[instrument(skip_all, fields(finding = %request.finding.id, strategy = %request.strategy))]
    fn fix(&self, request: &FixRequest) -> Result<FixOutcome> {
        let input = serde_json::to_vec(request).context("serialize fix request")?;
        let output = run_configured(&self.config, &self.workdir, &input)?;
        if output.succeeded() {
            debug!("fixer reported success");
            return Ok(FixOutcome::Fixed);
        }
        let summary = output.failure_summary("fixer");
        warn!(%summary, "fixer did not fix finding");
        Ok(FixOutcome::Failed(summary))
    }
}

/// Stand-in when no fixer command is configured. Every fix attempt is a job failure.
pub struct UnconfiguredFixer;

impl Fixer for UnconfiguredFixer {
    fn fix(&self, request: &FixRequest) -> Result<FixOutcome> {
        Err(anyhow!(
            "no fixer configured (set [fixer] in .conductor/config.toml) for finding {}",
            request.finding.id
        ))
    }
}

pub struct CommandGenerator {
    config: CommandConfig,
    workdir: PathBuf,
}

impl CommandGenerator {
    pub fn new(config: CommandConfig, workdir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workdir: workdir.into(),
        }
    }
}

impl ContentGenerator for CommandGenerator {
    #[instrument(skip_all, fields(missing = request.missing.len()))]
    fn generate(&self, request: &GenerateRequest) -> Result<()> {
        let input = serde_json::to_vec(request).context("serialize generate request")?;
        let output = run_configured(&self.config, &self.workdir, &input)?;
        if output.succeeded() {
            return Ok(());
        }
        Err(anyhow!(output.failure_summary("generator")))
    }
}

pub struct UnconfiguredGenerator;

impl ContentGenerator for UnconfiguredGenerator {
    fn generate(&self, request: &GenerateRequest) -> Result<()> {
        Err(anyhow!(
            "no generator configured (set [generator] in .conductor/config.toml); create {} in {}",
            request.missing.join(", "),
            request.phase_dir.display()
        ))
    }
}

/// Reads the operator's sign-off from `human.signoff` in the state store.
///
/// The driver records the decision with `set human.signoff "confirmed"`; an
/// absent value is pending.
pub struct StoreHumanGate {
    store: StateStore,
}

impl StoreHumanGate {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl HumanGate for StoreHumanGate {
    fn review(&self, request: &HumanGateRequest) -> Result<HumanDecision> {
        let decision = self
            .store
            .get_as::<HumanDecision>(HUMAN_SIGNOFF)?
            .unwrap_or(HumanDecision::Pending);
        debug!(phase = %request.phase, ?decision, "human gate reviewed");
        Ok(decision)
    }
}

/// The collaborator set an engine runs with.
pub struct Collaborators {
    pub fixer: Arc<dyn Fixer>,
    pub generator: Box<dyn ContentGenerator>,
    pub human: Box<dyn HumanGate>,
}

impl Collaborators {
    /// Command-backed collaborators from config, falling back to the unconfigured
    /// stand-ins and the store-backed human gate.
    pub fn from_config(config: &EngineConfig, root: &Path, store: &StateStore) -> Self {
        let fixer: Arc<dyn Fixer> = match &config.fixer {
            Some(cmd) => Arc::new(CommandFixer::new(cmd.clone(), root)),
            None => Arc::new(UnconfiguredFixer),
        };
        let generator: Box<dyn ContentGenerator> = match &config.generator {
            Some(cmd) => Box::new(CommandGenerator::new(cmd.clone(), root)),
            None => Box::new(UnconfiguredGenerator),
        };
        Self {
            fixer,
            generator,
            human: Box::new(StoreHumanGate::new(store.clone())),
        }
    }
}
