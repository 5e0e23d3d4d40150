//! Engine configuration stored under `.conductor/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::fix_strategy::FixStrategyTable;
use crate::core::gates::SeverityPolicy;

/// Upper bound on the auto-fix iteration budget.
pub const MAX_FIX_ITERATIONS: u32 = 5;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields take the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Auto-fix iteration budget, at most [`MAX_FIX_ITERATIONS`].
    pub max_fix_iterations: u32,

    /// Treat any finding (not only critical ones) as blocking.
    pub strict_gates: bool,

    /// A worker batch is aborted when its failure ratio is strictly greater than this.
    pub failure_threshold: f64,

    pub timeouts: TimeoutConfig,
    pub artifacts: ArtifactConfig,
    pub severity: SeverityPolicy,
    pub fix_strategies: FixStrategyTable,

    /// External fixer command. Receives one fix request as JSON on stdin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixer: Option<CommandConfig>,

    /// External content generator command. Receives a generate request as JSON on stdin.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generator: Option<CommandConfig>,
}

/// Per-role worker job timeouts in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub analysis_secs: u64,
    pub validation_secs: u64,
    pub fix_secs: u64,
    pub implementation_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            analysis_secs: 180,
            validation_secs: 180,
            fix_secs: 300,
            implementation_secs: 900,
        }
    }
}

/// Artifact names and locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Directory (relative to the project root) holding one directory per phase.
    pub phase_root: String,
    /// Artifacts the design step must produce.
    pub design: Vec<String>,
    /// Markdown task list (must be one of `design`).
    pub task_list: String,
    pub analysis_report: String,
    pub analysis_findings: String,
    pub verification_report: String,
    pub coverage_map: String,
    pub compliance_report: String,
    /// Minimum non-heading content for an artifact to count as populated.
    pub min_populated_bytes: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            phase_root: "specs".to_string(),
            design: vec![
                "spec.md".to_string(),
                "plan.md".to_string(),
                "tasks.md".to_string(),
            ],
            task_list: "tasks.md".to_string(),
            analysis_report: "analysis.md".to_string(),
            analysis_findings: "analysis.json".to_string(),
            verification_report: "verification.md".to_string(),
            coverage_map: "coverage.json".to_string(),
            compliance_report: "compliance.json".to_string(),
            min_populated_bytes: 64,
        }
    }
}

impl ArtifactConfig {
    /// Every artifact name a step is known to produce.
    pub fn known(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.design.iter().map(String::as_str).collect();
        names.extend([
            self.analysis_report.as_str(),
            self.analysis_findings.as_str(),
            self.verification_report.as_str(),
            self.coverage_map.as_str(),
            self.compliance_report.as_str(),
        ]);
        names
    }
}

/// An external command collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self, label: &str) -> Result<()> {
        if self.command.is_empty() || self.command[0].trim().is_empty() {
            return Err(anyhow!("{label}.command must be a non-empty array"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("{label}.timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("{label}.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_fix_iterations: 5,
            strict_gates: false,
            failure_threshold: 0.5,
            timeouts: TimeoutConfig::default(),
            artifacts: ArtifactConfig::default(),
            severity: SeverityPolicy::default(),
            fix_strategies: FixStrategyTable::default(),
            fixer: None,
            generator: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_FIX_ITERATIONS).contains(&self.max_fix_iterations) {
            return Err(anyhow!(
                "max_fix_iterations must be between 1 and {MAX_FIX_ITERATIONS}"
            ));
        }
        if !(0.0..1.0).contains(&self.failure_threshold) {
            return Err(anyhow!("failure_threshold must be in [0, 1)"));
        }
        let t = &self.timeouts;
        if [
            t.analysis_secs,
            t.validation_secs,
            t.fix_secs,
            t.implementation_secs,
        ]
        .contains(&0)
        {
            return Err(anyhow!("timeouts must all be > 0"));
        }
        let a = &self.artifacts;
        if a.phase_root.trim().is_empty() {
            return Err(anyhow!("artifacts.phase_root must not be empty"));
        }
        if a.design.is_empty() {
            return Err(anyhow!("artifacts.design must list at least one artifact"));
        }
        if !a.design.contains(&a.task_list) {
            return Err(anyhow!(
                "artifacts.task_list '{}' must be one of artifacts.design",
                a.task_list
            ));
        }
        if let Some(name) = a.known().into_iter().find(|n| n.contains('/') || n.is_empty()) {
            return Err(anyhow!("artifact name '{name}' must be a plain file name"));
        }
        if let Some(fixer) = &self.fixer {
            fixer.validate("fixer")?;
        }
        if let Some(generator) = &self.generator {
            generator.validate("generator")?;
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
