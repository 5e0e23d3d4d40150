//! Canonical paths and `.conductor/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{EngineConfig, write_config};
use super::state_store::StateStore;

/// All canonical paths within `.conductor/` for a project root.
#[derive(Debug, Clone)]
pub struct ConductorPaths {
    pub root: PathBuf,
    pub conductor_dir: PathBuf,
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub journal_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl ConductorPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let conductor_dir = root.join(".conductor");
        Self {
            root: root.clone(),
            conductor_dir: conductor_dir.clone(),
            config_path: conductor_dir.join("config.toml"),
            state_path: conductor_dir.join("state.json"),
            journal_dir: conductor_dir.join("journal"),
            gitignore_path: conductor_dir.join(".gitignore"),
        }
    }

    /// Auto-fix journal directory for one phase.
    pub fn autofix_journal_dir(&self, phase_id: &str) -> PathBuf {
        self.journal_dir.join("autofix").join(phase_id)
    }

    /// Absolute artifact directory for a phase directory recorded relative to the root.
    pub fn phase_dir(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// Options for `init_conductor`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing engine-owned files.
    pub force: bool,
}

/// Create `.conductor/` scaffolding in `root`: default config, an empty state
/// document and the journal directory.
///
/// Fails if `.conductor/` already exists unless `options.force` is set.
pub fn init_conductor(root: &Path, options: &InitOptions) -> Result<ConductorPaths> {
    let paths = ConductorPaths::new(root);
    if paths.conductor_dir.exists() && !paths.conductor_dir.is_dir() {
        return Err(anyhow!("init: .conductor exists but is not a directory"));
    }
    if paths.conductor_dir.exists() && !options.force {
        return Err(anyhow!(
            "init: .conductor already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.conductor_dir)?;
    create_dir(&paths.journal_dir)?;
    fs::write(&paths.gitignore_path, CONDUCTOR_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &EngineConfig::default())?;
    StateStore::new(&paths.state_path).reset()?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const CONDUCTOR_GITIGNORE: &str = "journal/\n*.tmp\n";
