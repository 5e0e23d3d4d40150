//! Filesystem and process I/O for the engine.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod artifacts;
pub mod collaborators;
pub mod config;
pub mod init;
pub mod journal;
pub mod process;
pub mod state_store;

/// Write `contents` to `path` via a sibling temp file and rename, creating the parent.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let ext = path
        .extension()
        .map(|ext| format!("{}.tmp", ext.to_string_lossy()))
        .unwrap_or_else(|| "tmp".to_string());
    let tmp_path = path.with_extension(ext);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
