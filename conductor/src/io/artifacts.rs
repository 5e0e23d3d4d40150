//! Artifact inspection for a phase directory.
//!
//! The engine never judges content quality; it only checks that artifacts
//! exist, carry more than headings, and that the machine-readable ones parse.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::core::coverage::CoverageMap;
use crate::core::gates::ArtifactStatus;
use crate::core::task_graph::TaskGraph;
use crate::core::task_parser::parse_task_list;
use crate::core::types::Finding;
use crate::io::config::ArtifactConfig;

/// Inspect one artifact. Content bytes exclude markdown heading lines and whitespace.
pub fn inspect(dir: &Path, name: &str) -> Result<ArtifactStatus> {
    let path = dir.join(name);
    if !path.is_file() {
        return Ok(ArtifactStatus::missing(name));
    }
    let bytes = fs::read(&path).with_context(|| format!("read artifact {}", path.display()))?;
    Ok(ArtifactStatus {
        name: name.to_string(),
        exists: true,
        content_bytes: content_bytes(&String::from_utf8_lossy(&bytes)),
    })
}

fn content_bytes(contents: &str) -> usize {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .map(|line| line.chars().filter(|c| !c.is_whitespace()).count())
        .sum()
}

pub fn inspect_design(dir: &Path, artifacts: &ArtifactConfig) -> Result<Vec<ArtifactStatus>> {
    artifacts
        .design
        .iter()
        .map(|name| inspect(dir, name))
        .collect()
}

/// Names of design artifacts that do not exist yet.
pub fn missing_design(dir: &Path, artifacts: &ArtifactConfig) -> Vec<String> {
    artifacts
        .design
        .iter()
        .filter(|name| !dir.join(name).is_file())
        .cloned()
        .collect()
}

/// Files directly inside the phase directory that no step produces.
pub fn unreferenced(dir: &Path, artifacts: &ArtifactConfig) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let known: BTreeSet<&str> = artifacts.known().into_iter().collect();
    let mut extra = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read dir entry in {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') && !known.contains(name.as_str()) {
            extra.push(name);
        }
    }
    extra.sort();
    Ok(extra)
}

/// Result of reading the task list artifact.
#[derive(Debug, Clone)]
pub enum TaskListLoad {
    Missing,
    Invalid(Vec<String>),
    Parsed(TaskGraph),
}

impl TaskListLoad {
    pub fn graph(&self) -> Option<&TaskGraph> {
        match self {
            TaskListLoad::Parsed(graph) => Some(graph),
            _ => None,
        }
    }

    pub fn into_parts(self) -> (Option<TaskGraph>, Vec<String>) {
        match self {
            TaskListLoad::Missing => (None, Vec::new()),
            TaskListLoad::Invalid(errors) => (None, errors),
            TaskListLoad::Parsed(graph) => (Some(graph), Vec::new()),
        }
    }
}

pub fn load_task_list(path: &Path) -> Result<TaskListLoad> {
    if !path.is_file() {
        return Ok(TaskListLoad::Missing);
    }
    let bytes = fs::read(path).with_context(|| format!("read task list {}", path.display()))?;
    let Ok(contents) = std::str::from_utf8(&bytes) else {
        return Ok(TaskListLoad::Invalid(vec!["task list is not UTF-8".to_string()]));
    };
    let tasks = match parse_task_list(contents) {
        Ok(tasks) => tasks,
        Err(errors) => return Ok(TaskListLoad::Invalid(errors)),
    };
    debug!(path = %path.display(), tasks = tasks.len(), "task list parsed");
    Ok(match TaskGraph::new(tasks) {
        Ok(graph) => TaskListLoad::Parsed(graph),
        Err(errors) => TaskListLoad::Invalid(errors),
    })
}

/// Result of reading a machine-readable (JSON) artifact.
///
/// Only I/O failures are errors. Content that does not parse is a value the
/// gates report on, so one bad file never stops the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonLoad<T> {
    Missing,
    Malformed(String),
    Parsed(T),
}

impl<T: Default> JsonLoad<T> {
    /// The parsed value (default when missing or malformed) and the parse error, if any.
    pub fn into_parts(self) -> (T, Option<String>) {
        match self {
            JsonLoad::Missing => (T::default(), None),
            JsonLoad::Malformed(detail) => (T::default(), Some(detail)),
            JsonLoad::Parsed(value) => (value, None),
        }
    }
}

fn load_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<JsonLoad<T>> {
    if !path.is_file() {
        return Ok(JsonLoad::Missing);
    }
    let bytes = fs::read(path).with_context(|| format!("read {what} {}", path.display()))?;
    Ok(match serde_json::from_slice(&bytes) {
        Ok(value) => JsonLoad::Parsed(value),
        Err(err) => {
            warn!(path = %path.display(), %err, "malformed {what}");
            JsonLoad::Malformed(err.to_string())
        }
    })
}

/// Load the goal -> requirement -> task mapping.
pub fn load_coverage_map(path: &Path) -> Result<JsonLoad<CoverageMap>> {
    load_json(path, "coverage map")
}

/// Load a findings report (JSON array of findings).
pub fn load_findings(path: &Path) -> Result<JsonLoad<Vec<Finding>>> {
    load_json(path, "findings report")
}
