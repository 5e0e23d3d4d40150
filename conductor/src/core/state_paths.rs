//! Dot-path addressing and write ownership for the state document.
//!
//! Ownership partition:
//! - `version`, `phase.*`, `step.current`, `step.history`, `tasks.*`, `archive.*`: engine
//! - `step.status`: engine or the active step component
//! - `<component>.*` (e.g. `autofix.*`): that component or the engine
//! - anything else: the driver (or the engine)

use std::fmt;

use serde_json::{Map, Value};

use crate::error::EngineError;

/// Subtrees owned by named components.
pub const COMPONENT_ROOTS: [&str; 1] = ["autofix"];

const ENGINE_ROOTS: [&str; 4] = ["version", "phase", "tasks", "archive"];

/// Who is attempting a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer<'a> {
    Engine,
    ActiveStep,
    Component(&'a str),
    Driver,
}

impl fmt::Display for Writer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Writer::Engine => f.write_str("engine"),
            Writer::ActiveStep => f.write_str("active step"),
            Writer::Component(name) => write!(f, "component '{name}'"),
            Writer::Driver => f.write_str("driver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner<'a> {
    Engine,
    StepStatus,
    Component(&'a str),
    Driver,
}

/// Split a dot path into segments. Empty paths and empty segments are invalid.
pub fn parse_path(path: &str) -> Result<Vec<&str>, String> {
    if path.trim().is_empty() {
        return Err("state path must not be empty".to_string());
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(format!("state path '{path}' has an empty segment"));
    }
    Ok(segments)
}

fn owner<'a>(segments: &[&'a str]) -> Owner<'a> {
    let root = segments[0];
    if ENGINE_ROOTS.contains(&root) {
        return Owner::Engine;
    }
    if root == "step" {
        return match segments.get(1) {
            Some(&"status") => Owner::StepStatus,
            _ => Owner::Engine,
        };
    }
    if let Some(component) = COMPONENT_ROOTS.iter().find(|c| **c == root) {
        return Owner::Component(*component);
    }
    Owner::Driver
}

/// Check `writer` may write `path`. A write to a parent covers all of its
/// children, so writing `step` requires engine ownership.
pub fn check_write(writer: Writer<'_>, path: &str) -> Result<(), EngineError> {
    let segments = parse_path(path).map_err(EngineError::InvalidPath)?;
    let allowed = match (owner(&segments), writer) {
        (_, Writer::Engine) => true,
        (Owner::StepStatus, Writer::ActiveStep) => true,
        (Owner::Component(owner), Writer::Component(name)) => owner == name,
        (Owner::Driver, Writer::Driver) => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::OwnershipViolation {
            writer: writer.to_string(),
            path: path.to_string(),
        })
    }
}

/// Read the value at `segments`, if present.
pub fn get_in<'v>(doc: &'v Value, segments: &[&str]) -> Option<&'v Value> {
    segments
        .iter()
        .try_fold(doc, |current, segment| current.as_object()?.get(*segment))
}

/// Write `value` at `segments`, creating intermediate objects. `null` removes the key.
pub fn set_in(doc: &mut Value, segments: &[&str], value: Value) -> Result<(), String> {
    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| "state path must not be empty".to_string())?;
    let mut current = doc;
    for (depth, segment) in parents.iter().enumerate() {
        let map = current.as_object_mut().ok_or_else(|| {
            format!(
                "cannot write through non-object at '{}'",
                segments[..depth].join(".")
            )
        })?;
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let map = current.as_object_mut().ok_or_else(|| {
        format!(
            "cannot write through non-object at '{}'",
            parents.join(".")
        )
    })?;
    if value.is_null() {
        map.remove(*last);
    } else {
        map.insert(last.to_string(), value);
    }
    Ok(())
}
