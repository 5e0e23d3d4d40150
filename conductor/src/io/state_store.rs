//! Durable, path-addressed state store (`.conductor/state.json`).
//!
//! Every write is load-modify-write of the whole document followed by an
//! atomic replace (temp file + rename), so readers never see a half-written
//! value. The document is validated against the embedded JSON Schema on every
//! load and before every write.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::state_doc::empty_document;
use crate::core::state_paths::{Writer, check_write, get_in, parse_path, set_in};
use crate::error::EngineError;

pub const STATE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../schemas/state/v1.schema.json"
));

static VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(STATE_SCHEMA).map_err(|err| format!("parse state schema: {err}"))?;
    jsonschema::validator_for(&schema).map_err(|err| format!("invalid state schema: {err}"))
});

fn validate_document(path: &Path, doc: &Value) -> Result<()> {
    let validator = VALIDATOR.as_ref().map_err(|err| anyhow!("{err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(doc)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(EngineError::StateCorruption {
        path: path.display().to_string(),
        detail: format!("schema validation failed: {}", messages.join("; ")),
    }
    .into())
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole document. A missing file is an empty document; bytes that
    /// are not UTF-8 JSON, or schema violations, are [`EngineError::StateCorruption`].
    pub fn load(&self) -> Result<Value> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "state missing, using empty document");
            return Ok(empty_document());
        }
        let bytes =
            fs::read(&self.path).with_context(|| format!("read state {}", self.path.display()))?;
        let corrupt = |detail: String| EngineError::StateCorruption {
            path: self.path.display().to_string(),
            detail,
        };
        let contents =
            std::str::from_utf8(&bytes).map_err(|err| corrupt(format!("not UTF-8: {err}")))?;
        let doc: Value = serde_json::from_str(contents)
            .map_err(|err| corrupt(format!("invalid JSON: {err}")))?;
        validate_document(&self.path, &doc)?;
        Ok(doc)
    }

    /// Check a candidate document against the schema without writing it.
    pub fn validate(&self, doc: &Value) -> Result<()> {
        validate_document(&self.path, doc)
    }

    /// Replace the whole document.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn write(&self, doc: &Value) -> Result<()> {
        validate_document(&self.path, doc)?;
        let mut buf = serde_json::to_string_pretty(doc).context("serialize state")?;
        buf.push('\n');
        super::write_atomic(&self.path, &buf)?;
        debug!("state written");
        Ok(())
    }

    /// Overwrite the store with an empty document.
    pub fn reset(&self) -> Result<()> {
        self.write(&empty_document())
    }

    pub fn get(&self, path: &str) -> Result<Option<Value>> {
        let segments = parse_path(path).map_err(EngineError::InvalidPath)?;
        let doc = self.load()?;
        let value = get_in(&doc, &segments).cloned();
        debug!(path, present = value.is_some(), "state get");
        Ok(value)
    }

    /// Read and deserialize the value at `path`. A value of the wrong shape is
    /// reported as corruption of that path.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get(path)? {
            None => Ok(None),
            Some(value) => serde_json::from_value(value).map(Some).map_err(|err| {
                EngineError::StateCorruption {
                    path: path.to_string(),
                    detail: err.to_string(),
                }
                .into()
            }),
        }
    }

    /// Write `value` at `path` on behalf of `writer`. `null` removes the key.
    pub fn set_as(&self, writer: Writer<'_>, path: &str, value: Value) -> Result<()> {
        check_write(writer, path)?;
        let segments = parse_path(path).map_err(EngineError::InvalidPath)?;
        let mut doc = self.load()?;
        set_in(&mut doc, &segments, value)
            .map_err(|detail| anyhow!("set {path}: {detail}"))?;
        debug!(path, %writer, "state set");
        self.write(&doc)
    }

    pub fn set_serialized<T: Serialize>(
        &self,
        writer: Writer<'_>,
        path: &str,
        value: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(value).with_context(|| format!("serialize {path}"))?;
        self.set_as(writer, path, value)
    }

    /// Apply several writes as one atomic document replacement.
    pub fn set_many(&self, writer: Writer<'_>, writes: Vec<(&str, Value)>) -> Result<()> {
        let mut doc = self.load()?;
        for (path, value) in writes {
            check_write(writer, path)?;
            let segments = parse_path(path).map_err(EngineError::InvalidPath)?;
            set_in(&mut doc, &segments, value)
                .map_err(|detail| anyhow!("set {path}: {detail}"))?;
        }
        self.write(&doc)
    }
}
