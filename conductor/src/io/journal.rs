//! Auto-fix journal under `.conductor/journal/autofix/<phase-id>/`.
//!
//! One JSON record per iteration, named by iteration number. The journal is a
//! product artifact: it is written regardless of the log filter.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::DispatchReport;
use crate::core::types::Finding;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutofixJournalEntry {
    pub iteration: u32,
    pub gate: String,
    pub findings_before: Vec<Finding>,
    pub dispatch: DispatchReport,
    pub findings_after: Vec<Finding>,
}

pub fn entry_path(dir: &Path, iteration: u32) -> PathBuf {
    dir.join(format!("{iteration}.json"))
}

/// Write (or overwrite, on a resumed iteration) the record for `entry.iteration`.
pub fn write_entry(dir: &Path, entry: &AutofixJournalEntry) -> Result<PathBuf> {
    let path = entry_path(dir, entry.iteration);
    let mut buf = serde_json::to_string_pretty(entry).context("serialize journal entry")?;
    buf.push('\n');
    super::write_atomic(&path, &buf)?;
    debug!(path = %path.display(), iteration = entry.iteration, "journal entry written");
    Ok(path)
}

/// All records in `dir`, ordered by iteration. A missing directory is empty.
pub fn read_entries(dir: &Path) -> Result<Vec<AutofixJournalEntry>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for item in fs::read_dir(dir).with_context(|| format!("read journal {}", dir.display()))? {
        let path = item
            .with_context(|| format!("read journal entry in {}", dir.display()))?
            .path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let entry: AutofixJournalEntry = serde_json::from_str(&contents)
            .with_context(|| format!("parse journal entry {}", path.display()))?;
        entries.push(entry);
    }
    entries.sort_by_key(|entry| entry.iteration);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{DispatchReport, DispatchStatus};
    use crate::core::types::{Location, Severity};

    fn entry(iteration: u32, before: usize, after: usize) -> AutofixJournalEntry {
        let finding = |n: usize| {
            Finding::new(
                format!("F{n}"),
                "ambiguity",
                Severity::Medium,
                Location::anchored("spec.md", format!("l{n}")),
                "vague",
            )
        };
        AutofixJournalEntry {
            iteration,
            gate: "design".to_string(),
            findings_before: (0..before).map(finding).collect(),
            dispatch: DispatchReport {
                status: DispatchStatus::Completed,
                batches: vec![vec!["fix-spec.md".to_string()]],
                conflicts: Vec::new(),
                jobs: Vec::new(),
                findings: Vec::new(),
                notes: Vec::new(),
                abort_reason: None,
            },
            findings_after: (0..after).map(finding).collect(),
        }
    }

    #[test]
    fn entries_are_read_back_in_iteration_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("autofix").join("001");
        for (iteration, before, after) in [(10, 1, 0), (2, 2, 1), (1, 3, 2)] {
            write_entry(&dir, &entry(iteration, before, after)).expect("write");
        }
        fs::write(dir.join("notes.txt"), "ignored").expect("write");

        let entries = read_entries(&dir).expect("read");
        let order: Vec<u32> = entries.iter().map(|e| e.iteration).collect();
        assert_eq!(order, vec![1, 2, 10]);
        assert_eq!(entries[0].findings_before.len(), 3);
        assert_eq!(entries[2].findings_after.len(), 0);
    }

    #[test]
    fn missing_journal_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_entries(&temp.path().join("none")).expect("read").is_empty());
    }
}
