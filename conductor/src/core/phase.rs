//! Phase identifiers and the persisted phase record.
//!
//! Phase ids are dotted numbers (`003`, `003.1`, `004`). Ordering is numeric per
//! segment, so an insertion slot `003.1` sorts between `003` and `004`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::types::{Goal, PhaseStatus};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhaseId {
    raw: String,
    segments: Vec<u32>,
}

impl PhaseId {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// First free major id after every id in `existing` (`001` when empty).
    pub fn next_major<'a>(existing: impl IntoIterator<Item = &'a PhaseId>) -> PhaseId {
        let (major, width) = existing
            .into_iter()
            .map(|id| (id.segments[0], id.major_width()))
            .max()
            .map_or((1, 3), |(major, width)| (major + 1, width));
        PhaseId::from_segments(&[major], width)
    }

    /// First free insertion slot directly after `self` (`003` -> `003.1`, or
    /// `003.2` if `003.1` is taken).
    pub fn insert_after<'a>(&self, existing: impl IntoIterator<Item = &'a PhaseId>) -> PhaseId {
        let depth = self.segments.len();
        let taken = existing
            .into_iter()
            .filter(|id| {
                id.segments.len() == depth + 1 && id.segments[..depth] == self.segments[..]
            })
            .map(|id| id.segments[depth])
            .max()
            .unwrap_or(0);
        let mut segments = self.segments.clone();
        segments.push(taken + 1);
        PhaseId::from_segments(&segments, self.major_width())
    }

    fn major_width(&self) -> usize {
        self.raw.split('.').next().map_or(1, str::len)
    }

    fn from_segments(segments: &[u32], width: usize) -> PhaseId {
        let mut raw = format!("{:0width$}", segments[0], width = width);
        for segment in &segments[1..] {
            raw.push('.');
            raw.push_str(&segment.to_string());
        }
        PhaseId {
            raw,
            segments: segments.to_vec(),
        }
    }
}

impl FromStr for PhaseId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        if raw.is_empty() {
            return Err("phase id must not be empty".to_string());
        }
        let segments = raw
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                    return Err(format!("invalid phase id '{raw}' (expected e.g. 003 or 003.1)"));
                }
                part.parse::<u32>()
                    .map_err(|err| format!("invalid phase id '{raw}': {err}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PhaseId {
            raw: raw.to_string(),
            segments,
        })
    }
}

impl Ord for PhaseId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments
            .cmp(&other.segments)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl PartialOrd for PhaseId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `phase` subtree of the state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Phase artifact directory, relative to the project root.
    pub dir: String,
    pub status: PhaseStatus,
}

impl PhaseRecord {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            PhaseStatus::InProgress | PhaseStatus::AwaitingHuman
        )
    }
}
