//! Category to fix-strategy lookup.
//!
//! The table is data: configured entries override the built-in defaults and
//! unknown categories fall back to [`FixStrategy::Escalate`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixStrategy {
    KeepHigherQualityVersion,
    AddMissingLink,
    ModifyOrEscalate,
    ClarifyWording,
    AlignTerminology,
    AddDetail,
    Escalate,
}

impl FixStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            FixStrategy::KeepHigherQualityVersion => "keep-higher-quality-version",
            FixStrategy::AddMissingLink => "add-missing-link",
            FixStrategy::ModifyOrEscalate => "modify-or-escalate",
            FixStrategy::ClarifyWording => "clarify-wording",
            FixStrategy::AlignTerminology => "align-terminology",
            FixStrategy::AddDetail => "add-detail",
            FixStrategy::Escalate => "escalate",
        }
    }
}

impl fmt::Display for FixStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const BUILTIN: &[(&str, FixStrategy)] = &[
    ("duplication", FixStrategy::KeepHigherQualityVersion),
    ("coverage-gap", FixStrategy::AddMissingLink),
    ("compliance-violation", FixStrategy::ModifyOrEscalate),
    ("ambiguity", FixStrategy::ClarifyWording),
    ("inconsistency", FixStrategy::AlignTerminology),
    ("underspecification", FixStrategy::AddDetail),
];

/// Configured overrides (`[fix_strategies]` in config.toml).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixStrategyTable(BTreeMap<String, FixStrategy>);

impl FixStrategyTable {
    pub fn new(entries: BTreeMap<String, FixStrategy>) -> Self {
        Self(entries)
    }

    pub fn strategy_for(&self, category: &str) -> FixStrategy {
        let key = category.trim().to_ascii_lowercase();
        if let Some(strategy) = self.0.get(&key) {
            return *strategy;
        }
        BUILTIN
            .iter()
            .find(|(name, _)| *name == key)
            .map_or(FixStrategy::Escalate, |(_, strategy)| *strategy)
    }
}
