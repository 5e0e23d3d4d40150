//! Write-ownership checks and conflict-free batch partitioning.
//!
//! Two ownership sets conflict when they share a path, or when one path is a
//! directory prefix of the other (at a `/` boundary). Conflicts are resolved
//! before dispatch by placing the later job in a later batch.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Normalize an ownership path: strip `./` prefixes and trailing `/`.
pub fn normalize_path(path: &str) -> String {
    let mut trimmed = path.trim();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.trim_end_matches('/').to_string()
}

/// True if `a` and `b` name the same path or one contains the other.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    let a = normalize_path(a);
    let b = normalize_path(b);
    if a == b {
        return true;
    }
    let (short, long) = if a.len() < b.len() { (&a, &b) } else { (&b, &a) };
    long.starts_with(short.as_str()) && long.as_bytes().get(short.len()) == Some(&b'/')
}

/// First path in `a` that overlaps some path in `b`, if any.
pub fn first_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<String> {
    for left in a {
        for right in b {
            if paths_overlap(left, right) {
                return Some(normalize_path(left));
            }
        }
    }
    None
}

/// A conflict found while partitioning: `deferred` was pushed to a later batch
/// because it overlaps `holder` on `path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipConflict {
    pub holder: String,
    pub deferred: String,
    pub path: String,
}

/// Partition of item indices into batches with pairwise-disjoint ownership.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<Vec<usize>>,
    pub conflicts: Vec<OwnershipConflict>,
}

/// Greedily place each item (in input order) into the first batch where it
/// conflicts with nobody.
///
/// `ids[i]` labels item `i` in conflict reports; `sets[i]` is its ownership set.
/// Input order is preserved within each batch, so the plan is deterministic.
pub fn partition_batches(ids: &[String], sets: &[BTreeSet<String>]) -> BatchPlan {
    debug_assert_eq!(ids.len(), sets.len());
    let mut plan = BatchPlan::default();

    for (index, set) in sets.iter().enumerate() {
        let mut placed = false;
        for batch in &mut plan.batches {
            let clash = batch
                .iter()
                .find_map(|&other| first_overlap(set, &sets[other]).map(|path| (other, path)));
            match clash {
                Some((other, path)) => {
                    if !plan
                        .conflicts
                        .iter()
                        .any(|c| c.deferred == ids[index] && c.holder == ids[other])
                    {
                        plan.conflicts.push(OwnershipConflict {
                            holder: ids[other].clone(),
                            deferred: ids[index].clone(),
                            path,
                        });
                    }
                }
                None => {
                    batch.push(index);
                    placed = true;
                    break;
                }
            }
        }
        if !placed {
            plan.batches.push(vec![index]);
        }
    }

    plan
}
