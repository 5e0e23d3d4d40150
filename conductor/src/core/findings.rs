//! Finding ordering, grouping and deduplication.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::core::types::{Finding, Location, Severity};

/// Canonical report order: severity descending, then location, then id.
pub fn compare_findings(a: &Finding, b: &Finding) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| a.location.cmp(&b.location))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_findings(findings: &mut [Finding]) {
    findings.sort_by(compare_findings);
}

pub fn has_critical(findings: &[Finding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Critical)
}

/// Group findings by the artifact they target. Each group keeps report order.
pub fn group_by_artifact(findings: &[Finding]) -> BTreeMap<String, Vec<Finding>> {
    let mut groups: BTreeMap<String, Vec<Finding>> = BTreeMap::new();
    for finding in findings {
        groups
            .entry(finding.location.artifact.clone())
            .or_default()
            .push(finding.clone());
    }
    for group in groups.values_mut() {
        sort_findings(group);
    }
    groups
}

/// Keep one finding per location: the highest severity wins, ties go to the
/// lowest id. Output is in report order.
pub fn dedup_by_location(findings: Vec<Finding>) -> Vec<Finding> {
    let mut best: BTreeMap<Location, Finding> = BTreeMap::new();
    for finding in findings {
        match best.get(&finding.location) {
            Some(current) if compare_findings(current, &finding) != Ordering::Greater => {}
            _ => {
                best.insert(finding.location.clone(), finding);
            }
        }
    }
    let mut merged: Vec<Finding> = best.into_values().collect();
    sort_findings(&mut merged);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(id: &str, severity: Severity, location: Location) -> Finding {
        Finding::new(id, "ambiguity", severity, location, format!("{id} description"))
    }

    #[test]
    fn sorts_by_severity_then_location_then_id() {
        let mut findings = vec![
            finding("F3", Severity::Low, Location::artifact("a.md")),
            finding("F2", Severity::Critical, Location::artifact("b.md")),
            finding("F1", Severity::Critical, Location::artifact("a.md")),
        ];
        sort_findings(&mut findings);
        let ids: Vec<&str> = findings.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["F1", "F2", "F3"]);
    }

    #[test]
    fn dedup_keeps_highest_severity_per_location() {
        let merged = dedup_by_location(vec![
            finding("job-a", Severity::Medium, Location::anchored("spec.md", "FR-1")),
            finding("job-b", Severity::High, Location::anchored("spec.md", "FR-1")),
            finding("job-c", Severity::Low, Location::anchored("spec.md", "FR-2")),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].id, "job-b");
        assert_eq!(merged[1].id, "job-c");
    }

    #[test]
    fn dedup_tie_is_independent_of_input_order() {
        let a = finding("A", Severity::High, Location::artifact("plan.md"));
        let b = finding("B", Severity::High, Location::artifact("plan.md"));
        let forward = dedup_by_location(vec![a.clone(), b.clone()]);
        let backward = dedup_by_location(vec![b, a]);
        assert_eq!(forward, backward);
        assert_eq!(forward[0].id, "A");
    }

    #[test]
    fn groups_by_target_artifact() {
        let groups = group_by_artifact(&[
            finding("F1", Severity::Low, Location::anchored("spec.md", "x")),
            finding("F2", Severity::High, Location::artifact("plan.md")),
            finding("F3", Severity::High, Location::artifact("spec.md")),
        ]);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["plan.md", "spec.md"]);
        assert_eq!(groups["spec.md"][0].id, "F3");
    }
}
