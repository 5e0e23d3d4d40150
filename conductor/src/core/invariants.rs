//! Semantic invariants of a parsed task list.

use std::collections::{HashMap, HashSet};

use crate::core::types::Task;

/// Check task-list invariants:
/// - No duplicate ids
/// - Every dependency names a known task
/// - No task depends on itself
/// - The dependency graph is acyclic
pub fn validate_invariants(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.id));
        }
    }

    for task in tasks {
        for dep in &task.depends_on {
            if dep == &task.id {
                errors.push(format!("{}: depends on itself", task.id));
            } else if !seen.contains(dep.as_str()) {
                errors.push(format!("{}: unknown dependency '{}'", task.id, dep));
            }
        }
    }

    if errors.is_empty()
        && let Some(cycle) = find_cycle(tasks)
    {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn find_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    for task in tasks {
        if let Some(cycle) = visit(task.id.as_str(), &by_id, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    id: &'a str,
    by_id: &HashMap<&'a str, &'a Task>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(id) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|s| *s == id).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(id, Mark::Visiting);
    stack.push(id);
    if let Some(task) = by_id.get(id) {
        for dep in &task.depends_on {
            if let Some(cycle) = visit(dep.as_str(), by_id, marks, stack) {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    marks.insert(id, Mark::Done);
    None
}
