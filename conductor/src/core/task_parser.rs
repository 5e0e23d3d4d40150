//! Parser for the markdown task list artifact.
//!
//! Recognized line shape:
//!
//! ```text
//! ## Phase 2: Core
//! - [ ] T004 [P] [US1] Add parser in `src/parse.rs` (depends on T001, T002)
//! ```
//!
//! Dependencies are explicit (`(depends on ...)` or `depends: ...`) or inferred:
//! every task depends on the tasks of the previous `##` section, and a task
//! without `[P]` also depends on the nearest preceding non-`[P]` task of its
//! own section.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::invariants::validate_invariants;
use crate::core::types::{Task, TaskState};

static TASK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*]\s+\[( |x|X)\]\s+([A-Za-z]+[0-9]+)\b\s*(.*)$").expect("task line regex")
});
static LEADING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]\s*").expect("tag regex"));
static DEPENDS_PAREN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\(\s*depends\s+on\s*:?\s*([^)]*)\)").expect("depends regex")
});
static DEPENDS_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdepends\s*:\s*([A-Za-z0-9,\s]+)$").expect("depends suffix regex")
});
static TASK_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+[0-9]+").expect("task id regex"));
static BACKTICKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`\s]+)`").expect("backtick regex"));

struct RawTask {
    task: Task,
    explicit_deps: Option<Vec<String>>,
}

/// Parse a task list. Returns all tasks (declaration order) or invariant errors.
pub fn parse_task_list(contents: &str) -> Result<Vec<Task>, Vec<String>> {
    let mut raw = Vec::new();
    let mut section = 0usize;
    let mut section_has_tasks = false;

    for line in contents.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("## ") {
            if section_has_tasks {
                section += 1;
                section_has_tasks = false;
            }
            continue;
        }
        if let Some(parsed) = parse_line(line, section) {
            section_has_tasks = true;
            raw.push(parsed);
        }
    }

    let tasks = infer_dependencies(raw);
    let errors = validate_invariants(&tasks);
    if errors.is_empty() {
        Ok(tasks)
    } else {
        Err(errors)
    }
}

fn parse_line(line: &str, section: usize) -> Option<RawTask> {
    let caps = TASK_LINE.captures(line)?;
    let checked = &caps[1] != " ";
    let id = caps[2].to_string();
    let mut rest = caps[3].trim();

    let mut parallel = false;
    let mut labels = Vec::new();
    while let Some(tag) = LEADING_TAG.captures(rest) {
        let label = tag[1].trim().to_string();
        let matched = tag.get(0).map_or(0, |m| m.end());
        if label == "P" {
            parallel = true;
        } else {
            labels.push(label);
        }
        rest = rest[matched..].trim_start();
    }

    let mut description = rest.to_string();
    let explicit = DEPENDS_PAREN
        .captures(&description)
        .or_else(|| DEPENDS_SUFFIX.captures(&description))
        .map(|caps| {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            (extract_ids(&caps[1]), whole)
        });
    let mut explicit_deps = None;
    if let Some((deps, whole)) = explicit {
        explicit_deps = Some(deps);
        description.replace_range(whole, "");
    }
    let description = description.trim().trim_end_matches(['-', ';']).trim().to_string();
    let targets = extract_targets(&description);

    Some(RawTask {
        task: Task {
            id,
            description,
            targets,
            depends_on: Vec::new(),
            parallel,
            labels,
            section,
            state: if checked {
                TaskState::Complete
            } else {
                TaskState::Pending
            },
            block_reason: None,
        },
        explicit_deps,
    })
}

fn extract_ids(list: &str) -> Vec<String> {
    TASK_ID
        .find_iter(list)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Extract declared file targets: backticked tokens plus bare tokens that look
/// like relative file paths (contain `/` and end in an extension).
pub fn extract_targets(description: &str) -> Vec<String> {
    let mut targets = BTreeSet::new();
    for caps in BACKTICKED.captures_iter(description) {
        targets.insert(caps[1].to_string());
    }
    let without_code = BACKTICKED.replace_all(description, " ");
    for token in without_code.split_whitespace() {
        let token =
            token.trim_matches(|c: char| matches!(c, ',' | ';' | ':' | '(' | ')' | '"' | '\''));
        let token = token.trim_end_matches('.');
        if looks_like_path(token) {
            targets.insert(token.to_string());
        }
    }
    targets.into_iter().collect()
}

fn looks_like_path(token: &str) -> bool {
    if !token.contains('/') || token.contains("://") {
        return false;
    }
    let last = token.rsplit('/').next().unwrap_or("");
    match last.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn infer_dependencies(raw: Vec<RawTask>) -> Vec<Task> {
    let mut tasks = Vec::with_capacity(raw.len());
    let mut previous_section_ids: Vec<String> = Vec::new();
    let mut current_section_ids: Vec<String> = Vec::new();
    let mut current_section: Option<usize> = None;
    let mut last_sequential: Option<String> = None;

    for RawTask {
        mut task,
        explicit_deps,
    } in raw
    {
        if current_section != Some(task.section) {
            if current_section.is_some() {
                previous_section_ids = std::mem::take(&mut current_section_ids);
            }
            current_section = Some(task.section);
            last_sequential = None;
        }

        task.depends_on = match explicit_deps {
            Some(deps) => deps,
            None => {
                let mut deps = previous_section_ids.clone();
                if !task.parallel
                    && let Some(prev) = &last_sequential
                {
                    deps.push(prev.clone());
                }
                deps
            }
        };

        if !task.parallel {
            last_sequential = Some(task.id.clone());
        }
        current_section_ids.push(task.id.clone());
        tasks.push(task);
    }

    tasks
}
