use std::collections::BTreeMap;

use mend_core::{CodeError, GroupType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupingThresholds {
    pub min_file_group: usize,
    pub min_type_group: usize,
    pub min_context_group: usize,
    /// Maximum line gap between consecutive members of a context window.
    pub context_window: usize,
}

impl Default for GroupingThresholds {
    fn default() -> Self {
        Self {
            min_file_group: 3,
            min_type_group: 5,
            min_context_group: 3,
            context_window: 20,
        }
    }
}

/// Unscored candidate produced by one of the grouping passes.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    pub group_type: GroupType,
    pub key: String,
    pub errors: Vec<CodeError>,
}

/// Runs the three independent passes. An error may appear in a file, a type
/// and a context group at the same time.
pub fn candidate_groups(errors: &[CodeError], thresholds: GroupingThresholds) -> Vec<CandidateGroup> {
    let mut groups = group_by_file(errors, thresholds.min_file_group);
    groups.extend(group_by_type(errors, thresholds.min_type_group));
    groups.extend(group_by_context(
        errors,
        thresholds.min_context_group,
        thresholds.context_window,
    ));
    groups
}

pub fn group_by_file(errors: &[CodeError], min_size: usize) -> Vec<CandidateGroup> {
    let mut by_file: BTreeMap<&str, Vec<CodeError>> = BTreeMap::new();
    for error in errors {
        by_file
            .entry(error.file.as_str())
            .or_default()
            .push(error.clone());
    }

    by_file
        .into_iter()
        .filter(|(_, members)| members.len() >= min_size)
        .map(|(file, members)| CandidateGroup {
            group_type: GroupType::File,
            key: file.to_owned(),
            errors: members,
        })
        .collect()
}

pub fn group_by_type(errors: &[CodeError], min_size: usize) -> Vec<CandidateGroup> {
    let mut by_code: BTreeMap<&str, Vec<CodeError>> = BTreeMap::new();
    for error in errors {
        by_code
            .entry(error.code.as_str())
            .or_default()
            .push(error.clone());
    }

    by_code
        .into_iter()
        .filter(|(_, members)| members.len() >= min_size)
        .map(|(code, members)| CandidateGroup {
            group_type: GroupType::Type,
            key: code.to_owned(),
            errors: members,
        })
        .collect()
}

pub fn group_by_context(
    errors: &[CodeError],
    min_size: usize,
    window: usize,
) -> Vec<CandidateGroup> {
    let mut sorted: Vec<&CodeError> = errors.iter().collect();
    sorted.sort_by(|left, right| {
        left.file
            .cmp(&right.file)
            .then(left.line.cmp(&right.line))
            .then(left.code.cmp(&right.code))
    });

    let mut windows: Vec<Vec<CodeError>> = Vec::new();
    let mut current: Vec<CodeError> = Vec::new();
    for error in sorted {
        let extends = current.last().is_some_and(|previous: &CodeError| {
            previous.file == error.file && error.line.saturating_sub(previous.line) <= window
        });
        if !extends && !current.is_empty() {
            windows.push(std::mem::take(&mut current));
        }
        current.push(error.clone());
    }
    if !current.is_empty() {
        windows.push(current);
    }

    windows
        .into_iter()
        .filter(|members| members.len() >= min_size)
        .map(|members| {
            let first = &members[0];
            let last = &members[members.len() - 1];
            CandidateGroup {
                group_type: GroupType::Context,
                key: format!("{}:{}-{}", first.file, first.line, last.line),
                errors: members,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use mend_core::PriorityTier;

    use super::*;

    fn error(file: &str, line: usize, code: &str) -> CodeError {
        CodeError::new("ruff", file, line, 1, code, "msg", PriorityTier::Medium)
    }

    #[test]
    fn file_groups_need_three_members() {
        let errors = vec![
            error("a.py", 1, "X"),
            error("a.py", 2, "X"),
            error("a.py", 3, "Y"),
            error("a.py", 4, "Y"),
            error("b.py", 1, "X"),
            error("b.py", 2, "Y"),
        ];

        let groups = group_by_file(&errors, 3);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "a.py");
        assert_eq!(groups[0].errors.len(), 4);
    }

    #[test]
    fn type_groups_count_across_files() {
        let errors = vec![
            error("a.py", 1, "X"),
            error("a.py", 2, "X"),
            error("b.py", 1, "X"),
            error("b.py", 2, "Y"),
        ];
        assert!(group_by_type(&errors, 5).is_empty());

        let mut more = errors.clone();
        more.push(error("c.py", 1, "X"));
        more.push(error("c.py", 9, "X"));
        let groups = group_by_type(&more, 5);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "X");
        assert_eq!(groups[0].errors.len(), 5);
    }

    #[test]
    fn context_windows_break_on_gaps_and_files() {
        let errors = vec![
            error("a.py", 40, "X"),
            error("a.py", 1, "X"),
            error("a.py", 15, "Y"),
            error("a.py", 30, "Z"),
            error("a.py", 100, "X"),
            error("b.py", 101, "X"),
            error("b.py", 102, "X"),
        ];

        let groups = group_by_context(&errors, 3, 20);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "a.py:1-40");
        assert_eq!(groups[0].errors.len(), 4);
    }
}
