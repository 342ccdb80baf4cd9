use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static REPLY_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*(?i:line\s+)?(\d+)\s*:\s?(.*)$").ok());

/// Reads `N: text` entries from a model reply. Code fences and anything
/// else that does not match are ignored.
pub fn parse_reply(reply: &str) -> Vec<(usize, String)> {
    let Some(regex) = REPLY_LINE.as_ref() else {
        return Vec::new();
    };

    reply
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .filter_map(|line| {
            let captures = regex.captures(line.trim_end_matches('\r'))?;
            let number: usize = captures.get(1)?.as_str().parse().ok()?;
            let text = captures.get(2).map_or("", |text| text.as_str());
            Some((number, text.trim_end().to_owned()))
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppliedEdit {
    pub text: String,
    pub applied: Vec<usize>,
    pub out_of_range: Vec<usize>,
}

impl AppliedEdit {
    pub fn changed(&self, original: &str) -> bool {
        self.text != original
    }
}

/// Replaces whole lines by 1-based number. A replacement with no leading
/// whitespace inherits the original line's indentation, each line keeps its
/// own terminator, and when a number repeats the last entry wins.
pub fn apply_replacements(source: &str, replacements: &[(usize, String)]) -> AppliedEdit {
    let mut segments: Vec<(&str, &str)> = source
        .split_inclusive('\n')
        .map(|segment| {
            let ending = if segment.ends_with("\r\n") {
                "\r\n"
            } else if segment.ends_with('\n') {
                "\n"
            } else {
                ""
            };
            (&segment[..segment.len() - ending.len()], ending)
        })
        .collect();
    let line_count = segments.len();

    let mut by_line: BTreeMap<usize, &str> = BTreeMap::new();
    let mut out_of_range = Vec::new();
    for (number, text) in replacements {
        if *number == 0 || *number > line_count {
            tracing::warn!(
                line = number,
                line_count,
                "reply references a line outside the file, skipping"
            );
            out_of_range.push(*number);
            continue;
        }
        by_line.insert(*number, text.as_str());
    }

    let mut rebuilt: Vec<String> = Vec::with_capacity(line_count);
    for (index, (body, _)) in segments.iter().enumerate() {
        let replacement = by_line.get(&(index + 1)).map(|text| with_indent(body, text));
        rebuilt.push(replacement.unwrap_or_else(|| (*body).to_owned()));
    }

    let mut text = String::with_capacity(source.len());
    for (body, (_, ending)) in rebuilt.iter().zip(segments.drain(..)) {
        text.push_str(body);
        text.push_str(ending);
    }

    AppliedEdit {
        text,
        applied: by_line.into_keys().collect(),
        out_of_range,
    }
}

fn with_indent(original: &str, replacement: &str) -> String {
    if replacement.is_empty() || replacement.starts_with([' ', '\t']) {
        return replacement.to_owned();
    }
    let indent_len = original.len() - original.trim_start_matches([' ', '\t']).len();
    format!("{}{replacement}", &original[..indent_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_parsing_skips_fences_and_prose() {
        let reply = "Here is the fix:\n```python\n10: x = 1\nline 12:     return x\n```\nthis line is not an edit\n3:\n";
        assert_eq!(
            parse_reply(reply),
            vec![
                (10, "x = 1".to_owned()),
                (12, "    return x".to_owned()),
                (3, String::new()),
            ]
        );
        assert!(parse_reply("I could not find anything to change.").is_empty());
    }

    #[test]
    fn indentation_and_line_endings_survive() {
        let source = "def f():\r\n    x = 0\r\n    return x\r\n";
        let edit = apply_replacements(source, &[(2, "x = 1".to_owned())]);
        assert_eq!(edit.text, "def f():\r\n    x = 1\r\n    return x\r\n");
        assert_eq!(edit.applied, vec![2]);
    }

    #[test]
    fn out_of_range_entries_are_skipped_not_fatal() {
        let source: String = (1..=50).map(|n| format!("v{n} = {n}\n")).collect();
        let edit = apply_replacements(
            &source,
            &[(9999, "boom".to_owned()), (4, "v4 = 40".to_owned()), (0, "zero".to_owned())],
        );
        assert_eq!(edit.out_of_range, vec![9999, 0]);
        assert_eq!(edit.applied, vec![4]);
        assert!(edit.text.contains("v4 = 40\n"));
        assert_eq!(edit.text.lines().count(), 50);
    }

    #[test]
    fn last_duplicate_wins_and_missing_final_newline_kept() {
        let edit = apply_replacements(
            "a = 1\nb = 2",
            &[(2, "b = 3".to_owned()), (2, "b = 4".to_owned())],
        );
        assert_eq!(edit.text, "a = 1\nb = 4");
        assert!(edit.changed("a = 1\nb = 2"));
    }
}
