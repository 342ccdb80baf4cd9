use std::collections::BTreeSet;

use tree_sitter::Node;

use crate::ParseError;
use crate::python::{IMPORT_KINDS, parse_python};

const STDLIB_MODULES: &[&str] = &[
    "__future__", "abc", "argparse", "array", "ast", "asyncio", "base64", "bisect", "builtins",
    "bz2", "calendar", "cmath", "codecs", "collections", "colorsys", "concurrent",
    "configparser", "contextlib", "contextvars", "copy", "csv", "ctypes", "dataclasses",
    "datetime", "decimal", "difflib", "dis", "email", "enum", "errno", "faulthandler",
    "fnmatch", "fractions", "functools", "gc", "getpass", "gettext", "glob", "graphlib",
    "gzip", "hashlib", "heapq", "hmac", "html", "http", "importlib", "inspect", "io",
    "ipaddress", "itertools", "json", "keyword", "linecache", "locale", "logging", "lzma",
    "math", "mimetypes", "multiprocessing", "numbers", "operator", "os", "pathlib", "pdb",
    "pickle", "pkgutil", "platform", "pprint", "profile", "queue", "random", "re",
    "reprlib", "resource", "secrets", "select", "selectors", "shlex", "shutil", "signal",
    "site", "socket", "sqlite3", "ssl", "stat", "statistics", "string", "struct",
    "subprocess", "sys", "sysconfig", "tarfile", "tempfile", "textwrap", "threading", "time",
    "timeit", "tomllib", "traceback", "types", "typing", "unicodedata", "unittest", "urllib",
    "uuid", "warnings", "weakref", "xml", "zipfile", "zlib", "zoneinfo",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImportSection {
    Standard,
    ThirdParty,
    Local,
}

/// Classifies a dotted module path. Relative imports and modules rooted in
/// one of `local_roots` are local.
pub fn classify_module(module: &str, local_roots: &[&str]) -> ImportSection {
    if module.starts_with('.') {
        return ImportSection::Local;
    }
    let root = module.split('.').next().unwrap_or(module);
    if local_roots.contains(&root) {
        ImportSection::Local
    } else if STDLIB_MODULES.contains(&root) {
        ImportSection::Standard
    } else {
        ImportSection::ThirdParty
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ImportEntry {
    section: ImportSection,
    is_from: bool,
    module_key: String,
    text: String,
}

/// Moves the top-level import statements covering `lines` (1-based), together
/// with any imports already leading the module, into one sorted block of
/// standard, third-party and local sections. The block lands after the module
/// docstring, leading comments and `__future__` imports. Lines that are not
/// top-level imports are ignored.
pub fn relocate_imports(
    source: &str,
    lines: &[usize],
    local_roots: &[&str],
) -> Result<String, ParseError> {
    let tree = parse_python(source)?;
    let root = tree.root_node();
    let bytes = source.as_bytes();
    let source_lines: Vec<&str> = source.lines().collect();

    let mut cursor = root.walk();
    let top_level: Vec<Node<'_>> = root.named_children(&mut cursor).collect();

    let header_len = count_header(&top_level);
    let insert_row = header_len
        .checked_sub(1)
        .map_or(0, |last| top_level[last].end_position().row + 1);
    let leading_imports: Vec<Node<'_>> = top_level[header_len..]
        .iter()
        .take_while(|node| IMPORT_KINDS.contains(&node.kind()))
        .copied()
        .collect();

    let targeted: Vec<Node<'_>> = top_level
        .iter()
        .filter(|node| IMPORT_KINDS.contains(&node.kind()))
        .filter(|node| {
            let start = node.start_position().row + 1;
            let end = node.end_position().row + 1;
            lines.iter().any(|line| (start..=end).contains(line))
        })
        .copied()
        .collect();

    if targeted.is_empty() {
        return Ok(source.to_owned());
    }

    let mut removed_rows = BTreeSet::new();
    let mut entries = BTreeSet::new();
    let mut seen_text = BTreeSet::new();
    for node in leading_imports.iter().chain(targeted.iter()) {
        for row in node.start_position().row..=node.end_position().row {
            removed_rows.insert(row);
        }
        let text = node
            .utf8_text(bytes)
            .map(normalize_statement)
            .unwrap_or_default();
        if text.is_empty() || !seen_text.insert(text.clone()) {
            continue;
        }
        let module = import_module(*node, bytes);
        entries.insert(ImportEntry {
            section: classify_module(&module, local_roots),
            is_from: node.kind() == "import_from_statement",
            module_key: module.to_ascii_lowercase(),
            text,
        });
    }

    let mut block = Vec::new();
    let mut current_section = None;
    for entry in &entries {
        if current_section.is_some() && current_section != Some(entry.section) {
            block.push(String::new());
        }
        current_section = Some(entry.section);
        block.push(entry.text.clone());
    }

    let mut output: Vec<String> = Vec::with_capacity(source_lines.len() + block.len() + 2);
    for (row, line) in source_lines.iter().enumerate().take(insert_row) {
        if !removed_rows.contains(&row) {
            output.push((*line).to_owned());
        }
    }
    if insert_row > 0 && output.last().is_some_and(|line| !line.trim().is_empty()) {
        output.push(String::new());
    }
    output.extend(block);

    let rest: Vec<&str> = source_lines
        .iter()
        .enumerate()
        .skip(insert_row)
        .filter(|(row, _)| !removed_rows.contains(row))
        .map(|(_, line)| *line)
        .skip_while(|line| line.trim().is_empty())
        .collect();
    if !rest.is_empty() {
        output.push(String::new());
        output.extend(rest.into_iter().map(str::to_owned));
    }

    let newline = if source.contains("\r\n") { "\r\n" } else { "\n" };
    let mut rendered = output.join("\n");
    if source.ends_with('\n') {
        rendered.push('\n');
    }
    if newline != "\n" {
        // multi-line statements in the block were normalized to `\n` too
        rendered = rendered.replace('\n', newline);
    }
    Ok(rendered)
}

fn count_header(top_level: &[Node<'_>]) -> usize {
    top_level
        .iter()
        .enumerate()
        .take_while(|(index, node)| {
            (*index == 0 && is_docstring(**node))
                || node.kind() == "comment"
                || node.kind() == "future_import_statement"
        })
        .count()
}

fn is_docstring(node: Node<'_>) -> bool {
    node.kind() == "expression_statement"
        && node
            .named_child(0)
            .is_some_and(|child| child.kind() == "string")
}

fn import_module(node: Node<'_>, source: &[u8]) -> String {
    let field = if node.kind() == "import_from_statement" {
        node.child_by_field_name("module_name")
    } else {
        node.child_by_field_name("name")
    };
    field
        .and_then(|name| {
            if name.kind() == "aliased_import" {
                name.child_by_field_name("name")
            } else {
                Some(name)
            }
        })
        .and_then(|name| name.utf8_text(source).ok())
        .map(str::to_owned)
        .unwrap_or_default()
}

fn normalize_statement(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_owned()
}
