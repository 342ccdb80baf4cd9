mod imports;
mod python;

use std::path::Path;

use mend_core::{FileKind, file_kind};
use thiserror::Error;

pub use imports::{ImportSection, classify_module, relocate_imports};
pub use python::{python_outline, python_syntax};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to load {0} tree-sitter grammar")]
    Grammar(&'static str),
    #[error("tree-sitter parser produced no syntax tree")]
    NoTree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxReport {
    pub valid: bool,
    /// 1-based line of the first error or missing node.
    pub error_line: Option<usize>,
}

impl SyntaxReport {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error_line: None,
        }
    }
}

/// Structural landmarks used to build minimal fix context. All line numbers
/// are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceOutline {
    pub import_lines: Vec<usize>,
    pub signature_lines: Vec<usize>,
}

/// Checks whether `source` parses. Only Python has a grammar here; other
/// file kinds are reported valid.
pub fn check_syntax(path: &Path, source: &str) -> Result<SyntaxReport, ParseError> {
    match file_kind(path) {
        Some(FileKind::Python) => python_syntax(source),
        _ => Ok(SyntaxReport::valid()),
    }
}

pub fn outline(path: &Path, source: &str) -> Result<SourceOutline, ParseError> {
    match file_kind(path) {
        Some(FileKind::Python) => python_outline(source),
        _ => Ok(heuristic_outline(source)),
    }
}

/// Line-prefix outline for sources without a grammar.
pub fn heuristic_outline(source: &str) -> SourceOutline {
    const IMPORT_PREFIXES: &[&str] = &["import ", "from ", "#include", "use ", "require("];
    const SIGNATURE_PREFIXES: &[&str] = &[
        "function ",
        "async function ",
        "class ",
        "export ",
        "def ",
        "async def ",
        "interface ",
        "type ",
    ];

    let mut outline = SourceOutline::default();
    for (index, line) in source.lines().enumerate() {
        if line.starts_with(char::is_whitespace) {
            continue;
        }
        let is_require = line.contains("= require(");
        if is_require || IMPORT_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            outline.import_lines.push(index + 1);
        } else if SIGNATURE_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            outline.signature_lines.push(index + 1);
        }
    }
    outline
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn heuristic_outline_finds_imports_and_signatures() {
        let source = "import fs from 'fs';\nconst path = require('path');\n\nexport function run() {\n  return 1;\n}\nclass Worker {}\n";
        let outline = heuristic_outline(source);

        assert_eq!(outline.import_lines, vec![1, 2]);
        assert_eq!(outline.signature_lines, vec![4, 7]);
    }

    #[test]
    fn non_python_sources_are_always_valid() {
        let report = check_syntax(&PathBuf::from("web/app.ts"), "function (").expect("check");
        assert!(report.valid);
    }

    #[test]
    fn python_dispatch_detects_broken_source() {
        let report = check_syntax(&PathBuf::from("pkg/mod.py"), "def broken(:\n    pass\n")
            .expect("check");
        assert!(!report.valid);
        assert_eq!(report.error_line, Some(1));
    }
}
