use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

mod report;
mod secret;

pub use report::{AnalysisReport, ErrorGroup, GroupType, RiskLevel};
pub use secret::Secret;

pub const PYTHON_EXTENSIONS: &[&str] = &["py", "pyi"];
pub const SCRIPT_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];
pub const TEXT_EXTENSIONS: &[&str] = &[
    "md", "toml", "yaml", "yml", "json", "cfg", "ini", "txt", "rst",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Python,
    Script,
    Text,
}

impl FileKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Script => "script",
            Self::Text => "text",
        }
    }
}

pub fn file_kind(path: &Path) -> Option<FileKind> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let extension = extension.as_str();
    if PYTHON_EXTENSIONS.contains(&extension) {
        Some(FileKind::Python)
    } else if SCRIPT_EXTENSIONS.contains(&extension) {
        Some(FileKind::Script)
    } else if TEXT_EXTENSIONS.contains(&extension) {
        Some(FileKind::Text)
    } else {
        None
    }
}

/// Ordering key used when no analysis report is available. `Critical` sorts
/// first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Critical,
    High,
    Medium,
    Low,
}

impl PriorityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct ErrorKey {
    pub file: String,
    pub line: usize,
    pub code: String,
}

/// A single finding reported by a validator. Built once at the validator
/// boundary and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeError {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub code: String,
    pub message: String,
    pub tool: String,
    pub tier: PriorityTier,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl CodeError {
    pub fn new(
        tool: impl Into<String>,
        file: impl AsRef<str>,
        line: usize,
        column: usize,
        code: impl Into<String>,
        message: impl Into<String>,
        tier: PriorityTier,
    ) -> Self {
        Self {
            file: normalize_path(file.as_ref()),
            line,
            column,
            code: code.into().trim().to_owned(),
            message: message.into().trim().to_owned(),
            tool: tool.into(),
            tier,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> ErrorKey {
        ErrorKey {
            file: self.file.clone(),
            line: self.line,
            code: self.code.clone(),
        }
    }

    pub fn location(&self) -> (usize, String) {
        (self.line, self.code.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ValidationResult {
    pub success: bool,
    pub errors: Vec<CodeError>,
    pub warnings: Vec<CodeError>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
}

impl ValidationResult {
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors_for_file(&self, file: &str) -> Vec<&CodeError> {
        let file = normalize_path(file);
        self.errors.iter().filter(|error| error.file == file).collect()
    }

    /// Folds another validator's output into this one. Success is the AND of
    /// both sides; duplicate `(file, line, code)` keys are dropped.
    pub fn merge(&mut self, other: ValidationResult) {
        self.success &= other.success;
        self.elapsed_ms += other.elapsed_ms;
        self.skipped.extend(other.skipped);

        let mut seen: BTreeSet<ErrorKey> = self.errors.iter().map(CodeError::key).collect();
        for error in other.errors {
            if seen.insert(error.key()) {
                self.errors.push(error);
            }
        }

        let mut seen: BTreeSet<ErrorKey> = self.warnings.iter().map(CodeError::key).collect();
        for warning in other.warnings {
            if seen.insert(warning.key()) {
                self.warnings.push(warning);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FixResult {
    pub success: bool,
    pub files_changed: Vec<String>,
    pub errors_fixed: usize,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub details: BTreeMap<String, Value>,
}

impl FixResult {
    pub fn noop() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn changed(&self) -> bool {
        !self.files_changed.is_empty() || self.errors_fixed > 0
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_owned(), value.into());
        self
    }

    pub fn set_detail(&mut self, key: &str, value: impl Into<Value>) {
        self.details.insert(key.to_owned(), value.into());
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }

    /// Adds a changed file, keeping the list sorted and free of duplicates.
    pub fn record_change(&mut self, file: impl AsRef<str>) {
        let file = normalize_path(file.as_ref());
        if let Err(index) = self.files_changed.binary_search(&file) {
            self.files_changed.insert(index, file);
        }
    }

    pub fn absorb(&mut self, other: &FixResult) {
        for file in &other.files_changed {
            self.record_change(file);
        }
        self.errors_fixed += other.errors_fixed;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorDiff {
    pub fixed: Vec<(usize, String)>,
    pub remaining: Vec<(usize, String)>,
    pub introduced: Vec<(usize, String)>,
}

/// Compares `(line, code)` sets before and after an edit.
pub fn diff_errors(before: &[CodeError], after: &[CodeError]) -> ErrorDiff {
    let before: BTreeSet<(usize, String)> = before.iter().map(CodeError::location).collect();
    let after: BTreeSet<(usize, String)> = after.iter().map(CodeError::location).collect();

    ErrorDiff {
        fixed: before.difference(&after).cloned().collect(),
        remaining: before.intersection(&after).cloned().collect(),
        introduced: after.difference(&before).cloned().collect(),
    }
}

pub fn normalize_path(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .strip_prefix("./")
        .map(str::to_owned)
        .unwrap_or(normalized)
}

pub fn content_hash(content: &[u8]) -> String {
    blake3::hash(content).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn error(file: &str, line: usize, code: &str) -> CodeError {
        CodeError::new("ruff", file, line, 1, code, "msg", PriorityTier::Medium)
    }

    #[test]
    fn file_kind_recognizes_supported_extensions() {
        assert_eq!(file_kind(&PathBuf::from("a/b.py")), Some(FileKind::Python));
        assert_eq!(file_kind(&PathBuf::from("a/b.PYI")), Some(FileKind::Python));
        assert_eq!(file_kind(&PathBuf::from("web/app.tsx")), Some(FileKind::Script));
        assert_eq!(file_kind(&PathBuf::from("README.md")), Some(FileKind::Text));
        assert_eq!(file_kind(&PathBuf::from("image.png")), None);
        assert_eq!(file_kind(&PathBuf::from("Makefile")), None);
    }

    #[test]
    fn merge_ands_success_and_drops_duplicate_keys() {
        let mut left = ValidationResult {
            success: true,
            errors: vec![error("a.py", 1, "F401")],
            ..ValidationResult::default()
        };
        let right = ValidationResult {
            success: false,
            errors: vec![error("./a.py", 1, "F401"), error("a.py", 2, "E501")],
            skipped: vec!["bandit".to_owned()],
            ..ValidationResult::default()
        };

        left.merge(right);

        assert!(!left.success);
        assert_eq!(left.errors.len(), 2);
        assert_eq!(left.skipped, vec!["bandit".to_owned()]);
    }

    #[test]
    fn record_change_dedups_and_sorts() {
        let mut result = FixResult::noop();
        result.record_change("b.py");
        result.record_change("a.py");
        result.record_change("./b.py");

        assert_eq!(result.files_changed, vec!["a.py", "b.py"]);
    }

    #[test]
    fn diff_errors_splits_fixed_remaining_and_introduced() {
        let before = vec![error("a.py", 1, "F401"), error("a.py", 5, "E501")];
        let after = vec![error("a.py", 5, "E501"), error("a.py", 9, "F821")];

        let diff = diff_errors(&before, &after);

        assert_eq!(diff.fixed, vec![(1, "F401".to_owned())]);
        assert_eq!(diff.remaining, vec![(5, "E501".to_owned())]);
        assert_eq!(diff.introduced, vec![(9, "F821".to_owned())]);
    }
}
