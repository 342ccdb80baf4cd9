use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use mend_core::{FileKind, FixResult, content_hash, file_kind};
use regex::Regex;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::tools::{BLACK, ESLINT, RUFF, relative_args, run_tool};

static RUFF_FIXED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\((\d+) fixed|Fixed (\d+) errors?").ok());
static BLACK_REFORMATTED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?m)^reformatted (.+?)\s*$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FixerKind {
    WhitespaceTrimmer,
    EofNormalizer,
    LintAutoFixer,
    Formatter,
    SecondaryLintFixer,
}

impl FixerKind {
    pub const ALL: [FixerKind; 5] = [
        Self::WhitespaceTrimmer,
        Self::EofNormalizer,
        Self::LintAutoFixer,
        Self::Formatter,
        Self::SecondaryLintFixer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WhitespaceTrimmer => "whitespace",
            Self::EofNormalizer => "eof_newline",
            Self::LintAutoFixer => "ruff_fix",
            Self::Formatter => "black",
            Self::SecondaryLintFixer => "eslint_fix",
        }
    }

    pub fn build(self) -> Box<dyn Fixer> {
        match self {
            Self::WhitespaceTrimmer => Box::new(WhitespaceTrimmer),
            Self::EofNormalizer => Box::new(EofNormalizer),
            Self::LintAutoFixer => Box::new(LintAutoFixer),
            Self::Formatter => Box::new(Formatter),
            Self::SecondaryLintFixer => Box::new(SecondaryLintFixer),
        }
    }
}

/// A deterministic file transformer. Implementations never fail: a missing
/// or broken tool reports zero changes with a `skipped` detail.
#[async_trait]
pub trait Fixer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fix(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult;
}

/// Runs the registered fixers in order until a pass changes nothing or the
/// iteration cap is reached.
pub struct FixerStage {
    fixers: Vec<Box<dyn Fixer>>,
}

impl Default for FixerStage {
    fn default() -> Self {
        Self::new(FixerKind::ALL.iter().map(|kind| kind.build()).collect())
    }
}

impl FixerStage {
    pub fn new(fixers: Vec<Box<dyn Fixer>>) -> Self {
        Self { fixers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.fixers.iter().map(|fixer| fixer.name()).collect()
    }

    pub async fn run(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult {
        let started = Instant::now();
        let paths: Vec<PathBuf> = paths.iter().map(|path| ctx.absolute(path)).collect();
        let max_iterations = if ctx.dry_run() {
            ctx.config.pipeline.max_fixer_iterations.min(1)
        } else {
            ctx.config.pipeline.max_fixer_iterations
        };

        let mut total = FixResult::noop();
        let mut per_fixer: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut iterations = 0;
        let mut converged = max_iterations == 0;

        while iterations < max_iterations {
            iterations += 1;
            let mut pass_changed = false;
            for fixer in &self.fixers {
                let result = fixer.fix(ctx, &paths).await;
                pass_changed |= result.changed();
                *per_fixer.entry(fixer.name()).or_default() += result.errors_fixed;
                if let Some(reason) = result.detail("skipped").and_then(Value::as_str)
                    && !skipped.iter().any(|known| known == reason)
                {
                    skipped.push(reason.to_owned());
                }
                total.absorb(&result);
            }

            tracing::debug!(
                iteration = iterations,
                changed = pass_changed,
                "fixer pass complete"
            );
            if !pass_changed {
                converged = true;
                break;
            }
        }

        if !converged && !ctx.dry_run() {
            tracing::warn!(
                iterations,
                "fixers still changing files at the iteration cap"
            );
        }

        total.elapsed_ms = started.elapsed().as_millis() as u64;
        total.set_detail("iterations", iterations);
        total.set_detail("converged", converged);
        total.set_detail("fixers", json!(per_fixer));
        if !skipped.is_empty() {
            total.set_detail("skipped", json!(skipped));
        }
        if ctx.dry_run() {
            total.set_detail("dry_run", true);
        }
        total
    }
}

pub struct WhitespaceTrimmer;

#[async_trait]
impl Fixer for WhitespaceTrimmer {
    fn name(&self) -> &'static str {
        FixerKind::WhitespaceTrimmer.as_str()
    }

    async fn fix(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult {
        rewrite_text_files(ctx, paths, |source| {
            let (trimmed, count) = trim_trailing_whitespace(source);
            (count > 0).then_some((trimmed, count))
        })
    }
}

pub struct EofNormalizer;

#[async_trait]
impl Fixer for EofNormalizer {
    fn name(&self) -> &'static str {
        FixerKind::EofNormalizer.as_str()
    }

    async fn fix(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult {
        rewrite_text_files(ctx, paths, |source| {
            let normalized = normalize_final_newline(source);
            (normalized != source).then_some((normalized, 1))
        })
    }
}

/// `ruff check --fix`. Credits the count ruff reports; changed files are
/// found by content hash.
pub struct LintAutoFixer;

#[async_trait]
impl Fixer for LintAutoFixer {
    fn name(&self) -> &'static str {
        FixerKind::LintAutoFixer.as_str()
    }

    async fn fix(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult {
        let targets = paths_of_kind(paths, FileKind::Python);
        if targets.is_empty() || ctx.dry_run() {
            return FixResult::noop();
        }

        let mut args = vec!["check".to_owned(), "--fix".to_owned()];
        if ctx.config.tools.ruff_unsafe_fixes {
            args.push("--unsafe-fixes".to_owned());
        }
        args.push("--exit-zero".to_owned());
        args.extend(relative_args(ctx, &targets));

        let before = hash_files(&targets);
        let output = match run_tool(ctx, RUFF, &args).await {
            Ok(output) => output,
            Err(reason) => return FixResult::noop().with_detail("skipped", reason),
        };
        if !output.succeeded() {
            tracing::warn!(
                exit_code = ?output.exit_code,
                stderr = %first_line(&output.stderr),
                "ruff --fix failed"
            );
            return FixResult::noop().with_detail("skipped", format!("{RUFF}: exited with error"));
        }

        let mut result = FixResult::noop();
        let changed = changed_files(&targets, &before);
        for path in &changed {
            result.record_change(ctx.relative(path));
        }
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        result.errors_fixed = parse_ruff_fixed(&combined).unwrap_or(changed.len());
        result
    }
}

/// `black`. Change detection comes from its `reformatted <path>` report.
pub struct Formatter;

#[async_trait]
impl Fixer for Formatter {
    fn name(&self) -> &'static str {
        FixerKind::Formatter.as_str()
    }

    async fn fix(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult {
        let targets = paths_of_kind(paths, FileKind::Python);
        if targets.is_empty() || ctx.dry_run() {
            return FixResult::noop();
        }

        let args = relative_args(ctx, &targets);
        let output = match run_tool(ctx, BLACK, &args).await {
            Ok(output) => output,
            Err(reason) => return FixResult::noop().with_detail("skipped", reason),
        };
        if output.exit_code == Some(123) {
            tracing::warn!(stderr = %first_line(&output.stderr), "black could not parse a file");
        }

        let mut result = FixResult::noop();
        for reformatted in parse_black_reformatted(&output.stderr) {
            result.record_change(ctx.relative(Path::new(&reformatted)));
            result.errors_fixed += 1;
        }
        result
    }
}

/// `eslint --fix` over script sources. eslint reports nothing about what it
/// rewrote, so changes are found by content hash.
pub struct SecondaryLintFixer;

#[async_trait]
impl Fixer for SecondaryLintFixer {
    fn name(&self) -> &'static str {
        FixerKind::SecondaryLintFixer.as_str()
    }

    async fn fix(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult {
        let targets = paths_of_kind(paths, FileKind::Script);
        if targets.is_empty() || ctx.dry_run() {
            return FixResult::noop();
        }

        let mut args = vec!["--fix".to_owned()];
        args.extend(relative_args(ctx, &targets));

        let before = hash_files(&targets);
        let output = match run_tool(ctx, ESLINT, &args).await {
            Ok(output) => output,
            Err(reason) => return FixResult::noop().with_detail("skipped", reason),
        };
        // 1 means lint errors remain after fixing; 2 is a configuration or crash.
        if output.exit_code.is_some_and(|code| code > 1) {
            tracing::warn!(stderr = %first_line(&output.stderr), "eslint --fix failed");
            return FixResult::noop().with_detail("skipped", format!("{ESLINT}: exited with error"));
        }

        let mut result = FixResult::noop();
        for path in changed_files(&targets, &before) {
            result.record_change(ctx.relative(&path));
            result.errors_fixed += 1;
        }
        result
    }
}

fn rewrite_text_files<F>(ctx: &RunContext, paths: &[PathBuf], transform: F) -> FixResult
where
    F: Fn(&str) -> Option<(String, usize)>,
{
    let mut result = FixResult::noop();
    for path in paths {
        if file_kind(path).is_none() {
            continue;
        }
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "skipping unreadable file");
                continue;
            }
        };
        let Some((updated, credits)) = transform(&source) else {
            continue;
        };

        if !ctx.dry_run()
            && let Err(err) = fs::write(path, updated)
        {
            tracing::warn!(path = %path.display(), error = %err, "failed to write fixed file");
            continue;
        }
        result.record_change(ctx.relative(path));
        result.errors_fixed += credits;
    }
    result
}

/// Strips trailing spaces and tabs from every line, keeping each line's
/// original terminator. Returns the new text and how many lines changed.
pub fn trim_trailing_whitespace(source: &str) -> (String, usize) {
    let mut output = String::with_capacity(source.len());
    let mut changed = 0;
    for segment in source.split_inclusive('\n') {
        let ending = if segment.ends_with("\r\n") {
            "\r\n"
        } else if segment.ends_with('\n') {
            "\n"
        } else {
            ""
        };
        let body = &segment[..segment.len() - ending.len()];
        let trimmed = body.trim_end_matches([' ', '\t', '\u{000c}']);
        if trimmed.len() != body.len() {
            changed += 1;
        }
        output.push_str(trimmed);
        output.push_str(ending);
    }
    (output, changed)
}

/// Exactly one trailing newline, in the file's own newline style. Empty
/// files stay empty and blank-only files become empty.
pub fn normalize_final_newline(source: &str) -> String {
    let newline = if source.contains("\r\n") { "\r\n" } else { "\n" };
    let body = source.trim_end_matches(['\n', '\r']);
    if body.is_empty() {
        return String::new();
    }
    format!("{body}{newline}")
}

pub fn parse_ruff_fixed(output: &str) -> Option<usize> {
    let regex = RUFF_FIXED.as_ref()?;
    let captures = regex.captures(output)?;
    captures
        .get(1)
        .or_else(|| captures.get(2))
        .and_then(|count| count.as_str().parse().ok())
}

pub fn parse_black_reformatted(stderr: &str) -> Vec<String> {
    let Some(regex) = BLACK_REFORMATTED.as_ref() else {
        return Vec::new();
    };
    regex
        .captures_iter(stderr)
        .filter_map(|captures| captures.get(1))
        .map(|path| path.as_str().to_owned())
        .collect()
}

fn paths_of_kind(paths: &[PathBuf], kind: FileKind) -> Vec<&Path> {
    paths
        .iter()
        .filter(|path| file_kind(path) == Some(kind) && path.is_file())
        .map(PathBuf::as_path)
        .collect()
}

fn hash_files(paths: &[&Path]) -> BTreeMap<PathBuf, String> {
    paths
        .iter()
        .filter_map(|path| {
            fs::read(path)
                .ok()
                .map(|content| (path.to_path_buf(), content_hash(&content)))
        })
        .collect()
}

fn changed_files(paths: &[&Path], before: &BTreeMap<PathBuf, String>) -> Vec<PathBuf> {
    let after = hash_files(paths);
    after
        .into_iter()
        .filter(|(path, hash)| before.get(path) != Some(hash))
        .map(|(path, _)| path)
        .collect()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trimming_counts_lines_and_keeps_terminators() {
        let (trimmed, count) = trim_trailing_whitespace("a = 1   \r\nb = 2\t\nc = 3\n  ");
        assert_eq!(trimmed, "a = 1\r\nb = 2\nc = 3\n");
        assert_eq!(count, 3);

        let (same, none) = trim_trailing_whitespace(&trimmed);
        assert_eq!(same, trimmed);
        assert_eq!(none, 0);
    }

    #[test]
    fn final_newline_is_added_or_collapsed() {
        assert_eq!(normalize_final_newline("x = 1"), "x = 1\n");
        assert_eq!(normalize_final_newline("x = 1\n\n\n"), "x = 1\n");
        assert_eq!(normalize_final_newline("x = 1\r\n\r\n"), "x = 1\r\n");
        assert_eq!(normalize_final_newline(""), "");
        assert_eq!(normalize_final_newline("\n\n"), "");
        assert_eq!(normalize_final_newline("x = 1\n"), "x = 1\n");
    }

    #[test]
    fn ruff_summary_is_parsed() {
        assert_eq!(
            parse_ruff_fixed("Found 3 errors (2 fixed, 1 remaining)."),
            Some(2)
        );
        assert_eq!(parse_ruff_fixed("Fixed 1 error:\n- a.py:\n    1 × F401"), Some(1));
        assert_eq!(parse_ruff_fixed("All checks passed!"), None);
    }

    #[test]
    fn black_report_lists_reformatted_files() {
        let stderr = "reformatted pkg/a.py\nreformatted b.py\nAll done! ✨ 🍰 ✨\n2 files reformatted, 1 file left unchanged.\n";
        assert_eq!(parse_black_reformatted(stderr), vec!["pkg/a.py", "b.py"]);
        assert!(parse_black_reformatted("1 file left unchanged.\n").is_empty());
    }

    #[test]
    fn registry_order_is_fixed() {
        let names = FixerStage::default().names();
        assert_eq!(
            names,
            vec!["whitespace", "eof_newline", "ruff_fix", "black", "eslint_fix"]
        );
    }
}
