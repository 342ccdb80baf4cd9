use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use mend_analysis::{ErrorAnalyzer, write_report};
use mend_core::{AnalysisReport, CodeError, FileKind, PriorityTier, ValidationResult, file_kind};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;

use crate::context::RunContext;
use crate::tools::{BANDIT, MYPY, RUFF, relative_args, run_tool};

/// Ruff codes reported as warnings rather than errors.
pub const LINT_WARNING_PREFIXES: &[&str] = &["W", "D", "C90"];
pub const SYNTAX_CODES: &[&str] = &["E999", "invalid-syntax", "syntax"];

static RUFF_TEXT_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?P<col>\d+):\s+(?P<code>[A-Z]+\d+|[a-z][a-z-]*):?\s+(?P<msg>.*)$")
        .ok()
});
static MYPY_TEXT_LINE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<file>[^:\s][^:]*):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<severity>error|warning|note):\s+(?P<msg>.*?)(?:\s+\[(?P<code>[a-z0-9-]+)\])?\s*$",
    )
    .ok()
});
static BANDIT_ISSUE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r">> Issue: \[(?P<code>[A-Z]\d+)(?::[\w-]+)?\]\s*(?P<msg>.*)$").ok());
static BANDIT_SEVERITY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"Severity:\s*(?P<severity>\w+)\s+Confidence:\s*(?P<confidence>\w+)").ok()
});
static BANDIT_LOCATION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Location:\s*(?P<file>.+?):(?P<line>\d+)(?::(?P<col>\d+))?\s*$").ok());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidatorKind {
    LintChecker,
    TypeChecker,
    SecurityScanner,
}

impl ValidatorKind {
    pub const ALL: [ValidatorKind; 3] = [Self::LintChecker, Self::TypeChecker, Self::SecurityScanner];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LintChecker => "ruff",
            Self::TypeChecker => "mypy",
            Self::SecurityScanner => "bandit",
        }
    }

    pub fn build(self) -> Box<dyn Validator> {
        match self {
            Self::LintChecker => Box::new(LintChecker),
            Self::TypeChecker => Box::new(TypeChecker),
            Self::SecurityScanner => Box::new(SecurityScanner),
        }
    }
}

/// A read-only checker. A tool that cannot run yields a passing, empty
/// result whose `skipped` list names the reason.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &'static str;
    async fn validate(&self, ctx: &RunContext, paths: &[PathBuf]) -> ValidationResult;
}

pub struct ValidatorStage {
    validators: Vec<Box<dyn Validator>>,
    analyzer: ErrorAnalyzer,
}

impl Default for ValidatorStage {
    fn default() -> Self {
        Self::new(ValidatorKind::ALL.iter().map(|kind| kind.build()).collect())
    }
}

impl ValidatorStage {
    pub fn new(validators: Vec<Box<dyn Validator>>) -> Self {
        Self {
            validators,
            analyzer: ErrorAnalyzer::default(),
        }
    }

    /// Whether at least one validator actually ran for `result`.
    pub fn verified(&self, result: &ValidationResult) -> bool {
        result.skipped.len() < self.validators.len()
    }

    /// Runs every validator and merges their findings. No analysis and no
    /// metrics; used for re-validation inside stage 3.
    pub async fn validate(&self, ctx: &RunContext, paths: &[PathBuf]) -> ValidationResult {
        let started = Instant::now();
        let paths: Vec<PathBuf> = paths.iter().map(|path| ctx.absolute(path)).collect();
        let mut merged = ValidationResult::passed();
        for validator in &self.validators {
            let result = validator.validate(ctx, &paths).await;
            tracing::debug!(
                validator = validator.name(),
                errors = result.errors.len(),
                warnings = result.warnings.len(),
                "validator finished"
            );
            merged.merge(result);
        }
        merged.elapsed_ms = started.elapsed().as_millis() as u64;
        merged
    }

    /// Validation plus error analysis. The report is persisted when
    /// `pipeline.report_dir` is set.
    pub async fn run(
        &self,
        ctx: &RunContext,
        paths: &[PathBuf],
    ) -> (ValidationResult, Option<AnalysisReport>) {
        let started = Instant::now();
        let validation = self.validate(ctx, paths).await;
        ctx.metrics().record_stage2(
            &ctx.run_id,
            started,
            json!({
                "files": paths.len(),
                "errors": validation.errors.len(),
                "warnings": validation.warnings.len(),
                "skipped": validation.skipped,
            }),
            validation.success,
            None,
        );

        if validation.errors.is_empty() {
            return (validation, None);
        }

        let analysis_started = Instant::now();
        let report = self.analyzer.analyze(&validation);
        ctx.metrics().record_analysis(
            &ctx.run_id,
            analysis_started,
            json!({
                "total_errors": report.total_errors,
                "filtered_errors": report.filtered_errors,
                "groups": report.groups.len(),
                "estimated_cost": report.total_cost,
            }),
        );

        if let Some(dir) = ctx.config.pipeline.report_dir.as_deref() {
            let dir = ctx.absolute(Path::new(dir));
            match write_report(&report, &dir) {
                Ok((text, _)) => tracing::info!(path = %text.display(), "analysis report written"),
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), error = %err, "failed to write analysis report")
                }
            }
        }

        (validation, Some(report))
    }
}

pub struct LintChecker;

#[async_trait]
impl Validator for LintChecker {
    fn name(&self) -> &'static str {
        ValidatorKind::LintChecker.as_str()
    }

    async fn validate(&self, ctx: &RunContext, paths: &[PathBuf]) -> ValidationResult {
        let targets = python_targets(paths);
        if targets.is_empty() {
            return ValidationResult::passed();
        }

        let mut args = vec![
            "check".to_owned(),
            "--no-fix".to_owned(),
            "--output-format=json".to_owned(),
        ];
        args.extend(relative_args(ctx, &targets));

        let output = match run_tool(ctx, RUFF, &args).await {
            Ok(output) => output,
            Err(reason) => return skipped(reason),
        };
        if output.exit_code.is_some_and(|code| code > 1) {
            tracing::warn!(stderr = %output.stderr.trim(), "ruff check failed");
            return skipped(format!("{RUFF}: exited with error"));
        }

        let findings = match parse_ruff_json(&output.stdout) {
            Some(findings) => findings,
            None => {
                tracing::debug!("ruff json output unreadable, falling back to text");
                parse_ruff_text(&output.stdout)
            }
        };
        classify(
            findings
                .into_iter()
                .map(|finding| finding.into_error(ctx))
                .collect(),
        )
    }
}

pub struct TypeChecker;

#[async_trait]
impl Validator for TypeChecker {
    fn name(&self) -> &'static str {
        ValidatorKind::TypeChecker.as_str()
    }

    async fn validate(&self, ctx: &RunContext, paths: &[PathBuf]) -> ValidationResult {
        let targets = python_targets(paths);
        if targets.is_empty() {
            return ValidationResult::passed();
        }
        let files = relative_args(ctx, &targets);

        let mut args = vec!["--output".to_owned(), "json".to_owned()];
        args.extend(files.iter().cloned());
        let mut output = match run_tool(ctx, MYPY, &args).await {
            Ok(output) => output,
            Err(reason) => return skipped(reason),
        };

        if output.stderr.contains("unrecognized arguments") {
            tracing::debug!("mypy predates json output, rerunning in text mode");
            let mut args = vec![
                "--show-column-numbers".to_owned(),
                "--no-error-summary".to_owned(),
            ];
            args.extend(files);
            output = match run_tool(ctx, MYPY, &args).await {
                Ok(output) => output,
                Err(reason) => return skipped(reason),
            };
        }
        if output.exit_code.is_some_and(|code| code > 1) {
            tracing::warn!(stderr = %output.stderr.trim(), "mypy failed");
            return skipped(format!("{MYPY}: exited with error"));
        }

        let findings = parse_mypy(&output.stdout);
        classify(
            findings
                .into_iter()
                .map(|finding| finding.into_error(ctx))
                .collect(),
        )
    }
}

pub struct SecurityScanner;

#[async_trait]
impl Validator for SecurityScanner {
    fn name(&self) -> &'static str {
        ValidatorKind::SecurityScanner.as_str()
    }

    async fn validate(&self, ctx: &RunContext, paths: &[PathBuf]) -> ValidationResult {
        let targets = python_targets(paths);
        if targets.is_empty() {
            return ValidationResult::passed();
        }

        let mut args = vec!["-f".to_owned(), "json".to_owned(), "-q".to_owned()];
        args.extend(relative_args(ctx, &targets));
        let output = match run_tool(ctx, BANDIT, &args).await {
            Ok(output) => output,
            Err(reason) => return skipped(reason),
        };
        if output.exit_code.is_some_and(|code| code > 1) {
            tracing::warn!(stderr = %output.stderr.trim(), "bandit failed");
            return skipped(format!("{BANDIT}: exited with error"));
        }

        let findings = parse_bandit_json(&output.stdout)
            .unwrap_or_else(|| parse_bandit_text(&output.stdout));
        classify(
            findings
                .into_iter()
                .map(|finding| finding.into_error(ctx))
                .collect(),
        )
    }
}

/// One validator finding before it is tied to the workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub tool: &'static str,
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub code: String,
    pub message: String,
    pub is_error: bool,
    pub tier: PriorityTier,
}

impl Finding {
    fn into_error(self, ctx: &RunContext) -> (CodeError, bool) {
        let file = ctx.relative(&ctx.absolute(Path::new(&self.file)));
        let error = CodeError::new(
            self.tool,
            file,
            self.line,
            self.column,
            self.code,
            self.message,
            self.tier,
        );
        (error, self.is_error)
    }
}

fn classify(findings: Vec<(CodeError, bool)>) -> ValidationResult {
    let mut result = ValidationResult::passed();
    let mut sorted = ValidationResult::passed();
    for (error, is_error) in findings {
        if is_error {
            sorted.errors.push(error);
        } else {
            sorted.warnings.push(error);
        }
    }
    // merge also drops duplicate keys within one tool's output
    result.merge(sorted);
    result.success = result.errors.is_empty();
    result
}

fn skipped(reason: String) -> ValidationResult {
    ValidationResult {
        skipped: vec![reason],
        ..ValidationResult::passed()
    }
}

fn python_targets(paths: &[PathBuf]) -> Vec<&Path> {
    paths
        .iter()
        .filter(|path| file_kind(path) == Some(FileKind::Python) && path.is_file())
        .map(PathBuf::as_path)
        .collect()
}

pub fn is_syntax_code(code: &str) -> bool {
    SYNTAX_CODES.contains(&code)
}

fn is_lint_warning(code: &str) -> bool {
    LINT_WARNING_PREFIXES.iter().any(|prefix| {
        code.strip_prefix(prefix)
            .is_some_and(|rest| rest.chars().next().is_none_or(|ch| ch.is_ascii_digit()))
    })
}

fn ruff_finding(file: String, line: usize, column: usize, code: String, message: String) -> Finding {
    let syntax = is_syntax_code(&code);
    let is_error = syntax || !is_lint_warning(&code);
    let tier = if syntax {
        PriorityTier::Critical
    } else if is_error {
        PriorityTier::Medium
    } else {
        PriorityTier::Low
    };
    Finding {
        tool: RUFF,
        file,
        line,
        column,
        code,
        message,
        is_error,
        tier,
    }
}

#[derive(Debug, Deserialize)]
struct RuffDiagnostic {
    code: Option<String>,
    message: String,
    filename: String,
    location: RuffLocation,
}

#[derive(Debug, Deserialize)]
struct RuffLocation {
    row: usize,
    column: usize,
}

pub fn parse_ruff_json(stdout: &str) -> Option<Vec<Finding>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Some(Vec::new());
    }
    let diagnostics: Vec<RuffDiagnostic> = serde_json::from_str(trimmed).ok()?;
    Some(
        diagnostics
            .into_iter()
            .map(|diagnostic| {
                let code = diagnostic
                    .code
                    .filter(|code| !code.trim().is_empty())
                    .unwrap_or_else(|| "invalid-syntax".to_owned());
                ruff_finding(
                    diagnostic.filename,
                    diagnostic.location.row,
                    diagnostic.location.column,
                    code,
                    diagnostic.message,
                )
            })
            .collect(),
    )
}

pub fn parse_ruff_text(stdout: &str) -> Vec<Finding> {
    let Some(regex) = RUFF_TEXT_LINE.as_ref() else {
        return Vec::new();
    };
    stdout
        .lines()
        .filter_map(|line| regex.captures(line.trim_end()))
        .filter_map(|captures| {
            Some(ruff_finding(
                captures.name("file")?.as_str().to_owned(),
                captures.name("line")?.as_str().parse().ok()?,
                captures.name("col")?.as_str().parse().ok()?,
                captures.name("code")?.as_str().to_owned(),
                captures.name("msg")?.as_str().to_owned(),
            ))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct MypyDiagnostic {
    file: String,
    line: i64,
    #[serde(default)]
    column: i64,
    message: String,
    #[serde(default)]
    code: Option<String>,
    severity: String,
}

fn mypy_finding(
    file: String,
    line: usize,
    column: usize,
    severity: &str,
    code: Option<String>,
    message: String,
) -> Finding {
    let is_error = severity == "error";
    let code = code
        .filter(|code| !code.is_empty())
        .unwrap_or_else(|| if is_error { "misc" } else { "note" }.to_owned());
    let tier = if is_syntax_code(&code) {
        PriorityTier::Critical
    } else if is_error {
        PriorityTier::High
    } else {
        PriorityTier::Low
    };
    Finding {
        tool: MYPY,
        file,
        line,
        column,
        code,
        message,
        is_error,
        tier,
    }
}

/// Reads mypy's line-delimited JSON, falling back to its text format line by
/// line. Summary and blank lines match neither and are dropped.
pub fn parse_mypy(stdout: &str) -> Vec<Finding> {
    let text_regex = MYPY_TEXT_LINE.as_ref();
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            if line.starts_with('{') {
                let diagnostic: MypyDiagnostic = serde_json::from_str(line).ok()?;
                // JSON columns are zero-based.
                return Some(mypy_finding(
                    diagnostic.file,
                    diagnostic.line.max(1) as usize,
                    (diagnostic.column.max(0) + 1) as usize,
                    &diagnostic.severity,
                    diagnostic.code,
                    diagnostic.message,
                ));
            }
            let captures = text_regex?.captures(line)?;
            Some(mypy_finding(
                captures.name("file")?.as_str().to_owned(),
                captures.name("line")?.as_str().parse().ok()?,
                captures
                    .name("col")
                    .and_then(|col| col.as_str().parse().ok())
                    .unwrap_or(1),
                captures.name("severity")?.as_str(),
                captures.name("code").map(|code| code.as_str().to_owned()),
                captures.name("msg")?.as_str().to_owned(),
            ))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct BanditReport {
    #[serde(default)]
    results: Vec<BanditIssue>,
}

#[derive(Debug, Deserialize)]
struct BanditIssue {
    filename: String,
    line_number: usize,
    #[serde(default)]
    col_offset: usize,
    issue_severity: String,
    issue_confidence: String,
    test_id: String,
    issue_text: String,
}

fn bandit_finding(
    file: String,
    line: usize,
    column: usize,
    code: String,
    message: String,
    severity: &str,
    confidence: &str,
) -> Finding {
    let severity = severity.to_ascii_uppercase();
    let confidence = confidence.to_ascii_uppercase();
    let (is_error, tier) = match (severity.as_str(), confidence.as_str()) {
        ("HIGH", _) => (true, PriorityTier::Critical),
        ("MEDIUM", "HIGH") => (true, PriorityTier::Medium),
        _ => (false, PriorityTier::Low),
    };
    Finding {
        tool: BANDIT,
        file,
        line,
        column,
        code,
        message,
        is_error,
        tier,
    }
}

/// bandit can print progress lines before its JSON document, so parsing
/// starts at the first `{`.
pub fn parse_bandit_json(stdout: &str) -> Option<Vec<Finding>> {
    let start = stdout.find('{')?;
    let report: BanditReport = serde_json::from_str(stdout[start..].trim()).ok()?;
    Some(
        report
            .results
            .into_iter()
            .map(|issue| {
                bandit_finding(
                    issue.filename,
                    issue.line_number,
                    issue.col_offset + 1,
                    issue.test_id,
                    issue.issue_text,
                    &issue.issue_severity,
                    &issue.issue_confidence,
                )
            })
            .collect(),
    )
}

/// Screen-format fallback: an `>> Issue:` line, then severity/confidence,
/// then `Location:` closes the finding.
pub fn parse_bandit_text(stdout: &str) -> Vec<Finding> {
    let (Some(issue_re), Some(severity_re), Some(location_re)) = (
        BANDIT_ISSUE.as_ref(),
        BANDIT_SEVERITY.as_ref(),
        BANDIT_LOCATION.as_ref(),
    ) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    let mut issue: Option<(String, String)> = None;
    let mut rating = ("LOW".to_owned(), "LOW".to_owned());
    for line in stdout.lines() {
        if let Some(captures) = issue_re.captures(line) {
            issue = Some((captures["code"].to_owned(), captures["msg"].trim().to_owned()));
            rating = ("LOW".to_owned(), "LOW".to_owned());
        } else if let Some(captures) = severity_re.captures(line) {
            rating = (captures["severity"].to_owned(), captures["confidence"].to_owned());
        } else if let Some(captures) = location_re.captures(line)
            && let Some((code, message)) = issue.take()
        {
            let Ok(line_number) = captures["line"].parse() else {
                continue;
            };
            let column = captures
                .name("col")
                .and_then(|col| col.as_str().parse().ok())
                .unwrap_or(1);
            findings.push(bandit_finding(
                captures["file"].to_owned(),
                line_number,
                column,
                code,
                message,
                &rating.0,
                &rating.1,
            ));
        }
    }
    findings
}
