//! Stage 3: AI-assisted repair of the errors the free stages left behind.
//!
//! Every batch is backed up before its file is written, re-fixed, syntax
//! checked and re-validated. After the last batch the touched files are
//! validated together; a regression restores all of them.

pub mod apply;
pub mod batching;
pub mod prompt;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use mend_config::check_fix_settings;
use mend_core::{
    AnalysisReport, CodeError, FixResult, PriorityTier, ValidationResult, diff_errors,
};
use mend_infer::{FixRequest, FixResponse, load_provider, response_cost};
use mend_parse::{check_syntax, relocate_imports};
use mend_store::{BackupHandle, EvaluationRecord};
use serde_json::{Value, json};
use tokio::time::timeout;

use crate::context::{ProviderHandle, RunContext};
use crate::fixers::FixerStage;
use crate::validators::ValidatorStage;

pub use apply::{AppliedEdit, apply_replacements, parse_reply};
pub use batching::{Batch, BatchPlan, FilterCounts, plan_batches};
pub use prompt::{ModelSettings, SAFETY_PREAMBLE, build_context, build_prompt, model_settings};

const RETRY_BASE_BACKOFF_MS: u64 = 200;
const RETRY_MAX_BACKOFF_MS: u64 = 2_000;
const IMPORT_AT_TOP_CODE: &str = "E402";

/// The state of a file before stage 3 first wrote to it.
struct Snapshot {
    backup_id: Option<String>,
    original: Vec<u8>,
}

#[derive(Debug, Default)]
struct BatchOutcome {
    applied: bool,
    credited: usize,
    syntax_error: Option<usize>,
    out_of_range: Vec<usize>,
    cost_usd: f64,
}

enum BatchFailure {
    /// Recorded and skipped.
    Recoverable(String),
    /// Aborts the run after restoring touched files.
    Backup(anyhow::Error),
}

pub struct FixOrchestrator<'a> {
    ctx: &'a RunContext,
    provider: Option<ProviderHandle>,
    fixers: FixerStage,
    validators: ValidatorStage,
}

impl<'a> FixOrchestrator<'a> {
    /// Checks the `[ai]` settings and loads the provider. A missing API key
    /// for any provider other than `mock` or `local` is an error here, before
    /// any file is touched. In dry-run no provider is loaded.
    pub fn new(ctx: &'a RunContext) -> Result<Self> {
        check_fix_settings(&ctx.config.ai).context("invalid [ai] settings")?;

        let provider = if ctx.dry_run() {
            None
        } else if let Some(provider) = ctx.provider.clone() {
            Some(provider)
        } else {
            let loaded = load_provider(&ctx.config.ai, ctx.provider_overrides.clone())
                .context("failed to load inference provider")?;
            Some(ProviderHandle::from(loaded))
        };

        Ok(Self {
            ctx,
            provider,
            fixers: FixerStage::default(),
            validators: ValidatorStage::default(),
        })
    }

    pub fn with_stages(mut self, fixers: FixerStage, validators: ValidatorStage) -> Self {
        self.fixers = fixers;
        self.validators = validators;
        self
    }

    pub async fn fix(
        &self,
        validation: &ValidationResult,
        report: Option<&AnalysisReport>,
    ) -> Result<FixResult> {
        let started = Instant::now();
        let plan = plan_batches(validation, report, &self.ctx.config.ai);

        let mut result = FixResult::noop();
        result.set_detail("filtered", json!(plan.filtered));
        result.set_detail("batches_planned", plan.batches.len());

        if plan.is_empty() {
            tracing::info!("no errors eligible for AI repair");
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(result);
        }

        if self.ctx.dry_run() {
            result.set_detail("dry_run", true);
            result.set_detail("planned", Value::Array(self.preview(&plan)));
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(result);
        }

        let Some(provider) = self.provider.as_ref() else {
            return Err(anyhow!("no inference provider available for stage 3"));
        };

        let mut snapshots: BTreeMap<String, Snapshot> = BTreeMap::new();
        let mut current: BTreeMap<String, Vec<CodeError>> = BTreeMap::new();
        let mut failures: Vec<Value> = Vec::new();
        let mut syntax_failures: Vec<Value> = Vec::new();
        let mut out_of_range: Vec<Value> = Vec::new();
        let mut applied_batches = 0usize;
        let mut credited = 0usize;
        let mut cost_usd = 0.0;

        for batch in &plan.batches {
            let before = current
                .entry(batch.file.clone())
                .or_insert_with(|| {
                    validation
                        .errors_for_file(&batch.file)
                        .into_iter()
                        .cloned()
                        .collect()
                })
                .clone();

            match self
                .process_batch(provider, batch, &before, &mut snapshots, &mut current)
                .await
            {
                Ok(outcome) => {
                    cost_usd += outcome.cost_usd;
                    if outcome.applied {
                        applied_batches += 1;
                        credited += outcome.credited;
                        result.record_change(&batch.file);
                    }
                    if let Some(line) = outcome.syntax_error {
                        syntax_failures.push(json!({
                            "batch_index": batch.index,
                            "file": batch.file,
                            "line": line,
                        }));
                    }
                    if !outcome.out_of_range.is_empty() {
                        out_of_range.push(json!({
                            "batch_index": batch.index,
                            "lines": outcome.out_of_range,
                        }));
                    }
                }
                Err(BatchFailure::Recoverable(message)) => {
                    tracing::warn!(
                        batch_index = batch.index,
                        file = %batch.file,
                        error = %message,
                        "stage 3 batch failed"
                    );
                    failures.push(json!({
                        "batch_index": batch.index,
                        "error": message,
                        "batch_size": batch.errors.len(),
                    }));
                }
                Err(BatchFailure::Backup(err)) => {
                    if let Err(restore_err) = self.restore(&snapshots) {
                        tracing::error!(error = %restore_err, "failed to restore files after backup failure");
                    }
                    self.record_metrics(started, 0, cost_usd, false, Some(err.to_string()));
                    return Err(err.context(format!("backup before batch {} failed", batch.index)));
                }
            }
        }

        result.errors_fixed = credited;
        let mut regressed = false;
        if applied_batches > 0 {
            let touched: Vec<String> = snapshots.keys().cloned().collect();
            let baseline: Vec<&CodeError> = touched
                .iter()
                .flat_map(|file| validation.errors_for_file(file))
                .collect();
            let paths: Vec<PathBuf> = touched.iter().map(PathBuf::from).collect();
            let final_validation = self.validators.validate(self.ctx, &paths).await;

            if let Some(reason) = regression(&baseline, &final_validation) {
                regressed = true;
                tracing::warn!(reason = %reason, files = touched.len(), "stage 3 regressed, rolling back");
                result.set_detail("regression", reason);
                if let Err(err) = self.restore(&snapshots) {
                    tracing::error!(error = %err, "rollback after regression failed");
                    result.set_detail("rollback_error", err.to_string());
                }
                result.set_detail("rolled_back", true);
                result.errors_fixed = 0;
            }
            result.set_detail("final_errors", final_validation.errors.len());
            result.set_detail("baseline_errors", baseline.len());
        }

        result.success = result.errors_fixed > 0 && !regressed;
        result.set_detail("batches_applied", applied_batches);
        result.set_detail("cost_usd", cost_usd);
        result.set_detail(
            "partial_success",
            applied_batches > 0 && (!failures.is_empty() || !syntax_failures.is_empty()),
        );
        if !failures.is_empty() {
            result.set_detail("failed_batches", Value::Array(failures));
        }
        if !syntax_failures.is_empty() {
            result.set_detail("syntax_errors", Value::Array(syntax_failures));
        }
        if !out_of_range.is_empty() {
            result.set_detail("out_of_range", Value::Array(out_of_range));
        }
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        self.record_metrics(started, result.errors_fixed, cost_usd, result.success, None);
        Ok(result)
    }

    async fn process_batch(
        &self,
        provider: &ProviderHandle,
        batch: &Batch,
        before: &[CodeError],
        snapshots: &mut BTreeMap<String, Snapshot>,
        current: &mut BTreeMap<String, Vec<CodeError>>,
    ) -> Result<BatchOutcome, BatchFailure> {
        let path = self.ctx.absolute(Path::new(&batch.file));
        let source = fs::read_to_string(&path)
            .map_err(|err| BatchFailure::Recoverable(format!("failed to read {}: {err}", batch.file)))?;

        let ai = &self.ctx.config.ai;
        let context = build_context(&path, &source, batch, ai.context_lines);
        let prompt = build_prompt(batch, &context);
        let settings = model_settings(batch, ai, &provider.model_name);
        let request = FixRequest {
            system: SAFETY_PREAMBLE.to_owned(),
            prompt,
            model: settings.model.clone(),
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
        };

        let response = self
            .complete_with_retry(provider, &request)
            .await
            .map_err(BatchFailure::Recoverable)?;
        let mut outcome = BatchOutcome {
            cost_usd: response_cost(&settings.model, response.input_tokens, response.output_tokens),
            ..BatchOutcome::default()
        };

        let entries = parse_reply(&response.text);
        if entries.is_empty() {
            tracing::info!(batch_index = batch.index, file = %batch.file, "reply contained no edits");
            self.record_evaluation(batch, &settings, &request, &response, before, before, false);
            return Ok(outcome);
        }

        let edit = apply_replacements(&source, &entries);
        outcome.out_of_range = edit.out_of_range.clone();
        let mut updated = edit.text;
        let relocate_lines: Vec<usize> = batch
            .errors
            .iter()
            .filter(|error| error.code == IMPORT_AT_TOP_CODE)
            .map(|error| error.line)
            .collect();
        if !relocate_lines.is_empty() {
            let roots = local_module_roots(&self.ctx.workspace_root);
            let roots: Vec<&str> = roots.iter().map(String::as_str).collect();
            match relocate_imports(&updated, &relocate_lines, &roots) {
                Ok(relocated) => updated = relocated,
                Err(err) => {
                    tracing::warn!(file = %batch.file, error = %err, "import relocation failed")
                }
            }
        }

        if updated == source {
            tracing::info!(batch_index = batch.index, file = %batch.file, "reply left the file unchanged");
            self.record_evaluation(batch, &settings, &request, &response, before, before, false);
            return Ok(outcome);
        }

        let handle = self
            .ctx
            .backups
            .create(std::slice::from_ref(&path), &format!("stage3_batch_{}", batch.index))
            .map_err(|err| BatchFailure::Backup(anyhow::Error::new(err)))?;
        snapshots.entry(batch.file.clone()).or_insert_with(|| Snapshot {
            backup_id: match handle {
                BackupHandle::Created(id) => Some(id),
                BackupHandle::Disabled => None,
            },
            original: source.clone().into_bytes(),
        });

        fs::write(&path, &updated)
            .map_err(|err| BatchFailure::Recoverable(format!("failed to write {}: {err}", batch.file)))?;
        outcome.applied = true;

        self.fixers.run(self.ctx, std::slice::from_ref(&path)).await;

        let fixed_source = fs::read_to_string(&path).unwrap_or(updated);
        match check_syntax(&path, &fixed_source) {
            Ok(report) if !report.valid => {
                let line = report.error_line.unwrap_or(0);
                tracing::warn!(file = %batch.file, line, "edit left a syntax error");
                outcome.syntax_error = Some(line);
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(file = %batch.file, error = %err, "syntax check unavailable"),
        }

        let after = self
            .validators
            .validate(self.ctx, std::slice::from_ref(&path))
            .await;
        let after_errors: Vec<CodeError> = after
            .errors_for_file(&batch.file)
            .into_iter()
            .cloned()
            .collect();

        if self.validators.verified(&after) {
            let diff = diff_errors(before, &after_errors);
            let own: BTreeSet<(usize, String)> = batch.errors.iter().map(CodeError::location).collect();
            outcome.credited = diff.fixed.iter().filter(|fixed| own.contains(*fixed)).count();
            current.insert(batch.file.clone(), after_errors.clone());
        } else {
            tracing::warn!(file = %batch.file, "no validator ran, fixes are not credited");
        }

        self.record_evaluation(
            batch,
            &settings,
            &request,
            &response,
            before,
            &after_errors,
            outcome.credited > 0,
        );
        Ok(outcome)
    }

    async fn complete_with_retry(
        &self,
        provider: &ProviderHandle,
        request: &FixRequest,
    ) -> Result<FixResponse, String> {
        let ai = &self.ctx.config.ai;
        let limit = Duration::from_secs(ai.timeout_secs.max(1));
        let total_attempts = ai.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..total_attempts {
            match timeout(limit, provider.provider.complete(request)).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => {
                    last_error = format!("inference timed out after {}s", limit.as_secs())
                }
            }

            if attempt + 1 < total_attempts {
                let backoff_ms = (RETRY_BASE_BACKOFF_MS << attempt).min(RETRY_MAX_BACKOFF_MS);
                tracing::debug!(attempt, backoff_ms, error = %last_error, "retrying inference");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        Err(last_error)
    }

    fn preview(&self, plan: &BatchPlan) -> Vec<Value> {
        let ai = &self.ctx.config.ai;
        let default_model = self
            .ctx
            .provider_overrides
            .model
            .clone()
            .or_else(|| ai.model.clone())
            .unwrap_or_else(|| "unset".to_owned());
        plan.batches
            .iter()
            .map(|batch| {
                let path = self.ctx.absolute(Path::new(&batch.file));
                let source = fs::read_to_string(&path).unwrap_or_default();
                let context = build_context(&path, &source, batch, ai.context_lines);
                json!({
                    "batch_index": batch.index,
                    "file": batch.file,
                    "codes": batch.codes(),
                    "lines": batch.lines(),
                    "settings": model_settings(batch, ai, &default_model),
                    "prompt": build_prompt(batch, &context),
                })
            })
            .collect()
    }

    /// Puts every touched file back to its state before stage 3. Files with
    /// a backup are restored from it; the rest from memory.
    fn restore(&self, snapshots: &BTreeMap<String, Snapshot>) -> Result<()> {
        let mut failures = Vec::new();
        for (file, snapshot) in snapshots {
            let restored = match snapshot.backup_id.as_deref() {
                Some(id) => match self.ctx.backups.rollback(id) {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(anyhow!("backup {id} not found")),
                    Err(err) => Err(anyhow::Error::new(err)),
                },
                None => fs::write(self.ctx.absolute(Path::new(file)), &snapshot.original)
                    .with_context(|| format!("failed to rewrite {file}")),
            };
            if let Err(err) = restored {
                tracing::error!(file = %file, error = %err, "restore failed");
                failures.push(format!("{file}: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_evaluation(
        &self,
        batch: &Batch,
        settings: &ModelSettings,
        request: &FixRequest,
        response: &FixResponse,
        before: &[CodeError],
        after: &[CodeError],
        success: bool,
    ) {
        let Some(store) = self.ctx.evaluations.as_ref() else {
            return;
        };
        let diff = diff_errors(before, after);
        let record = EvaluationRecord {
            run_id: self.ctx.run_id.clone(),
            batch_index: batch.index,
            file: batch.file.clone(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            top_p: settings.top_p,
            max_tokens: settings.max_tokens,
            prompt: request.prompt.clone(),
            response: response.text.clone(),
            before: before.iter().map(CodeError::location).collect(),
            after: after.iter().map(CodeError::location).collect(),
            fixed: diff.fixed,
            remaining: diff.remaining,
            introduced: diff.introduced,
            success,
            created_at: Utc::now(),
        };
        if let Err(err) = store.record(&record) {
            tracing::warn!(batch_index = batch.index, error = %err, "failed to persist evaluation record");
        }
    }

    fn record_metrics(
        &self,
        started: Instant,
        errors_fixed: usize,
        cost_usd: f64,
        success: bool,
        error: Option<String>,
    ) {
        self.ctx.metrics().record_stage3(
            &self.ctx.run_id,
            started,
            json!({ "errors_fixed": errors_fixed, "cost_usd": cost_usd }),
            success,
            error,
        );
    }
}

/// Why the final state is worse than the state before stage 3, if it is:
/// more errors on the touched files, or more critical-tier errors of some
/// `(file, code)` than before. Critical findings are counted, not located,
/// so edits that shift lines do not make an existing finding look new.
pub fn regression(baseline: &[&CodeError], after: &ValidationResult) -> Option<String> {
    if after.errors.len() > baseline.len() {
        return Some(format!(
            "error count rose from {} to {}",
            baseline.len(),
            after.errors.len()
        ));
    }

    let before = critical_counts(baseline.iter().copied());
    let now = critical_counts(after.errors.iter());
    now.into_iter().find_map(|((file, code), count)| {
        let prior = before.get(&(file.clone(), code.clone())).copied().unwrap_or(0);
        (count > prior).then(|| {
            format!("new critical error {code} in {file} ({prior} before, {count} after)")
        })
    })
}

fn critical_counts<'e>(
    errors: impl Iterator<Item = &'e CodeError>,
) -> BTreeMap<(String, String), usize> {
    let mut counts = BTreeMap::new();
    for error in errors.filter(|error| error.tier == PriorityTier::Critical) {
        *counts
            .entry((error.file.clone(), error.code.clone()))
            .or_insert(0) += 1;
    }
    counts
}

/// Top-level packages (directories with `__init__.py`) and modules of the
/// workspace, used to classify imports as local.
pub fn local_module_roots(workspace_root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(workspace_root) else {
        return Vec::new();
    };
    let mut roots: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.is_dir() && path.join("__init__.py").is_file() {
                path.file_name()?.to_str().map(str::to_owned)
            } else if path.extension().is_some_and(|ext| ext == "py") {
                path.file_stem()?.to_str().map(str::to_owned)
            } else {
                None
            }
        })
        .collect();
    roots.sort();
    roots
}
