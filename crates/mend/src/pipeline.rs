use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use mend_core::{AnalysisReport, FixResult, ValidationResult};
use serde::Serialize;
use serde_json::{Value, json};

use crate::context::RunContext;
use crate::fixers::FixerStage;
use crate::orchestrator::FixOrchestrator;
use crate::validators::ValidatorStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Stage1,
    Stage2,
    Analyzed,
    Stage3,
    Done,
    RolledBack,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stage1 => "stage1",
            Self::Stage2 => "stage2",
            Self::Analyzed => "analyzed",
            Self::Stage3 => "stage3",
            Self::Done => "done",
            Self::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::RolledBack)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineOutcome {
    pub states: Vec<PipelineState>,
    pub stage1: Option<FixResult>,
    pub validation: Option<ValidationResult>,
    pub report: Option<AnalysisReport>,
    pub stage3: Option<FixResult>,
    pub summary: FixResult,
}

impl PipelineOutcome {
    pub fn final_state(&self) -> PipelineState {
        self.states.last().copied().unwrap_or(PipelineState::Done)
    }

    pub fn visited(&self, state: PipelineState) -> bool {
        self.states.contains(&state)
    }
}

/// Drives `Stage1 -> Stage2 -> Analyzed -> Stage3 -> Done | RolledBack`,
/// skipping disabled stages without reordering them.
pub async fn run_pipeline(ctx: &RunContext, paths: &[PathBuf]) -> Result<PipelineOutcome> {
    let pipeline = &ctx.config.pipeline;
    let mut outcome = PipelineOutcome::default();
    // settings and credentials are checked before stage 1 writes anything
    let orchestrator = if pipeline.enable_stage3 {
        Some(FixOrchestrator::new(ctx)?)
    } else {
        None
    };

    if pipeline.enable_stage1 {
        outcome.states.push(PipelineState::Stage1);
        let started = Instant::now();
        let result = FixerStage::default().run(ctx, paths).await;
        tracing::info!(
            files_changed = result.files_changed.len(),
            errors_fixed = result.errors_fixed,
            "stage 1 complete"
        );
        ctx.metrics().record_stage1(
            &ctx.run_id,
            started,
            json!({
                "errors_fixed": result.errors_fixed,
                "files_changed": result.files_changed.len(),
                "iterations": result.detail("iterations").cloned().unwrap_or(Value::Null),
            }),
            result.success,
            None,
        );
        outcome.stage1 = Some(result);
    }

    if pipeline.enable_stage2 {
        outcome.states.push(PipelineState::Stage2);
        let (validation, report) = ValidatorStage::default().run(ctx, paths).await;
        tracing::info!(
            errors = validation.errors.len(),
            warnings = validation.warnings.len(),
            "stage 2 complete"
        );
        if report.is_some() {
            outcome.states.push(PipelineState::Analyzed);
        }
        outcome.validation = Some(validation);
        outcome.report = report;
    }

    let has_errors = outcome
        .validation
        .as_ref()
        .is_some_and(ValidationResult::has_errors);
    let mut final_state = PipelineState::Done;
    if let Some(orchestrator) = orchestrator.as_ref()
        && has_errors
    {
        outcome.states.push(PipelineState::Stage3);
        let validation = outcome.validation.as_ref().cloned().unwrap_or_default();
        let stage3 = match orchestrator.fix(&validation, outcome.report.as_ref()).await {
            Ok(result) => result,
            Err(err) => {
                save_metrics(ctx);
                return Err(err);
            }
        };
        if stage3.detail("rolled_back").and_then(Value::as_bool) == Some(true) {
            final_state = PipelineState::RolledBack;
        }
        tracing::info!(
            errors_fixed = stage3.errors_fixed,
            files_changed = stage3.files_changed.len(),
            rolled_back = final_state == PipelineState::RolledBack,
            "stage 3 complete"
        );
        if ctx.backups.enabled() && !ctx.dry_run() {
            match ctx.backups.cleanup() {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "expired backups removed"),
                Err(err) => tracing::warn!(error = %err, "backup cleanup failed"),
            }
        }
        outcome.stage3 = Some(stage3);
    }
    outcome.states.push(final_state);

    outcome.summary = summarize(&outcome);
    save_metrics(ctx);
    Ok(outcome)
}

fn summarize(outcome: &PipelineOutcome) -> FixResult {
    let mut summary = FixResult::noop();
    let mut elapsed = 0;
    for stage in [outcome.stage1.as_ref(), outcome.stage3.as_ref()]
        .into_iter()
        .flatten()
    {
        summary.absorb(stage);
        elapsed += stage.elapsed_ms;
    }
    if let Some(validation) = outcome.validation.as_ref() {
        elapsed += validation.elapsed_ms;
        summary.set_detail("errors_found", validation.errors.len());
        summary.set_detail("warnings_found", validation.warnings.len());
        if !validation.skipped.is_empty() {
            summary.set_detail("validators_skipped", json!(validation.skipped));
        }
    }
    if let Some(report) = outcome.report.as_ref() {
        summary.set_detail("estimated_cost", report.total_cost);
        summary.set_detail("recommendations", json!(report.recommendations));
    }

    let stage1_ok = outcome.stage1.as_ref().is_none_or(|stage| stage.success);
    let stage3_ok = outcome.stage3.as_ref().is_none_or(|stage| stage.success);
    summary.success = stage1_ok && stage3_ok;
    summary.elapsed_ms = elapsed;
    summary.set_detail("final_state", outcome.final_state().as_str());
    summary.set_detail(
        "states",
        json!(outcome.states.iter().map(|state| state.as_str()).collect::<Vec<_>>()),
    );
    if let Some(stage3) = outcome.stage3.as_ref() {
        summary.set_detail("stage3", json!(stage3.details));
    }
    summary
}

fn save_metrics(ctx: &RunContext) {
    if let Err(err) = ctx.save_metrics() {
        tracing::warn!(error = %err, "failed to save metrics");
    }
}
