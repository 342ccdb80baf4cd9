use std::collections::BTreeSet;

use mend_analysis::risk_for_error;
use mend_config::AiConfig;
use mend_core::{AnalysisReport, CodeError, ErrorKey, RiskLevel, ValidationResult};
use serde::Serialize;

/// Errors from one file sent to the model in a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub file: String,
    pub errors: Vec<CodeError>,
}

impl Batch {
    pub fn codes(&self) -> Vec<&str> {
        let mut codes = Vec::new();
        for error in &self.errors {
            if !codes.contains(&error.code.as_str()) {
                codes.push(error.code.as_str());
            }
        }
        codes
    }

    pub fn lines(&self) -> Vec<usize> {
        self.errors.iter().map(|error| error.line).collect()
    }
}

/// How many errors each filter held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FilterCounts {
    pub critical: usize,
    pub low_confidence: usize,
    pub denied: usize,
    pub duplicate: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    pub filtered: FilterCounts,
}

impl BatchPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.batches.iter().map(|batch| batch.errors.len()).sum()
    }
}

/// Builds the stage-3 work list. With a report, ranked groups go first and
/// errors no group claimed follow in tier order; without one, every error is
/// ordered by `(tier, file, line)`. Critical-risk errors are never scheduled,
/// nor is anything whose group or own risk confidence is below
/// `ai.min_confidence`. A `(file, line, code)` key is scheduled at most once.
pub fn plan_batches(
    validation: &ValidationResult,
    report: Option<&AnalysisReport>,
    ai: &AiConfig,
) -> BatchPlan {
    let batch_size = ai.batch_size.max(1);
    let mut plan = BatchPlan::default();
    let mut scheduled: BTreeSet<ErrorKey> = BTreeSet::new();
    let mut held_back: BTreeSet<ErrorKey> = BTreeSet::new();

    if let Some(report) = report {
        for group in &report.groups {
            // members stay eligible through other groups; critical errors
            // themselves are dropped below
            if group.risk == RiskLevel::Critical {
                continue;
            }
            if group.confidence < ai.min_confidence {
                for error in &group.errors {
                    if held_back.insert(error.key()) {
                        plan.filtered.low_confidence += 1;
                    }
                }
                continue;
            }
            let selected = select(
                &group.errors,
                ai,
                &mut scheduled,
                &mut held_back,
                &mut plan.filtered,
            );
            push_batches(&mut plan.batches, selected, batch_size);
        }
    }

    let mut remaining: Vec<&CodeError> = validation
        .errors
        .iter()
        .filter(|error| !scheduled.contains(&error.key()))
        .filter(|error| !held_back.contains(&error.key()))
        .filter(|error| risk_for_error(error) != RiskLevel::Critical)
        .collect();
    remaining.retain(|error| {
        if risk_for_error(error).fix_confidence() >= ai.min_confidence {
            return true;
        }
        if held_back.insert(error.key()) {
            plan.filtered.low_confidence += 1;
        }
        false
    });
    remaining.sort_by(|left, right| {
        left.tier
            .cmp(&right.tier)
            .then_with(|| left.file.cmp(&right.file))
            .then(left.line.cmp(&right.line))
    });
    let owned: Vec<CodeError> = remaining.into_iter().cloned().collect();
    let selected = select(
        &owned,
        ai,
        &mut scheduled,
        &mut held_back,
        &mut plan.filtered,
    );
    push_batches(&mut plan.batches, selected, batch_size);

    plan.filtered.critical = validation
        .errors
        .iter()
        .filter(|error| !scheduled.contains(&error.key()))
        .filter(|error| risk_for_error(error) == RiskLevel::Critical)
        .count();

    for (index, batch) in plan.batches.iter_mut().enumerate() {
        batch.index = index;
    }
    plan
}

fn select(
    errors: &[CodeError],
    ai: &AiConfig,
    scheduled: &mut BTreeSet<ErrorKey>,
    held_back: &mut BTreeSet<ErrorKey>,
    filtered: &mut FilterCounts,
) -> Vec<CodeError> {
    let mut selected = Vec::new();
    for error in errors {
        if held_back.contains(&error.key()) {
            continue;
        }
        if !ai.is_allowed(&error.code) {
            held_back.insert(error.key());
            filtered.denied += 1;
            continue;
        }
        if !scheduled.insert(error.key()) {
            filtered.duplicate += 1;
            continue;
        }
        selected.push(error.clone());
    }
    selected
}

/// Splits `errors` at file boundaries and at `batch_size`, keeping the first
/// appearance order of files.
fn push_batches(batches: &mut Vec<Batch>, errors: Vec<CodeError>, batch_size: usize) {
    let mut files: Vec<String> = Vec::new();
    for error in &errors {
        if !files.contains(&error.file) {
            files.push(error.file.clone());
        }
    }

    for file in files {
        let mut for_file: Vec<CodeError> = errors
            .iter()
            .filter(|error| error.file == file)
            .cloned()
            .collect();
        for_file.sort_by_key(|error| (error.line, error.column));
        for chunk in for_file.chunks(batch_size) {
            batches.push(Batch {
                index: batches.len(),
                file: file.clone(),
                errors: chunk.to_vec(),
            });
        }
    }
}
