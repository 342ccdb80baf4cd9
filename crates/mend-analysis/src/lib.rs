mod grouping;
mod risk;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use mend_core::{AnalysisReport, CodeError, ErrorGroup, ErrorKey, GroupType, RiskLevel, ValidationResult};
use thiserror::Error;

pub use grouping::{
    CandidateGroup, GroupingThresholds, candidate_groups, group_by_context, group_by_file,
    group_by_type,
};
pub use risk::{IMPORT_ORDER_CODES, category_for, is_import_order_code, risk_for_code, risk_for_error};

pub const REPORT_TEXT_FILE: &str = "analysis_report.txt";
pub const REPORT_JSON_FILE: &str = "analysis_report.json";
const TOP_RECOMMENDATIONS: usize = 5;
const ESCALATION_THRESHOLD: usize = 50;
const TYPE_GROUP_BONUS: f64 = 1.2;
const IMPORT_ORDER_BONUS: f64 = 1.5;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Groups raw validator errors and scores each group for risk, priority,
/// confidence and cost. Analysis is pure; persisting the report is a
/// separate step.
#[derive(Debug, Clone, Default)]
pub struct ErrorAnalyzer {
    thresholds: GroupingThresholds,
}

impl ErrorAnalyzer {
    pub fn new(thresholds: GroupingThresholds) -> Self {
        Self { thresholds }
    }

    pub fn analyze(&self, validation: &ValidationResult) -> AnalysisReport {
        let errors = &validation.errors;

        let mut groups: Vec<ErrorGroup> = candidate_groups(errors, self.thresholds)
            .into_iter()
            .map(score_group)
            .collect();
        groups.sort_by(|left, right| {
            right
                .priority
                .cmp(&left.priority)
                .then(left.risk.cmp(&right.risk))
                .then(left.group_type.cmp(&right.group_type))
                .then(left.key.cmp(&right.key))
        });

        let filtered: BTreeSet<ErrorKey> = groups
            .iter()
            .filter(|group| group.risk != RiskLevel::Critical)
            .flat_map(|group| group.errors.iter().map(CodeError::key))
            .collect();

        let mut category_summary: BTreeMap<String, usize> = BTreeMap::new();
        let mut risk_summary: BTreeMap<RiskLevel, usize> = BTreeMap::new();
        for error in errors {
            *category_summary
                .entry(category_for(error).to_owned())
                .or_default() += 1;
            *risk_summary.entry(risk_for_error(error)).or_default() += 1;
        }

        let total_cost = groups
            .iter()
            .filter(|group| group.risk != RiskLevel::Critical)
            .map(|group| group.estimated_cost)
            .sum();

        let grouped_errors: usize = groups.iter().map(ErrorGroup::len).sum();
        let confidence = if grouped_errors == 0 {
            0.0
        } else {
            groups
                .iter()
                .map(|group| group.confidence * group.len() as f64)
                .sum::<f64>()
                / grouped_errors as f64
        };

        let recommendations = groups
            .iter()
            .take(TOP_RECOMMENDATIONS)
            .map(recommendation_for)
            .collect();

        tracing::debug!(
            total_errors = errors.len(),
            groups = groups.len(),
            filtered = filtered.len(),
            "error analysis complete"
        );

        AnalysisReport {
            total_errors: errors.len(),
            filtered_errors: filtered.len(),
            groups,
            category_summary,
            risk_summary,
            recommendations,
            total_cost,
            confidence,
        }
    }
}

pub fn score_group(candidate: CandidateGroup) -> ErrorGroup {
    let CandidateGroup {
        group_type,
        key,
        errors,
    } = candidate;

    let mut risk = errors
        .iter()
        .map(risk_for_error)
        .max()
        .unwrap_or(RiskLevel::Low);
    if group_type == GroupType::File && errors.len() > ESCALATION_THRESHOLD {
        risk = risk.escalate();
    }

    let count = errors.len();
    let base = (count * 10).min(100) as f64;
    let mut score = base * risk.priority_multiplier();
    if group_type == GroupType::Type {
        score *= TYPE_GROUP_BONUS;
    }
    if errors.iter().any(|error| is_import_order_code(&error.code)) {
        score *= IMPORT_ORDER_BONUS;
    }

    ErrorGroup {
        group_type,
        key,
        risk,
        priority: score.round() as u32,
        confidence: risk.fix_confidence(),
        estimated_cost: risk.per_error_cost() * count as f64,
        errors,
    }
}

fn recommendation_for(group: &ErrorGroup) -> String {
    let codes = group.codes().join(", ");
    if group.risk == RiskLevel::Critical {
        return format!(
            "Review {} group '{}' manually ({} error(s), codes: {codes}); critical risk is never auto-fixed",
            group.group_type.as_str(),
            group.key,
            group.len()
        );
    }
    format!(
        "Fix {} error(s) in {} group '{}' (codes: {codes}; {} risk, confidence {:.2}, est. ${:.3})",
        group.len(),
        group.group_type.as_str(),
        group.key,
        group.risk.as_str(),
        group.confidence,
        group.estimated_cost
    )
}

/// Writes the text and JSON renderings of `report` into `dir`.
pub fn write_report(report: &AnalysisReport, dir: &Path) -> Result<(PathBuf, PathBuf), AnalysisError> {
    fs::create_dir_all(dir)?;
    let text_path = dir.join(REPORT_TEXT_FILE);
    let json_path = dir.join(REPORT_JSON_FILE);
    fs::write(&text_path, report.render_text())?;
    fs::write(&json_path, serde_json::to_string_pretty(report)?)?;
    Ok((text_path, json_path))
}

#[cfg(test)]
mod tests {
    use mend_core::PriorityTier;
    use tempfile::tempdir;

    use super::*;

    fn error(file: &str, line: usize, code: &str) -> CodeError {
        CodeError::new("ruff", file, line, 1, code, "msg", PriorityTier::Medium)
    }

    fn candidate(group_type: GroupType, errors: Vec<CodeError>) -> CandidateGroup {
        CandidateGroup {
            group_type,
            key: "k".to_owned(),
            errors,
        }
    }

    #[test]
    fn group_risk_is_max_of_members() {
        let group = score_group(candidate(
            GroupType::Context,
            vec![error("a.py", 1, "E501"), error("a.py", 2, "F811"), error("a.py", 3, "F401")],
        ));
        assert_eq!(group.risk, RiskLevel::High);
        assert_eq!(group.confidence, 0.5);
    }

    #[test]
    fn large_file_groups_escalate_one_tier() {
        let errors: Vec<CodeError> = (1..=51).map(|line| error("a.py", line, "E501")).collect();
        let group = score_group(candidate(GroupType::File, errors.clone()));
        assert_eq!(group.risk, RiskLevel::Medium);

        let fifty = score_group(candidate(GroupType::File, errors[..50].to_vec()));
        assert_eq!(fifty.risk, RiskLevel::Low);

        let by_type = score_group(candidate(GroupType::Type, errors));
        assert_eq!(by_type.risk, RiskLevel::Low);
    }

    #[test]
    fn priority_applies_multipliers() {
        let low_file = score_group(candidate(
            GroupType::File,
            vec![error("a.py", 1, "E501"), error("a.py", 2, "E501"), error("a.py", 3, "E501")],
        ));
        assert_eq!(low_file.priority, 60);

        let type_group = score_group(candidate(
            GroupType::Type,
            (1..=5).map(|line| error("a.py", line, "E501")).collect(),
        ));
        assert_eq!(type_group.priority, 120);

        let imports = score_group(candidate(
            GroupType::File,
            vec![error("a.py", 1, "E402"), error("a.py", 2, "E501"), error("a.py", 3, "E501")],
        ));
        assert_eq!(imports.priority, 90);

        let critical = score_group(candidate(
            GroupType::File,
            vec![error("a.py", 1, "E999"), error("a.py", 2, "E501"), error("a.py", 3, "E501")],
        ));
        assert_eq!(critical.priority, 0);
        assert_eq!(critical.estimated_cost, 0.0);
    }

    #[test]
    fn cost_grows_with_group_size_at_equal_risk() {
        let small = score_group(candidate(
            GroupType::Type,
            (1..=5).map(|line| error("a.py", line, "F821")).collect(),
        ));
        let large = score_group(candidate(
            GroupType::Type,
            (1..=9).map(|line| error("a.py", line, "F821")).collect(),
        ));
        assert_eq!(small.risk, large.risk);
        assert!(large.estimated_cost >= small.estimated_cost);
    }

    #[test]
    fn analyze_ranks_groups_and_summarizes() {
        let mut errors = vec![
            error("a.py", 1, "X100"),
            error("a.py", 2, "X100"),
            error("a.py", 3, "Y100"),
            error("a.py", 4, "Y100"),
            error("b.py", 1, "X100"),
            error("b.py", 2, "Y100"),
        ];
        errors.extend((10..15).map(|line| error("c.py", line * 30, "E501")));
        let validation = ValidationResult {
            success: false,
            errors,
            ..ValidationResult::default()
        };

        let report = ErrorAnalyzer::default().analyze(&validation);

        assert_eq!(report.total_errors, 11);
        let keys: Vec<(GroupType, &str)> = report
            .groups
            .iter()
            .map(|group| (group.group_type, group.key.as_str()))
            .collect();
        assert!(keys.contains(&(GroupType::File, "a.py")));
        assert!(!keys.contains(&(GroupType::File, "b.py")));
        assert!(keys.contains(&(GroupType::File, "c.py")));
        assert!(keys.contains(&(GroupType::Type, "E501")));
        assert!(!keys.contains(&(GroupType::Type, "X100")));

        assert_eq!(report.groups[0].group_type, GroupType::Type);
        assert_eq!(report.groups[0].key, "E501");
        assert!(report.groups.windows(2).all(|pair| pair[0].priority >= pair[1].priority));

        assert_eq!(report.filtered_errors, 5);
        assert_eq!(report.risk_summary.get(&RiskLevel::Critical), Some(&6));
        assert_eq!(report.risk_summary.get(&RiskLevel::Low), Some(&5));
        assert!(report.recommendations.len() <= 5);
        assert!(report.recommendations[0].starts_with("Fix 5 error(s) in type group 'E501'"));
    }

    #[test]
    fn analyze_with_no_errors_yields_empty_report() {
        let report = ErrorAnalyzer::default().analyze(&ValidationResult::passed());
        assert_eq!(report.total_errors, 0);
        assert!(report.groups.is_empty());
        assert_eq!(report.confidence, 0.0);
    }

    #[test]
    fn write_report_emits_text_and_json() {
        let temp = tempdir().expect("tempdir");
        let report = ErrorAnalyzer::default().analyze(&ValidationResult {
            success: false,
            errors: (1..=3).map(|line| error("a.py", line, "F401")).collect(),
            ..ValidationResult::default()
        });

        let (text, json) = write_report(&report, &temp.path().join("reports")).expect("write");
        assert!(fs::read_to_string(text).expect("text").contains("ERROR ANALYSIS REPORT"));
        let parsed: AnalysisReport =
            serde_json::from_str(&fs::read_to_string(json).expect("json")).expect("parse");
        assert_eq!(parsed.total_errors, 3);
    }
}
