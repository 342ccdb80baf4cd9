use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::CodeError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default, Ord, PartialOrd,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn escalate(self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// Likelihood that an automated fix for this tier is correct. Zero for
    /// `Critical`: those groups are never dispatched.
    pub fn fix_confidence(self) -> f64 {
        match self {
            Self::Low => 0.95,
            Self::Medium => 0.75,
            Self::High => 0.50,
            Self::Critical => 0.0,
        }
    }

    pub fn priority_multiplier(self) -> f64 {
        match self {
            Self::Low => 2.0,
            Self::Medium => 1.5,
            Self::High => 0.8,
            Self::Critical => 0.0,
        }
    }

    /// Estimated AI spend per error in USD.
    pub fn per_error_cost(self) -> f64 {
        match self {
            Self::Low => 0.002,
            Self::Medium => 0.005,
            Self::High => 0.01,
            Self::Critical => 0.0,
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!(
                "invalid risk level '{other}', expected one of: low, medium, high, critical"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    File,
    Type,
    Context,
}

impl GroupType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Type => "type",
            Self::Context => "context",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub group_type: GroupType,
    pub key: String,
    pub errors: Vec<CodeError>,
    pub risk: RiskLevel,
    pub priority: u32,
    pub confidence: f64,
    pub estimated_cost: f64,
}

impl ErrorGroup {
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.errors.iter().map(|error| error.code.as_str()).collect();
        codes.sort_unstable();
        codes.dedup();
        codes
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalysisReport {
    pub total_errors: usize,
    pub filtered_errors: usize,
    pub groups: Vec<ErrorGroup>,
    pub category_summary: BTreeMap<String, usize>,
    pub risk_summary: BTreeMap<RiskLevel, usize>,
    pub recommendations: Vec<String>,
    pub total_cost: f64,
    pub confidence: f64,
}

impl AnalysisReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "ERROR ANALYSIS REPORT");
        let _ = writeln!(out, "=====================");
        let _ = writeln!(
            out,
            "errors: {} total, {} addressable",
            self.total_errors, self.filtered_errors
        );
        let _ = writeln!(out, "groups: {}", self.groups.len());
        let _ = writeln!(out, "estimated cost: ${:.4}", self.total_cost);
        let _ = writeln!(out, "overall confidence: {:.2}", self.confidence);

        let _ = writeln!(out, "\nrisk distribution:");
        for risk in RiskLevel::ALL {
            let count = self.risk_summary.get(&risk).copied().unwrap_or(0);
            let _ = writeln!(out, "  {:<9} {count}", risk.as_str());
        }

        if !self.category_summary.is_empty() {
            let _ = writeln!(out, "\ncategories:");
            for (category, count) in &self.category_summary {
                let _ = writeln!(out, "  {category:<24} {count}");
            }
        }

        if !self.recommendations.is_empty() {
            let _ = writeln!(out, "\nrecommendations:");
            for (index, recommendation) in self.recommendations.iter().enumerate() {
                let _ = writeln!(out, "  {}. {recommendation}", index + 1);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_never_increases_with_risk() {
        let confidences: Vec<f64> = RiskLevel::ALL
            .iter()
            .map(|risk| risk.fix_confidence())
            .collect();

        assert!(confidences.windows(2).all(|pair| pair[0] >= pair[1]));
        assert_eq!(RiskLevel::Critical.fix_confidence(), 0.0);
    }

    #[test]
    fn escalation_saturates_at_critical() {
        assert_eq!(RiskLevel::Low.escalate(), RiskLevel::Medium);
        assert_eq!(RiskLevel::High.escalate(), RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.escalate(), RiskLevel::Critical);
    }

    #[test]
    fn render_text_lists_every_tier() {
        let report = AnalysisReport {
            total_errors: 3,
            filtered_errors: 3,
            recommendations: vec!["Fix 3 errors in a.py".to_owned()],
            ..AnalysisReport::default()
        };

        let text = report.render_text();
        for risk in RiskLevel::ALL {
            assert!(text.contains(risk.as_str()));
        }
        assert!(text.contains("1. Fix 3 errors in a.py"));
    }
}
