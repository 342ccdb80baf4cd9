use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use mend_config::{MetricsConfig, resolve_path};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{StoreError, write_json_atomic};

pub const METRICS_FILE: &str = "metrics.json";

/// Assumed AI spend for one error, used to value fixes made by free stages.
pub const ASSUMED_AI_COST_PER_ERROR: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum MetricStage {
    Stage1,
    Stage2,
    Analysis,
    Stage3,
}

impl MetricStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stage1 => "stage1",
            Self::Stage2 => "stage2",
            Self::Analysis => "analysis",
            Self::Stage3 => "stage3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: MetricStage,
    pub operation_id: String,
    pub payload: Value,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StageSummary {
    pub operations: usize,
    pub successes: usize,
    pub average_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricsSummary {
    pub window_days: u32,
    pub operations: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub stages: BTreeMap<String, StageSummary>,
    pub errors_fixed_free: u64,
    pub errors_fixed_ai: u64,
    pub ai_cost_usd: f64,
    pub estimated_savings_usd: f64,
}

/// Buffers entries for the current session; `save` appends them to the
/// durable log.
#[derive(Debug)]
pub struct MetricsCollector {
    path: PathBuf,
    enabled: bool,
    session: Vec<MetricEntry>,
}

impl MetricsCollector {
    pub fn new(workspace_root: impl AsRef<Path>, config: &MetricsConfig) -> Self {
        Self {
            path: resolve_path(workspace_root, config.path.as_deref(), METRICS_FILE),
            enabled: config.enabled,
            session: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> &[MetricEntry] {
        &self.session
    }

    pub fn record_stage1(
        &mut self,
        operation_id: &str,
        started: Instant,
        payload: Value,
        success: bool,
        error: Option<String>,
    ) {
        self.record(MetricStage::Stage1, operation_id, started, payload, success, error);
    }

    pub fn record_stage2(
        &mut self,
        operation_id: &str,
        started: Instant,
        payload: Value,
        success: bool,
        error: Option<String>,
    ) {
        self.record(MetricStage::Stage2, operation_id, started, payload, success, error);
    }

    pub fn record_stage3(
        &mut self,
        operation_id: &str,
        started: Instant,
        payload: Value,
        success: bool,
        error: Option<String>,
    ) {
        self.record(MetricStage::Stage3, operation_id, started, payload, success, error);
    }

    pub fn record_analysis(&mut self, operation_id: &str, started: Instant, payload: Value) {
        self.record(MetricStage::Analysis, operation_id, started, payload, true, None);
    }

    fn record(
        &mut self,
        stage: MetricStage,
        operation_id: &str,
        started: Instant,
        payload: Value,
        success: bool,
        error: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        self.session.push(MetricEntry {
            timestamp: Utc::now(),
            stage,
            operation_id: operation_id.to_owned(),
            payload,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        });
    }

    /// Appends the session buffer to the log and clears it. Returns the
    /// number of entries written.
    pub fn save(&mut self) -> Result<usize, StoreError> {
        if !self.enabled || self.session.is_empty() {
            self.session.clear();
            return Ok(0);
        }

        let mut log = self.load()?;
        let written = self.session.len();
        log.append(&mut self.session);
        write_json_atomic(&self.path, &log)?;
        tracing::debug!(entries = written, path = %self.path.display(), "metrics saved");
        Ok(written)
    }

    pub fn load(&self) -> Result<Vec<MetricEntry>, StoreError> {
        match fs::read(&self.path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Aggregates the durable log plus unsaved session entries over the last
    /// `days` days.
    pub fn summary(&self, days: u32) -> Result<MetricsSummary, StoreError> {
        self.summary_at(Utc::now(), days)
    }

    fn summary_at(&self, now: DateTime<Utc>, days: u32) -> Result<MetricsSummary, StoreError> {
        let cutoff = now - Duration::days(i64::from(days));
        let mut entries = self.load()?;
        entries.extend(self.session.iter().cloned());
        entries.retain(|entry| entry.timestamp >= cutoff);
        Ok(summarize(&entries, days))
    }
}

pub fn summarize(entries: &[MetricEntry], window_days: u32) -> MetricsSummary {
    let mut summary = MetricsSummary {
        window_days,
        operations: entries.len(),
        ..MetricsSummary::default()
    };
    if entries.is_empty() {
        return summary;
    }

    let mut durations: BTreeMap<String, u64> = BTreeMap::new();
    for entry in entries {
        let stage = summary
            .stages
            .entry(entry.stage.as_str().to_owned())
            .or_default();
        stage.operations += 1;
        stage.successes += usize::from(entry.success);
        *durations.entry(entry.stage.as_str().to_owned()).or_default() += entry.duration_ms;

        let fixed = payload_u64(&entry.payload, "errors_fixed");
        match entry.stage {
            MetricStage::Stage1 => summary.errors_fixed_free += fixed,
            MetricStage::Stage3 => {
                summary.errors_fixed_ai += fixed;
                summary.ai_cost_usd += entry
                    .payload
                    .get("cost_usd")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
            }
            MetricStage::Stage2 | MetricStage::Analysis => {}
        }
    }

    for (name, stage) in &mut summary.stages {
        let total = durations.get(name).copied().unwrap_or(0);
        stage.average_duration_ms = total as f64 / stage.operations as f64;
    }

    let successes = entries.iter().filter(|entry| entry.success).count();
    summary.success_rate = successes as f64 / entries.len() as f64;
    summary.average_duration_ms =
        entries.iter().map(|entry| entry.duration_ms).sum::<u64>() as f64 / entries.len() as f64;
    summary.estimated_savings_usd = savings(summary.errors_fixed_free);
    summary
}

pub fn savings(errors_fixed_free: u64) -> f64 {
    errors_fixed_free as f64 * ASSUMED_AI_COST_PER_ERROR
}

fn payload_u64(payload: &Value, key: &str) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn save_appends_and_clears_session() {
        let temp = tempdir().expect("tempdir");
        let mut metrics = MetricsCollector::new(temp.path(), &MetricsConfig::default());

        metrics.record_stage1("run-1", Instant::now(), json!({ "errors_fixed": 4 }), true, None);
        assert_eq!(metrics.save().expect("save"), 1);
        assert!(metrics.session().is_empty());

        metrics.record_stage3(
            "run-1",
            Instant::now(),
            json!({ "errors_fixed": 2, "cost_usd": 0.01 }),
            false,
            Some("regression".to_owned()),
        );
        assert_eq!(metrics.save().expect("save"), 1);

        let log = metrics.load().expect("load");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].error.as_deref(), Some("regression"));
        assert!(temp.path().join(".mend").join(METRICS_FILE).exists());
    }

    #[test]
    fn disabled_collector_records_nothing() {
        let temp = tempdir().expect("tempdir");
        let config = MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        };
        let mut metrics = MetricsCollector::new(temp.path(), &config);
        metrics.record_stage2("run", Instant::now(), json!({}), true, None);

        assert_eq!(metrics.save().expect("save"), 0);
        assert!(!metrics.path().exists());
    }

    #[test]
    fn summary_breaks_down_stages_and_savings() {
        let temp = tempdir().expect("tempdir");
        let mut metrics = MetricsCollector::new(temp.path(), &MetricsConfig::default());
        metrics.record_stage1("r", Instant::now(), json!({ "errors_fixed": 10 }), true, None);
        metrics.record_stage2("r", Instant::now(), json!({ "errors": 3 }), false, None);
        metrics.record_analysis("r", Instant::now(), json!({ "groups": 1 }));
        metrics.record_stage3(
            "r",
            Instant::now(),
            json!({ "errors_fixed": 1, "cost_usd": 0.25 }),
            true,
            None,
        );

        let summary = metrics.summary(7).expect("summary");
        assert_eq!(summary.operations, 4);
        assert_eq!(summary.success_rate, 0.75);
        assert_eq!(summary.stages["stage2"].successes, 0);
        assert_eq!(summary.errors_fixed_free, 10);
        assert_eq!(summary.errors_fixed_ai, 1);
        assert_eq!(summary.ai_cost_usd, 0.25);
        assert!((summary.estimated_savings_usd - 0.05).abs() < 1e-9);
    }

    #[test]
    fn summary_window_excludes_old_entries() {
        let temp = tempdir().expect("tempdir");
        let mut metrics = MetricsCollector::new(temp.path(), &MetricsConfig::default());
        metrics.record_stage1("r", Instant::now(), json!({}), true, None);
        metrics.save().expect("save");

        let later = Utc::now() + Duration::days(30);
        assert_eq!(metrics.summary_at(later, 7).expect("summary").operations, 0);
    }
}
