use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use mend_config::MendConfig;
use mend_core::normalize_path;
use mend_infer::{FixProvider, LoadedProvider, ProviderOverrides};
use mend_store::{
    BackupManager, EvaluationStore, JsonlEvaluationStore, MetricsCollector, SqliteEvaluationStore,
};

use crate::process::{ProcessRunner, SystemProcessRunner, ToolResolver};

#[derive(Clone)]
pub struct ProviderHandle {
    pub provider: Arc<dyn FixProvider>,
    pub provider_name: String,
    pub model_name: String,
}

impl ProviderHandle {
    pub fn new(provider: impl FixProvider + 'static, provider_name: &str, model_name: &str) -> Self {
        Self {
            provider: Arc::new(provider),
            provider_name: provider_name.to_owned(),
            model_name: model_name.to_owned(),
        }
    }
}

impl From<LoadedProvider> for ProviderHandle {
    fn from(loaded: LoadedProvider) -> Self {
        Self {
            provider: Arc::from(loaded.provider),
            provider_name: loaded.provider_name,
            model_name: loaded.model_name,
        }
    }
}

/// Everything one pipeline run needs, built once by the caller and dropped
/// when the run ends.
pub struct RunContext {
    pub workspace_root: PathBuf,
    pub config: MendConfig,
    pub run_id: String,
    pub runner: Arc<dyn ProcessRunner>,
    pub resolver: ToolResolver,
    pub provider: Option<ProviderHandle>,
    pub provider_overrides: ProviderOverrides,
    pub backups: BackupManager,
    pub evaluations: Option<Box<dyn EvaluationStore>>,
    metrics: Mutex<MetricsCollector>,
}

impl RunContext {
    /// A context with the system process runner and no evaluation store.
    /// The provider is loaded lazily by the orchestrator unless injected.
    pub fn new(workspace_root: impl AsRef<Path>, config: MendConfig) -> Self {
        let workspace_root = workspace_root.as_ref().to_path_buf();
        Self {
            run_id: new_run_id(),
            runner: Arc::new(SystemProcessRunner),
            resolver: ToolResolver::new(),
            provider: None,
            provider_overrides: ProviderOverrides::default(),
            backups: BackupManager::new(&workspace_root, &config.backup),
            evaluations: None,
            metrics: Mutex::new(MetricsCollector::new(&workspace_root, &config.metrics)),
            workspace_root,
            config,
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_provider(mut self, provider: impl Into<ProviderHandle>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_provider_overrides(mut self, overrides: ProviderOverrides) -> Self {
        self.provider_overrides = overrides;
        self
    }

    pub fn with_evaluation_store(mut self, store: Box<dyn EvaluationStore>) -> Self {
        self.evaluations = Some(store);
        self
    }

    /// Opens the configured evaluation store: SQLite with the optional JSONL
    /// mirror, or the JSONL log alone when SQLite cannot be opened.
    pub fn open_evaluation_store(mut self) -> Self {
        if !self.config.evaluation.enabled {
            return self;
        }
        let store: Box<dyn EvaluationStore> = match SqliteEvaluationStore::open(
            &self.workspace_root,
            self.config.evaluation.legacy_jsonl,
        ) {
            Ok(store) => Box::new(store),
            Err(err) => {
                tracing::warn!(error = %err, "sqlite evaluation store unavailable, using jsonl log");
                let path = mend_config::mend_dir(&self.workspace_root)
                    .join(mend_store::evaluation::EVALUATION_JSONL_FILE);
                Box::new(JsonlEvaluationStore::new(path))
            }
        };
        self.evaluations = Some(store);
        self
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tools.timeout_secs.max(1))
    }

    pub fn dry_run(&self) -> bool {
        self.config.pipeline.dry_run
    }

    /// Absolute path for a workspace-relative or absolute input.
    pub fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_root.join(path)
        }
    }

    /// Forward-slash, workspace-relative display form used in results and
    /// error records.
    pub fn relative(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.workspace_root).unwrap_or(path);
        normalize_path(&relative.to_string_lossy())
    }

    pub fn metrics(&self) -> MutexGuard<'_, MetricsCollector> {
        match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn save_metrics(&self) -> Result<usize> {
        self.metrics()
            .save()
            .context("failed to persist metrics log")
    }
}

fn new_run_id() -> String {
    format!(
        "run-{}-{}",
        chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"),
        std::process::id()
    )
}
