use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MEND_DIR_NAME: &str = ".mend";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://127.0.0.1:11434/api/chat";
pub const DEFAULT_LOCAL_MODEL: &str = "qwen2.5-coder:7b";

pub const DEFAULT_MAX_FIXER_ITERATIONS: u32 = 5;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_AI_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_AI_MAX_RETRIES: u32 = 2;
pub const DEFAULT_CONTEXT_LINES: usize = 5;
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;
pub const DEFAULT_TEMPERATURE: f64 = 0.1;
pub const DEFAULT_TOP_P: f64 = 0.95;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_MAX_BACKUPS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InferenceProviderKind {
    #[default]
    Auto,
    Mock,
    Gemini,
    Local,
}

impl InferenceProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Mock => "mock",
            Self::Gemini => "gemini",
            Self::Local => "local",
        }
    }
}

impl std::str::FromStr for InferenceProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "auto" => Ok(Self::Auto),
            "mock" => Ok(Self::Mock),
            "gemini" => Ok(Self::Gemini),
            "local" => Ok(Self::Local),
            other => Err(format!(
                "invalid provider '{other}', expected one of: auto, mock, gemini, local"
            )),
        }
    }
}

/// What happens to error codes with no `[[ai.codes]]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DefaultPolicy {
    #[default]
    AllowAll,
    DenyAll,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MendConfig {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_fixer_iterations")]
    pub max_fixer_iterations: u32,
    #[serde(default = "default_true")]
    pub enable_stage1: bool,
    #[serde(default = "default_true")]
    pub enable_stage2: bool,
    #[serde(default)]
    pub enable_stage3: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_fixer_iterations: DEFAULT_MAX_FIXER_ITERATIONS,
            enable_stage1: true,
            enable_stage2: true,
            enable_stage3: false,
            dry_run: false,
            report_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub ruff_unsafe_fixes: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TOOL_TIMEOUT_SECS,
            ruff_unsafe_fixes: false,
        }
    }
}

/// Per-code override. `allow = false` keeps the code out of AI repair
/// entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodePolicy {
    pub code: String,
    #[serde(default = "default_true")]
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub provider: InferenceProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_ai_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ai_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub default_policy: DefaultPolicy,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<CodePolicy>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: InferenceProviderKind::Auto,
            model: None,
            endpoint: None,
            api_key_env: default_api_key_env(),
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: DEFAULT_AI_TIMEOUT_SECS,
            max_retries: DEFAULT_AI_MAX_RETRIES,
            context_lines: DEFAULT_CONTEXT_LINES,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            default_policy: DefaultPolicy::AllowAll,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
            codes: Vec::new(),
        }
    }
}

impl AiConfig {
    pub fn policy_for(&self, code: &str) -> Option<&CodePolicy> {
        self.codes.iter().find(|policy| policy.code == code)
    }

    pub fn is_allowed(&self, code: &str) -> bool {
        match self.policy_for(code) {
            Some(policy) => policy.allow,
            None => self.default_policy == DefaultPolicy::AllowAll,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
    #[serde(default = "default_backup_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            retention_days: DEFAULT_BACKUP_RETENTION_DAYS,
            max_backups: DEFAULT_MAX_BACKUPS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub legacy_jsonl: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            legacy_jsonl: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

pub fn mend_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(MEND_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    mend_dir(workspace_root).join(CONFIG_FILE_NAME)
}

/// Resolves a configured path against the workspace, falling back to
/// `.mend/<default_name>` when unset.
pub fn resolve_path(
    workspace_root: impl AsRef<Path>,
    configured: Option<&str>,
    default_name: &str,
) -> PathBuf {
    let workspace_root = workspace_root.as_ref();
    match configured {
        Some(value) if Path::new(value).is_absolute() => PathBuf::from(value),
        Some(value) => workspace_root.join(value),
        None => mend_dir(workspace_root).join(default_name),
    }
}

pub fn load_workspace_config(workspace_root: impl AsRef<Path>) -> Result<MendConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(MendConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<MendConfig, ConfigError> {
    let parsed: MendConfig = toml::from_str(raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<MendConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(mend_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = MendConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Soft problems that still allow a run.
pub fn validate_config(config: &MendConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.pipeline.max_fixer_iterations == 0 {
        warnings.push(ConfigWarning {
            code: "pipeline.max_fixer_iterations",
            message: "0 iterations disables every fixer pass".to_owned(),
        });
    }
    if config.pipeline.enable_stage3 && !config.pipeline.enable_stage2 {
        warnings.push(ConfigWarning {
            code: "pipeline.enable_stage3",
            message: "stage 3 needs stage 2 findings; it will be skipped".to_owned(),
        });
    }
    if config.pipeline.enable_stage3 && !config.backup.enabled {
        warnings.push(ConfigWarning {
            code: "backup.enabled",
            message: "AI edits will run without backups; rollback is impossible".to_owned(),
        });
    }
    if !(0.0..=1.0).contains(&config.ai.min_confidence) {
        warnings.push(ConfigWarning {
            code: "ai.min_confidence",
            message: format!(
                "{} is outside [0.0, 1.0] and will be clamped",
                config.ai.min_confidence
            ),
        });
    }
    if config.ai.default_policy == DefaultPolicy::DenyAll
        && !config.ai.codes.iter().any(|policy| policy.allow)
    {
        warnings.push(ConfigWarning {
            code: "ai.default_policy",
            message: "deny_all with no allowed codes means stage 3 never edits anything"
                .to_owned(),
        });
    }

    let mut seen = std::collections::BTreeSet::new();
    for policy in &config.ai.codes {
        if !seen.insert(policy.code.as_str()) {
            warnings.push(ConfigWarning {
                code: "ai.codes",
                message: format!("duplicate entry for '{}'; the first wins", policy.code),
            });
        }
    }

    warnings
}

/// Hard checks performed before stage 3 touches any file.
pub fn check_fix_settings(ai: &AiConfig) -> Result<(), ConfigError> {
    if ai.batch_size == 0 {
        return Err(ConfigError::Invalid("ai.batch_size must be at least 1".to_owned()));
    }
    if ai.timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "ai.timeout_secs must be at least 1".to_owned(),
        ));
    }
    for policy in &ai.codes {
        if policy.code.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "ai.codes entries need a non-empty code".to_owned(),
            ));
        }
        if let Some(temperature) = policy.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(ConfigError::Invalid(format!(
                "ai.codes[{}].temperature {temperature} is outside [0.0, 2.0]",
                policy.code
            )));
        }
        if let Some(top_p) = policy.top_p
            && !(0.0..=1.0).contains(&top_p)
        {
            return Err(ConfigError::Invalid(format!(
                "ai.codes[{}].top_p {top_p} is outside [0.0, 1.0]",
                policy.code
            )));
        }
    }
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_max_fixer_iterations() -> u32 {
    DEFAULT_MAX_FIXER_ITERATIONS
}

fn default_tool_timeout_secs() -> u64 {
    DEFAULT_TOOL_TIMEOUT_SECS
}

fn default_api_key_env() -> String {
    DEFAULT_GEMINI_API_KEY_ENV.to_owned()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_ai_timeout_secs() -> u64 {
    DEFAULT_AI_TIMEOUT_SECS
}

fn default_ai_max_retries() -> u32 {
    DEFAULT_AI_MAX_RETRIES
}

fn default_context_lines() -> usize {
    DEFAULT_CONTEXT_LINES
}

fn default_min_confidence() -> f64 {
    DEFAULT_MIN_CONFIDENCE
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_backup_retention_days() -> u32 {
    DEFAULT_BACKUP_RETENTION_DAYS
}

fn default_max_backups() -> usize {
    DEFAULT_MAX_BACKUPS
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn normalize_config(mut config: MendConfig) -> MendConfig {
    config.ai.model = normalize_optional(config.ai.model.take());
    config.ai.endpoint = normalize_optional(config.ai.endpoint.take());
    config.pipeline.report_dir = normalize_optional(config.pipeline.report_dir.take());
    config.backup.dir = normalize_optional(config.backup.dir.take());
    config.metrics.path = normalize_optional(config.metrics.path.take());

    let api_key_env = config.ai.api_key_env.trim();
    if api_key_env.is_empty() {
        config.ai.api_key_env = default_api_key_env();
    } else {
        config.ai.api_key_env = api_key_env.to_owned();
    }

    config.ai.min_confidence = config.ai.min_confidence.clamp(0.0, 1.0);
    for policy in &mut config.ai.codes {
        policy.code = policy.code.trim().to_owned();
        policy.model = normalize_optional(policy.model.take());
    }

    config
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn ensure_workspace_config_creates_default_file() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();

        let config = ensure_workspace_config(workspace).expect("ensure config");

        assert_eq!(config.ai.provider, InferenceProviderKind::Auto);
        assert_eq!(config.ai.api_key_env, DEFAULT_GEMINI_API_KEY_ENV);
        assert!(!config.pipeline.enable_stage3);
        assert!(config_path(workspace).exists());

        let content = fs::read_to_string(config_path(workspace)).expect("read config file");
        assert!(content.contains("[pipeline]"));
        assert!(content.contains("[ai]"));
        assert!(content.contains("provider = \"auto\""));
    }

    #[test]
    fn load_workspace_config_parses_code_policies() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();
        fs::create_dir_all(mend_dir(workspace)).expect("create .mend");

        let raw = r#"
[pipeline]
max_fixer_iterations = 3
enable_stage3 = true

[ai]
provider = "local"
model = "  qwen2.5-coder:14b "
default_policy = "deny_all"
min_confidence = 1.7

[[ai.codes]]
code = "F401"
allow = true
temperature = 0.0

[[ai.codes]]
code = "B105"
allow = false
"#;
        fs::write(config_path(workspace), raw).expect("write config");

        let config = load_workspace_config(workspace).expect("load config");

        assert_eq!(config.pipeline.max_fixer_iterations, 3);
        assert!(config.pipeline.enable_stage3);
        assert_eq!(config.ai.provider, InferenceProviderKind::Local);
        assert_eq!(config.ai.model.as_deref(), Some("qwen2.5-coder:14b"));
        assert_eq!(config.ai.min_confidence, 1.0);
        assert!(config.ai.is_allowed("F401"));
        assert!(!config.ai.is_allowed("B105"));
        assert!(!config.ai.is_allowed("E501"));
        assert_eq!(
            config.ai.policy_for("F401").and_then(|policy| policy.temperature),
            Some(0.0)
        );
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let temp = tempdir().expect("tempdir");
        let config = load_workspace_config(temp.path()).expect("load config");
        assert_eq!(config, MendConfig::default());
        assert!(config.ai.is_allowed("anything"));
    }

    #[test]
    fn validate_config_flags_stage3_without_backups() {
        let mut config = MendConfig::default();
        config.pipeline.enable_stage3 = true;
        config.backup.enabled = false;

        let warnings = validate_config(&config);
        assert!(warnings.iter().any(|warning| warning.code == "backup.enabled"));
    }

    #[test]
    fn check_fix_settings_rejects_zero_batch_size() {
        let ai = AiConfig {
            batch_size: 0,
            ..AiConfig::default()
        };
        assert!(matches!(check_fix_settings(&ai), Err(ConfigError::Invalid(_))));
        assert!(check_fix_settings(&AiConfig::default()).is_ok());
    }

    #[test]
    fn resolve_path_prefers_configured_value() {
        let root = Path::new("/work");
        assert_eq!(
            resolve_path(root, None, "backups"),
            PathBuf::from("/work/.mend/backups")
        );
        assert_eq!(
            resolve_path(root, Some("var/bk"), "backups"),
            PathBuf::from("/work/var/bk")
        );
        assert_eq!(
            resolve_path(root, Some("/abs/bk"), "backups"),
            PathBuf::from("/abs/bk")
        );
    }
}
