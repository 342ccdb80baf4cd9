use std::ffi::OsStr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use mend_config::InferenceProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "table" => Ok(Self::Table),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid output format '{other}', expected one of: table, json"
            )),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Staged lint, type and security remediation")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .mend/config.toml"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[arg(
        long,
        global = true,
        default_value = "table",
        value_parser = parse_output_format,
        help = "Result format: table or json"
    )]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the enabled stages over the given files and directories
    Run(RunArgs),
    /// Validate and print the error analysis without changing files
    Analyze(AnalyzeArgs),
    /// Inspect or restore stage-3 backups
    Backups {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Summarize recorded pipeline metrics
    Metrics {
        #[command(subcommand)]
        command: MetricsCommands,
    },
}

#[derive(Debug, Clone, PartialEq, Args)]
pub struct RunArgs {
    #[arg(required = true, help = "Files or directories to process")]
    pub paths: Vec<PathBuf>,

    #[arg(long, help = "Skip the deterministic fixers")]
    pub no_stage1: bool,

    #[arg(long, help = "Skip validation and analysis")]
    pub no_stage2: bool,

    #[arg(long, help = "Skip AI-assisted repair")]
    pub no_stage3: bool,

    #[arg(long, help = "Enable AI-assisted repair even if config disables it")]
    pub stage3: bool,

    #[arg(long, help = "Compute changes and prompts without writing files")]
    pub dry_run: bool,

    #[arg(
        long,
        value_parser = parse_inference_provider,
        help = "Inference provider override: auto, mock, gemini, or local"
    )]
    pub provider: Option<InferenceProviderKind>,

    #[arg(long, help = "Model override for stage 3")]
    pub model: Option<String>,

    #[arg(long, help = "Directory for analysis_report.txt/json")]
    pub report_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Args)]
pub struct AnalyzeArgs {
    #[arg(required = true, help = "Files or directories to validate")]
    pub paths: Vec<PathBuf>,

    #[arg(long, help = "Directory for analysis_report.txt/json")]
    pub report_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum BackupCommands {
    /// List backups, newest first
    List,
    /// Restore every file of a backup
    Rollback {
        #[arg(help = "Backup id as shown by `backups list`")]
        id: String,
    },
    /// Remove expired and excess backups
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum MetricsCommands {
    /// Aggregate the metrics log over a time window
    Summary {
        #[arg(long, default_value_t = 7, help = "Window size in days")]
        days: u32,
    },
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_inference_provider(value: &str) -> Result<InferenceProviderKind, String> {
    value.parse()
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_output_format(value: &str) -> Result<OutputFormat, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn run_parses_stage_toggles_and_overrides() {
        let cli = Cli::try_parse_from([
            "mend",
            "--workspace",
            "/tmp/project",
            "run",
            "src",
            "app.py",
            "--no-stage1",
            "--dry-run",
            "--provider",
            "mock",
            "--model",
            "tiny",
            "--report-dir",
            "reports",
        ])
        .expect("parse run");

        assert_eq!(cli.workspace, PathBuf::from("/tmp/project"));
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.paths, vec![PathBuf::from("src"), PathBuf::from("app.py")]);
        assert!(args.no_stage1);
        assert!(!args.no_stage2);
        assert!(args.dry_run);
        assert_eq!(args.provider, Some(InferenceProviderKind::Mock));
        assert_eq!(args.model.as_deref(), Some("tiny"));
        assert_eq!(args.report_dir.as_deref(), Some("reports"));
    }

    #[test]
    fn run_requires_paths() {
        assert!(Cli::try_parse_from(["mend", "run"]).is_err());
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mend",
            "metrics",
            "summary",
            "--days",
            "30",
            "--log-format",
            "json",
            "--output",
            "json",
        ])
        .expect("parse metrics");

        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Metrics {
                command: MetricsCommands::Summary { days: 30 }
            }
        ));
    }

    #[test]
    fn backups_rollback_takes_an_id() {
        let cli = Cli::try_parse_from(["mend", "backups", "rollback", "20260101T000000_stage3"])
            .expect("parse backups");
        assert!(matches!(
            cli.command,
            Commands::Backups {
                command: BackupCommands::Rollback { ref id }
            } if id == "20260101T000000_stage3"
        ));
    }

    #[test]
    fn invalid_log_format_is_rejected() {
        let err = "xml".parse::<LogFormat>().expect_err("expected error");
        assert!(err.contains("human, json"));
        assert_eq!(LogFormat::Json.as_str(), "json");
    }
}
