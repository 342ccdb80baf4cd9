use std::path::Path;

use anyhow::{Context, Result, bail};
use mend::cli::{
    AnalyzeArgs, BackupCommands, Cli, Commands, LogFormat, MetricsCommands, OutputFormat, RunArgs,
    parse_cli,
};
use mend::discover::collect_paths;
use mend::{RunContext, ValidatorStage, run_pipeline};
use mend_config::{MendConfig, ensure_workspace_config, validate_config};
use mend_core::FixResult;
use mend_infer::ProviderOverrides;
use mend_store::{BackupManager, MetricsCollector};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mend=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Human => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(err) = installed {
        eprintln!("mend: failed to install log subscriber: {err}");
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;
    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load {}",
            mend_config::config_path(&workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        eprintln!(
            "mend config warning [{}]: {}",
            warning.code, warning.message
        );
    }

    match cli.command {
        Commands::Run(args) => run_command(&workspace, config, args, cli.output),
        Commands::Analyze(args) => analyze_command(&workspace, config, args, cli.output),
        Commands::Backups { command } => backups_command(&workspace, &config, command, cli.output),
        Commands::Metrics { command } => metrics_command(&workspace, &config, command, cli.output),
    }
}

fn run_command(workspace: &Path, mut config: MendConfig, args: RunArgs, output: OutputFormat) -> Result<()> {
    let pipeline = &mut config.pipeline;
    pipeline.enable_stage1 &= !args.no_stage1;
    pipeline.enable_stage2 &= !args.no_stage2;
    pipeline.enable_stage3 = (pipeline.enable_stage3 || args.stage3) && !args.no_stage3;
    pipeline.dry_run |= args.dry_run;
    if args.report_dir.is_some() {
        pipeline.report_dir = args.report_dir.clone();
    }

    let paths = collect_paths(workspace, &args.paths)?;
    if paths.is_empty() {
        eprintln!("mend: no supported files under the given paths");
        return Ok(());
    }

    let overrides = ProviderOverrides {
        provider: args.provider,
        model: args.model.clone(),
        ..ProviderOverrides::default()
    };
    let ctx = RunContext::new(workspace, config)
        .with_provider_overrides(overrides)
        .open_evaluation_store();

    let runtime = build_runtime()?;
    let outcome = runtime.block_on(run_pipeline(&ctx, &paths))?;

    print_fix_result(&outcome.summary, output)?;
    if !outcome.summary.success {
        bail!("mend run finished in state {}", outcome.final_state().as_str());
    }
    Ok(())
}

fn analyze_command(
    workspace: &Path,
    mut config: MendConfig,
    args: AnalyzeArgs,
    output: OutputFormat,
) -> Result<()> {
    if args.report_dir.is_some() {
        config.pipeline.report_dir = args.report_dir.clone();
    }
    let paths = collect_paths(workspace, &args.paths)?;
    let ctx = RunContext::new(workspace, config);

    let runtime = build_runtime()?;
    let (validation, report) = runtime.block_on(ValidatorStage::default().run(&ctx, &paths));
    if let Err(err) = ctx.save_metrics() {
        tracing::warn!(error = %err, "failed to save metrics");
    }

    match output {
        OutputFormat::Json => {
            let document = serde_json::json!({
                "validation": validation,
                "report": report,
            });
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        OutputFormat::Table => {
            for reason in &validation.skipped {
                eprintln!("skipped: {reason}");
            }
            match report {
                Some(report) => print!("{}", report.render_text()),
                None => println!(
                    "no errors ({} warnings) in {} files",
                    validation.warnings.len(),
                    paths.len()
                ),
            }
        }
    }
    Ok(())
}

fn backups_command(
    workspace: &Path,
    config: &MendConfig,
    command: BackupCommands,
    output: OutputFormat,
) -> Result<()> {
    let manager = BackupManager::new(workspace, &config.backup);
    match command {
        BackupCommands::List => {
            let backups = manager.list().context("failed to read backup index")?;
            if output == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&backups)?);
                return Ok(());
            }
            if backups.is_empty() {
                println!("no backups in {}", manager.backup_dir().display());
            }
            for backup in backups {
                println!(
                    "{}  {}  {:<20} {} files, {} bytes",
                    backup.id,
                    backup.created_at.format("%Y-%m-%d %H:%M:%S"),
                    backup.operation,
                    backup.files.len(),
                    backup.total_bytes
                );
            }
        }
        BackupCommands::Rollback { id } => {
            let restored = manager
                .rollback(&id)
                .with_context(|| format!("failed to restore backup {id}"))?;
            if !restored {
                bail!("unknown backup id {id}");
            }
            println!("restored backup {id}");
        }
        BackupCommands::Cleanup => {
            let removed = manager.cleanup().context("backup cleanup failed")?;
            println!("removed {removed} backups");
        }
    }
    Ok(())
}

fn metrics_command(
    workspace: &Path,
    config: &MendConfig,
    command: MetricsCommands,
    output: OutputFormat,
) -> Result<()> {
    let MetricsCommands::Summary { days } = command;
    let collector = MetricsCollector::new(workspace, &config.metrics);
    let summary = collector
        .summary(days)
        .with_context(|| format!("failed to read {}", collector.path().display()))?;

    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("last {} days: {} operations", summary.window_days, summary.operations);
    println!("success rate: {:.1}%", summary.success_rate * 100.0);
    println!("average duration: {:.0} ms", summary.average_duration_ms);
    for (stage, stats) in &summary.stages {
        println!(
            "  {stage:<9} {} runs, {} ok, {:.0} ms avg",
            stats.operations, stats.successes, stats.average_duration_ms
        );
    }
    println!(
        "fixed free: {}  fixed by ai: {}  ai cost: ${:.4}  estimated savings: ${:.4}",
        summary.errors_fixed_free,
        summary.errors_fixed_ai,
        summary.ai_cost_usd,
        summary.estimated_savings_usd
    );
    Ok(())
}

fn print_fix_result(result: &FixResult, output: OutputFormat) -> Result<()> {
    if output == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let state = result
        .detail("final_state")
        .and_then(|value| value.as_str())
        .unwrap_or("done");
    println!("state:         {state}");
    println!("success:       {}", result.success);
    println!("errors fixed:  {}", result.errors_fixed);
    println!("files changed: {}", result.files_changed.len());
    for file in &result.files_changed {
        println!("  {file}");
    }
    if let Some(found) = result.detail("errors_found") {
        println!("errors found:  {found}");
    }
    println!("elapsed:       {} ms", result.elapsed_ms);
    Ok(())
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}
