use std::path::Path;

use crate::context::RunContext;
use crate::process::{InvocationStrategy, ToolOutcome, ToolOutput};

pub const RUFF: &str = "ruff";
pub const BLACK: &str = "black";
pub const MYPY: &str = "mypy";
pub const BANDIT: &str = "bandit";
pub const ESLINT: &str = "eslint";

/// Candidate invocations in probe order: the bare executable, then the
/// module form through the interpreter.
pub fn python_tool_candidates(tool: &str) -> Vec<InvocationStrategy> {
    vec![
        InvocationStrategy::new(tool, &[]),
        InvocationStrategy::new("python3", &["-m", tool]),
        InvocationStrategy::new("python", &["-m", tool]),
    ]
}

pub fn eslint_candidates(workspace_root: &Path) -> Vec<InvocationStrategy> {
    let local = workspace_root.join("node_modules").join(".bin").join(ESLINT);
    vec![
        InvocationStrategy::new(ESLINT, &[]),
        InvocationStrategy::new("npx", &["--no-install", ESLINT]),
        InvocationStrategy {
            program: local.to_string_lossy().into_owned(),
            prefix_args: Vec::new(),
        },
    ]
}

pub fn candidates_for(tool: &str, workspace_root: &Path) -> Vec<InvocationStrategy> {
    if tool == ESLINT {
        eslint_candidates(workspace_root)
    } else {
        python_tool_candidates(tool)
    }
}

/// Resolves `tool` once per run and runs it with `args` from the workspace
/// root. `Err` carries the reason the tool was skipped.
pub async fn run_tool(ctx: &RunContext, tool: &str, args: &[String]) -> Result<ToolOutput, String> {
    let candidates = candidates_for(tool, &ctx.workspace_root);
    let Some(strategy) = ctx
        .resolver
        .resolve(
            tool,
            &candidates,
            ctx.runner.as_ref(),
            &ctx.workspace_root,
            ctx.tool_timeout(),
        )
        .await
    else {
        return Err(format!("{tool}: no working invocation"));
    };

    let command = strategy.command(&ctx.workspace_root).args(args.iter().cloned());
    tracing::debug!(tool, command = %command.display(), "running tool");
    match ctx.runner.run(&command, ctx.tool_timeout()).await {
        ToolOutcome::Completed(output) => Ok(output),
        outcome => {
            let reason = outcome
                .skip_reason(tool)
                .unwrap_or_else(|| format!("{tool}: failed"));
            tracing::warn!(tool, reason = %reason, "tool run failed");
            Err(reason)
        }
    }
}

pub fn relative_args(ctx: &RunContext, paths: &[&Path]) -> Vec<String> {
    paths.iter().map(|path| ctx.relative(path)).collect()
}
