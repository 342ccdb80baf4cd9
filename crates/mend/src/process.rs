use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>, cwd: impl AsRef<Path>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.as_ref().to_path_buf(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How an external tool invocation ended. Only `Completed` carries output;
/// every other variant is a recoverable, non-fatal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    NotFound,
    TimedOut,
    Failed(String),
    Completed(ToolOutput),
}

impl ToolOutcome {
    pub fn output(&self) -> Option<&ToolOutput> {
        match self {
            Self::Completed(output) => Some(output),
            _ => None,
        }
    }

    pub fn skip_reason(&self, tool: &str) -> Option<String> {
        match self {
            Self::NotFound => Some(format!("{tool}: executable not found")),
            Self::TimedOut => Some(format!("{tool}: timed out")),
            Self::Failed(message) => Some(format!("{tool}: {message}")),
            Self::Completed(_) => None,
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, command: &ToolCommand, limit: Duration) -> ToolOutcome;
}

/// Spawns real child processes. Children are killed when the timeout drops
/// their future.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, command: &ToolCommand, limit: Duration) -> ToolOutcome {
        let mut child = Command::new(&command.program);
        child
            .args(&command.args)
            .current_dir(&command.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match timeout(limit, child.output()).await {
            Err(_) => {
                tracing::warn!(
                    command = %command.display(),
                    timeout_secs = limit.as_secs(),
                    "tool timed out"
                );
                ToolOutcome::TimedOut
            }
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => ToolOutcome::NotFound,
            Ok(Err(err)) => ToolOutcome::Failed(format!("failed to launch: {err}")),
            Ok(Ok(output)) => ToolOutcome::Completed(ToolOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
        }
    }
}

/// One way of launching a tool, e.g. `eslint` or `npx --no-install eslint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationStrategy {
    pub program: String,
    pub prefix_args: Vec<String>,
}

impl InvocationStrategy {
    pub fn new(program: &str, prefix_args: &[&str]) -> Self {
        Self {
            program: program.to_owned(),
            prefix_args: prefix_args.iter().map(|arg| (*arg).to_owned()).collect(),
        }
    }

    pub fn command(&self, cwd: &Path) -> ToolCommand {
        ToolCommand::new(&self.program, cwd).args(self.prefix_args.iter().cloned())
    }
}

/// Remembers, per tool, the first invocation strategy that answered
/// `--version`. A tool with no live strategy is remembered as absent.
#[derive(Debug, Default)]
pub struct ToolResolver {
    cache: Mutex<HashMap<String, Option<InvocationStrategy>>>,
}

impl ToolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(
        &self,
        tool: &str,
        candidates: &[InvocationStrategy],
        runner: &dyn ProcessRunner,
        cwd: &Path,
        limit: Duration,
    ) -> Option<InvocationStrategy> {
        if let Some(cached) = self.cached(tool) {
            return cached;
        }

        let mut resolved = None;
        for candidate in candidates {
            let probe = candidate.command(cwd).arg("--version");
            match runner.run(&probe, limit).await {
                ToolOutcome::Completed(output) if output.succeeded() => {
                    tracing::debug!(tool, command = %probe.display(), "tool resolved");
                    resolved = Some(candidate.clone());
                    break;
                }
                outcome => {
                    tracing::debug!(
                        tool,
                        command = %probe.display(),
                        outcome = ?outcome,
                        "invocation strategy unavailable"
                    );
                }
            }
        }

        if resolved.is_none() {
            tracing::info!(tool, "no working invocation found, tool will be skipped");
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(tool.to_owned(), resolved.clone());
        }
        resolved
    }

    fn cached(&self, tool: &str) -> Option<Option<InvocationStrategy>> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(tool).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingRunner {
        calls: AtomicUsize,
        live_program: &'static str,
    }

    #[async_trait]
    impl ProcessRunner for CountingRunner {
        async fn run(&self, command: &ToolCommand, _limit: Duration) -> ToolOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if command.program == self.live_program {
                ToolOutcome::Completed(ToolOutput {
                    exit_code: Some(0),
                    stdout: "1.0.0".to_owned(),
                    stderr: String::new(),
                })
            } else {
                ToolOutcome::NotFound
            }
        }
    }

    fn candidates() -> Vec<InvocationStrategy> {
        vec![
            InvocationStrategy::new("eslint", &[]),
            InvocationStrategy::new("npx", &["--no-install", "eslint"]),
        ]
    }

    #[tokio::test]
    async fn first_live_strategy_is_cached() {
        let runner = CountingRunner {
            calls: AtomicUsize::new(0),
            live_program: "npx",
        };
        let resolver = ToolResolver::new();
        let cwd = PathBuf::from(".");

        let first = resolver
            .resolve("eslint", &candidates(), &runner, &cwd, Duration::from_secs(1))
            .await
            .expect("resolved");
        assert_eq!(first.program, "npx");
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);

        let again = resolver
            .resolve("eslint", &candidates(), &runner, &cwd, Duration::from_secs(1))
            .await;
        assert_eq!(again, Some(first));
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn absent_tool_is_remembered() {
        let runner = CountingRunner {
            calls: AtomicUsize::new(0),
            live_program: "nothing",
        };
        let resolver = ToolResolver::new();
        let cwd = PathBuf::from(".");

        for _ in 0..2 {
            let resolved = resolver
                .resolve("eslint", &candidates(), &runner, &cwd, Duration::from_secs(1))
                .await;
            assert!(resolved.is_none());
        }
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_executable_is_not_found() {
        let outcome = SystemProcessRunner
            .run(
                &ToolCommand::new("mend-definitely-not-a-real-binary", "."),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(outcome, ToolOutcome::NotFound);
    }

    #[test]
    fn command_display_joins_arguments() {
        let command = InvocationStrategy::new("npx", &["--no-install", "eslint"])
            .command(Path::new("."))
            .arg("--fix");
        assert_eq!(command.display(), "npx --no-install eslint --fix");
    }
}
