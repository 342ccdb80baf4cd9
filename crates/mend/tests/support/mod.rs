#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mend::{ProcessRunner, ProviderHandle, RunContext, ToolCommand, ToolOutcome, ToolOutput};
use mend_config::MendConfig;
use mend_infer::MockProvider;
use serde_json::json;
use tempfile::TempDir;

type Handler = Box<dyn Fn(&ToolCommand) -> ToolOutput + Send + Sync>;

/// Answers tool invocations from closures keyed by program name. Programs
/// without a handler are reported as not installed.
#[derive(Default)]
pub struct ScriptedRunner {
    handlers: HashMap<String, Handler>,
    calls: Mutex<Vec<ToolCommand>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, program: &str, handler: F) -> Self
    where
        F: Fn(&ToolCommand) -> ToolOutput + Send + Sync + 'static,
    {
        self.handlers.insert(program.to_owned(), Box::new(handler));
        self
    }

    /// Real invocations of `program`, liveness probes excluded.
    pub fn calls_to(&self, program: &str) -> Vec<ToolCommand> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|command| command.program == program)
            .filter(|command| command.args != ["--version"])
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, command: &ToolCommand, _limit: Duration) -> ToolOutcome {
        self.calls.lock().expect("calls lock").push(command.clone());
        let Some(handler) = self.handlers.get(&command.program) else {
            return ToolOutcome::NotFound;
        };
        if command.args == ["--version"] {
            return ToolOutcome::Completed(output(0, "scripted 1.0\n", ""));
        }
        ToolOutcome::Completed(handler(command))
    }
}

pub fn output(exit_code: i32, stdout: &str, stderr: &str) -> ToolOutput {
    ToolOutput {
        exit_code: Some(exit_code),
        stdout: stdout.to_owned(),
        stderr: stderr.to_owned(),
    }
}

/// File arguments of a command, resolved against its working directory.
pub fn file_args(command: &ToolCommand) -> Vec<std::path::PathBuf> {
    command
        .args
        .iter()
        .filter(|arg| !arg.starts_with('-') && arg.as_str() != "check" && arg.as_str() != "json")
        .map(|arg| command.cwd.join(arg))
        .collect()
}

/// A ruff stand-in: `--fix` does nothing; checking reports every line
/// containing `BAD` as F821, `LONG` as E501 and `def (` as a syntax error.
pub fn marker_ruff(command: &ToolCommand) -> ToolOutput {
    if command.args.iter().any(|arg| arg == "--fix") {
        return output(0, "", "All checks passed!\n");
    }

    let mut diagnostics = Vec::new();
    for path in file_args(command) {
        let Ok(source) = fs::read_to_string(&path) else {
            continue;
        };
        for (index, line) in source.lines().enumerate() {
            let code = if line.contains("def (") {
                serde_json::Value::Null
            } else if line.contains("BAD") {
                json!("F821")
            } else if line.contains("LONG") {
                json!("E501")
            } else {
                continue;
            };
            diagnostics.push(json!({
                "code": code,
                "message": "scripted finding",
                "filename": path.to_string_lossy(),
                "location": {"row": index + 1, "column": 1},
            }));
        }
    }
    let exit = if diagnostics.is_empty() { 0 } else { 1 };
    output(exit, &json!(diagnostics).to_string(), "")
}

pub fn workspace(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, content).expect("write fixture");
    }
    dir
}

pub fn stage3_config() -> MendConfig {
    let mut config = MendConfig::default();
    config.pipeline.enable_stage3 = true;
    config.ai.max_retries = 0;
    config.ai.timeout_secs = 5;
    config
}

pub fn context(
    root: &Path,
    config: MendConfig,
    runner: Arc<ScriptedRunner>,
    provider: &MockProvider,
) -> RunContext {
    RunContext::new(root, config)
        .with_runner(runner)
        .with_provider(ProviderHandle::new(provider.clone(), "mock", "mock"))
}

pub fn read(root: &Path, name: &str) -> String {
    fs::read_to_string(root.join(name)).expect("read workspace file")
}
