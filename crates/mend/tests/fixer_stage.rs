mod support;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mend::{Fixer, FixerKind, FixerStage, RunContext};
use mend_config::MendConfig;
use mend_core::FixResult;
use mend_infer::MockProvider;
use serde_json::{Value, json};

use support::{ScriptedRunner, context, output, read, workspace};

/// Rewrites every file whose content equals `from` to `to`.
struct Swap {
    name: &'static str,
    from: &'static str,
    to: &'static str,
}

#[async_trait]
impl Fixer for Swap {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fix(&self, ctx: &RunContext, paths: &[PathBuf]) -> FixResult {
        let mut result = FixResult::noop();
        for path in paths {
            if fs::read_to_string(path).is_ok_and(|source| source == self.from) {
                fs::write(path, self.to).expect("write swap");
                result.record_change(ctx.relative(path));
                result.errors_fixed += 1;
            }
        }
        result
    }
}

fn builtin_stage() -> FixerStage {
    FixerStage::new(vec![
        FixerKind::WhitespaceTrimmer.build(),
        FixerKind::EofNormalizer.build(),
    ])
}

#[tokio::test]
async fn second_run_over_fixed_files_changes_nothing() {
    let dir = workspace(&[
        ("pkg/a.py", "def f():  \n    return 1\t\n\n\n"),
        ("web/b.ts", "const x = 1;   \nexport default x;"),
    ]);
    let runner = Arc::new(ScriptedRunner::new());
    let ctx = context(dir.path(), MendConfig::default(), runner, &MockProvider::new());
    let paths = vec![dir.path().join("pkg/a.py"), dir.path().join("web/b.ts")];

    let first = builtin_stage().run(&ctx, &paths).await;
    assert_eq!(first.files_changed, vec!["pkg/a.py", "web/b.ts"]);
    assert!(first.errors_fixed >= 4);
    assert_eq!(read(dir.path(), "pkg/a.py"), "def f():\n    return 1\n");
    assert_eq!(
        read(dir.path(), "web/b.ts"),
        "const x = 1;\nexport default x;\n"
    );

    let second = builtin_stage().run(&ctx, &paths).await;
    assert_eq!(second.errors_fixed, 0);
    assert!(second.files_changed.is_empty());
    assert_eq!(second.detail("iterations"), Some(&Value::from(1)));
    assert_eq!(second.detail("converged"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn oscillating_fixers_stop_at_the_iteration_cap() {
    let dir = workspace(&[("app.py", "a")]);
    let runner = Arc::new(ScriptedRunner::new());
    let mut config = MendConfig::default();
    config.pipeline.max_fixer_iterations = 3;
    let ctx = context(dir.path(), config, runner, &MockProvider::new());

    let stage = FixerStage::new(vec![
        Box::new(Swap {
            name: "a_to_b",
            from: "a",
            to: "b",
        }),
        Box::new(Swap {
            name: "b_to_a",
            from: "b",
            to: "a",
        }),
    ]);
    let result = stage.run(&ctx, &[dir.path().join("app.py")]).await;

    assert_eq!(result.detail("iterations"), Some(&Value::from(3)));
    assert_eq!(result.detail("converged"), Some(&Value::Bool(false)));
    assert_eq!(result.detail("fixers"), Some(&json!({"a_to_b": 3, "b_to_a": 3})));
    assert_eq!(read(dir.path(), "app.py"), "a");
}

#[tokio::test]
async fn lint_fixer_credits_the_reported_fix_count() {
    let dir = workspace(&[("app.py", "import os\nimport sys\nprint(sys.argv)\n")]);
    let runner = Arc::new(ScriptedRunner::new().on("ruff", |command| {
        assert!(command.args.iter().any(|arg| arg == "--exit-zero"));
        let path = command.cwd.join("app.py");
        let source = fs::read_to_string(&path).expect("read");
        match source.strip_prefix("import os\n") {
            Some(rest) => {
                fs::write(&path, rest).expect("write");
                output(0, "Found 2 errors (1 fixed, 1 remaining).\n", "")
            }
            None => output(0, "Found 1 error.\n", ""),
        }
    }));
    let ctx = context(dir.path(), MendConfig::default(), runner.clone(), &MockProvider::new());

    let stage = FixerStage::new(vec![FixerKind::LintAutoFixer.build()]);
    let result = stage.run(&ctx, &[dir.path().join("app.py")]).await;

    assert_eq!(result.errors_fixed, 1);
    assert_eq!(result.files_changed, vec!["app.py"]);
    assert_eq!(result.detail("iterations"), Some(&Value::from(2)));
    assert_eq!(runner.calls_to("ruff").len(), 2);
    assert_eq!(read(dir.path(), "app.py"), "import sys\nprint(sys.argv)\n");
}

#[tokio::test]
async fn unsafe_fixes_follow_configuration() {
    let dir = workspace(&[("app.py", "x = 1\n")]);
    let runner = Arc::new(ScriptedRunner::new().on("ruff", |_| output(0, "", "")));
    let mut config = MendConfig::default();
    config.tools.ruff_unsafe_fixes = true;
    let ctx = context(dir.path(), config, runner.clone(), &MockProvider::new());

    FixerStage::new(vec![FixerKind::LintAutoFixer.build()])
        .run(&ctx, &[dir.path().join("app.py")])
        .await;

    let calls = runner.calls_to("ruff");
    assert_eq!(calls.len(), 1);
    assert!(calls[0].args.iter().any(|arg| arg == "--unsafe-fixes"));
}

#[tokio::test]
async fn missing_formatter_is_reported_as_skipped() {
    let dir = workspace(&[("app.py", "x = 1\n")]);
    let runner = Arc::new(ScriptedRunner::new());
    let ctx = context(dir.path(), MendConfig::default(), runner, &MockProvider::new());

    let result = FixerStage::new(vec![FixerKind::Formatter.build()])
        .run(&ctx, &[dir.path().join("app.py")])
        .await;

    assert!(!result.changed());
    let skipped = result.detail("skipped").expect("skipped detail");
    assert!(skipped[0].as_str().is_some_and(|reason| reason.contains("black")));
}
