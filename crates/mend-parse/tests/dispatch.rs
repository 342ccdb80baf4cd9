use std::path::Path;

use mend_parse::{check_syntax, outline, relocate_imports};

#[test]
fn outline_uses_the_grammar_only_for_python() {
    let source = "import os\n\nclass Job:\n    def run(self):\n        return os.sep\n";

    let python = outline(Path::new("jobs/job.py"), source).expect("python outline");
    assert_eq!(python.import_lines, vec![1]);
    assert_eq!(python.signature_lines, vec![3]);

    let script = "const fs = require('fs');\n\nasync function load() {\n  return fs;\n}\n";
    let heuristic = outline(Path::new("web/load.js"), script).expect("script outline");
    assert_eq!(heuristic.import_lines, vec![1]);
    assert_eq!(heuristic.signature_lines, vec![3]);
}

#[test]
fn syntax_error_line_points_at_the_broken_statement() {
    let source = "def ok():\n    return 1\n\n\nvalue = ok(\n";
    let report = check_syntax(Path::new("app.py"), source).expect("check");

    assert!(!report.valid);
    assert!(report.error_line.is_some_and(|line| line >= 5));
}

#[test]
fn relocated_source_still_parses() {
    let source = "\"\"\"Entry point.\"\"\"\nimport sys\n\nsys.path.insert(0, '.')\nimport app.config\nimport requests\n\nprint(app.config, requests)\n";
    let relocated = relocate_imports(source, &[5, 6], &["app"]).expect("relocate");

    assert!(check_syntax(Path::new("main.py"), &relocated).expect("check").valid);
    let sys_index = relocated.find("import sys").expect("sys import");
    let requests_index = relocated.find("import requests").expect("requests import");
    let local_index = relocated.find("import app.config").expect("local import");
    assert!(sys_index < requests_index && requests_index < local_index);
}
