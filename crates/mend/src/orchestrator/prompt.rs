use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use mend_config::AiConfig;
use mend_parse::{heuristic_outline, outline};
use serde::Serialize;

use super::batching::Batch;

pub const SAFETY_PREAMBLE: &str = "\
You repair code-quality findings in source files. Rules:
1. Preserve functionality; behavior must not change.
2. Make the minimal change that resolves each finding.
3. Validate the code before and after your edit.
4. Explain your reasoning only through the edit itself.
5. Keep every change easy to reverse.
6. When two fixes are possible, choose the safer one.";

struct CodeGuidance {
    code: &'static str,
    guidance: &'static str,
    example: &'static str,
}

const PROMPT_LIBRARY: &[CodeGuidance] = &[
    CodeGuidance {
        code: "E501",
        guidance: "Line too long. Each reply line replaces exactly one source line, so shorten it in place: drop redundant parentheses, reuse a name bound nearby, or trim a comment.",
        example: "12:     total = price * quantity  # gross",
    },
    CodeGuidance {
        code: "F401",
        guidance: "Unused import. Delete the name from the import; replace the line with an empty line if nothing remains.",
        example: "3: ",
    },
    CodeGuidance {
        code: "F841",
        guidance: "Local variable assigned but never used. Drop the assignment target and keep any call with side effects.",
        example: "20:     compute()",
    },
    CodeGuidance {
        code: "E402",
        guidance: "Module level import not at top of file. Repeat the import line unchanged; it will be moved into the import block.",
        example: "30: import json",
    },
    CodeGuidance {
        code: "I001",
        guidance: "Import block is unsorted. Rewrite the import lines sorted as standard library, third party, then local.",
        example: "1: import os\n2: import sys",
    },
    CodeGuidance {
        code: "E711",
        guidance: "Comparison to None. Use `is None` or `is not None`.",
        example: "8:     if value is None:",
    },
    CodeGuidance {
        code: "E712",
        guidance: "Comparison to True or False. Use the truthiness of the expression directly.",
        example: "9:     if enabled:",
    },
    CodeGuidance {
        code: "E722",
        guidance: "Bare except. Catch `Exception` instead of everything.",
        example: "14: except Exception:",
    },
    CodeGuidance {
        code: "F821",
        guidance: "Undefined name. Fix the typo or add the missing import; do not invent new behavior.",
        example: "2: from pathlib import Path",
    },
    CodeGuidance {
        code: "var-annotated",
        guidance: "Variable needs a type annotation. Annotate it with the narrowest correct type.",
        example: "5: items: list[str] = []",
    },
    CodeGuidance {
        code: "no-untyped-def",
        guidance: "Function is missing type annotations. Annotate parameters and the return type.",
        example: "10: def load(path: str) -> dict[str, str]:",
    },
    CodeGuidance {
        code: "assignment",
        guidance: "Incompatible types in assignment. Fix the annotation or convert the value explicitly.",
        example: "7: count: int = int(raw_count)",
    },
    CodeGuidance {
        code: "arg-type",
        guidance: "Argument has an incompatible type. Convert the argument at the call site.",
        example: "18: save(str(path))",
    },
    CodeGuidance {
        code: "union-attr",
        guidance: "Attribute access on an Optional value. Guard the access with an explicit None check.",
        example: "22:     if node is not None:\n23:         node.close()",
    },
    CodeGuidance {
        code: "return-value",
        guidance: "Incompatible return value. Return a value of the declared type or fix the annotation.",
        example: "40:     return str(total)",
    },
];

const GENERIC_GUIDANCE: &str =
    "Resolve the reported finding with the smallest edit that keeps behavior unchanged.";

fn guidance_for(code: &str) -> Option<&'static CodeGuidance> {
    PROMPT_LIBRARY.iter().find(|entry| entry.code == code)
}

/// Model parameters for one request, taken from the first batch code with
/// a `[[ai.codes]]` entry and falling back to the `[ai]` defaults.
/// `default_model` is the model the run's provider resolved to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
}

pub fn model_settings(batch: &Batch, ai: &AiConfig, default_model: &str) -> ModelSettings {
    let policy = batch.codes().into_iter().find_map(|code| ai.policy_for(code));
    let model = policy
        .and_then(|policy| policy.model.clone())
        .unwrap_or_else(|| default_model.to_owned());
    ModelSettings {
        model,
        temperature: policy
            .and_then(|policy| policy.temperature)
            .unwrap_or(ai.temperature),
        top_p: policy.and_then(|policy| policy.top_p).unwrap_or(ai.top_p),
        max_tokens: policy
            .and_then(|policy| policy.max_tokens)
            .unwrap_or(ai.max_tokens),
    }
}

/// Lines kept around the batch errors plus every import and top-level
/// signature, rendered with their original 1-based numbers. Gaps are marked
/// with `...`.
pub fn build_context(path: &Path, source: &str, batch: &Batch, context_lines: usize) -> String {
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let landmarks = outline(path, source).unwrap_or_else(|err| {
        tracing::debug!(path = %path.display(), error = %err, "outline failed, using heuristics");
        heuristic_outline(source)
    });

    let mut keep: BTreeSet<usize> = BTreeSet::new();
    for line in batch.lines() {
        let start = line.saturating_sub(context_lines).max(1);
        let end = line.saturating_add(context_lines).min(lines.len());
        keep.extend(start..=end);
    }
    keep.extend(landmarks.import_lines.iter().copied());
    keep.extend(landmarks.signature_lines.iter().copied());

    let width = lines.len().to_string().len();
    let mut rendered = String::new();
    let mut previous = 0;
    for number in keep.into_iter().filter(|number| (1..=lines.len()).contains(number)) {
        if previous != 0 && number > previous + 1 {
            rendered.push_str("...\n");
        }
        let _ = writeln!(rendered, "{number:>width$}: {}", lines[number - 1]);
        previous = number;
    }
    rendered
}

pub fn build_prompt(batch: &Batch, context: &str) -> String {
    let mut prompt = String::new();
    let codes = batch.codes();

    let _ = writeln!(prompt, "File: {}", batch.file);
    let _ = writeln!(
        prompt,
        "Findings: {} ({} distinct code{})",
        batch.errors.len(),
        codes.len(),
        if codes.len() == 1 { "" } else { "s" }
    );

    prompt.push_str("\nHow to fix each code:\n");
    for code in &codes {
        match guidance_for(code) {
            Some(entry) => {
                let _ = writeln!(prompt, "[{code}] {}", entry.guidance);
                let _ = writeln!(prompt, "Example:\n{}", entry.example);
            }
            None => {
                let _ = writeln!(prompt, "[{code}] {GENERIC_GUIDANCE}");
            }
        }
    }

    prompt.push_str("\nFindings to fix:\n");
    for error in &batch.errors {
        let _ = writeln!(
            prompt,
            "- line {}, column {}: [{}] {}",
            error.line, error.column, error.code, error.message
        );
    }

    prompt.push_str("\nSource excerpt (original line numbers):\n");
    prompt.push_str(context);

    prompt.push_str(
        "\nReply only with edited lines, one per line, formatted as\n\
         line_number: replacement_line\n\
         Do not explain the changes.\n",
    );
    prompt
}
