use mend_core::{CodeError, RiskLevel};

/// Codes that signal misplaced or unsorted imports.
pub const IMPORT_ORDER_CODES: &[&str] = &["I001", "I002", "E402"];

const EXACT_RISK: &[(&str, RiskLevel)] = &[
    // syntax
    ("E999", RiskLevel::Critical),
    ("syntax", RiskLevel::Critical),
    ("invalid-syntax", RiskLevel::Critical),
    // cosmetic
    ("F401", RiskLevel::Low),
    ("F841", RiskLevel::Low),
    ("F541", RiskLevel::Low),
    ("E402", RiskLevel::Low),
    // annotations and simple mismatches
    ("var-annotated", RiskLevel::Medium),
    ("assignment", RiskLevel::Medium),
    ("arg-type", RiskLevel::Medium),
    ("no-untyped-def", RiskLevel::Medium),
    ("no-untyped-call", RiskLevel::Medium),
    ("union-attr", RiskLevel::Medium),
    ("attr-defined", RiskLevel::Medium),
    ("call-arg", RiskLevel::Medium),
    ("index", RiskLevel::Medium),
    ("name-defined", RiskLevel::Medium),
    ("import-untyped", RiskLevel::Medium),
    ("F821", RiskLevel::Medium),
    ("E711", RiskLevel::Medium),
    ("E712", RiskLevel::Medium),
    // redefinition, unreachable, return types, operators
    ("no-redef", RiskLevel::High),
    ("F811", RiskLevel::High),
    ("unreachable", RiskLevel::High),
    ("return-value", RiskLevel::High),
    ("return", RiskLevel::High),
    ("operator", RiskLevel::High),
    ("override", RiskLevel::High),
    ("misc", RiskLevel::High),
    ("E722", RiskLevel::High),
];

const PREFIX_RISK: &[(&str, RiskLevel)] = &[
    ("E1", RiskLevel::Low),
    ("E2", RiskLevel::Low),
    ("E3", RiskLevel::Low),
    ("E4", RiskLevel::Low),
    ("E5", RiskLevel::Low),
    ("E7", RiskLevel::Medium),
    ("E9", RiskLevel::Critical),
    ("W", RiskLevel::Low),
    ("I", RiskLevel::Low),
    ("D", RiskLevel::Low),
    ("Q", RiskLevel::Low),
    ("UP", RiskLevel::Low),
    ("COM", RiskLevel::Low),
    ("C4", RiskLevel::Low),
    ("SIM", RiskLevel::Low),
    ("ANN", RiskLevel::Medium),
    ("ARG", RiskLevel::Medium),
    ("RET", RiskLevel::High),
    ("PLR", RiskLevel::High),
    ("S", RiskLevel::Critical),
    ("B", RiskLevel::Critical),
];

/// Exact match first, then the longest registered prefix. Anything the table
/// does not know is `Critical`.
pub fn risk_for_code(code: &str) -> RiskLevel {
    if let Some((_, risk)) = EXACT_RISK.iter().find(|(known, _)| *known == code) {
        return *risk;
    }

    PREFIX_RISK
        .iter()
        .filter(|(prefix, _)| code.starts_with(prefix) && is_code_continuation(code, prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, risk)| *risk)
        .unwrap_or(RiskLevel::Critical)
}

pub fn risk_for_error(error: &CodeError) -> RiskLevel {
    if error.tool == "bandit" {
        return RiskLevel::Critical;
    }
    risk_for_code(&error.code)
}

pub fn is_import_order_code(code: &str) -> bool {
    IMPORT_ORDER_CODES.contains(&code)
}

pub fn category_for(error: &CodeError) -> &'static str {
    let code = error.code.as_str();
    match error.tool.as_str() {
        "bandit" => return "security",
        "mypy" if code == "syntax" => return "syntax",
        "mypy" => return "typing",
        _ => {}
    }

    if code == "E999" || code == "invalid-syntax" || code.starts_with("E9") {
        "syntax"
    } else if is_import_order_code(code) || code == "F401" || code.starts_with('I') {
        "imports"
    } else if code.starts_with('S') && code[1..].starts_with(|ch: char| ch.is_ascii_digit()) {
        "security"
    } else if code.starts_with('F') || code.starts_with('B') {
        "correctness"
    } else if ["E", "W", "D", "Q", "UP", "COM", "C4", "SIM"]
        .iter()
        .any(|prefix| code.starts_with(prefix))
    {
        "style"
    } else {
        "other"
    }
}

/// A prefix only matches when the code continues with digits, so `D` does
/// not swallow `DTZ005` and `S` does not swallow `SIM108`.
fn is_code_continuation(code: &str, prefix: &str) -> bool {
    code[prefix.len()..]
        .chars()
        .next()
        .is_none_or(|ch| ch.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use mend_core::PriorityTier;

    use super::*;

    #[test]
    fn exact_codes_win_over_prefixes() {
        assert_eq!(risk_for_code("E402"), RiskLevel::Low);
        assert_eq!(risk_for_code("E722"), RiskLevel::High);
        assert_eq!(risk_for_code("E501"), RiskLevel::Low);
        assert_eq!(risk_for_code("E999"), RiskLevel::Critical);
    }

    #[test]
    fn longest_prefix_is_used() {
        assert_eq!(risk_for_code("UP035"), RiskLevel::Low);
        assert_eq!(risk_for_code("SIM108"), RiskLevel::Low);
        assert_eq!(risk_for_code("S105"), RiskLevel::Critical);
        assert_eq!(risk_for_code("RET504"), RiskLevel::High);
    }

    #[test]
    fn alphabetic_families_do_not_leak_into_short_prefixes() {
        assert_eq!(risk_for_code("ERA001"), RiskLevel::Critical);
        assert_eq!(risk_for_code("DTZ005"), RiskLevel::Critical);
    }

    #[test]
    fn unknown_codes_are_critical() {
        assert_eq!(risk_for_code("totally-new-check"), RiskLevel::Critical);
    }

    #[test]
    fn bandit_findings_are_always_critical_security() {
        let error = CodeError::new(
            "bandit",
            "a.py",
            3,
            1,
            "B105",
            "hardcoded password",
            PriorityTier::Critical,
        );
        assert_eq!(risk_for_error(&error), RiskLevel::Critical);
        assert_eq!(category_for(&error), "security");
    }
}
