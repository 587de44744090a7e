use std::sync::OnceLock;

use regex::Regex;

/// Best-effort reading of a QA agent's output. The grammar is tolerant;
/// when neither marker is present the attempt counts as failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaParse {
    pub passed: bool,
    pub failed_tests: Vec<String>,
    pub error_line: Option<String>,
}

struct Grammar {
    success: Regex,
    failure: Regex,
    fail_line: Regex,
    error_capture: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| Grammar {
        success: Regex::new(r"(?i)\btests?\s+(passed|success|pass)\b").expect("success marker"),
        failure: Regex::new(r"(?i)\btests?\s+(failed|error|fail)\b").expect("failure marker"),
        fail_line: Regex::new(r"(?m)^\s*(FAIL|ERROR|✗|✖)[:\s]\s*(.*)$").expect("fail line"),
        error_capture: Regex::new(r"(Error|FAIL|AssertionError)[: ]\s*(.+)").expect("error capture"),
    })
}

pub fn parse_qa_output(output: &str) -> QaParse {
    let grammar = grammar();

    let mut failed_tests = Vec::new();
    for capture in grammar.fail_line.captures_iter(output) {
        let name = capture
            .get(2)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        if !name.is_empty() {
            failed_tests.push(name);
        }
    }

    let error_line = grammar
        .error_capture
        .captures(output)
        .and_then(|c| c.get(0))
        .map(|m| m.as_str().trim().to_string());

    let failed = grammar.failure.is_match(output)
        || !failed_tests.is_empty()
        || error_line.is_some();
    if failed {
        return QaParse {
            passed: false,
            failed_tests,
            error_line,
        };
    }
    if grammar.success.is_match(output) {
        return QaParse {
            passed: true,
            failed_tests: Vec::new(),
            error_line: None,
        };
    }
    QaParse {
        passed: false,
        failed_tests: Vec::new(),
        error_line: Some("no recognizable test output".to_string()),
    }
}

/// Canonical hint table keyed by substrings of the captured error.
fn hint_for(error: &str) -> Option<&'static str> {
    if error.contains("TypeError") {
        return Some("A TypeError usually means a value had an unexpected shape; check argument types at the failing call site.");
    }
    if error.contains("AssertionError") {
        return Some("An AssertionError means observed output diverged from the expectation; re-read the failing assertion before changing code.");
    }
    if error.contains("SyntaxError") {
        return Some("A SyntaxError points at malformed source; inspect the most recently edited file.");
    }
    if error.contains("ENOENT") {
        return Some("ENOENT means a file or directory was missing; verify paths and creation order.");
    }
    None
}

/// Structured feedback handed back to the builder between attempts.
pub fn compose_feedback(parse: &QaParse, attempt: u32) -> String {
    let mut sections = vec![format!(
        "QA attempt {attempt} failed. Fix the issues below and keep the existing behavior intact."
    )];
    if let Some(error) = &parse.error_line {
        sections.push(format!("Error: {error}"));
        if let Some(hint) = hint_for(error) {
            sections.push(format!("Hint: {hint}"));
        }
    }
    if !parse.failed_tests.is_empty() {
        sections.push(format!("Failing tests:\n- {}", parse.failed_tests.join("\n- ")));
    }
    if parse.error_line.is_none() && parse.failed_tests.is_empty() {
        sections.push("No structured failure detail was reported; rerun the suite and inspect the full output.".to_string());
    }
    sections.join("\n\n")
}
