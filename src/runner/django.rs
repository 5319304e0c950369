//! `manage.py test -v 2` output (unittest verbose format, written to stderr).

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ExecutionResult, OutputParser, TestStatus};

/// `test_add (shop.tests.test_calc.CalcTests.test_add) ... ok`
static RESULT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<test>\w+) \((?P<qual>[\w.]+)\)\s*\.\.\. (?P<status>ok|FAIL|ERROR|skipped.*|expected failure|unexpected success)\s*$",
    )
    .expect("valid unittest result regex")
});

/// Header line when a docstring pushes the status onto the next line.
static HEADER_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<test>\w+) \((?P<qual>[\w.]+)\)\s*$").expect("valid unittest header regex"));

static TRAILING_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\.\.\. (?P<status>ok|FAIL|ERROR|skipped.*|expected failure|unexpected success)\s*$")
        .expect("valid unittest status regex")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct DjangoParser;

impl OutputParser for DjangoParser {
    fn parse(&self, stdout: &str, stderr: &str) -> ExecutionResult {
        let mut results = ExecutionResult::default();
        let mut pending: Option<String> = None;

        for line in stderr.lines().chain(stdout.lines()) {
            if let Some(caps) = RESULT_LINE.captures(line) {
                results.insert(qualified(&caps["test"], &caps["qual"]), status(&caps["status"]));
                pending = None;
            } else if let Some(caps) = HEADER_LINE.captures(line) {
                pending = Some(qualified(&caps["test"], &caps["qual"]));
            } else if let Some(caps) = TRAILING_STATUS.captures(line) {
                if let Some(name) = pending.take() {
                    results.insert(name, status(&caps["status"]));
                }
            }
        }
        results
    }
}

/// Python 3.11+ prints the full id in parentheses; older versions only the class.
fn qualified(test: &str, qual: &str) -> String {
    if qual.ends_with(&format!(".{}", test)) {
        qual.to_string()
    } else {
        format!("{}.{}", qual, test)
    }
}

fn status(word: &str) -> TestStatus {
    match word {
        "ok" => TestStatus::Passed,
        "FAIL" | "unexpected success" => TestStatus::Failed,
        "ERROR" => TestStatus::Error,
        _ => TestStatus::Unknown,
    }
}
