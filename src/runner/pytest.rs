//! pytest `-v` output.
//!
//! Two line shapes carry results: the verbose progress line
//! (`tests/test_calc.py::test_add PASSED [ 50%]`, or a bare `test_add PASSED`)
//! and the short summary (`FAILED tests/test_calc.py::test_sub - assert ...`).

use once_cell::sync::Lazy;
use regex::Regex;

use super::{ExecutionResult, OutputParser, TestStatus};

static NAME_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<name>\S+)\s+(?P<status>PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\b")
        .expect("valid pytest result regex")
});

static STATUS_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<status>PASSED|FAILED|ERROR|SKIPPED|XFAIL|XPASS)\s+(?P<name>\S+::\S+)")
        .expect("valid pytest summary regex")
});

static COLLECTION_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ERROR collecting (?P<path>[^\s_][^\s]*)").expect("valid pytest collection regex")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct PytestParser;

impl OutputParser for PytestParser {
    fn parse(&self, stdout: &str, _stderr: &str) -> ExecutionResult {
        let mut results = ExecutionResult::default();

        for line in stdout.lines() {
            if is_traceback(line) {
                continue;
            }
            if let Some(caps) = COLLECTION_ERROR.captures(line) {
                results.insert(node_name(&caps["path"]), TestStatus::Error);
                continue;
            }
            if let Some(caps) = STATUS_FIRST.captures(line) {
                results.insert(node_name(&caps["name"]), status(&caps["status"]));
                continue;
            }
            let Some(caps) = NAME_FIRST.captures(line) else {
                continue;
            };
            let name = &caps["name"];
            if is_status_word(name) || !looks_like_test(name) {
                continue;
            }
            results.insert(node_name(name), status(&caps["status"]));
        }
        results
    }
}

fn status(word: &str) -> TestStatus {
    match word {
        "PASSED" | "XPASS" => TestStatus::Passed,
        "FAILED" => TestStatus::Failed,
        "ERROR" => TestStatus::Error,
        _ => TestStatus::Unknown,
    }
}

fn is_status_word(name: &str) -> bool {
    matches!(name, "PASSED" | "FAILED" | "ERROR" | "SKIPPED" | "XFAIL" | "XPASS")
}

/// Assertion detail (`E   ...`) and source (`>   ...`) lines of a failure report.
fn is_traceback(line: &str) -> bool {
    let line = line.trim_start();
    line.starts_with("E ") || line == "E" || line.starts_with('>')
}

/// A node id, or a bare function name as `pytest` prints it.
fn looks_like_test(name: &str) -> bool {
    name.contains("::") || name.starts_with("test")
}

/// `tests/unit/test_calc.py::TestAdd::test_one` -> `test_calc.py::TestAdd::test_one`.
fn node_name(raw: &str) -> String {
    match raw.split_once("::") {
        Some((path, rest)) => {
            let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
            format!("{}::{}", file, rest)
        }
        None => raw.rsplit(['/', '\\']).next().unwrap_or(raw).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_status_lines() {
        let out = PytestParser.parse("test_add PASSED\ntest_sub FAILED\n", "");
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("test_add"), Some(TestStatus::Passed));
        assert_eq!(out.get("test_sub"), Some(TestStatus::Failed));
    }

    #[test]
    fn test_verbose_and_summary_lines() {
        let stdout = "\
============================= test session starts ==============================
collected 3 items

tests/test_calc.py::test_add PASSED                                      [ 33%]
tests/test_calc.py::test_sub FAILED                                      [ 66%]
tests/test_calc.py::test_div SKIPPED (no division yet)                   [100%]

=========================== short test summary info ============================
FAILED tests/test_calc.py::test_sub - assert 1 == 2
==================== 1 failed, 1 passed, 1 skipped in 0.02s ====================
";
        let out = PytestParser.parse(stdout, "");
        assert_eq!(out.len(), 3);
        assert_eq!(out.get("test_calc.py::test_add"), Some(TestStatus::Passed));
        assert_eq!(out.get("test_calc.py::test_sub"), Some(TestStatus::Failed));
        assert_eq!(out.get("test_calc.py::test_div"), Some(TestStatus::Unknown));
    }

    #[test]
    fn test_collection_error_is_reported_per_file() {
        let stdout = "ERROR collecting tests/test_broken.py\nE   ModuleNotFoundError: No module named 'calc'\n";
        let out = PytestParser.parse(stdout, "");
        assert_eq!(out.get("test_broken.py"), Some(TestStatus::Error));
    }

    #[test]
    fn test_unparseable_lines_are_ignored() {
        let out = PytestParser.parse("hello world\n=== 2 passed ===\nPASSED\n", "");
        assert!(out.is_empty());
    }

    #[test]
    fn test_failure_report_lines_are_not_results() {
        let stdout = "\
tests/test_calc.py::test_add PASSED                                      [ 50%]
tests/test_calc.py::test_sub FAILED                                      [100%]

=================================== FAILURES ===================================
___________________________________ test_sub ___________________________________

    def test_sub():
>       assert sub(3, 1) == 1, \"sub PASSED through\"
E       FAILED assertion: sub(3, 1) == 2
E       AssertionError: sub PASSED through

tests/test_calc.py:6: AssertionError
setup PASSED teardown
=========================== short test summary info ============================
FAILED tests/test_calc.py::test_sub - AssertionError: sub PASSED through
";
        let out = PytestParser.parse(stdout, "");
        assert_eq!(out.len(), 2, "{:?}", out);
        assert_eq!(out.get("test_calc.py::test_add"), Some(TestStatus::Passed));
        assert_eq!(out.get("test_calc.py::test_sub"), Some(TestStatus::Failed));
        assert_eq!(out.get("E"), None);
    }

    #[test]
    fn test_class_node_ids() {
        let out = PytestParser.parse("tests/test_x.py::TestAdd::test_one[1-2] ERROR\n", "");
        assert_eq!(out.get("test_x.py::TestAdd::test_one[1-2]"), Some(TestStatus::Error));
    }
}
