//! `jest --json` output.

use serde::Deserialize;
use tracing::debug;

use super::{ExecutionResult, OutputParser, TestStatus};
use crate::pipeline::parse::parse_value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestReport {
    #[serde(default)]
    test_results: Vec<JestFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    assertion_results: Vec<JestAssertion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestAssertion {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JestParser;

impl OutputParser for JestParser {
    fn parse(&self, stdout: &str, _stderr: &str) -> ExecutionResult {
        let mut results = ExecutionResult::default();
        let report: JestReport = match parse_value(stdout)
            .map_err(|e| e.to_string())
            .and_then(|value| serde_json::from_value(value).map_err(|e| e.to_string()))
        {
            Ok(report) => report,
            Err(e) => {
                debug!("Unreadable jest JSON report: {}", e);
                return results;
            }
        };

        for file in report.test_results {
            // A suite that failed to load has no assertions; report the file itself.
            if file.assertion_results.is_empty() {
                if file.status == "failed" {
                    let base = file.name.rsplit(['/', '\\']).next().unwrap_or(&file.name);
                    results.insert(base.to_string(), TestStatus::Error);
                }
                continue;
            }
            for assertion in file.assertion_results {
                let name = if assertion.full_name.is_empty() {
                    assertion.title
                } else {
                    assertion.full_name
                };
                if name.is_empty() {
                    continue;
                }
                let status = match assertion.status.as_str() {
                    "passed" => TestStatus::Passed,
                    "failed" => TestStatus::Failed,
                    _ => TestStatus::Unknown,
                };
                results.insert(name, status);
            }
        }
        results
    }
}
