//! End-to-end pipeline behaviour against a scripted backend

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use repotest::chunker::ChunkSplitter;
use repotest::error::PipelineError;
use repotest::ingest::file_block;
use repotest::llm::client::{CompletionRequest, LlmClient};
use repotest::llm::prompts;
use repotest::pipeline::records::StageKind;
use repotest::pipeline::{aggregate, ChunkOutcome, FailureKind, RepoInput, TestGenerator};
use repotest::tokenizer::Tokenizer;

/// Answers per stage marker; Stage 2 output for `b.py` is not JSON.
struct ScriptedClient {
    calls: AtomicUsize,
}

impl ScriptedClient {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.user_text();

        if prompt.contains(prompts::STACK_MARKER) {
            return Ok(r#"{"languages": ["Python"], "frameworks": []}"#.to_string());
        }
        if prompt.contains(prompts::UNITS_MARKER) {
            if prompt.contains("File: b.py") {
                return Ok("I'm sorry, I can't produce JSON for this file.".to_string());
            }
            let name = if prompt.contains("File: a.py") { "func_a" } else { "func_c" };
            return Ok(format!(
                r#"```json
{{"snippets": [{{"id": "u1", "path": "{name}.py", "name": "{name}", "type": "function", "code": "def {name}(x):\n    return x + 1",}}]}}
```"#
            ));
        }
        if prompt.contains(prompts::CASES_MARKER) {
            return Ok(r#"{"test_cases_result": [{"function": "f", "test_cases": [
                {"category": "Functional Cases > Core functionality", "test_name": "test_increments", "description": "adds one", "test_data": {"x": 1}, "expected_output": 2, "is_regression": true},
                {"category": "Edge Cases > Boundary value analysis", "test_name": "", "description": "nameless cases are dropped"}
            ]}]}"#
                .to_string());
        }
        if prompt.contains(prompts::CODE_MARKER) {
            return Ok(r#"{"unit_tests": [{"unit_test_code": "def test_increments():\n    assert True\n", "test_library": "pytest", "name_unit_test_file": "test_increments.py", "path": "tests", "category": "Functional Cases > Core functionality", "project_root_path": "None"}]}"#.to_string());
        }
        bail!("unexpected prompt")
    }
}

struct DownClient;

#[async_trait]
impl LlmClient for DownClient {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        bail!("connection refused")
    }
}

fn file(name: &str) -> String {
    let stem = name.trim_end_matches(".py");
    let body = format!(
        "def func_{stem}(x):\n    \"\"\"Return x incremented by one, used by the {stem} module for counters and offsets.\"\"\"\n    return x + 1\n"
    );
    file_block(name, &body)
}

/// A splitter whose budget fits exactly one of the three files.
fn one_file_per_chunk(files: &[String]) -> ChunkSplitter {
    let tokenizer = Arc::new(Tokenizer::for_model("gpt-3.5-turbo").unwrap());
    let budget = files.iter().map(|f| tokenizer.count(f)).max().unwrap();
    for pair in files.windows(2) {
        assert!(tokenizer.count(&pair.concat()) > budget);
    }
    ChunkSplitter::new(tokenizer, budget).unwrap()
}

#[tokio::test]
async fn test_invalid_chunk_two_of_three_is_recorded_not_raised() {
    let files: Vec<String> = ["a.py", "b.py", "c.py"].iter().map(|n| file(n)).collect();
    let content = files.concat();
    let splitter = one_file_per_chunk(&files);
    assert_eq!(splitter.split(&content), files);

    let client = Arc::new(ScriptedClient::new());
    let generator = TestGenerator::new(client.clone(), splitter).with_concurrency(3);
    let report = generator
        .generate(&RepoInput {
            content: &content,
            tree: None,
            repo_name: Some("shop"),
        })
        .await
        .unwrap();

    assert_eq!(report.stack.languages, vec!["Python"]);
    let names: Vec<&str> = report.units.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["func_a", "func_c"]);

    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.stage, StageKind::Units);
    assert_eq!(failure.chunk_index, 1);
    assert_eq!(failure.kind, FailureKind::Parse);

    // one well-formed case per unit; the nameless one is dropped
    assert_eq!(report.test_cases.len(), 2);
    assert!(report.test_cases.iter().all(|c| !c.regression));
    for (unit, case) in report.units.iter().zip(&report.test_cases) {
        assert_eq!(case.unit_id, unit.id);
    }

    assert_eq!(report.artifacts.len(), 2);
    for (unit, artifact) in report.units.iter().zip(&report.artifacts) {
        assert_eq!(artifact.unit_id, unit.id);
        assert_eq!(artifact.case_ids.len(), 1);
        assert_eq!(artifact.project_root, None);
    }

    // 3 stack + 3 unit + 2 case + 2 code calls; the bad chunk is not retried
    assert_eq!(client.calls.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_backend_down_on_every_chunk_is_a_transport_error() {
    let files: Vec<String> = ["a.py", "b.py"].iter().map(|n| file(n)).collect();
    let splitter = one_file_per_chunk(&files);
    let generator = TestGenerator::new(Arc::new(DownClient), splitter);

    let err = generator
        .generate(&RepoInput {
            content: &files.concat(),
            tree: None,
            repo_name: None,
        })
        .await
        .unwrap_err();

    match err {
        PipelineError::Transport { stage, chunks, message } => {
            assert_eq!(stage, StageKind::Stack);
            assert_eq!(chunks, 2);
            assert!(message.contains("connection refused"), "{}", message);
        }
        other => panic!("expected transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_regression_flag_comes_from_the_caller() {
    let content = file("a.py");
    let tokenizer = Arc::new(Tokenizer::for_model("gpt-3.5-turbo").unwrap());
    let splitter = ChunkSplitter::new(tokenizer, 15000).unwrap();
    let generator = TestGenerator::new(Arc::new(ScriptedClient::new()), splitter).with_regression(true);

    let report = generator
        .generate(&RepoInput {
            content: &content,
            tree: None,
            repo_name: None,
        })
        .await
        .unwrap();

    assert_eq!(report.test_cases.len(), 1);
    assert!(report.test_cases[0].regression);
    assert!(report.artifacts.iter().all(|a| a.regression));
}

#[test]
fn test_aggregation_is_idempotent() {
    let failure = repotest::pipeline::ChunkFailure {
        stage: StageKind::TestCases,
        chunk_index: 1,
        kind: FailureKind::Timeout,
        message: "chunk exceeded 180s".to_string(),
    };
    let outcomes = vec![
        ChunkOutcome::parsed(2, vec![5, 6]),
        ChunkOutcome::failed(failure),
        ChunkOutcome::parsed(0, vec![1, 2, 3]),
    ];

    let once = aggregate(outcomes);
    assert_eq!(once.records, vec![1, 2, 3, 5, 6]);
    assert_eq!(once.failures.len(), 1);

    let twice = aggregate(once.clone().into_outcomes());
    assert_eq!(twice, once);
}
