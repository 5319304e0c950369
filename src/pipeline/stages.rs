//! The four stages: wire shapes the model answers with, job construction and
//! conversion into records carrying locally minted identifiers.

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::aggregate::StageOutput;
use super::parse::{lenient_string, parse_items, parse_object, WellFormed};
use super::project_root;
use super::records::{
    RecordId, StackFinding, StageKind, TechStack, TestCase, TestCodeArtifact, TestableUnit, UnitKind,
};
use super::stage::{jobs_from, StageRunner};
use crate::chunker::ChunkSplitter;
use crate::error::PipelineError;
use crate::llm::prompts::{self, CodeContext};

// ============================================================================
// Stage 1
// ============================================================================

#[derive(Debug, Deserialize)]
struct StackWire {
    #[serde(default)]
    languages: Vec<String>,
    #[serde(default)]
    frameworks: Vec<String>,
}

pub async fn detect_stack(
    runner: &StageRunner<'_>,
    chunks: &[String],
    custom: Option<&str>,
) -> Result<StageOutput<StackFinding>, PipelineError> {
    let jobs = jobs_from(chunks.iter().map(|c| (prompts::stack_request(c, custom), ())));

    runner
        .run(StageKind::Stack, jobs, |raw, _| {
            let wire: StackWire = parse_object(raw)?;
            Ok(vec![StackFinding {
                id: RecordId::fresh(),
                languages: wire.languages,
                frameworks: wire.frameworks,
            }])
        })
        .await
}

// ============================================================================
// Stage 2
// ============================================================================

#[derive(Debug, Deserialize)]
struct SnippetWire {
    #[serde(default, deserialize_with = "lenient_string")]
    id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    path: String,
    #[serde(deserialize_with = "lenient_string")]
    name: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    kind: String,
    #[serde(deserialize_with = "lenient_string")]
    code: String,
}

impl WellFormed for SnippetWire {
    fn is_well_formed(&self) -> bool {
        !self.name.trim().is_empty() && !self.code.trim().is_empty()
    }
}

pub async fn detect_units(
    runner: &StageRunner<'_>,
    chunks: &[String],
    custom: Option<&str>,
) -> Result<StageOutput<TestableUnit>, PipelineError> {
    let jobs = jobs_from(chunks.iter().map(|c| (prompts::units_request(c, custom), ())));

    runner
        .run(StageKind::Units, jobs, |raw, _| {
            let parsed = parse_items::<SnippetWire>(raw, &["snippets"])?;
            log_rejected(StageKind::Units, parsed.rejected);
            Ok(parsed
                .items
                .into_iter()
                .map(|s| TestableUnit {
                    id: RecordId::fresh(),
                    path: s.path.trim().to_string(),
                    name: s.name.trim().to_string(),
                    kind: UnitKind::from_label(&s.kind),
                    code: s.code,
                    id_hint: non_empty(s.id),
                })
                .collect())
        })
        .await
}

// ============================================================================
// Stage 3
// ============================================================================

#[derive(Debug, Deserialize)]
struct FunctionCasesWire {
    #[serde(default)]
    test_cases: Vec<Value>,
}

impl WellFormed for FunctionCasesWire {
    fn is_well_formed(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct CaseWire {
    #[serde(default, deserialize_with = "lenient_string")]
    category: String,
    #[serde(deserialize_with = "lenient_string")]
    test_name: String,
    #[serde(default, deserialize_with = "lenient_string")]
    description: String,
    #[serde(default)]
    test_data: Value,
    #[serde(default)]
    expected_output: Value,
}

impl WellFormed for CaseWire {
    fn is_well_formed(&self) -> bool {
        !self.test_name.trim().is_empty()
    }
}

/// Per-job context for Stage 3.
#[derive(Debug, Clone, Copy)]
struct CaseJob {
    unit_id: RecordId,
}

/// Inputs shared by every Stage 3 job.
#[derive(Debug, Clone, Copy)]
pub struct CaseInputs<'a> {
    pub stack: &'a TechStack,
    pub requirement_chunks: &'a [String],
    /// Regression flag stamped on every generated case.
    pub regression: bool,
    pub custom: Option<&'a str>,
}

/// One job per (unit code chunk, requirement chunk) pair.
pub async fn generate_cases(
    runner: &StageRunner<'_>,
    splitter: &ChunkSplitter,
    units: &[TestableUnit],
    inputs: CaseInputs<'_>,
) -> Result<StageOutput<TestCase>, PipelineError> {
    let mut requests = Vec::new();
    for unit in units {
        for code_chunk in splitter.split(&unit.code) {
            for requirement in inputs.requirement_chunks {
                requests.push((
                    prompts::cases_request(inputs.stack, unit, &code_chunk, requirement, inputs.custom),
                    CaseJob { unit_id: unit.id },
                ));
            }
        }
    }
    let regression = inputs.regression;

    runner
        .run(StageKind::TestCases, jobs_from(requests), move |raw, job| {
            let groups = parse_items::<FunctionCasesWire>(raw, &["test_cases_result"])?;
            let mut rejected = groups.rejected;
            let mut cases = Vec::new();

            for group in groups.items {
                for item in group.test_cases {
                    match serde_json::from_value::<CaseWire>(item) {
                        Ok(case) if case.is_well_formed() => cases.push(TestCase {
                            id: RecordId::fresh(),
                            unit_id: job.unit_id,
                            category: case.category.trim().to_string(),
                            name: case.test_name.trim().to_string(),
                            description: case.description,
                            input: case.test_data,
                            expected: case.expected_output,
                            regression,
                        }),
                        _ => rejected += 1,
                    }
                }
            }
            log_rejected(StageKind::TestCases, rejected);
            Ok(cases)
        })
        .await
}

// ============================================================================
// Stage 4
// ============================================================================

#[derive(Debug, Deserialize)]
struct CodeWire {
    #[serde(deserialize_with = "lenient_string")]
    unit_test_code: String,
    #[serde(default, deserialize_with = "lenient_string")]
    test_library: String,
    #[serde(default, deserialize_with = "lenient_string")]
    name_unit_test_file: String,
    #[serde(default, deserialize_with = "lenient_string")]
    path: String,
    #[serde(default, deserialize_with = "lenient_string")]
    category: String,
    #[serde(default, deserialize_with = "lenient_string")]
    project_root_path: String,
}

impl WellFormed for CodeWire {
    fn is_well_formed(&self) -> bool {
        !self.unit_test_code.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
struct CodeJob {
    unit_id: RecordId,
    case_ids: Vec<RecordId>,
    fallback_category: String,
}

/// One job per unit per packed group of that unit's test cases.
pub async fn generate_code(
    runner: &StageRunner<'_>,
    splitter: &ChunkSplitter,
    ctx: CodeContext<'_>,
    units: &[TestableUnit],
    cases: &[TestCase],
    regression: bool,
    custom: Option<&str>,
) -> Result<StageOutput<TestCodeArtifact>, PipelineError> {
    let mut requests = Vec::new();
    for unit in units {
        let unit_cases: Vec<&TestCase> = cases.iter().filter(|c| c.unit_id == unit.id).collect();
        if unit_cases.is_empty() {
            debug!("No test cases for {}, skipping test code", unit.name);
            continue;
        }
        for (text, case_ids) in pack_cases(&unit_cases, splitter) {
            let fallback_category = unit_cases
                .iter()
                .find(|c| case_ids.contains(&c.id))
                .map(|c| c.category.clone())
                .unwrap_or_default();
            requests.push((
                prompts::code_request(ctx, unit, &text, custom),
                CodeJob {
                    unit_id: unit.id,
                    case_ids,
                    fallback_category,
                },
            ));
        }
    }

    runner
        .run(StageKind::TestCode, jobs_from(requests), move |raw, job| {
            let parsed = parse_items::<CodeWire>(raw, &["test_code_result", "unit_tests"])?;
            log_rejected(StageKind::TestCode, parsed.rejected);
            Ok(parsed
                .items
                .into_iter()
                .map(|w| {
                    let category = if w.category.trim().is_empty() {
                        job.fallback_category.clone()
                    } else {
                        w.category.trim().to_string()
                    };
                    TestCodeArtifact {
                        id: RecordId::fresh(),
                        unit_id: job.unit_id,
                        case_ids: job.case_ids.clone(),
                        code: w.unit_test_code,
                        file_name: w.name_unit_test_file.trim().to_string(),
                        path: w.path.trim().to_string(),
                        test_library: w.test_library.trim().to_string(),
                        category,
                        regression,
                        project_root: project_root::resolve(
                            ctx.stack,
                            ctx.tree,
                            ctx.repo_name,
                            Some(w.project_root_path.as_str()),
                        ),
                    }
                })
                .collect())
        })
        .await
}

/// Model-facing rendering of a case; identifiers stay local.
fn case_view(case: &TestCase) -> Value {
    json!({
        "category": case.category,
        "test_name": case.name,
        "description": case.description,
        "test_data": case.input,
        "expected_output": case.expected,
        "is_regression": case.regression,
    })
}

/// Pack cases into JSON arrays that fit the chunk budget.
///
/// Each group remembers which cases it carries. A single case too large for
/// the budget is split as text on its own.
fn pack_cases(cases: &[&TestCase], splitter: &ChunkSplitter) -> Vec<(String, Vec<RecordId>)> {
    let budget = splitter.budget();
    let tokenizer = splitter.tokenizer();
    let mut groups = Vec::new();
    let mut items: Vec<String> = Vec::new();
    let mut ids: Vec<RecordId> = Vec::new();
    let mut used = 2;

    for case in cases {
        let text = format!("{:#}", case_view(case));
        let tokens = tokenizer.count(&text) + 1;

        if tokens + 2 > budget {
            close_group(&mut items, &mut ids, &mut groups);
            used = 2;
            for piece in splitter.split(&text) {
                groups.push((piece, vec![case.id]));
            }
            continue;
        }
        if used + tokens > budget {
            close_group(&mut items, &mut ids, &mut groups);
            used = 2;
        }
        items.push(text);
        ids.push(case.id);
        used += tokens;
    }
    close_group(&mut items, &mut ids, &mut groups);
    groups
}

fn close_group(items: &mut Vec<String>, ids: &mut Vec<RecordId>, groups: &mut Vec<(String, Vec<RecordId>)>) {
    if !items.is_empty() {
        groups.push((format!("[\n{}\n]", items.join(",\n")), std::mem::take(ids)));
        items.clear();
    }
}

fn log_rejected(stage: StageKind, rejected: usize) {
    if rejected > 0 {
        debug!(stage = %stage, rejected, "Dropped non-conforming records");
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
