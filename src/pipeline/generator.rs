use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::aggregate::{ChunkFailure, StageOutput};
use super::records::{TechStack, TestCase, TestCodeArtifact, TestableUnit};
use super::stage::{RunState, StageRunner};
use super::stages::{self, CaseInputs};
use crate::chunker::ChunkSplitter;
use crate::config::{PipelineConfig, PromptsConfig};
use crate::error::PipelineError;
use crate::llm::client::LlmClient;
use crate::llm::prompts::{self, CodeContext};
use crate::tokenizer::Tokenizer;

/// Repository material handed to the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct RepoInput<'a> {
    /// Concatenated file contents with file-boundary markers.
    pub content: &'a str,
    pub tree: Option<&'a str>,
    /// `owner/repo` or `repo`, used to strip prefixes from project roots.
    pub repo_name: Option<&'a str>,
}

/// Everything one pipeline run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub stack: TechStack,
    pub units: Vec<TestableUnit>,
    pub test_cases: Vec<TestCase>,
    pub artifacts: Vec<TestCodeArtifact>,
    pub failures: Vec<ChunkFailure>,
}

impl PipelineReport {
    fn absorb<T>(&mut self, output: StageOutput<T>) -> Vec<T> {
        self.failures.extend(output.failures);
        output.records
    }

    pub fn summary(&self) -> String {
        format!(
            "{} unit(s), {} test case(s), {} test file(s), {} failed chunk(s)",
            self.units.len(),
            self.test_cases.len(),
            self.artifacts.len(),
            self.failures.len()
        )
    }
}

pub struct TestGenerator {
    client: Arc<dyn LlmClient>,
    splitter: ChunkSplitter,
    max_concurrency: usize,
    chunk_timeout: Duration,
    max_requirement_chunks: usize,
    prompts_config: PromptsConfig,
    requirements: Option<String>,
    regression: bool,
}

impl TestGenerator {
    pub fn new(client: Arc<dyn LlmClient>, splitter: ChunkSplitter) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            client,
            splitter,
            max_concurrency: defaults.max_concurrency,
            chunk_timeout: defaults.chunk_timeout(),
            max_requirement_chunks: defaults.max_requirement_chunks,
            prompts_config: PromptsConfig::default(),
            requirements: None,
            regression: false,
        }
    }

    /// Build the tokenizer and splitter from `[pipeline]` settings.
    ///
    /// Fails fast on an unknown encoding or a non-positive budget.
    pub fn from_config(client: Arc<dyn LlmClient>, config: &PipelineConfig) -> Result<Self, PipelineError> {
        let tokenizer = Arc::new(Tokenizer::for_model(&config.encoding_model)?);
        let splitter = ChunkSplitter::new(tokenizer, config.safe_budget()?)?;
        Ok(Self::new(client, splitter)
            .with_concurrency(config.max_concurrency)
            .with_chunk_timeout(config.chunk_timeout())
            .with_max_requirement_chunks(config.max_requirement_chunks)
            .with_prompts_config(config.prompts.clone()))
    }

    pub fn with_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }

    pub fn with_max_requirement_chunks(mut self, max: usize) -> Self {
        self.max_requirement_chunks = max.max(1);
        self
    }

    pub fn with_prompts_config(mut self, config: PromptsConfig) -> Self {
        self.prompts_config = config;
        self
    }

    pub fn with_requirements(mut self, requirements: Option<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_regression(mut self, regression: bool) -> Self {
        self.regression = regression;
        self
    }

    pub fn splitter(&self) -> &ChunkSplitter {
        &self.splitter
    }

    /// Requirement chunks crossed with every code chunk in Stage 3.
    ///
    /// Without requirements a single placeholder chunk stands in, so Stage 3
    /// still runs once per code chunk.
    pub fn requirement_chunks(&self) -> Vec<String> {
        let text = self.requirements.as_deref().unwrap_or_default();
        if text.trim().is_empty() {
            return vec![prompts::NO_REQUIREMENTS.to_string()];
        }
        let mut chunks = non_blank(self.splitter.split(text));
        if chunks.len() > self.max_requirement_chunks {
            warn!(
                "Requirements span {} chunks; using the first {}",
                chunks.len(),
                self.max_requirement_chunks
            );
            chunks.truncate(self.max_requirement_chunks);
        }
        chunks
    }

    pub async fn generate(&self, input: &RepoInput<'_>) -> Result<PipelineReport, PipelineError> {
        let runner = StageRunner::new(&*self.client, self.max_concurrency, self.chunk_timeout);
        let prompts_config = &self.prompts_config;
        let mut report = PipelineReport::default();

        info!(state = %RunState::Chunking, "Splitting repository content (budget {} tokens)", self.splitter.budget());
        let chunks = non_blank(self.splitter.split(input.content));
        info!("Repository content split into {} chunk(s)", chunks.len());

        // Stage 1: languages and frameworks
        let findings = stages::detect_stack(&runner, &chunks, prompts_config.stack_custom.as_deref()).await?;
        let findings = report.absorb(findings);
        report.stack = TechStack::merge(&findings);
        info!(
            "Detected languages: {}; frameworks: {}",
            report.stack.languages_label(),
            report.stack.frameworks_label()
        );

        // Stage 2: testable units
        if report.stack.languages.is_empty() {
            warn!("No languages detected; skipping unit detection");
        } else {
            let units = stages::detect_units(&runner, &chunks, prompts_config.units_custom.as_deref()).await?;
            report.units = report.absorb(units);
        }
        info!("Found {} testable unit(s)", report.units.len());

        // Stage 3: test cases
        let requirement_chunks = self.requirement_chunks();
        let cases = stages::generate_cases(
            &runner,
            &self.splitter,
            &report.units,
            CaseInputs {
                stack: &report.stack,
                requirement_chunks: &requirement_chunks,
                regression: self.regression,
                custom: prompts_config.cases_custom.as_deref(),
            },
        )
        .await?;
        report.test_cases = report.absorb(cases);
        info!("Generated {} test case(s)", report.test_cases.len());

        // Stage 4: test code
        let ctx = CodeContext {
            stack: &report.stack,
            tree: input.tree,
            repo_name: input.repo_name,
        };
        let artifacts = stages::generate_code(
            &runner,
            &self.splitter,
            ctx,
            &report.units,
            &report.test_cases,
            self.regression,
            prompts_config.code_custom.as_deref(),
        )
        .await?;
        report.artifacts = report.absorb(artifacts);

        info!(state = %RunState::Done, "Pipeline finished: {}", report.summary());
        Ok(report)
    }
}

fn non_blank(chunks: Vec<String>) -> Vec<String> {
    chunks.into_iter().filter(|c| !c.trim().is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::MockLlmClient;
    use std::collections::HashSet;

    fn generator() -> TestGenerator {
        TestGenerator::from_config(Arc::new(MockLlmClient::new()), &PipelineConfig::default()).unwrap()
    }

    const CONTENT: &str = "================================================================\nFile: calculator.py\n================================================================\ndef add(a, b):\n    return a + b\n\n";

    #[tokio::test]
    async fn test_generate_with_mock_client() {
        let report = generator()
            .generate(&RepoInput {
                content: CONTENT,
                tree: None,
                repo_name: Some("acme/calculator"),
            })
            .await
            .unwrap();

        assert_eq!(report.stack.languages, vec!["Python"]);
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.test_cases.len(), 2);
        assert_eq!(report.artifacts.len(), 1);
        assert!(report.failures.is_empty());

        let unit = &report.units[0];
        assert!(report.test_cases.iter().all(|c| c.unit_id == unit.id));
        let artifact = &report.artifacts[0];
        assert_eq!(artifact.unit_id, unit.id);
        assert_eq!(
            artifact.case_ids,
            report.test_cases.iter().map(|c| c.id).collect::<Vec<_>>()
        );
        assert_eq!(artifact.project_root, None);
        assert_eq!(unit.id_hint.as_deref(), Some("add-1"));
    }

    #[tokio::test]
    async fn test_every_record_id_is_unique() {
        let report = generator()
            .generate(&RepoInput {
                content: CONTENT,
                tree: None,
                repo_name: None,
            })
            .await
            .unwrap();
        let mut ids = HashSet::new();
        for id in report
            .units
            .iter()
            .map(|u| u.id)
            .chain(report.test_cases.iter().map(|c| c.id))
            .chain(report.artifacts.iter().map(|a| a.id))
        {
            assert!(ids.insert(id), "duplicate id {id}");
        }
    }

    #[tokio::test]
    async fn test_empty_content_makes_no_calls() {
        let report = generator()
            .generate(&RepoInput {
                content: "",
                tree: None,
                repo_name: None,
            })
            .await
            .unwrap();
        assert!(report.stack.languages.is_empty());
        assert!(report.units.is_empty());
        assert!(report.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_regression_flag_stamps_records() {
        let report = generator()
            .with_regression(true)
            .generate(&RepoInput {
                content: CONTENT,
                tree: None,
                repo_name: None,
            })
            .await
            .unwrap();
        assert!(report.test_cases.iter().all(|c| c.regression));
        assert!(report.artifacts.iter().all(|a| a.regression));
    }

    #[test]
    fn test_requirement_chunks_placeholder_when_empty() {
        let generator = generator().with_requirements(Some("  \n".to_string()));
        assert_eq!(generator.requirement_chunks(), vec![prompts::NO_REQUIREMENTS.to_string()]);
        let generator = generator.with_requirements(None);
        assert_eq!(generator.requirement_chunks().len(), 1);
    }

    #[test]
    fn test_requirement_chunks_are_capped() {
        let tokenizer = Arc::new(Tokenizer::for_model("gpt-3.5-turbo").unwrap());
        let splitter = ChunkSplitter::new(tokenizer, 20).unwrap();
        let generator = TestGenerator::new(Arc::new(MockLlmClient::new()), splitter)
            .with_max_requirement_chunks(3)
            .with_requirements(Some("The system shall add numbers. ".repeat(50)));
        assert_eq!(generator.requirement_chunks().len(), 3);
    }

    #[test]
    fn test_from_config_rejects_bad_budget() {
        let config = PipelineConfig {
            context_tokens: 1000,
            reserved_prompt_tokens: 1000,
            ..PipelineConfig::default()
        };
        let err = TestGenerator::from_config(Arc::new(MockLlmClient::new()), &config)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_from_config_rejects_unknown_encoding() {
        let config = PipelineConfig {
            encoding_model: "no-such-model-xyz".to_string(),
            ..PipelineConfig::default()
        };
        assert!(TestGenerator::from_config(Arc::new(MockLlmClient::new()), &config).is_err());
    }
}
