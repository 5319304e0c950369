use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::{info, warn};

use super::{load_config, Overrides};
use crate::config::Config;
use crate::github::{publish_artifacts, FileAddition, GitHubClient};
use crate::ingest::{self, IngestedRepo, RepoRef};
use crate::llm::client::LlmClient;
use crate::llm::factory;
use crate::pipeline::{PipelineReport, RepoInput, TestGenerator};
use crate::report::AnalysisReport;
use crate::runner::{repository_paths, select_runner, Dispatcher, RunReport};

#[derive(Debug, Clone, Args)]
pub struct AnalyzeArgs {
    /// GitHub URL or path to a local checkout
    pub repo: String,

    /// Requirements document crossed with the code in test-case generation
    #[arg(long)]
    pub requirements: Option<PathBuf>,

    /// Mark generated cases and tests as regression tests
    #[arg(long)]
    pub regression: bool,

    /// Branch to clone (URLs only)
    #[arg(long = "ref")]
    pub git_ref: Option<String>,

    /// Path to config file (defaults to ./repotest.toml or ~/.config/repotest/config.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Override LLM provider (openai, openai-compatible, anthropic, gemini)
    #[arg(long)]
    pub provider: Option<String>,

    /// Override LLM model
    #[arg(long)]
    pub model: Option<String>,

    /// Chunk invocations in flight per stage
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Generate tests without executing them
    #[arg(long)]
    pub no_run: bool,

    /// Write the full JSON report here
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Commit the generated test files to this new branch (GitHub URLs only)
    #[arg(long)]
    pub commit_branch: Option<String>,

    /// Use the canned mock LLM client
    #[arg(long)]
    pub dry_run: bool,
}

impl AnalyzeArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            provider: self.provider.clone(),
            model: self.model.clone(),
            concurrency: self.concurrency,
        }
    }
}

pub async fn run(args: AnalyzeArgs) -> Result<()> {
    let config = load_config(args.config.clone(), &args.overrides())?;
    info!("Repository: {}", args.repo);
    info!("Dry run: {}", args.dry_run);

    let requirements = match &args.requirements {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("Failed to read requirements from {}", path.display()))?,
        ),
        None => None,
    };

    let repo = ingest_repo(&args.repo, args.git_ref.clone()).await?;
    info!("{}", repo.summary);

    let client: Arc<dyn LlmClient> = Arc::from(factory::create_client(&config, args.dry_run)?);
    let generator = TestGenerator::from_config(client, &config.pipeline)?
        .with_requirements(requirements)
        .with_regression(args.regression);

    let short_name = repo.name.rsplit('/').next().unwrap_or(&repo.name);
    let report = generator
        .generate(&RepoInput {
            content: &repo.content,
            tree: Some(&repo.tree),
            repo_name: Some(short_name),
        })
        .await?;
    println!("Generated: {}", report.summary());
    for failure in &report.failures {
        warn!(
            "Stage {} chunk {} failed ({:?}): {}",
            failure.stage.as_str(),
            failure.chunk_index,
            failure.kind,
            failure.message
        );
    }

    let run = if args.no_run {
        None
    } else if report.artifacts.is_empty() {
        info!("No test files generated; skipping execution");
        None
    } else {
        let dispatcher = Dispatcher::new(config.runner.clone());
        let run = dispatcher
            .dispatch(repo.workspace.root(), &report.stack, &report.artifacts)
            .await;
        print_run(&run);
        Some(run)
    };

    if let Some(branch) = &args.commit_branch {
        if args.dry_run {
            warn!("--dry-run is set; not committing to {}", branch);
        } else {
            publish(&config, &args.repo, branch, &report).await?;
        }
    }

    if let Some(path) = &args.output {
        AnalysisReport::new(repo.name.clone(), report)
            .with_run(run)
            .write_json(path)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

/// Local directories are read in place; anything else is cloned.
async fn ingest_repo(target: &str, git_ref: Option<String>) -> Result<IngestedRepo> {
    let target = target.to_string();
    let local = Path::new(&target).is_dir();
    if local && git_ref.is_some() {
        warn!("--ref is ignored for local checkouts");
    }
    tokio::task::spawn_blocking(move || {
        if local {
            ingest::from_path(Path::new(&target))
        } else {
            ingest::from_url(&target, git_ref.as_deref())
        }
    })
    .await
    .context("Ingestion task panicked")?
}

async fn publish(config: &Config, target: &str, branch: &str, report: &PipelineReport) -> Result<()> {
    let Some(repo) = RepoRef::parse(target) else {
        bail!("--commit-branch needs a GitHub repository URL, got {}", target);
    };
    if report.artifacts.is_empty() {
        warn!("No test files to commit");
        return Ok(());
    }

    let runner = select_runner(&report.stack)?;
    let files: Vec<FileAddition> = repository_paths(runner, &report.artifacts)
        .into_iter()
        .zip(&report.artifacts)
        .map(|(path, artifact)| FileAddition::new(path, artifact.code.clone()))
        .collect();

    let github = GitHubClient::from_config(&config.github, &repo).await?;
    let headline = format!("Add {} generated test file(s)", files.len());
    let commit = publish_artifacts(&github, &repo, branch, &files, &headline)
        .await
        .with_context(|| format!("Failed to publish tests to {}", repo.full_name()))?;
    println!("Committed {} file(s) to {} ({})", files.len(), commit.branch, commit.oid);
    Ok(())
}

fn print_run(run: &RunReport) {
    if let Some(runner) = run.runner {
        println!("Runner: {}", runner);
    }
    for (name, status) in run.results.iter() {
        println!("  {:<8} {}", format!("{:?}", status).to_lowercase(), name);
    }
    for failure in &run.errors {
        println!("  runner error ({}): {}", failure.target, failure.message);
    }
    println!("Executed: {}", run.summary());
}
