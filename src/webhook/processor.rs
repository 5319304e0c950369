use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use super::push::PushEvent;
use crate::config::Config;
use crate::github::GitHubClient;
use crate::ingest::{self, RepoRef};
use crate::llm::client::LlmClient;
use crate::pipeline::{RepoInput, TestGenerator};
use crate::report::AnalysisReport;
use crate::runner::Dispatcher;

/// Work done for an accepted push, off the request path.
#[async_trait]
pub trait PushHandler: Send + Sync {
    async fn handle(&self, event: PushEvent) -> Result<()>;
}

/// One async mutex per repository, so deliveries for the same repository
/// run one at a time while different repositories proceed in parallel.
///
/// An entry lives only while some delivery holds or awaits it.
#[derive(Debug, Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RepoLocks {
    pub async fn acquire(&self, repository: &str) -> RepoLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(repository.to_string()).or_default().clone()
        };
        RepoLockGuard {
            guard: Some(lock.lock_owned().await),
            locks: self,
            repository: repository.to_string(),
        }
    }

    /// Repositories with a live entry.
    pub fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Held lock for one repository; forgets the entry when nobody else wants it.
#[derive(Debug)]
pub struct RepoLockGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    locks: &'a RepoLocks,
    repository: String,
}

impl Drop for RepoLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.locks.lock().unwrap_or_else(|e| e.into_inner());
        // clones are only taken under this map lock, so a count of 1 means no waiters
        if locks
            .get(&self.repository)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.repository);
        }
    }
}

/// Fetches the pushed files, generates regression tests for them and
/// optionally runs them against a fresh clone.
pub struct PipelineProcessor {
    config: Config,
    llm: Arc<dyn LlmClient>,
    locks: RepoLocks,
}

impl PipelineProcessor {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            locks: RepoLocks::default(),
        }
    }

    async fn process(&self, repo: &RepoRef, sha: &str, event: &PushEvent) -> Result<()> {
        let changes = event.changed_paths();
        for path in &changes.removed {
            info!("{}: {} removed", repo.full_name(), path);
        }
        if changes.present.is_empty() {
            info!("{}: no added or modified files at {}", repo.full_name(), sha);
            return Ok(());
        }

        let github = GitHubClient::from_config(&self.config.github, repo).await?;
        let mut content = String::new();
        let mut fetched = Vec::new();
        for path in &changes.present {
            match github.file_content(repo, path, sha).await {
                Ok(text) => {
                    content.push_str(&ingest::file_block(path, &text));
                    fetched.push(path.clone());
                }
                Err(e) => warn!("{}: skipping {}: {}", repo.full_name(), path, e),
            }
        }
        if fetched.is_empty() {
            warn!("{}: none of the changed files could be fetched", repo.full_name());
            return Ok(());
        }
        info!("{}: generating regression tests for {} file(s)", repo.full_name(), fetched.len());

        let tree = ingest::render_tree(&repo.name, &fetched);
        let generator = TestGenerator::from_config(self.llm.clone(), &self.config.pipeline)?.with_regression(true);
        let report = generator
            .generate(&RepoInput {
                content: &content,
                tree: Some(&tree),
                repo_name: Some(&repo.name),
            })
            .await?;
        info!("{}: {}", repo.full_name(), report.summary());

        let run = if self.config.webhook.run_tests && !report.artifacts.is_empty() {
            let url = event.clone_url();
            let branch = event.branch().map(str::to_string);
            let workspace = tokio::task::spawn_blocking(move || ingest::clone_repo(&url, branch.as_deref()))
                .await
                .context("Clone task panicked")??;
            let dispatcher = Dispatcher::new(self.config.runner.clone());
            Some(dispatcher.dispatch(workspace.root(), &report.stack, &report.artifacts).await)
        } else {
            None
        };

        if let Some(dir) = &self.config.webhook.report_dir {
            let path = report_path(dir, repo, sha);
            AnalysisReport::new(repo.full_name(), report)
                .with_commit(sha)
                .with_run(run)
                .write_json(&path)?;
            info!("{}: report written to {}", repo.full_name(), path.display());
        }
        Ok(())
    }
}

#[async_trait]
impl PushHandler for PipelineProcessor {
    async fn handle(&self, event: PushEvent) -> Result<()> {
        let repo = event
            .repo_ref()
            .with_context(|| format!("Malformed repository name: {}", event.repository.full_name))?;
        let sha = event
            .commit_sha()
            .with_context(|| format!("{}: push carries no commit", repo.full_name()))?
            .to_string();

        let _guard = self.locks.acquire(&repo.full_name()).await;
        self.process(&repo, &sha, &event).await
    }
}

fn report_path(dir: &std::path::Path, repo: &RepoRef, sha: &str) -> PathBuf {
    let short: String = sha.chars().take(12).collect();
    dir.join(format!("{}-{}-{}.json", repo.owner, repo.name, short))
}
