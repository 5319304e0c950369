//! Per-chunk execution shared by every stage.
//!
//! A stage hands the runner one [`ChunkJob`] per chunk. Each job is submitted
//! to the backend under a time limit, its response parsed, and the outcome
//! recorded. No job is retried, and a failed job never aborts its siblings.

use std::fmt;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::aggregate::{aggregate, ChunkFailure, ChunkOutcome, FailureKind, StageOutput};
use super::parse::ParseError;
use super::records::StageKind;
use crate::error::PipelineError;
use crate::llm::client::{CompletionRequest, LlmClient};

/// Lifecycle of a stage and of each chunk inside it, as logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Chunking,
    Submitting,
    Parsing,
    Aggregated,
    Failed,
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Chunking => "chunking",
            RunState::Submitting => "submitting",
            RunState::Parsing => "parsing",
            RunState::Aggregated => "aggregated",
            RunState::Failed => "failed",
            RunState::Done => "done",
        };
        f.write_str(s)
    }
}

/// One backend invocation plus the context its parser needs.
#[derive(Debug, Clone)]
pub struct ChunkJob<C> {
    pub index: usize,
    pub request: CompletionRequest,
    pub context: C,
}

pub struct StageRunner<'a> {
    client: &'a dyn LlmClient,
    concurrency: usize,
    chunk_timeout: Duration,
}

impl<'a> StageRunner<'a> {
    pub fn new(client: &'a dyn LlmClient, concurrency: usize, chunk_timeout: Duration) -> Self {
        Self {
            client,
            concurrency: concurrency.max(1),
            chunk_timeout,
        }
    }

    /// Run every job of a stage and aggregate the results in chunk order.
    ///
    /// Returns `PipelineError::Transport` only when the stage had jobs and every
    /// one of them failed to reach the backend.
    pub async fn run<C, T, F>(
        &self,
        stage: StageKind,
        jobs: Vec<ChunkJob<C>>,
        parse: F,
    ) -> Result<StageOutput<T>, PipelineError>
    where
        C: Send + Sync,
        T: Send,
        F: Fn(&str, &C) -> Result<Vec<T>, ParseError> + Send + Sync,
    {
        let total = jobs.len();
        info!("Stage {} ({}): {} chunk(s)", stage.number(), stage, total);

        let parse = &parse;
        let outcomes: Vec<ChunkOutcome<T>> = stream::iter(jobs)
            .map(|job| self.run_chunk(stage, job, parse))
            .buffered(self.concurrency)
            .collect()
            .await;

        let output = aggregate(outcomes);

        if total > 0
            && output.failures.len() == total
            && output.failures.iter().all(|f| f.kind.is_unreachable())
        {
            let message = output
                .failures
                .last()
                .map(|f| f.message.clone())
                .unwrap_or_default();
            return Err(PipelineError::Transport {
                stage,
                chunks: total,
                message,
            });
        }

        if !output.failures.is_empty() {
            warn!(
                "Stage {} ({}): {} of {} chunk(s) failed",
                stage.number(),
                stage,
                output.failures.len(),
                total
            );
        }
        debug!(stage = %stage, state = %RunState::Done, records = output.records.len());
        Ok(output)
    }

    async fn run_chunk<C, T, F>(&self, stage: StageKind, job: ChunkJob<C>, parse: &F) -> ChunkOutcome<T>
    where
        F: Fn(&str, &C) -> Result<Vec<T>, ParseError>,
    {
        let index = job.index;
        let fail = |kind: FailureKind, message: String| {
            warn!(stage = %stage, chunk = index, state = %RunState::Failed, "{}", message);
            ChunkOutcome::failed(ChunkFailure {
                stage,
                chunk_index: index,
                kind,
                message,
            })
        };

        debug!(stage = %stage, chunk = index, state = %RunState::Submitting);
        let response = match timeout(self.chunk_timeout, self.client.complete(&job.request)).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return fail(FailureKind::Transport, format!("{:#}", e)),
            Err(_) => {
                return fail(
                    FailureKind::Timeout,
                    format!("backend call exceeded {:?}", self.chunk_timeout),
                )
            }
        };

        debug!(stage = %stage, chunk = index, state = %RunState::Parsing);
        match parse(&response, &job.context) {
            Ok(records) => {
                debug!(stage = %stage, chunk = index, state = %RunState::Aggregated, records = records.len());
                ChunkOutcome::parsed(index, records)
            }
            Err(e) => fail(FailureKind::Parse, e.to_string()),
        }
    }
}

/// Number jobs in submission order.
pub fn jobs_from<C>(items: impl IntoIterator<Item = (CompletionRequest, C)>) -> Vec<ChunkJob<C>> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, (request, context))| ChunkJob {
            index,
            request,
            context,
        })
        .collect()
}
