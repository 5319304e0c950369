//! Flattening per-chunk stage results into one ordered collection.

use serde::Serialize;

use super::records::StageKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The response could not be parsed against the stage schema.
    Parse,
    /// The backend call itself failed.
    Transport,
    /// The backend call exceeded its time limit.
    Timeout,
}

impl FailureKind {
    /// Failures that mean the backend was never heard from.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, FailureKind::Transport | FailureKind::Timeout)
    }
}

/// A chunk that produced no records, with enough context to diagnose it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub stage: StageKind,
    pub chunk_index: usize,
    pub kind: FailureKind,
    pub message: String,
}

/// Result of one chunk invocation, tagged with its position in the stage input.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome<T> {
    pub index: usize,
    pub result: Result<Vec<T>, ChunkFailure>,
}

impl<T> ChunkOutcome<T> {
    pub fn parsed(index: usize, records: Vec<T>) -> Self {
        Self {
            index,
            result: Ok(records),
        }
    }

    pub fn failed(failure: ChunkFailure) -> Self {
        Self {
            index: failure.chunk_index,
            result: Err(failure),
        }
    }
}

/// Flat, ordered records of a stage plus the failures recorded along the way.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageOutput<T> {
    pub records: Vec<T>,
    pub failures: Vec<ChunkFailure>,
}

impl<T> Default for StageOutput<T> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> StageOutput<T> {
    /// Express this output as outcomes again, so it can be fed back to [`aggregate`].
    pub fn into_outcomes(self) -> Vec<ChunkOutcome<T>> {
        let mut outcomes = Vec::with_capacity(1 + self.failures.len());
        outcomes.push(ChunkOutcome::parsed(0, self.records));
        outcomes.extend(self.failures.into_iter().map(ChunkOutcome::failed));
        outcomes
    }
}

/// Merge chunk outcomes into chunk order, keeping each chunk's record order.
///
/// Outcomes may arrive in completion order; they are sorted by chunk index
/// first. Failed chunks contribute their failure, never a record.
pub fn aggregate<T>(outcomes: impl IntoIterator<Item = ChunkOutcome<T>>) -> StageOutput<T> {
    let mut outcomes: Vec<ChunkOutcome<T>> = outcomes.into_iter().collect();
    outcomes.sort_by_key(|o| o.index);

    let mut output = StageOutput::default();
    for outcome in outcomes {
        match outcome.result {
            Ok(records) => output.records.extend(records),
            Err(failure) => output.failures.push(failure),
        }
    }
    output
}
