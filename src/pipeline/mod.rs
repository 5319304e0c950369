//! The four-stage generation pipeline and its record types.

pub mod aggregate;
pub mod generator;
pub mod parse;
pub mod project_root;
pub mod records;
pub mod stage;
pub mod stages;

pub use aggregate::{aggregate, ChunkFailure, ChunkOutcome, FailureKind, StageOutput};
pub use generator::{PipelineReport, RepoInput, TestGenerator};
