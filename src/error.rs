//! Run-level error taxonomy.
//!
//! Chunk-scoped failures never leave their stage; they are recorded as
//! [`ChunkFailure`](crate::pipeline::aggregate::ChunkFailure) values. The variants
//! here are the ones that abort a run and reach the top-level caller.

use thiserror::Error;

use crate::pipeline::records::StageKind;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad budget, unknown token encoding, missing credentials.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every chunk of a stage failed to reach the generation backend.
    #[error("{stage} stage: backend unreachable for all {chunks} chunk(s): {message}")]
    Transport {
        stage: StageKind,
        chunks: usize,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}
