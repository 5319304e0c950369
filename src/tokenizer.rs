//! Token counting tied to one model's BPE encoding.
//!
//! All chunk budgets are computed against this count, so an unknown model is
//! a configuration error rather than a reason to guess another encoding.

use std::fmt;
use std::sync::Arc;

use tiktoken_rs::CoreBPE;

use crate::error::PipelineError;

pub type Token = usize;

#[derive(Clone)]
pub struct Tokenizer {
    model: String,
    bpe: Arc<CoreBPE>,
}

impl fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokenizer").field("model", &self.model).finish()
    }
}

impl Tokenizer {
    /// Load the encoding used by `model` (e.g. "gpt-3.5-turbo" -> cl100k_base).
    pub fn for_model(model: &str) -> Result<Self, PipelineError> {
        let bpe = tiktoken_rs::get_bpe_from_model(model).map_err(|e| {
            PipelineError::config(format!("unknown token encoding for model '{}': {}", model, e))
        })?;
        Ok(Self {
            model: model.to_string(),
            bpe: Arc::new(bpe),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn count(&self, text: &str) -> usize {
        self.encode(text).len()
    }

    pub fn encode(&self, text: &str) -> Vec<Token> {
        self.bpe.encode_ordinary(text)
    }

    /// Decode a token window back to text.
    ///
    /// Fails when the window cuts through a multi-byte character; callers that
    /// window arbitrary token ranges must be ready to widen or narrow the cut.
    pub fn decode(&self, tokens: &[Token]) -> Option<String> {
        self.bpe.decode(tokens.to_vec()).ok()
    }
}
