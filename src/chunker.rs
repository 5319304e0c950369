//! Token-budgeted splitting of repository content.
//!
//! Text is partitioned at file-boundary markers (a line of 60 or more `=`
//! followed by `File: <path>`), sections are packed greedily into chunks, and a
//! section that alone exceeds the budget is cut into raw token windows.
//! Concatenating the chunks always reproduces the input byte for byte.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::PipelineError;
use crate::tokenizer::{Token, Tokenizer};

/// Marker emitted by [`crate::ingest`] ahead of every file body.
pub static FILE_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^={60,}\r?\nFile: [^\n]*").expect("valid file boundary regex")
});

/// A closed chunk with its position and measured size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    tokenizer: Arc<Tokenizer>,
    budget: usize,
}

impl ChunkSplitter {
    pub fn new(tokenizer: Arc<Tokenizer>, budget: usize) -> Result<Self, PipelineError> {
        if budget == 0 {
            return Err(PipelineError::config("chunk budget must be greater than zero"));
        }
        Ok(Self { tokenizer, budget })
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Split `text` into ordered chunk strings.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }
        if self.tokenizer.count(text) <= self.budget {
            return vec![text.to_string()];
        }

        let mut packer = Packer::new(self);
        for section in split_sections(text) {
            let size = self.tokenizer.count(section);
            if size > self.budget {
                packer.push_oversized(section);
            } else {
                packer.push(section, size);
            }
        }
        let chunks = packer.finish();
        debug!(
            "Split {} bytes into {} chunk(s) at budget {}",
            text.len(),
            chunks.len(),
            self.budget
        );
        chunks
    }

    /// Same as [`split`](Self::split) with index and token count attached.
    pub fn split_measured(&self, text: &str) -> Vec<Chunk> {
        self.split(text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                index,
                tokens: self.tokenizer.count(&text),
                text,
            })
            .collect()
    }

    /// Longest decodable prefix of `tokens` holding at most `max` tokens once
    /// re-encoded. Returns the text and how many tokens it consumed.
    fn fitting_prefix(&self, tokens: &[Token], max: usize) -> Option<(String, usize)> {
        let mut n = max.min(tokens.len());
        while n > 0 {
            if let Some(text) = self.tokenizer.decode(&tokens[..n]) {
                if self.tokenizer.count(&text) <= max {
                    return Some((text, n));
                }
            }
            n -= 1;
        }
        None
    }

    /// Next window from the front of `tokens`. Windows are exactly `budget`
    /// tokens unless a character straddles the cut, in which case the window
    /// shrinks; if even one token cannot be decoded alone it grows until it can.
    fn next_window(&self, tokens: &[Token]) -> (String, usize) {
        if let Some(window) = self.fitting_prefix(tokens, self.budget) {
            return window;
        }
        for n in self.budget + 1..=tokens.len() {
            if let Some(text) = self.tokenizer.decode(&tokens[..n]) {
                return (text, n);
            }
        }
        // The full run always decodes for tokens produced by `encode`.
        (String::new(), tokens.len())
    }

    fn windows(&self, tokens: &[Token], out: &mut Vec<String>) {
        let mut offset = 0;
        while offset < tokens.len() {
            let (text, used) = self.next_window(&tokens[offset..]);
            offset += used;
            if !text.is_empty() {
                out.push(text);
            }
        }
    }
}

/// Greedy accumulator of sections into closed chunks.
struct Packer<'a> {
    splitter: &'a ChunkSplitter,
    chunks: Vec<String>,
    current: String,
    current_tokens: usize,
}

impl<'a> Packer<'a> {
    fn new(splitter: &'a ChunkSplitter) -> Self {
        Self {
            splitter,
            chunks: Vec::new(),
            current: String::new(),
            current_tokens: 0,
        }
    }

    fn push(&mut self, section: &str, size: usize) {
        if !self.current.is_empty() && self.current_tokens + size > self.splitter.budget {
            self.close();
        }
        self.current.push_str(section);
        self.current_tokens += size;
    }

    /// Top up the open chunk with the section's head, close it, then window the rest.
    fn push_oversized(&mut self, section: &str) {
        let tokens = self.splitter.tokenizer.encode(section);
        let mut offset = 0;

        let room = self.splitter.budget.saturating_sub(self.current_tokens);
        if !self.current.is_empty() && room > 0 {
            if let Some((head, used)) = self.splitter.fitting_prefix(&tokens, room) {
                self.current.push_str(&head);
                offset = used;
            }
        }
        self.close();

        self.splitter.windows(&tokens[offset..], &mut self.chunks);
    }

    fn close(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.current);
        self.current_tokens = 0;

        // Joining sections can merge tokens across the seam; re-measure.
        let tokens = self.splitter.tokenizer.encode(&text);
        if tokens.len() <= self.splitter.budget {
            self.chunks.push(text);
        } else {
            self.splitter.windows(&tokens, &mut self.chunks);
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.close();
        self.chunks
    }
}

/// Partition at boundary markers; each marker starts the section it introduces.
fn split_sections(text: &str) -> Vec<&str> {
    let mut sections = Vec::new();
    let mut start = 0;
    for m in FILE_BOUNDARY.find_iter(text) {
        if m.start() > start {
            sections.push(&text[start..m.start()]);
            start = m.start();
        }
    }
    if start < text.len() {
        sections.push(&text[start..]);
    }
    sections
}
