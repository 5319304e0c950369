use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::{load_config, Overrides};
use crate::chunker::{Chunk, ChunkSplitter};
use crate::tokenizer::Tokenizer;

/// Print how `path` would be chunked: index, token count and first line.
pub fn run(path: &Path, budget: Option<usize>, config_path: Option<String>) -> Result<()> {
    let config = load_config(config_path, &Overrides::default())?;
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let tokenizer = Arc::new(Tokenizer::for_model(&config.pipeline.encoding_model)?);
    let budget = match budget {
        Some(budget) => budget,
        None => config.pipeline.safe_budget()?,
    };
    let splitter = ChunkSplitter::new(tokenizer, budget)?;

    let chunks = splitter.split_measured(&text);
    for line in describe(&chunks) {
        println!("{}", line);
    }
    println!(
        "{} chunk(s), {} token(s), budget {}",
        chunks.len(),
        chunks.iter().map(|c| c.tokens).sum::<usize>(),
        budget
    );
    Ok(())
}

fn describe(chunks: &[Chunk]) -> Vec<String> {
    chunks
        .iter()
        .map(|chunk| {
            let first = chunk.text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
            let first: String = first.chars().take(72).collect();
            format!("{:>4}  {:>6}  {}", chunk.index, chunk.tokens, first)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_uses_first_non_blank_line() {
        let chunks = vec![
            Chunk {
                index: 0,
                text: "\n\nFile: a.py\nbody".to_string(),
                tokens: 12,
            },
            Chunk {
                index: 1,
                text: String::new(),
                tokens: 0,
            },
        ];
        assert_eq!(describe(&chunks), vec!["   0      12  File: a.py", "   1       0  "]);
    }
}
