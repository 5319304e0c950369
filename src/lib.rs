//! repotest - Generate and run unit tests for a repository
//!
//! A four-stage LLM pipeline (stack detection, testable units, test cases,
//! test code) over token-budgeted chunks of a repository, followed by an
//! execution dispatcher that runs the generated tests with pytest, Django's
//! test runner or Jest. Results can be committed back through the GitHub API
//! and pushes can be processed from a webhook.

pub mod chunker;
pub mod cli;
pub mod config;
pub mod error;
pub mod github;
pub mod ingest;
pub mod llm;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod tokenizer;
pub mod util;
pub mod webhook;
