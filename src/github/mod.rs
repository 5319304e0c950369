//! GitHub as the version control hosting collaborator: GraphQL mutations keyed
//! by expected head oids, REST file contents, and GitHub App installation auth.

pub mod auth;
pub mod client;

pub use client::{publish_artifacts, GitHubClient, PublishedCommit, RepositoryInfo};

use thiserror::Error;

/// Errors from the hosting API.
#[derive(Debug, Error)]
pub enum HostingError {
    /// The branch head moved since it was read. `payload` is the response body
    /// exactly as GitHub sent it; callers must refetch state before retrying.
    #[error("Branch head changed concurrently: {payload}")]
    Conflict { payload: String },

    #[error("GitHub GraphQL API returned errors: {payload}")]
    GraphQl { payload: String },

    #[error("GitHub API call failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("GitHub request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected GitHub response: {0}")]
    Decode(String),

    #[error("GitHub authentication failed: {0}")]
    Auth(String),
}

impl HostingError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// One file written by a commit. `contents` is plain text; it is base64
/// encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAddition {
    pub path: String,
    pub contents: String,
}

impl FileAddition {
    pub fn new(path: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
        }
    }
}
