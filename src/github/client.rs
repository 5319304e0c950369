use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{auth, FileAddition, HostingError};
use crate::config::GitHubConfig;
use crate::ingest::RepoRef;
use crate::util::SecretString;

const USER_AGENT: &str = "repotest";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const REPOSITORY_QUERY: &str = r#"
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    id
    defaultBranchRef {
      name
      target { oid }
    }
  }
}"#;

const BRANCH_OID_QUERY: &str = r#"
query($owner: String!, $name: String!, $qualifiedName: String!) {
  repository(owner: $owner, name: $name) {
    ref(qualifiedName: $qualifiedName) {
      target {
        ... on Commit { oid }
      }
    }
  }
}"#;

const CREATE_REF_MUTATION: &str = r#"
mutation($input: CreateRefInput!) {
  createRef(input: $input) {
    ref { name }
  }
}"#;

const CREATE_COMMIT_MUTATION: &str = r#"
mutation($input: CreateCommitOnBranchInput!) {
  createCommitOnBranch(input: $input) {
    commit { oid url }
  }
}"#;

const MERGE_BRANCH_MUTATION: &str = r#"
mutation($input: MergeBranchInput!) {
  mergeBranch(input: $input) {
    clientMutationId
    mergeCommit { oid }
  }
}"#;

/// Thin GitHub API client. Every mutation that moves a branch takes the head
/// oid the caller last saw; a stale oid surfaces as [`HostingError::Conflict`].
pub struct GitHubClient {
    http: Client,
    api_url: String,
    graphql_url: String,
    token: SecretString,
}

/// Identity and default-branch head of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub id: String,
    pub default_branch: String,
    pub head_oid: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryData {
    repository: Option<RepositoryNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    id: String,
    default_branch_ref: Option<RefNode>,
}

#[derive(Deserialize)]
struct RefNode {
    #[serde(default)]
    name: String,
    target: Option<Target>,
}

#[derive(Deserialize)]
struct Target {
    oid: Option<String>,
}

#[derive(Deserialize)]
struct BranchData {
    repository: Option<BranchRepository>,
}

#[derive(Deserialize)]
struct BranchRepository {
    #[serde(rename = "ref")]
    reference: Option<RefNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRefData {
    create_ref: Option<CreateRefPayload>,
}

#[derive(Deserialize)]
struct CreateRefPayload {
    #[serde(rename = "ref")]
    reference: Option<RefNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateCommitData {
    create_commit_on_branch: Option<CommitPayload>,
}

#[derive(Deserialize)]
struct CommitPayload {
    commit: Option<Target>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergeData {
    merge_branch: Option<MergePayload>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MergePayload {
    merge_commit: Option<Target>,
}

#[derive(Serialize)]
struct EncodedAddition<'a> {
    path: &'a str,
    contents: String,
}

#[derive(Deserialize)]
struct ContentsResponse {
    content: String,
    #[serde(default)]
    encoding: String,
}

impl GitHubClient {
    pub fn new(token: SecretString) -> Result<Self, HostingError> {
        let defaults = GitHubConfig::default();
        Self::with_urls(token, &defaults.api_url, &defaults.graphql_url)
    }

    pub fn with_urls(token: SecretString, api_url: &str, graphql_url: &str) -> Result<Self, HostingError> {
        Ok(Self {
            http: http_client()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            graphql_url: graphql_url.to_string(),
            token,
        })
    }

    /// Authenticate for `repo`: a GitHub App installation token when an app
    /// is configured, otherwise the token from `token_env`.
    pub async fn from_config(config: &GitHubConfig, repo: &RepoRef) -> anyhow::Result<Self> {
        let token = match (&config.app_id, &config.private_key_path) {
            (Some(app_id), Some(key_path)) => {
                let pem = std::fs::read(key_path)
                    .with_context(|| format!("Failed to read GitHub App key {}", key_path.display()))?;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .context("System clock is before the Unix epoch")?
                    .as_secs();
                let jwt = auth::app_jwt(app_id, &pem, now)?;
                auth::installation_token(&http_client()?, &config.api_url, &jwt, repo)
                    .await
                    .with_context(|| format!("Failed to get installation token for {}", repo.full_name()))?
            }
            _ => config.token()?,
        };
        Ok(Self::with_urls(token, &config.api_url, &config.graphql_url)?)
    }

    /// POST one GraphQL document and return its `data` member.
    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T, HostingError> {
        let response = self
            .http
            .post(&self.graphql_url)
            .bearer_auth(self.token.expose())
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HostingError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: Value =
            serde_json::from_str(&body).map_err(|e| HostingError::Decode(format!("invalid JSON: {}", e)))?;
        if let Some(errors) = parsed.get("errors").filter(|e| !is_empty_errors(e)) {
            return Err(classify_errors(errors, body));
        }

        let data = parsed.get("data").cloned().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| HostingError::Decode(e.to_string()))
    }

    pub async fn repository(&self, repo: &RepoRef) -> Result<RepositoryInfo, HostingError> {
        let data: RepositoryData = self
            .graphql(REPOSITORY_QUERY, json!({ "owner": repo.owner, "name": repo.name }))
            .await?;
        let node = data
            .repository
            .ok_or_else(|| HostingError::Decode(format!("repository {} not found", repo.full_name())))?;
        let default_ref = node
            .default_branch_ref
            .ok_or_else(|| HostingError::Decode(format!("repository {} has no default branch", repo.full_name())))?;
        let head_oid = default_ref
            .target
            .and_then(|t| t.oid)
            .ok_or_else(|| HostingError::Decode(format!("default branch of {} has no commit", repo.full_name())))?;

        Ok(RepositoryInfo {
            id: node.id,
            default_branch: default_ref.name,
            head_oid,
        })
    }

    pub async fn repository_id(&self, repo: &RepoRef) -> Result<String, HostingError> {
        self.repository(repo).await.map(|info| info.id)
    }

    /// Commit oid at the tip of `branch`.
    pub async fn branch_oid(&self, repo: &RepoRef, branch: &str) -> Result<String, HostingError> {
        let data: BranchData = self
            .graphql(
                BRANCH_OID_QUERY,
                json!({
                    "owner": repo.owner,
                    "name": repo.name,
                    "qualifiedName": qualified_branch(branch),
                }),
            )
            .await?;
        data.repository
            .and_then(|r| r.reference)
            .and_then(|r| r.target)
            .and_then(|t| t.oid)
            .ok_or_else(|| HostingError::Decode(format!("branch '{}' not found in {}", branch, repo.full_name())))
    }

    /// Create `refs/heads/<name>` at `oid`; returns the new ref's name.
    pub async fn create_branch(&self, repository_id: &str, name: &str, oid: &str) -> Result<String, HostingError> {
        let data: CreateRefData = self
            .graphql(
                CREATE_REF_MUTATION,
                json!({
                    "input": {
                        "repositoryId": repository_id,
                        "name": qualified_branch(name),
                        "oid": oid,
                    }
                }),
            )
            .await?;
        let created = data
            .create_ref
            .and_then(|p| p.reference)
            .map(|r| r.name)
            .ok_or_else(|| HostingError::Decode("createRef returned no ref".to_string()))?;
        info!("Created branch {}", created);
        Ok(created)
    }

    /// Commit `additions` on top of `expected_head_oid`; returns the new commit oid.
    pub async fn create_commit(
        &self,
        repo: &RepoRef,
        branch: &str,
        headline: &str,
        additions: &[FileAddition],
        expected_head_oid: &str,
    ) -> Result<String, HostingError> {
        let encoded: Vec<EncodedAddition> = additions
            .iter()
            .map(|a| EncodedAddition {
                path: &a.path,
                contents: BASE64.encode(a.contents.as_bytes()),
            })
            .collect();

        let data: CreateCommitData = self
            .graphql(
                CREATE_COMMIT_MUTATION,
                json!({
                    "input": {
                        "branch": {
                            "repositoryNameWithOwner": repo.full_name(),
                            "branchName": branch,
                        },
                        "message": { "headline": headline },
                        "fileChanges": { "additions": encoded },
                        "expectedHeadOid": expected_head_oid,
                    }
                }),
            )
            .await?;
        let oid = data
            .create_commit_on_branch
            .and_then(|p| p.commit)
            .and_then(|c| c.oid)
            .ok_or_else(|| HostingError::Decode("createCommitOnBranch returned no commit".to_string()))?;
        info!("Committed {} file(s) to {} as {}", additions.len(), branch, oid);
        Ok(oid)
    }

    /// Merge `head` into `base`. `None` when there was nothing to merge.
    pub async fn merge_branch(
        &self,
        repository_id: &str,
        base: &str,
        head: &str,
        message: &str,
        author_email: &str,
    ) -> Result<Option<String>, HostingError> {
        let data: MergeData = self
            .graphql(
                MERGE_BRANCH_MUTATION,
                json!({
                    "input": {
                        "repositoryId": repository_id,
                        "base": base,
                        "head": head,
                        "commitMessage": message,
                        "authorEmail": author_email,
                        "clientMutationId": uuid::Uuid::new_v4().to_string(),
                    }
                }),
            )
            .await?;
        Ok(data.merge_branch.and_then(|m| m.merge_commit).and_then(|c| c.oid))
    }

    /// Text of `path` at `git_ref` via the REST contents API.
    pub async fn file_content(&self, repo: &RepoRef, path: &str, git_ref: &str) -> Result<String, HostingError> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url,
            repo.owner,
            repo.name,
            path.trim_start_matches('/')
        );
        let response = self
            .http
            .get(url)
            .query(&[("ref", git_ref)])
            .bearer_auth(self.token.expose())
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(HostingError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let contents: ContentsResponse =
            serde_json::from_str(&body).map_err(|e| HostingError::Decode(format!("{}: {}", path, e)))?;
        if !contents.encoding.is_empty() && contents.encoding != "base64" {
            return Err(HostingError::Decode(format!(
                "{}: unsupported encoding '{}'",
                path, contents.encoding
            )));
        }
        let compact: String = contents.content.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64
            .decode(compact)
            .map_err(|e| HostingError::Decode(format!("{}: {}", path, e)))?;
        String::from_utf8(bytes).map_err(|_| HostingError::Decode(format!("{}: not UTF-8 text", path)))
    }
}

/// Where a published set of files landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCommit {
    pub branch: String,
    pub oid: String,
}

/// Create `branch` from the default branch head and commit `files` onto it.
///
/// The commit expects the head that was just read, so a concurrent push to
/// the new branch fails with [`HostingError::Conflict`] instead of being
/// overwritten.
pub async fn publish_artifacts(
    client: &GitHubClient,
    repo: &RepoRef,
    branch: &str,
    files: &[FileAddition],
    headline: &str,
) -> Result<PublishedCommit, HostingError> {
    let info = client.repository(repo).await?;
    debug!(
        "Branching {} from {}@{}",
        branch, info.default_branch, info.head_oid
    );
    client.create_branch(&info.id, branch, &info.head_oid).await?;
    let oid = client
        .create_commit(repo, branch, headline, files, &info.head_oid)
        .await?;
    Ok(PublishedCommit {
        branch: branch.to_string(),
        oid,
    })
}

fn http_client() -> Result<Client, HostingError> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()?)
}

fn qualified_branch(branch: &str) -> String {
    if branch.starts_with("refs/") {
        branch.to_string()
    } else {
        format!("refs/heads/{}", branch)
    }
}

fn is_empty_errors(errors: &Value) -> bool {
    errors.is_null() || errors.as_array().is_some_and(|a| a.is_empty())
}

/// A moved head is reported as `STALE_DATA` or by its message text.
fn classify_errors(errors: &Value, body: String) -> HostingError {
    let stale = errors.as_array().into_iter().flatten().any(|e| {
        e.get("type").and_then(Value::as_str) == Some("STALE_DATA")
            || e.get("message")
                .and_then(Value::as_str)
                .is_some_and(|m| m.starts_with("Expected branch to point to"))
    });
    if stale {
        warn!("GitHub rejected a mutation against a stale head");
        HostingError::Conflict { payload: body }
    } else {
        HostingError::GraphQl { payload: body }
    }
}
