//! The parts of a GitHub `push` delivery the pipeline needs.

use serde::Deserialize;

use crate::ingest::RepoRef;

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref", default)]
    pub git_ref: String,
    /// Commit the branch points to after the push.
    #[serde(default)]
    pub after: String,
    pub repository: PushRepository,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
    #[serde(default)]
    pub head_commit: Option<PushCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub clone_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushCommit {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
}

/// Net effect of a push on file paths, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedPaths {
    /// Added or modified and still present after the push.
    pub present: Vec<String>,
    pub removed: Vec<String>,
}

impl ChangedPaths {
    pub fn is_empty(&self) -> bool {
        self.present.is_empty() && self.removed.is_empty()
    }
}

impl PushEvent {
    pub fn repo_ref(&self) -> Option<RepoRef> {
        let (owner, name) = self.repository.full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(RepoRef {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    /// Branch name for `refs/heads/*` pushes; tags and other refs yield `None`.
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }

    /// Commit whose file contents should be read.
    pub fn commit_sha(&self) -> Option<&str> {
        let after = self.after.trim();
        if !after.is_empty() && after.chars().any(|c| c != '0') {
            return Some(after);
        }
        self.head_commit
            .as_ref()
            .map(|c| c.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn clone_url(&self) -> String {
        self.repository
            .clone_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", self.repository.full_name))
    }

    /// Replay every commit in order; a later removal cancels an earlier
    /// add and a later add revives an earlier removal.
    pub fn changed_paths(&self) -> ChangedPaths {
        let commits: Vec<&PushCommit> = if self.commits.is_empty() {
            self.head_commit.iter().collect()
        } else {
            self.commits.iter().collect()
        };

        let mut changes = ChangedPaths::default();
        for commit in commits {
            for path in commit.added.iter().chain(&commit.modified) {
                changes.removed.retain(|p| p != path);
                if !changes.present.contains(path) {
                    changes.present.push(path.clone());
                }
            }
            for path in &commit.removed {
                changes.present.retain(|p| p != path);
                if !changes.removed.contains(path) {
                    changes.removed.push(path.clone());
                }
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{
        "ref": "refs/heads/main",
        "before": "1111111111111111111111111111111111111111",
        "after": "2222222222222222222222222222222222222222",
        "repository": {
            "name": "shop",
            "full_name": "acme/shop",
            "clone_url": "https://github.com/acme/shop.git",
            "owner": {"login": "acme"}
        },
        "commits": [
            {"id": "aaa", "added": ["shop/cart.py"], "removed": [], "modified": ["shop/views.py"]},
            {"id": "bbb", "added": ["tmp.py"], "removed": ["old.py"], "modified": ["shop/cart.py"]},
            {"id": "ccc", "added": [], "removed": ["tmp.py"], "modified": []}
        ],
        "head_commit": {"id": "ccc", "added": [], "removed": ["tmp.py"], "modified": []}
    }"#;

    fn event() -> PushEvent {
        serde_json::from_str(PAYLOAD).unwrap()
    }

    #[test]
    fn test_changed_paths_net_effect() {
        let changes = event().changed_paths();
        assert_eq!(changes.present, vec!["shop/cart.py", "shop/views.py"]);
        assert_eq!(changes.removed, vec!["old.py", "tmp.py"]);
    }

    #[test]
    fn test_identity_fields() {
        let event = event();
        let repo = event.repo_ref().unwrap();
        assert_eq!(repo.full_name(), "acme/shop");
        assert_eq!(event.branch(), Some("main"));
        assert_eq!(event.commit_sha(), Some("2222222222222222222222222222222222222222"));
        assert_eq!(event.clone_url(), "https://github.com/acme/shop.git");
    }

    #[test]
    fn test_head_commit_fallbacks() {
        let event: PushEvent = serde_json::from_str(
            r#"{
                "ref": "refs/tags/v1",
                "after": "0000000000000000000000000000000000000000",
                "repository": {"name": "shop", "full_name": "acme/shop"},
                "head_commit": {"id": "ddd", "added": ["a.py"], "removed": [], "modified": []}
            }"#,
        )
        .unwrap();
        assert_eq!(event.branch(), None);
        assert_eq!(event.commit_sha(), Some("ddd"));
        assert_eq!(event.changed_paths().present, vec!["a.py"]);
        assert_eq!(event.clone_url(), "https://github.com/acme/shop.git");
    }
}
