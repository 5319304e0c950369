//! Repository ingestion: clone or open a checkout and flatten it into a
//! summary, a directory tree and marker-delimited content.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use auth_git2::GitAuthenticator;
use ignore::WalkBuilder;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Files larger than this are left out of the content.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 1024 * 1024;

const SKIPPED_DIRS: &[&str] = &["node_modules", "__pycache__", ".venv", "venv", "dist", "build"];

/// `owner/name` of a GitHub repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Accepts `https://github.com/<owner>/<name>[.git]` and `git@github.com:<owner>/<name>.git`.
    pub fn parse(url: &str) -> Option<Self> {
        let url = url.trim().trim_end_matches('/');
        let path = url
            .strip_prefix("https://github.com/")
            .or_else(|| url.strip_prefix("http://github.com/"))
            .or_else(|| url.strip_prefix("git@github.com:"))?;
        let mut parts = path.split('/');
        let owner = parts.next()?.trim();
        let name = parts.next()?.trim();
        let name = name.strip_suffix(".git").unwrap_or(name);
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Where the ingested files live. A clone is deleted when this is dropped.
#[derive(Debug)]
pub enum Workspace {
    Cloned { dir: TempDir, root: PathBuf },
    Local { root: PathBuf },
}

impl Workspace {
    pub fn root(&self) -> &Path {
        match self {
            Workspace::Cloned { root, .. } | Workspace::Local { root } => root,
        }
    }

    pub fn is_clone(&self) -> bool {
        matches!(self, Workspace::Cloned { .. })
    }
}

#[derive(Debug)]
pub struct IngestedRepo {
    /// `owner/name` for GitHub URLs, otherwise the directory name.
    pub name: String,
    pub summary: String,
    pub tree: String,
    pub content: String,
    pub file_count: usize,
    pub workspace: Workspace,
}

/// Clone `url` (optionally at branch `git_ref`) and ingest the checkout.
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn from_url(url: &str, git_ref: Option<&str>) -> Result<IngestedRepo> {
    let name = display_name(url);
    let workspace = clone_repo(url, git_ref)?;
    let rendered = render(workspace.root(), &name, DEFAULT_MAX_FILE_BYTES)?;
    Ok(rendered.into_repo(name, workspace))
}

/// Shallow clone of `url` into a fresh temporary directory.
///
/// Blocking. The clone is deleted when the returned workspace is dropped.
pub fn clone_repo(url: &str, git_ref: Option<&str>) -> Result<Workspace> {
    let dir = TempDir::new().context("Failed to create clone directory")?;
    let name = display_name(url);
    let short = name.rsplit('/').next().unwrap_or(&name).to_string();
    let root = dir.path().join(&short);

    info!("Cloning {} into {}", url, root.display());
    let auth = GitAuthenticator::default();
    let git_config = git2::Config::open_default().context("Failed to open git configuration")?;

    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(auth.credentials(&git_config));
    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.remote_callbacks(callbacks);
    // libgit2's local transport cannot fetch shallow
    if !is_local_url(url) {
        fetch_options.depth(1);
    }

    let mut builder = git2::build::RepoBuilder::new();
    builder.fetch_options(fetch_options);
    if let Some(branch) = git_ref {
        builder.branch(branch);
    }
    builder
        .clone(url, &root)
        .with_context(|| format!("Failed to clone {}", url))?;

    Ok(Workspace::Cloned { dir, root })
}

fn is_local_url(url: &str) -> bool {
    url.starts_with("file://") || Path::new(url).is_dir()
}

fn display_name(url: &str) -> String {
    RepoRef::parse(url)
        .map(|r| r.full_name())
        .unwrap_or_else(|| fallback_name(url))
}

/// Ingest a local checkout in place.
pub fn from_path(path: &Path) -> Result<IngestedRepo> {
    if !path.is_dir() {
        bail!("Not a directory: {}", path.display());
    }
    let root = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("repository")
        .to_string();

    let rendered = render(&root, &name, DEFAULT_MAX_FILE_BYTES)?;
    Ok(rendered.into_repo(name, Workspace::Local { root }))
}

/// Boundary block placed before each file body; matched by
/// [`crate::chunker::FILE_BOUNDARY`].
pub fn file_block(path: &str, body: &str) -> String {
    let rule = "=".repeat(64);
    format!("{rule}\nFile: {path}\n{rule}\n{body}\n\n")
}

#[derive(Debug)]
pub struct Rendered {
    pub summary: String,
    pub tree: String,
    pub content: String,
    pub file_count: usize,
}

impl Rendered {
    fn into_repo(self, name: String, workspace: Workspace) -> IngestedRepo {
        IngestedRepo {
            name,
            summary: self.summary,
            tree: self.tree,
            content: self.content,
            file_count: self.file_count,
            workspace,
        }
    }
}

/// Walk `root` (honouring `.gitignore`) and flatten every readable text file.
pub fn render(root: &Path, name: &str, max_file_bytes: u64) -> Result<Rendered> {
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .filter_entry(|entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            !(is_dir && entry.file_name().to_str().is_some_and(|n| SKIPPED_DIRS.contains(&n)))
        })
        .build();

    let mut content = String::new();
    let mut paths: Vec<String> = Vec::new();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > max_file_bytes {
            debug!("Skipping {} ({} bytes)", path.display(), size);
            continue;
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Skipping unreadable file {}: {}", path.display(), e);
                continue;
            }
        };
        let Ok(body) = String::from_utf8(bytes) else {
            debug!("Skipping non-UTF-8 file {}", path.display());
            continue;
        };
        if body.contains('\0') {
            continue;
        }

        let relative = relative_path(root, path);
        content.push_str(&file_block(&relative, &body));
        paths.push(relative);
    }

    let tree = render_tree(name, &paths);
    let summary = format!(
        "Repository: {}\nFiles analyzed: {}\nEstimated tokens: {}",
        name,
        paths.len(),
        content.len() / 4
    );
    Ok(Rendered {
        summary,
        tree,
        content,
        file_count: paths.len(),
    })
}

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Default)]
struct DirNode {
    children: BTreeMap<String, Option<DirNode>>,
}

/// `Directory structure:` listing with `├── ` / `└── ` connectors.
pub fn render_tree(name: &str, paths: &[String]) -> String {
    let mut root = DirNode::default();
    for path in paths {
        let parts: Vec<&str> = path.split('/').collect();
        let mut node = &mut root;
        for (i, part) in parts.iter().enumerate() {
            let is_file = i + 1 == parts.len();
            let slot = node
                .children
                .entry(part.to_string())
                .or_insert_with(|| if is_file { None } else { Some(DirNode::default()) });
            match slot {
                Some(dir) => node = dir,
                None => break,
            }
        }
    }

    let dir_name = name.rsplit('/').next().unwrap_or(name);
    let mut out = format!("Directory structure:\n└── {}/\n", dir_name);
    write_children(&root, "    ", &mut out);
    out
}

fn write_children(node: &DirNode, prefix: &str, out: &mut String) {
    let count = node.children.len();
    for (i, (name, child)) in node.children.iter().enumerate() {
        let last = i + 1 == count;
        let connector = if last { "└── " } else { "├── " };
        match child {
            Some(dir) => {
                out.push_str(&format!("{}{}{}/\n", prefix, connector, name));
                let next = format!("{}{}", prefix, if last { "    " } else { "│   " });
                write_children(dir, &next, out);
            }
            None => out.push_str(&format!("{}{}{}\n", prefix, connector, name)),
        }
    }
}

fn fallback_name(url: &str) -> String {
    let last = url
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or("repository");
    last.strip_suffix(".git").unwrap_or(last).to_string()
}
