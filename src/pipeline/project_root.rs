//! Locating the directory a framework's test command must run from.
//!
//! Django projects are often nested (`repo/mysite/manage.py`). The directory
//! tree is authoritative when it shows `manage.py`; the model's
//! `project_root_path` is only a fallback hint and is normalized before use.

use std::path::{Component, Path};

use super::records::TechStack;

const BRANCH: &str = "├── ";
const LAST: &str = "└── ";

/// Project root for one Stage 4 artifact, relative to the repository root.
///
/// `None` means the repository root itself (or a non-Django stack).
pub fn resolve(
    stack: &TechStack,
    tree: Option<&str>,
    repo_name: Option<&str>,
    hint: Option<&str>,
) -> Option<String> {
    if !stack.is_django() {
        return None;
    }
    if let Some(found) = tree.and_then(|t| find_in_tree(t, "manage.py")) {
        return (!found.is_empty()).then_some(found);
    }
    hint.and_then(|h| normalize_hint(h, repo_name))
}

/// Directory (relative, without the tree's root entry) that contains `file_name`.
///
/// Returns `Some("")` when the file sits at the repository root.
pub fn find_in_tree(tree: &str, file_name: &str) -> Option<String> {
    let mut dirs: Vec<String> = Vec::new();

    for line in tree.lines() {
        let Some((depth, name)) = tree_entry(line) else {
            continue;
        };
        dirs.truncate(depth);

        if let Some(dir) = name.strip_suffix('/') {
            dirs.push(dir.to_string());
            continue;
        }
        if name == file_name {
            // dirs[0] is the repository directory itself
            let parents = dirs.get(1..depth).unwrap_or_default();
            return Some(parents.join("/"));
        }
    }
    None
}

/// Depth and name of one `├── name` / `└── name` tree line.
fn tree_entry(line: &str) -> Option<(usize, &str)> {
    let (prefix, name) = line
        .split_once(BRANCH)
        .or_else(|| line.split_once(LAST))?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((prefix.chars().count() / 4, name))
}

/// Clean a model-supplied root: relative, no traversal, no repository prefix.
pub fn normalize_hint(hint: &str, repo_name: Option<&str>) -> Option<String> {
    let hint = hint.trim().trim_matches(|c: char| c == '"' || c == '\'');
    if hint.is_empty() || hint.eq_ignore_ascii_case("none") || hint.eq_ignore_ascii_case("null") {
        return None;
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(hint).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::ParentDir => return None,
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    if parts.iter().any(|p| p.contains(':')) {
        return None;
    }

    if let (Some(first), Some(repo)) = (parts.first(), repo_name) {
        if is_repo_prefix(first, repo) {
            parts.remove(0);
        }
    }

    (!parts.is_empty()).then(|| parts.join("/"))
}

/// `repo`, `owner-repo` and `owner/repo` spellings of the checkout directory.
fn is_repo_prefix(component: &str, repo_name: &str) -> bool {
    let (owner, repo) = match repo_name.split_once('/') {
        Some((owner, repo)) => (Some(owner), repo),
        None => (None, repo_name),
    };
    if repo.is_empty() {
        return false;
    }
    component.eq_ignore_ascii_case(repo)
        || owner.is_some_and(|o| component.eq_ignore_ascii_case(&format!("{}-{}", o, repo)))
        || component
            .to_lowercase()
            .ends_with(&format!("-{}", repo.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = "Directory structure:
└── acme-shop/
    ├── README.md
    ├── requirements.txt
    └── shop/
        ├── manage.py
        ├── shop/
        │   ├── settings.py
        │   └── urls.py
        └── orders/
            ├── models.py
            └── views.py
";

    fn django() -> TechStack {
        TechStack {
            languages: vec!["Python".into()],
            frameworks: vec!["Django".into()],
        }
    }

    #[test]
    fn test_find_manage_py_in_nested_tree() {
        assert_eq!(find_in_tree(TREE, "manage.py").as_deref(), Some("shop"));
        assert_eq!(find_in_tree(TREE, "views.py").as_deref(), Some("shop/orders"));
        assert_eq!(find_in_tree(TREE, "README.md").as_deref(), Some(""));
        assert_eq!(find_in_tree(TREE, "missing.py"), None);
    }

    #[test]
    fn test_tree_wins_over_hint() {
        let root = resolve(&django(), Some(TREE), Some("acme/shop"), Some("/elsewhere"));
        assert_eq!(root.as_deref(), Some("shop"));
    }

    #[test]
    fn test_manage_py_at_root_is_none() {
        let tree = "Directory structure:\n└── site/\n    ├── manage.py\n    └── app/\n        └── models.py\n";
        assert_eq!(resolve(&django(), Some(tree), None, Some("app")), None);
    }

    #[test]
    fn test_non_django_has_no_root() {
        let stack = TechStack {
            languages: vec!["Python".into()],
            frameworks: vec!["Flask".into()],
        };
        assert_eq!(resolve(&stack, Some(TREE), None, Some("shop")), None);
    }

    #[test]
    fn test_hint_strips_repository_prefix() {
        assert_eq!(
            normalize_hint("/acme-shop/shop", Some("acme/shop")).as_deref(),
            Some("shop")
        );
        assert_eq!(
            normalize_hint("shop/mysite", Some("acme/shop")).as_deref(),
            Some("mysite")
        );
        assert_eq!(normalize_hint("./mysite/", None).as_deref(), Some("mysite"));
    }

    #[test]
    fn test_hint_rejects_traversal_and_empty() {
        assert_eq!(normalize_hint("../../etc", None), None);
        assert_eq!(normalize_hint("None", None), None);
        assert_eq!(normalize_hint("null", None), None);
        assert_eq!(normalize_hint("  ", None), None);
        assert_eq!(normalize_hint("/", None), None);
    }

    #[test]
    fn test_hint_is_never_absolute() {
        let root = normalize_hint("/srv/app", None).unwrap();
        assert!(!root.starts_with('/'));
        assert_eq!(root, "srv/app");
    }

    #[test]
    fn test_hint_used_without_tree() {
        let root = resolve(&django(), None, Some("acme/shop"), Some("acme-shop/backend"));
        assert_eq!(root.as_deref(), Some("backend"));
    }
}
