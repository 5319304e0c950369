//! Test file naming and removal of everything a run wrote.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{is_safe_relative, Runner};
use crate::pipeline::records::TestCodeArtifact;

static PY_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*from\s+[\w.]+\s+import\s+\(?\s*(?P<name>\w+)").expect("valid python import regex")
});

static JS_IMPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:import\s*\{\s*(?P<named>\w+)|import\s+(?P<default>\w+)\s+from|const\s*\{\s*(?P<destructured>\w+)[^}]*\}\s*=\s*require|const\s+(?P<required>\w+)\s*=\s*require)")
        .expect("valid js import regex")
});

const JS_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];

/// Removes tracked files and directories when dropped, newest first.
#[derive(Debug, Default)]
pub(super) struct CleanupGuard {
    files: Vec<PathBuf>,
    /// Directories we created; removed only if empty again.
    dirs: Vec<PathBuf>,
    /// Whole trees we created (virtualenvs, node_modules).
    trees: Vec<PathBuf>,
}

impl CleanupGuard {
    pub(super) fn file(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }

    pub(super) fn dir(&mut self, path: &Path) {
        self.dirs.push(path.to_path_buf());
    }

    pub(super) fn tree(&mut self, path: &Path) {
        self.trees.push(path.to_path_buf());
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        for file in self.files.iter().rev() {
            if fs::remove_file(file).is_ok() {
                debug!("Removed {}", file.display());
            }
        }
        for dir in self.dirs.iter().rev() {
            let _ = fs::remove_dir(dir);
        }
        for tree in self.trees.iter().rev() {
            let _ = fs::remove_dir_all(tree);
        }
    }
}

/// A safe, unique file name for `artifact` inside the runner's test directory.
///
/// Only the basename of the model's suggestion is used. Without one the name
/// comes from the imported function, else from the artifact id. The runner's
/// naming convention is enforced and clashes get `_2`, `_3`, ...
pub fn test_file_name(runner: Runner, artifact: &TestCodeArtifact, taken: &mut HashSet<String>) -> String {
    let suggested = basename(&artifact.file_name);
    let stem_source = if suggested.is_empty() {
        imported_name(runner, &artifact.code).unwrap_or_else(|| artifact.id.short())
    } else {
        suggested
    };

    let (stem, ext) = if runner.is_python() {
        python_name(&stem_source)
    } else {
        jest_name(&stem_source)
    };

    let mut name = format!("{}{}", stem, ext);
    let mut n = 2;
    while taken.contains(&name) {
        name = format!("{}_{}{}", stem, n, ext);
        n += 1;
    }
    taken.insert(name.clone());
    name
}

/// Repository-relative paths for publishing `artifacts`, in order.
///
/// Names follow [`test_file_name`]; Django artifacts with a usable project
/// root are placed under it.
pub fn repository_paths(runner: Runner, artifacts: &[TestCodeArtifact]) -> Vec<String> {
    let mut taken: HashMap<String, HashSet<String>> = HashMap::new();
    artifacts
        .iter()
        .map(|artifact| {
            let dir = match artifact.project_root.as_deref() {
                Some(root) if runner == Runner::DjangoTest && is_safe_relative(root) => {
                    format!("{}/{}", root.trim_end_matches('/'), runner.test_dir())
                }
                _ => runner.test_dir().to_string(),
            };
            let name = test_file_name(runner, artifact, taken.entry(dir.clone()).or_default());
            format!("{}/{}", dir, name)
        })
        .collect()
}

fn basename(raw: &str) -> String {
    let last = raw.trim().rsplit(['/', '\\']).next().unwrap_or_default();
    last.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn imported_name(runner: Runner, code: &str) -> Option<String> {
    if runner.is_python() {
        PY_IMPORT.captures(code).map(|c| c["name"].to_string())
    } else {
        let caps = JS_IMPORT.captures(code)?;
        ["named", "default", "destructured", "required"]
            .iter()
            .find_map(|g| caps.name(g))
            .map(|m| m.as_str().to_string())
    }
}

/// `test_<stem>.py` unless the stem already follows a pytest/unittest pattern.
fn python_name(source: &str) -> (String, &'static str) {
    let stem = source.strip_suffix(".py").unwrap_or(source).replace(['-', '.'], "_");
    let stem = if stem.starts_with("test_") || stem.ends_with("_test") {
        stem
    } else {
        format!("test_{}", stem)
    };
    (stem, ".py")
}

/// `<stem>.test.<ext>` keeping a JavaScript/TypeScript extension when given.
fn jest_name(source: &str) -> (String, &'static str) {
    let (mut stem, ext) = match source.rsplit_once('.') {
        Some((stem, ext)) => match JS_EXTENSIONS.iter().find(|e| e.eq_ignore_ascii_case(ext)) {
            Some(known) => (stem.to_string(), *known),
            None => (source.to_string(), "js"),
        },
        None => (source.to_string(), "js"),
    };
    for suffix in [".test", ".spec"] {
        if let Some(s) = stem.strip_suffix(suffix) {
            stem = s.to_string();
        }
    }
    let ext = match ext {
        "jsx" => ".test.jsx",
        "ts" => ".test.ts",
        "tsx" => ".test.tsx",
        "mjs" => ".test.mjs",
        "cjs" => ".test.cjs",
        _ => ".test.js",
    };
    (stem.replace('.', "_"), ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::records::RecordId;

    fn artifact(file_name: &str, code: &str) -> TestCodeArtifact {
        TestCodeArtifact {
            id: RecordId::fresh(),
            unit_id: RecordId::fresh(),
            case_ids: vec![],
            code: code.to_string(),
            file_name: file_name.to_string(),
            path: String::new(),
            test_library: String::new(),
            category: String::new(),
            regression: false,
            project_root: None,
        }
    }

    fn name(runner: Runner, file_name: &str, code: &str) -> String {
        test_file_name(runner, &artifact(file_name, code), &mut HashSet::new())
    }

    #[test]
    fn test_python_names() {
        assert_eq!(name(Runner::Pytest, "test_add.py", ""), "test_add.py");
        assert_eq!(name(Runner::Pytest, "calc_test.py", ""), "calc_test.py");
        assert_eq!(name(Runner::Pytest, "add.py", ""), "test_add.py");
        assert_eq!(name(Runner::Pytest, "tests/unit/test_x.py", ""), "test_x.py");
        assert_eq!(name(Runner::DjangoTest, "..\\..\\views.py", ""), "test_views.py");
    }

    #[test]
    fn test_python_name_from_import() {
        let code = "import pytest\nfrom calculator import add\n\ndef test_add():\n    assert add(1, 2) == 3\n";
        assert_eq!(name(Runner::Pytest, "", code), "test_add.py");
    }

    #[test]
    fn test_name_from_id_as_last_resort() {
        let a = artifact("", "assert True\n");
        let got = test_file_name(Runner::Pytest, &a, &mut HashSet::new());
        assert_eq!(got, format!("test_{}.py", a.id.short()));
    }

    #[test]
    fn test_jest_names() {
        assert_eq!(name(Runner::Jest, "add.test.js", ""), "add.test.js");
        assert_eq!(name(Runner::Jest, "add.js", ""), "add.test.js");
        assert_eq!(name(Runner::Jest, "add.spec.ts", ""), "add.test.ts");
        assert_eq!(name(Runner::Jest, "", "const { add } = require('../src/add');"), "add.test.js");
        assert_eq!(name(Runner::Jest, "", "import multiply from './math';"), "multiply.test.js");
    }

    #[test]
    fn test_collisions_get_suffix() {
        let mut taken = HashSet::new();
        let a = artifact("test_add.py", "");
        assert_eq!(test_file_name(Runner::Pytest, &a, &mut taken), "test_add.py");
        assert_eq!(test_file_name(Runner::Pytest, &a, &mut taken), "test_add_2.py");
        assert_eq!(test_file_name(Runner::Pytest, &a, &mut taken), "test_add_3.py");
    }

    #[test]
    fn test_repository_paths() {
        let plain = artifact("test_add.py", "");
        let mut rooted = artifact("test_views.py", "");
        rooted.project_root = Some("shop".to_string());
        let mut escaping = artifact("test_evil.py", "");
        escaping.project_root = Some("../elsewhere".to_string());

        let paths = repository_paths(Runner::DjangoTest, &[plain.clone(), rooted, escaping, plain]);
        assert_eq!(
            paths,
            vec![
                "tests/test_add.py",
                "shop/tests/test_views.py",
                "tests/test_evil.py",
                "tests/test_add_2.py",
            ]
        );

        let jest = repository_paths(Runner::Jest, &[artifact("add.js", "")]);
        assert_eq!(jest, vec!["__tests__/add.test.js"]);
    }

    #[test]
    fn test_cleanup_guard_removes_tracked_paths_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let created = dir.path().join("created");
        let kept = dir.path().join("kept.txt");
        fs::write(&kept, "x").unwrap();
        {
            let mut guard = CleanupGuard::default();
            fs::create_dir(&created).unwrap();
            guard.dir(&created);
            let file = created.join("a.txt");
            fs::write(&file, "a").unwrap();
            guard.file(&file);
        }
        assert!(!created.exists());
        assert!(kept.exists());
    }
}
