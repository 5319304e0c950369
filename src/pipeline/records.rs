//! Records produced by the four pipeline stages.
//!
//! Identifiers on every record are minted locally. Whatever id the model
//! returned is kept only as a `*_hint` string for human-readable linkage.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight hex digits, for file names and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    Stack,
    Units,
    TestCases,
    TestCode,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Stack => "stack",
            StageKind::Units => "units",
            StageKind::TestCases => "test-cases",
            StageKind::TestCode => "test-code",
        }
    }

    pub fn number(&self) -> u8 {
        match self {
            StageKind::Stack => 1,
            StageKind::Units => 2,
            StageKind::TestCases => 3,
            StageKind::TestCode => 4,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage 1 output for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFinding {
    pub id: RecordId,
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
}

/// Languages and frameworks merged across every Stage 1 chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechStack {
    pub languages: Vec<String>,
    pub frameworks: Vec<String>,
}

impl TechStack {
    /// Merge findings in chunk order, dropping case-insensitive duplicates.
    pub fn merge<'a>(findings: impl IntoIterator<Item = &'a StackFinding>) -> Self {
        let mut stack = TechStack::default();
        for finding in findings {
            push_unique(&mut stack.languages, &finding.languages);
            push_unique(&mut stack.frameworks, &finding.frameworks);
        }
        stack
    }

    pub fn has_language(&self, name: &str) -> bool {
        self.languages.iter().any(|l| l.eq_ignore_ascii_case(name))
    }

    pub fn has_framework(&self, name: &str) -> bool {
        self.frameworks
            .iter()
            .any(|f| f.to_lowercase().contains(&name.to_lowercase()))
    }

    pub fn is_django(&self) -> bool {
        self.has_framework("django")
    }

    pub fn languages_label(&self) -> String {
        if self.languages.is_empty() {
            "Unknown".to_string()
        } else {
            self.languages.join(" ")
        }
    }

    pub fn frameworks_label(&self) -> String {
        if self.frameworks.is_empty() {
            "None".to_string()
        } else {
            self.frameworks.join(" ")
        }
    }
}

fn push_unique(into: &mut Vec<String>, items: &[String]) {
    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if !into.iter().any(|existing| existing.eq_ignore_ascii_case(item)) {
            into.push(item.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Function,
    Class,
}

impl UnitKind {
    /// Models answer "function", "method", "Class", "class-based view"...
    pub fn from_label(label: &str) -> Self {
        if label.to_lowercase().contains("class") {
            UnitKind::Class
        } else {
            UnitKind::Function
        }
    }
}

/// A function or class that needs tests (Stage 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestableUnit {
    pub id: RecordId,
    pub path: String,
    pub name: String,
    pub kind: UnitKind,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_hint: Option<String>,
}

/// One scenario for a [`TestableUnit`] (Stage 3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: RecordId,
    /// The unit this case exercises; a reference, not ownership.
    pub unit_id: RecordId,
    pub category: String,
    pub name: String,
    pub description: String,
    pub input: Value,
    pub expected: Value,
    pub regression: bool,
}

/// One generated test file (Stage 4).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCodeArtifact {
    pub id: RecordId,
    pub unit_id: RecordId,
    pub case_ids: Vec<RecordId>,
    pub code: String,
    pub file_name: String,
    pub path: String,
    pub test_library: String,
    pub category: String,
    pub regression: bool,
    /// Relative directory holding the framework's entry point (e.g. `manage.py`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_root: Option<String>,
}
