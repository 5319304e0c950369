//! JSON report written by `analyze --output` and by webhook deliveries.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::pipeline::PipelineReport;
use crate::runner::RunReport;

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    pub pipeline: PipelineReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReport>,
}

impl AnalysisReport {
    pub fn new(repository: impl Into<String>, pipeline: PipelineReport) -> Self {
        Self {
            repository: repository.into(),
            commit: None,
            pipeline,
            run: None,
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_run(mut self, run: Option<RunReport>) -> Self {
        self.run = run;
        self
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;
        fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_json_creates_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("acme-shop.json");
        AnalysisReport::new("acme/shop", PipelineReport::default())
            .with_commit("abc123")
            .write_json(&path)
            .unwrap();

        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["repository"], "acme/shop");
        assert_eq!(value["commit"], "abc123");
        assert!(value["pipeline"]["artifacts"].as_array().unwrap().is_empty());
        assert!(value.get("run").is_none());
    }
}
