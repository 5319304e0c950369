//! Execution Dispatcher: write generated tests into a checkout, run the
//! matching test runner and collect per-test outcomes.
//!
//! Every file the dispatcher creates is removed again when the run ends,
//! including on error. The checkout itself belongs to the caller (see
//! [`crate::ingest::Workspace`]).

pub mod django;
pub mod jest;
pub mod pytest;
mod workspace;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::pipeline::records::{TechStack, TestCodeArtifact};
use crate::util::{run_cmd_async, tail, CommandFailure};

pub use workspace::{repository_paths, test_file_name};
use workspace::CleanupGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Runner {
    Pytest,
    DjangoTest,
    Jest,
}

impl Runner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Runner::Pytest => "pytest",
            Runner::DjangoTest => "django-test",
            Runner::Jest => "jest",
        }
    }

    /// Directory the runner discovers tests in, relative to its working root.
    pub fn test_dir(&self) -> &'static str {
        match self {
            Runner::Pytest | Runner::DjangoTest => "tests",
            Runner::Jest => "__tests__",
        }
    }

    pub fn is_python(&self) -> bool {
        matches!(self, Runner::Pytest | Runner::DjangoTest)
    }

    fn parser(&self) -> &'static dyn OutputParser {
        match self {
            Runner::Pytest => &pytest::PytestParser,
            Runner::DjangoTest => &django::DjangoParser,
            Runner::Jest => &jest::JestParser,
        }
    }
}

impl fmt::Display for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick a runner from the first detected language that has one.
pub fn select_runner(stack: &TechStack) -> Result<Runner, RunnerError> {
    for language in &stack.languages {
        match language.to_lowercase().as_str() {
            "python" => {
                return Ok(if stack.is_django() {
                    Runner::DjangoTest
                } else {
                    Runner::Pytest
                })
            }
            "javascript" | "typescript" | "node" | "nodejs" | "node.js" => return Ok(Runner::Jest),
            _ => {}
        }
    }
    Err(RunnerError::Unsupported {
        languages: stack.languages_label(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Error,
    Unknown,
}

/// Fully-qualified test name to outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExecutionResult(BTreeMap<String, TestStatus>);

impl ExecutionResult {
    pub fn insert(&mut self, name: impl Into<String>, status: TestStatus) {
        self.0.insert(name.into(), status);
    }

    pub fn get(&self, name: &str) -> Option<TestStatus> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TestStatus)> {
        self.0.iter()
    }

    pub fn count(&self, status: TestStatus) -> usize {
        self.0.values().filter(|s| **s == status).count()
    }

    pub fn merge(&mut self, other: ExecutionResult) {
        self.0.extend(other.0);
    }
}

impl FromIterator<(String, TestStatus)> for ExecutionResult {
    fn from_iter<I: IntoIterator<Item = (String, TestStatus)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Turns one runner's textual output into results. Lines it does not
/// recognise are skipped, never counted as failures.
pub trait OutputParser: Send + Sync {
    fn parse(&self, stdout: &str, stderr: &str) -> ExecutionResult;
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no test runner for languages: {languages}")]
    Unsupported { languages: String },

    #[error("{program} could not start: {message}")]
    CannotStart { program: String, message: String },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} exited with {status} and reported no results:\n{output}")]
    NoResults {
        program: String,
        status: String,
        output: String,
    },
}

/// One invocation (or setup step) that produced no results, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerFailure {
    pub target: String,
    pub message: String,
}

impl RunnerFailure {
    fn new(target: impl Into<String>, err: &RunnerError) -> Self {
        Self {
            target: target.into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub runner: Option<Runner>,
    pub results: ExecutionResult,
    pub errors: Vec<RunnerFailure>,
}

impl RunReport {
    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} failed, {} errors, {} unknown, {} runner failure(s)",
            self.results.count(TestStatus::Passed),
            self.results.count(TestStatus::Failed),
            self.results.count(TestStatus::Error),
            self.results.count(TestStatus::Unknown),
            self.errors.len()
        )
    }
}

const PYTEST_INI: &str = "[pytest]
testpaths = tests
pythonpath = .
python_files = test_*.py *_test.py
python_functions = test_* check_*
";

pub struct Dispatcher {
    config: RunnerConfig,
}

impl Dispatcher {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Write `artifacts` under `root`, run them and report per-test outcomes.
    ///
    /// Runner problems end up in [`RunReport::errors`]; this never fails.
    pub async fn dispatch(&self, root: &Path, stack: &TechStack, artifacts: &[TestCodeArtifact]) -> RunReport {
        let mut report = RunReport::default();

        let runner = match select_runner(stack) {
            Ok(runner) => runner,
            Err(e) => {
                warn!("{}", e);
                report.errors.push(RunnerFailure::new("selection", &e));
                return report;
            }
        };
        report.runner = Some(runner);

        if artifacts.is_empty() {
            info!("No test files to run");
            return report;
        }

        let work_root = work_root(root, runner, artifacts);
        let mut guard = CleanupGuard::default();

        let written = match self.place(&work_root, runner, artifacts, &mut guard) {
            Ok(written) => written,
            Err(e) => {
                warn!("Could not write test files: {}", e);
                report.errors.push(RunnerFailure::new("placement", &e));
                return report;
            }
        };
        info!(
            "Wrote {} test file(s) to {}",
            written.len(),
            work_root.join(runner.test_dir()).display()
        );

        match runner {
            Runner::Pytest => {
                let python = self.prepare_python(&work_root, false, &mut guard, &mut report).await;
                for file in &written {
                    let target = format!("{}/{}", runner.test_dir(), file);
                    let args = ["-m", "pytest", target.as_str(), "-v"];
                    self.invoke_into(&python, &args, &work_root, runner, &target, &mut report)
                        .await;
                }
            }
            Runner::DjangoTest => {
                let python = self.prepare_python(&work_root, true, &mut guard, &mut report).await;
                let args = ["manage.py", "test", runner.test_dir(), "-v", "2"];
                self.invoke_into(&python, &args, &work_root, runner, "manage.py test", &mut report)
                    .await;
            }
            Runner::Jest => {
                self.prepare_jest(&work_root, &mut guard, &mut report).await;
                let npx = self.config.npx.clone();
                self.invoke_into(&npx, &["jest", "--json"], &work_root, runner, "jest", &mut report)
                    .await;
            }
        }

        info!("Test run finished: {}", report.summary());
        report
    }

    /// Write every artifact into the runner's test directory.
    fn place(
        &self,
        work_root: &Path,
        runner: Runner,
        artifacts: &[TestCodeArtifact],
        guard: &mut CleanupGuard,
    ) -> Result<Vec<String>, RunnerError> {
        let test_dir = work_root.join(runner.test_dir());
        if !test_dir.exists() {
            fs::create_dir_all(&test_dir)?;
            guard.dir(&test_dir);
        }

        if runner.is_python() {
            let init = test_dir.join("__init__.py");
            if !init.exists() {
                fs::write(&init, "")?;
                guard.file(&init);
            }
        }
        if runner == Runner::Pytest {
            let ini = work_root.join("pytest.ini");
            if !ini.exists() {
                fs::write(&ini, PYTEST_INI)?;
                guard.file(&ini);
            }
        }

        let mut taken: HashSet<String> = fs::read_dir(&test_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();

        let mut written = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let name = test_file_name(runner, artifact, &mut taken);
            let path = test_dir.join(&name);
            fs::write(&path, &artifact.code)?;
            guard.file(&path);
            debug!("Wrote {}", path.display());
            written.push(name);
        }
        Ok(written)
    }

    /// Interpreter to run tests with: a fresh virtualenv when setup is on,
    /// otherwise (or if setup fails) the configured interpreter.
    async fn prepare_python(
        &self,
        work_root: &Path,
        django: bool,
        guard: &mut CleanupGuard,
        report: &mut RunReport,
    ) -> String {
        let system = self.config.python.clone();
        if !self.config.setup_env {
            return system;
        }

        let venv = work_root.join(".venv");
        if !venv.exists() {
            info!("Creating virtualenv in {}", venv.display());
            if let Err(e) = self
                .run(&system, &["-m", "venv", ".venv"], work_root, self.config.install_timeout())
                .await
            {
                warn!("virtualenv setup failed: {}", e);
                report.errors.push(RunnerFailure::new("environment", &e));
                return system;
            }
            guard.tree(&venv);
        }

        let python = venv_python(&venv);
        let python = python.to_string_lossy().into_owned();

        let mut args: Vec<&str> = vec!["-m", "pip", "install", "--quiet", "pytest"];
        if django {
            args.push("django");
        }
        if work_root.join("requirements.txt").exists() {
            args.extend(["-r", "requirements.txt"]);
        }
        info!("Installing test dependencies");
        if let Err(e) = self
            .run(&python, &args, work_root, self.config.install_timeout())
            .await
        {
            warn!("dependency install failed: {}", e);
            report.errors.push(RunnerFailure::new("environment", &e));
        }
        python
    }

    async fn prepare_jest(&self, work_root: &Path, guard: &mut CleanupGuard, report: &mut RunReport) {
        if !self.config.setup_env {
            return;
        }
        let manifest = work_root.join("package.json");
        if !manifest.exists() {
            guard.file(&manifest);
            guard.file(&work_root.join("package-lock.json"));
        }
        let modules = work_root.join("node_modules");
        if !modules.exists() {
            guard.tree(&modules);
        }

        info!("Installing jest");
        if let Err(e) = self
            .run(
                &self.config.npm,
                &["install", "--save-dev", "jest"],
                work_root,
                self.config.install_timeout(),
            )
            .await
        {
            warn!("jest install failed: {}", e);
            report.errors.push(RunnerFailure::new("environment", &e));
        }
    }

    async fn invoke_into(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
        runner: Runner,
        target: &str,
        report: &mut RunReport,
    ) {
        info!("Running {} ({})", runner, target);
        match self.invoke(program, args, cwd, runner.parser()).await {
            Ok(results) => report.results.merge(results),
            Err(e) => {
                warn!("{} failed: {}", target, e);
                report.errors.push(RunnerFailure::new(target, &e));
            }
        }
    }

    /// Run one test command and parse its output.
    pub async fn invoke(
        &self,
        program: &str,
        args: &[&str],
        cwd: &Path,
        parser: &dyn OutputParser,
    ) -> Result<ExecutionResult, RunnerError> {
        let output = spawn(program, args, cwd, self.config.test_timeout()).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        let results = parser.parse(&stdout, &stderr);
        if results.is_empty() && !output.status.success() {
            return Err(RunnerError::NoResults {
                program: program.to_string(),
                status: output.status.to_string(),
                output: tail(&format!("{}\n{}", stdout, stderr), 20),
            });
        }
        Ok(results)
    }

    /// Setup command that must exit successfully.
    async fn run(&self, program: &str, args: &[&str], cwd: &Path, timeout: Duration) -> Result<(), RunnerError> {
        let output = spawn(program, args, cwd, timeout).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(RunnerError::NoResults {
            program: format!("{} {}", program, args.join(" ")),
            status: output.status.to_string(),
            output: tail(&String::from_utf8_lossy(&output.stderr), 20),
        })
    }
}

async fn spawn(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> Result<std::process::Output, RunnerError> {
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd);
    debug!("$ {} {} (in {})", program, args.join(" "), cwd.display());

    run_cmd_async(cmd, timeout).await.map_err(|e| match e {
        CommandFailure::Spawn(err) => RunnerError::CannotStart {
            program: program.to_string(),
            message: err.to_string(),
        },
        CommandFailure::TimedOut(timeout) => RunnerError::Timeout {
            program: program.to_string(),
            timeout,
        },
        CommandFailure::Wait(err) => RunnerError::Io(err),
    })
}

fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(target_os = "windows") {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

/// The checkout root, or for Django the first usable artifact project root.
fn work_root(root: &Path, runner: Runner, artifacts: &[TestCodeArtifact]) -> PathBuf {
    if runner != Runner::DjangoTest {
        return root.to_path_buf();
    }
    let candidate = artifacts
        .iter()
        .filter_map(|a| a.project_root.as_deref())
        .find(|p| is_safe_relative(p));
    match candidate {
        Some(rel) if root.join(rel).is_dir() => {
            debug!("Using Django project root {}", rel);
            root.join(rel)
        }
        Some(rel) => {
            warn!("Project root {} does not exist; using repository root", rel);
            root.to_path_buf()
        }
        None => root.to_path_buf(),
    }
}

fn is_safe_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::records::RecordId;
    use tempfile::TempDir;

    fn stack(languages: &[&str], frameworks: &[&str]) -> TechStack {
        TechStack {
            languages: languages.iter().map(|s| s.to_string()).collect(),
            frameworks: frameworks.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn artifact(file_name: &str, code: &str) -> TestCodeArtifact {
        TestCodeArtifact {
            id: RecordId::fresh(),
            unit_id: RecordId::fresh(),
            case_ids: vec![],
            code: code.to_string(),
            file_name: file_name.to_string(),
            path: String::new(),
            test_library: "pytest".to_string(),
            category: String::new(),
            regression: false,
            project_root: None,
        }
    }

    fn no_setup() -> RunnerConfig {
        RunnerConfig {
            setup_env: false,
            test_timeout_secs: 30,
            ..RunnerConfig::default()
        }
    }

    #[test]
    fn test_select_runner() {
        assert_eq!(select_runner(&stack(&["Python"], &[])).unwrap(), Runner::Pytest);
        assert_eq!(
            select_runner(&stack(&["Python", "HTML"], &["Django"])).unwrap(),
            Runner::DjangoTest
        );
        assert_eq!(select_runner(&stack(&["JavaScript"], &["Express"])).unwrap(), Runner::Jest);
        assert_eq!(select_runner(&stack(&["HTML", "TypeScript"], &[])).unwrap(), Runner::Jest);
        assert!(matches!(
            select_runner(&stack(&["Go"], &[])),
            Err(RunnerError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_work_root_uses_existing_django_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("site")).unwrap();
        let mut a = artifact("test_x.py", "");
        a.project_root = Some("site".to_string());
        assert_eq!(work_root(dir.path(), Runner::DjangoTest, &[a.clone()]), dir.path().join("site"));
        assert_eq!(work_root(dir.path(), Runner::Pytest, &[a.clone()]), dir.path());

        a.project_root = Some("../escape".to_string());
        assert_eq!(work_root(dir.path(), Runner::DjangoTest, &[a]), dir.path());
    }

    #[test]
    fn test_place_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(no_setup());
        let artifacts = vec![
            artifact("test_add.py", "def test_a(): pass\n"),
            artifact("../../evil.py", "def test_b(): pass\n"),
            artifact("test_add.py", "def test_c(): pass\n"),
        ];
        {
            let mut guard = CleanupGuard::default();
            let written = dispatcher
                .place(dir.path(), Runner::Pytest, &artifacts, &mut guard)
                .unwrap();
            assert_eq!(written, vec!["test_add.py", "test_evil.py", "test_add_2.py"]);
            assert!(dir.path().join("tests/__init__.py").exists());
            assert!(dir.path().join("pytest.ini").exists());
            assert!(!dir.path().parent().unwrap().join("evil.py").exists());
        }
        assert!(!dir.path().join("tests").exists());
        assert!(!dir.path().join("pytest.ini").exists());
    }

    #[test]
    fn test_existing_files_survive_cleanup() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("tests")).unwrap();
        fs::write(dir.path().join("tests/test_mine.py"), "x").unwrap();
        fs::write(dir.path().join("pytest.ini"), "[pytest]\n").unwrap();
        let dispatcher = Dispatcher::new(no_setup());
        {
            let mut guard = CleanupGuard::default();
            let written = dispatcher
                .place(dir.path(), Runner::Pytest, &[artifact("test_mine.py", "y")], &mut guard)
                .unwrap();
            assert_eq!(written, vec!["test_mine_2.py"]);
        }
        assert_eq!(fs::read_to_string(dir.path().join("tests/test_mine.py")).unwrap(), "x");
        assert_eq!(fs::read_to_string(dir.path().join("pytest.ini")).unwrap(), "[pytest]\n");
        assert!(!dir.path().join("tests/test_mine_2.py").exists());
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(RunnerConfig {
            python: "repotest-no-such-python-xyz".to_string(),
            ..no_setup()
        });
        let report = dispatcher
            .dispatch(dir.path(), &stack(&["Python"], &[]), &[artifact("test_a.py", "")])
            .await;
        assert_eq!(report.runner, Some(Runner::Pytest));
        assert!(report.results.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].message.contains("could not start"));
        assert!(!dir.path().join("tests").exists());
    }

    #[tokio::test]
    async fn test_unsupported_stack() {
        let dir = TempDir::new().unwrap();
        let report = Dispatcher::new(no_setup())
            .dispatch(dir.path(), &stack(&["COBOL"], &[]), &[artifact("t.cob", "")])
            .await;
        assert_eq!(report.runner, None);
        assert_eq!(report.errors[0].target, "selection");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_parses_stdout() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(no_setup());
        let results = dispatcher
            .invoke(
                "sh",
                &["-c", "printf 'test_add PASSED\\ntest_sub FAILED\\n'; exit 1"],
                dir.path(),
                &pytest::PytestParser,
            )
            .await
            .unwrap();
        assert_eq!(results.get("test_add"), Some(TestStatus::Passed));
        assert_eq!(results.get("test_sub"), Some(TestStatus::Failed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invoke_without_results_surfaces_output() {
        let dir = TempDir::new().unwrap();
        let dispatcher = Dispatcher::new(no_setup());
        let err = dispatcher
            .invoke(
                "sh",
                &["-c", "echo 'No module named pytest' >&2; exit 1"],
                dir.path(),
                &pytest::PytestParser,
            )
            .await
            .unwrap_err();
        match err {
            RunnerError::NoResults { output, .. } => assert!(output.contains("No module named pytest")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
