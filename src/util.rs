//! Shared utilities for the repotest codebase

use std::fmt;
use std::io;
use std::process::{Command, Output, Stdio};
use std::sync::mpsc;
use std::time::Duration;

/// A string wrapper that masks its contents in Debug/Display output.
/// API keys, GitHub tokens and webhook secrets travel in this type.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    /// Access the raw secret value (for headers, signatures, etc.)
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<&str> for SecretString {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Why a subprocess did not produce an [`Output`].
#[derive(Debug)]
pub enum CommandFailure {
    /// The program could not be started at all (missing binary, bad cwd).
    Spawn(io::Error),
    /// The program was killed after exceeding its time limit.
    TimedOut(Duration),
    /// The program started but waiting on it failed.
    Wait(io::Error),
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn command: {}", e),
            Self::TimedOut(d) => write!(f, "command timed out after {:?}", d),
            Self::Wait(e) => write!(f, "failed to wait for command: {}", e),
        }
    }
}

impl std::error::Error for CommandFailure {}

/// Kill a process by PID. Uses SIGKILL on Unix (Linux, macOS, WSL).
#[cfg(unix)]
fn kill_process(pid: u32) {
    let _ = Command::new("kill")
        .arg("-9")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn kill_process(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// Run a command with a timeout, killing the child process on expiry.
///
/// The caller sets the working directory on `cmd`; nothing here touches the
/// process-wide current directory.
pub fn run_cmd_with_timeout(mut cmd: Command, timeout: Duration) -> Result<Output, CommandFailure> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(CommandFailure::Spawn)?;

    let pid = child.id();
    let (sender, receiver) = mpsc::channel();

    std::thread::spawn(move || {
        let result = child.wait_with_output();
        let _ = sender.send(result);
    });

    match receiver.recv_timeout(timeout) {
        Ok(result) => result.map_err(CommandFailure::Wait),
        Err(_) => {
            kill_process(pid);
            Err(CommandFailure::TimedOut(timeout))
        }
    }
}

/// Async wrapper around [`run_cmd_with_timeout`] that keeps the blocking wait
/// off the runtime's worker threads.
pub async fn run_cmd_async(cmd: Command, timeout: Duration) -> Result<Output, CommandFailure> {
    match tokio::task::spawn_blocking(move || run_cmd_with_timeout(cmd, timeout)).await {
        Ok(result) => result,
        Err(join) => Err(CommandFailure::Wait(io::Error::other(join.to_string()))),
    }
}

/// Last `max_lines` lines of `text`, for error messages.
pub fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
