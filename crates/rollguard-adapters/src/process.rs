//! Subprocess execution
//!
//! Every adapter describes its command as an [`Invocation`] and hands it to a
//! [`CommandRunner`]. The production runner spawns the program on tokio with a
//! deadline; failed exits are classified from stderr so the engine can tell
//! authorization failures from network hiccups.

use rollguard_core::{Result, RollguardError};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Default per-command deadline
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Stderr fragments that mean "credentials rejected"
pub const AUTH_MARKERS: &[&str] = &[
    "unauthenticated",
    "unauthorized",
    "token is expired",
    "invalid session",
    "401",
    "permission denied",
];

/// Stderr fragments that mean "try again later"
pub const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake",
    "timeout",
    "timed out",
    "deadline exceeded",
    "no such host",
    "serviceunavailable",
    "too many requests",
];

/// A program, its arguments and optional stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name or path
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Bytes written to stdin
    pub stdin: Option<String>,
    /// Working directory
    pub cwd: Option<PathBuf>,
    redacted: Vec<usize>,
}

impl Invocation {
    /// Create new invocation of `program`
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
            redacted: Vec::new(),
        }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument that is masked in logs
    #[must_use]
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.redacted.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// With stdin
    #[must_use]
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// With working directory
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Whether argument `index` is masked
    #[must_use]
    pub fn is_redacted(&self, index: usize) -> bool {
        self.redacted.contains(&index)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.is_redacted(i) {
                f.write_str(" ***")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Executes invocations and returns their stdout
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion
    ///
    /// # Errors
    /// A non-zero exit is classified with [`classify_failure`]; spawn failures
    /// are `Command` errors and deadline expiry is `Timeout`.
    async fn run(&self, invocation: &Invocation) -> Result<String>;
}

/// Runner that spawns real processes
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    /// Create new runner with a per-command deadline
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String> {
        debug!("exec: {}", invocation);
        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| RollguardError::Command {
            program: invocation.program.clone(),
            status: "spawn failure".to_string(),
            stderr: e.to_string(),
        })?;

        if let (Some(input), Some(mut pipe)) = (invocation.stdin.clone(), child.stdin.take()) {
            let program = invocation.program.clone();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    warn!("writing stdin of {} failed: {}", program, e);
                }
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| RollguardError::Command {
                program: invocation.program.clone(),
                status: "wait failure".to_string(),
                stderr: e.to_string(),
            })?,
            Err(_) => {
                return Err(RollguardError::Timeout {
                    operation: invocation.to_string(),
                    duration_secs: self.timeout.as_secs(),
                })
            }
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let status = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| format!("status {c}"));
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(invocation, &status, &stderr))
    }
}

/// Map a failed exit to the engine's error taxonomy
#[must_use]
pub fn classify_failure(invocation: &Invocation, status: &str, stderr: &str) -> RollguardError {
    let stderr = stderr.trim();
    let lower = stderr.to_ascii_lowercase();
    if AUTH_MARKERS.iter().any(|m| lower.contains(m)) {
        RollguardError::Auth(format!("{}: {}", invocation.program, stderr))
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        RollguardError::transient(invocation.to_string(), stderr)
    } else {
        RollguardError::Command {
            program: invocation.program.clone(),
            status: status.to_string(),
            stderr: stderr.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_masks_secret_args() {
        let inv = Invocation::new("argocd")
            .args(["login", "cd.example.com", "--password"])
            .secret_arg("hunter2")
            .arg("--grpc-web");

        assert_eq!(inv.to_string(), "argocd login cd.example.com --password *** --grpc-web");
        assert_eq!(inv.args[3], "hunter2");
    }

    #[test]
    fn classifies_auth_failures() {
        let inv = Invocation::new("argocd").arg("app");
        let err = classify_failure(&inv, "status 20", "rpc error: code = Unauthenticated desc = invalid session");
        assert!(err.is_auth());
    }

    #[test]
    fn classifies_transient_failures() {
        let inv = Invocation::new("kubectl").arg("get");
        let err = classify_failure(
            &inv,
            "status 1",
            "Unable to connect to the server: dial tcp 10.0.0.1:6443: i/o timeout",
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn other_failures_are_command_errors() {
        let inv = Invocation::new("kubectl").arg("get");
        let err = classify_failure(&inv, "status 1", "Error from server (NotFound): deployments.apps \"x\" not found\n");
        match err {
            RollguardError::Command { program, status, stderr } => {
                assert_eq!(program, "kubectl");
                assert_eq!(status, "status 1");
                assert!(!stderr.ends_with('\n'));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_captures_stdout_and_stdin() {
        let runner = SystemRunner::default();
        let out = runner.run(&Invocation::new("cat").stdin("kind: Deployment\n")).await.unwrap();
        assert_eq!(out, "kind: Deployment\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_reports_missing_program() {
        let runner = SystemRunner::default();
        let err = runner
            .run(&Invocation::new("rollguard-definitely-not-installed"))
            .await
            .unwrap_err();
        assert!(matches!(err, RollguardError::Command { ref status, .. } if status == "spawn failure"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_enforces_deadline() {
        let runner = SystemRunner::new(Duration::from_millis(50));
        let err = runner.run(&Invocation::new("sleep").arg("5")).await.unwrap_err();
        assert!(matches!(err, RollguardError::Timeout { .. }));
    }
}
