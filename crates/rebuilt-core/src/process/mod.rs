//! Subprocess execution boundary.
//!
//! Every external tool this crate touches (git, npm, volta) is invoked
//! through the [`CommandRunner`] trait, which returns structured
//! stdout/stderr/exit-code output. Keeping the boundary narrow has two
//! purposes: output-pattern matching lives in small parsing functions
//! instead of inline process plumbing, and the whole pipeline can be
//! exercised in tests with a scripted runner instead of real tools.
//!
//! Spawned commands never inherit the terminal: stdin is null, output is
//! captured, and `LC_ALL=C` / `NO_COLOR=1` are pinned so that scraped
//! output does not vary with the host locale or color configuration.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

#[cfg(test)]
pub(crate) mod testing;

/// Default per-invocation timeout when the request does not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// A single subprocess invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Program to execute (resolved via `PATH`).
    pub program: String,
    /// Arguments, unquoted.
    pub args: Vec<String>,
    /// Working directory; inherited when `None`.
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    pub envs: Vec<(String, String)>,
    /// Wall-clock bound for the invocation.
    pub timeout: Duration,
}

impl CommandRequest {
    /// Start building a request for `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The invocation rendered as a single line, for logs and fakes.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured output of a completed subprocess.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code; `-1` when terminated by a signal.
    pub exit_code: i32,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with code zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr concatenated, for error context.
    #[must_use]
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Errors from the process boundary itself.
///
/// A non-zero exit is not an error here: callers inspect
/// [`CommandOutput::success`] because most of the pipeline's fallback
/// ladders treat failure as a signal, not an exception.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The program could not be spawned at all.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The invocation exceeded its wall-clock bound and was killed.
    #[error("{program} timed out after {timeout_secs}s")]
    TimedOut {
        /// Program name.
        program: String,
        /// The bound that expired.
        timeout_secs: u64,
    },

    /// Waiting for the process failed.
    #[error("failed to collect output of {program}: {source}")]
    Wait {
        /// Program name.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Async subprocess runner boundary.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] only for spawn/wait/timeout failures; a
    /// non-zero exit code is reported through the returned output.
    async fn run(&self, req: &CommandRequest) -> Result<CommandOutput, ProcessError>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioRunner;

#[async_trait]
impl CommandRunner for TokioRunner {
    async fn run(&self, req: &CommandRequest) -> Result<CommandOutput, ProcessError> {
        debug!(command = %req.command_line(), cwd = ?req.cwd, "spawning");

        let mut cmd = Command::new(&req.program);
        cmd.args(&req.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out child must not outlive the dropped future.
            .kill_on_drop(true);

        if let Some(cwd) = &req.cwd {
            cmd.current_dir(cwd);
        }

        // Pin locale and color handling so scraped output is stable.
        cmd.env("LC_ALL", "C");
        cmd.env("LANG", "C");
        cmd.env("NO_COLOR", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        for (key, value) in &req.envs {
            cmd.env(key, value);
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: req.program.clone(),
            source,
        })?;

        match timeout(req.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(ProcessError::Wait {
                program: req.program.clone(),
                source,
            }),
            Err(_) => Err(ProcessError::TimedOut {
                program: req.program.clone(),
                timeout_secs: req.timeout.as_secs(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let out = TokioRunner
            .run(&CommandRequest::new("sh").args(["-c", "echo hello"]))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_a_process_error() {
        let out = TokioRunner
            .run(&CommandRequest::new("sh").args(["-c", "echo oops >&2; exit 3"]))
            .await
            .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = TokioRunner
            .run(&CommandRequest::new("rebuilt-no-such-program-xyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let err = TokioRunner
            .run(
                &CommandRequest::new("sh")
                    .args(["-c", "sleep 5"])
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn locale_is_pinned() {
        let out = TokioRunner
            .run(&CommandRequest::new("sh").args(["-c", "echo $LC_ALL"]))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "C");
    }

    #[test]
    fn command_line_renders_program_and_args() {
        let req = CommandRequest::new("git").args(["clone", "--depth", "1"]);
        assert_eq!(req.command_line(), "git clone --depth 1");
    }
}
