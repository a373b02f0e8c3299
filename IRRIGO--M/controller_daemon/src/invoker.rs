//! Runs external commands and captures their output.

use std::{path::PathBuf, process::Stdio};

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

/// Captured outcome of one finished child process.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code; `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout (lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (lossy UTF-8).
    pub stderr: String,
    /// True when the child exited with status zero.
    pub success: bool,
}

/// Failures of [`ProcessInvoker::run`].
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The process could not be started at all.
    #[error("failed to launch `{program}`: {source}")]
    LaunchFailed {
        /// Program that was requested.
        program: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },
    /// The process ran but exited unsuccessfully.
    #[error("`{program}` exited with {}", describe_exit(*.exit_code))]
    CommandFailed {
        /// Program that was run.
        program: String,
        /// Exit code, `None` when killed by a signal.
        exit_code: Option<i32>,
        /// Captured stderr of the failed run.
        stderr: String,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    code.map_or_else(|| "no exit code (signal)".to_string(), |c| format!("status {c}"))
}

/// Spawns child processes, waiting for each to finish. No timeout is applied.
#[derive(Debug, Clone, Default)]
pub struct ProcessInvoker {
    working_dir: Option<PathBuf>,
}

impl ProcessInvoker {
    /// Creates an invoker running children in the current directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every child in `dir`.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Runs `program` with `args` and returns the result regardless of exit status.
    ///
    /// The child is killed if the returned future is dropped before completion.
    pub async fn run_unchecked<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<ProcessResult, InvokeError> {
        let mut cmd = Command::new(program);
        for arg in args {
            cmd.arg(AsRef::<str>::as_ref(arg));
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .await
            .map_err(|source| InvokeError::LaunchFailed {
                program: program.to_string(),
                source,
            })?;
        Ok(ProcessResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
        })
    }

    /// Runs `program` with `args`; a non-zero exit becomes [`InvokeError::CommandFailed`].
    pub async fn run<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<ProcessResult, InvokeError> {
        let result = self.run_unchecked(program, args).await?;
        if result.success {
            Ok(result)
        } else {
            Err(InvokeError::CommandFailed {
                program: program.to_string(),
                exit_code: result.exit_code,
                stderr: result.stderr,
            })
        }
    }
}
