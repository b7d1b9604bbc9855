use std::fmt;
use std::time::Duration;

/// Structured error type for Docker and compose CLI operations.
///
/// Every subprocess failure in the docker layer maps to one of these
/// variants, so callers can distinguish "daemon is down" from "this one
/// container is gone" without string matching.
#[derive(Debug)]
pub enum DockerError {
    /// The command did not finish within its deadline.
    Timeout { command: String, timeout: Duration },

    /// The command ran and exited non-zero.
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// The binary could not be executed at all (missing, permissions).
    ExecFailed {
        command: String,
        source: std::io::Error,
    },

    /// The named container does not exist.
    ContainerNotFound { container: String },

    /// Neither `docker compose` nor `docker-compose` is available.
    ComposeUnavailable,

    /// The daemon did not answer.
    DaemonUnavailable,

    /// CLI output that should have been JSON was not parseable.
    UnexpectedOutput { command: String, detail: String },
}

impl DockerError {
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        DockerError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Build a command-failed error from a finished `std::process::Output`.
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        DockerError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code: output.status.code(),
        }
    }

    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        DockerError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    pub fn unexpected(cmd: impl Into<String>, detail: impl Into<String>) -> Self {
        DockerError::UnexpectedOutput {
            command: cmd.into(),
            detail: detail.into(),
        }
    }
}

impl fmt::Display for DockerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DockerError::Timeout { command, timeout } => write!(
                f,
                "Timed out running '{}' (exceeded {} seconds)",
                command,
                timeout.as_secs()
            ),
            DockerError::CommandFailed {
                command,
                stderr,
                exit_code,
            } => match exit_code {
                Some(code) => write!(f, "'{}' failed (exit code {}): {}", command, code, stderr),
                None => write!(f, "'{}' failed: {}", command, stderr),
            },
            DockerError::ExecFailed { command, source } => {
                write!(f, "Failed to execute '{}': {}", command, source)
            }
            DockerError::ContainerNotFound { container } => {
                write!(f, "No such container: {}", container)
            }
            DockerError::ComposeUnavailable => write!(
                f,
                "Neither 'docker compose' (v2) nor 'docker-compose' (v1) is available"
            ),
            DockerError::DaemonUnavailable => write!(f, "Docker daemon is not responding"),
            DockerError::UnexpectedOutput { command, detail } => {
                write!(f, "Could not parse output of '{}': {}", command, detail)
            }
        }
    }
}

impl std::error::Error for DockerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DockerError::ExecFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
