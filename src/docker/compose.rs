//! Compose invocation layer.
//!
//! Wraps `docker compose` (v2) with a fallback to the standalone
//! `docker-compose` (v1) binary, detected once per process and cached.

use super::DockerError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::OnceCell;

/// Which compose flavour is installed.
#[derive(Debug, Clone, Copy)]
enum ComposeBinary {
    /// `docker compose` plugin.
    V2,
    /// Standalone `docker-compose`.
    V1,
}

static COMPOSE_BINARY: OnceCell<ComposeBinary> = OnceCell::const_new();

impl ComposeBinary {
    async fn detect() -> Result<ComposeBinary, DockerError> {
        let v2 = tokio::process::Command::new("docker")
            .args(["compose", "version"])
            .output()
            .await;
        if let Ok(output) = v2 {
            if output.status.success() {
                return Ok(ComposeBinary::V2);
            }
        }

        let v1 = tokio::process::Command::new("docker-compose")
            .arg("--version")
            .output()
            .await;
        if let Ok(output) = v1 {
            if output.status.success() {
                return Ok(ComposeBinary::V1);
            }
        }

        Err(DockerError::ComposeUnavailable)
    }

    async fn get() -> Result<ComposeBinary, DockerError> {
        COMPOSE_BINARY
            .get_or_try_init(|| async { Self::detect().await })
            .await
            .copied()
    }

    fn program_and_prefix(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            ComposeBinary::V2 => ("docker", &["compose"]),
            ComposeBinary::V1 => ("docker-compose", &[]),
        }
    }
}

/// Handle on one compose project: a definition file plus a project name.
#[derive(Debug, Clone)]
pub struct Compose {
    file: PathBuf,
    project: String,
}

impl Compose {
    pub fn new(file: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            project: project.into(),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    async fn base_command(&self) -> Result<tokio::process::Command, DockerError> {
        let binary = ComposeBinary::get().await?;
        let (program, prefix) = binary.program_and_prefix();
        let mut command = tokio::process::Command::new(program);
        command.args(prefix);
        command.args(["-f"]);
        command.arg(&self.file);
        command.args(["-p", &self.project]);
        Ok(command)
    }

    /// Spawn `pull` with piped stdout/stderr so the caller can stream-filter
    /// the output. The child is not awaited here.
    pub async fn spawn_pull(&self) -> Result<Child, DockerError> {
        let mut command = self.base_command().await?;
        command
            .arg("pull")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
            .spawn()
            .map_err(|e| DockerError::exec_failed("compose pull", e))
    }

    /// Spawn `up -d` with piped stdout/stderr.
    pub async fn spawn_up(&self) -> Result<Child, DockerError> {
        let mut command = self.base_command().await?;
        command
            .args(["up", "-d"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
            .spawn()
            .map_err(|e| DockerError::exec_failed("compose up", e))
    }

    /// Run `down` to completion under a deadline.
    pub async fn down(&self, timeout: Duration) -> Result<(), DockerError> {
        let mut command = self.base_command().await?;
        command.arg("down");
        let result = tokio::time::timeout(timeout, command.output()).await;
        match result {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(DockerError::failed("compose down", &output)),
            Ok(Err(e)) => Err(DockerError::exec_failed("compose down", e)),
            Err(_) => Err(DockerError::timeout("compose down", timeout)),
        }
    }

    /// Wait for a spawned compose child under a deadline, mapping non-zero
    /// exit to a structured error. Stream readers consume the output; only
    /// the exit status is judged here.
    pub async fn wait(
        &self,
        label: &str,
        mut child: Child,
        timeout: Duration,
    ) -> Result<(), DockerError> {
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(DockerError::CommandFailed {
                command: label.to_string(),
                stderr: String::new(),
                exit_code: status.code(),
            }),
            Ok(Err(e)) => Err(DockerError::exec_failed(label, e)),
            Err(_) => {
                // Deadline passed: reap the child before reporting.
                let _ = child.kill().await;
                Err(DockerError::timeout(label, timeout))
            }
        }
    }
}
