//! Centralized Docker CLI client.
//!
//! Every `docker` subprocess the engine launches goes through
//! [`DockerClient`], which provides consistent timeout handling, error
//! mapping to [`DockerError`], and a single point where
//! `Command::new("docker")` is constructed. The raw CLI text/JSON never
//! leaves this module — callers receive typed records.

use super::DockerError;
use serde::Deserialize;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

/// One line of `docker ps --format '{{json .}}'` output.
///
/// Only the fields the detector cares about; docker emits more.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Ports", default)]
    pub ports: String,
    #[serde(rename = "Labels", default)]
    pub labels: String,
}

impl ContainerSummary {
    /// First name, without the leading slash docker sometimes includes.
    pub fn name(&self) -> &str {
        self.names
            .split(',')
            .next()
            .unwrap_or("")
            .trim_start_matches('/')
    }

    /// Image tag, or "unknown" when the image has no tag.
    pub fn version(&self) -> &str {
        match self.image.rsplit_once(':') {
            // Guard against "registry:5000/img" where the colon is a port.
            Some((_, tag)) if !tag.contains('/') => tag,
            _ => "unknown",
        }
    }
}

/// `docker inspect --format '{{json .State}}'` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Health")]
    pub health: Option<ContainerHealth>,
}

/// Built-in healthcheck state, present only when the image defines one.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerHealth {
    #[serde(rename = "Status", default)]
    pub status: String,
}

/// Centralized client for Docker CLI operations.
///
/// Cheap to construct and clone; holds no state.
#[derive(Debug, Clone, Default)]
pub struct DockerClient;

impl DockerClient {
    pub fn new() -> Self {
        DockerClient
    }

    /// Run a docker command with a timeout, returning the raw Output.
    pub(crate) async fn run(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output, DockerError> {
        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new("docker").args(args).output(),
        )
        .await;

        let cmd_str = format!("docker {}", args.join(" "));

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DockerError::exec_failed(cmd_str, e)),
            Err(_) => Err(DockerError::timeout(cmd_str, timeout)),
        }
    }

    /// Run a docker command with a timeout, returning Output only on exit 0.
    pub(crate) async fn run_success(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output, DockerError> {
        let output = self.run(args, timeout).await?;
        if output.status.success() {
            Ok(output)
        } else {
            let cmd_str = format!("docker {}", args.join(" "));
            Err(DockerError::failed(cmd_str, &output))
        }
    }

    /// Check that the daemon answers at all.
    pub async fn daemon_healthy(&self, timeout: Duration) -> bool {
        matches!(
            self.run(&["info", "--format", "{{.ServerVersion}}"], timeout)
                .await,
            Ok(output) if output.status.success()
        )
    }

    /// List all containers (running and stopped) as typed summaries.
    ///
    /// Lines that fail to parse are skipped with a debug log; a partial
    /// listing beats no listing during detection.
    pub async fn list_containers(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        let output = self
            .run_success(
                &["ps", "-a", "--no-trunc", "--format", "{{json .}}"],
                timeout,
            )
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut containers = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ContainerSummary>(line) {
                Ok(summary) => containers.push(summary),
                Err(e) => {
                    tracing::debug!("skipping unparseable docker ps line: {}", e);
                }
            }
        }
        Ok(containers)
    }

    /// Inspect a container's runtime state.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn inspect_state(
        &self,
        container: &str,
        timeout: Duration,
    ) -> Result<Option<ContainerState>, DockerError> {
        let output = self
            .run(
                &["inspect", "--format", "{{json .State}}", container],
                timeout,
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such object") || stderr.contains("No such container") {
                return Ok(None);
            }
            return Err(DockerError::failed("docker inspect", &output));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let state = serde_json::from_str::<ContainerState>(stdout.trim())
            .map_err(|e| DockerError::unexpected("docker inspect", e.to_string()))?;
        Ok(Some(state))
    }

    /// Start a stopped container.
    pub async fn start(&self, container: &str, timeout: Duration) -> Result<(), DockerError> {
        self.run_success(&["start", container], timeout).await?;
        Ok(())
    }

    /// Stop a container with a specific grace period.
    pub async fn stop(
        &self,
        container: &str,
        grace_secs: u64,
        timeout: Duration,
    ) -> Result<(), DockerError> {
        let grace = grace_secs.to_string();
        let output = self
            .run(&["stop", "-t", &grace, container], timeout)
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Err(DockerError::ContainerNotFound {
                container: container.to_string(),
            });
        }
        Err(DockerError::failed("docker stop", &output))
    }

    /// Remove a container. `Ok(())` if it is already gone.
    pub async fn remove(&self, container: &str, timeout: Duration) -> Result<(), DockerError> {
        let output = self.run(&["rm", container], timeout).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(DockerError::failed("docker rm", &output))
    }

    /// Copy a host path into a container.
    pub async fn copy_in(
        &self,
        host_path: &Path,
        container: &str,
        container_path: &str,
        timeout: Duration,
    ) -> Result<(), DockerError> {
        let src = host_path.to_string_lossy();
        let dest = format!("{}:{}", container, container_path);
        self.run_success(&["cp", src.as_ref(), &dest], timeout)
            .await?;
        Ok(())
    }

    /// Copy a container path out to the host.
    pub async fn copy_out(
        &self,
        container: &str,
        container_path: &str,
        host_path: &Path,
        timeout: Duration,
    ) -> Result<(), DockerError> {
        let src = format!("{}:{}", container, container_path);
        let dest = host_path.to_string_lossy();
        self.run_success(&["cp", &src, dest.as_ref()], timeout)
            .await?;
        Ok(())
    }

    /// Tar a named volume's contents into `backup_dir/<archive>` by running
    /// a disposable helper container. The volume is mounted read-only; the
    /// helper is removed when the tar finishes.
    pub async fn backup_volume(
        &self,
        volume: &str,
        backup_dir: &Path,
        archive: &str,
        timeout: Duration,
    ) -> Result<(), DockerError> {
        let data_mount = format!("{}:/data:ro", volume);
        let backup_mount = format!("{}:/backup", backup_dir.to_string_lossy());
        let tar_target = format!("/backup/{}", archive);
        self.run_success(
            &[
                "run", "--rm", "-v", &data_mount, "-v", &backup_mount, "alpine", "tar", "czf",
                &tar_target, "-C", "/data", ".",
            ],
            timeout,
        )
        .await?;
        Ok(())
    }

    /// Run a command inside a container and capture stdout.
    ///
    /// Returns `None` when the exec fails for any reason — used for
    /// best-effort probes (VPN address lookup) where failure is ordinary.
    pub async fn exec_capture(
        &self,
        container: &str,
        command: &[&str],
        timeout: Duration,
    ) -> Option<String> {
        let mut args = vec!["exec", container];
        args.extend_from_slice(command);
        match self.run(&args, timeout).await {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            _ => None,
        }
    }
}
