//! VPN client (tailscale) translation layer.
//!
//! Mirrors the docker module's policy: subprocess text is parsed here and
//! nowhere else, and every probe is best-effort — a missing or silent
//! tailscale binary yields `None`, never an error. Detection treats an
//! absent VPN daemon as ordinary.

use serde::Deserialize;
use std::time::Duration;

use crate::docker::DockerClient;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed subset of `tailscale status --json`.
#[derive(Debug, Clone)]
pub struct VpnStatus {
    /// Daemon backend state, e.g. "Running" or "Stopped".
    pub backend_state: String,
    /// Addresses assigned to this host on the tailnet.
    pub self_ips: Vec<String>,
    /// Client version string.
    pub version: String,
}

impl VpnStatus {
    pub fn is_running(&self) -> bool {
        self.backend_state.eq_ignore_ascii_case("running")
    }
}

#[derive(Debug, Deserialize)]
struct RawStatus {
    #[serde(rename = "BackendState", default)]
    backend_state: String,
    #[serde(rename = "Version", default)]
    version: String,
    #[serde(rename = "Self")]
    self_node: Option<RawSelf>,
}

#[derive(Debug, Deserialize)]
struct RawSelf {
    #[serde(rename = "TailscaleIPs", default)]
    ips: Vec<String>,
}

/// Probes the host-level VPN client CLI.
#[derive(Debug, Clone)]
pub struct VpnClient {
    binary: String,
}

impl Default for VpnClient {
    fn default() -> Self {
        Self {
            binary: "tailscale".to_string(),
        }
    }
}

impl VpnClient {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Option<String> {
        let result = tokio::time::timeout(
            PROBE_TIMEOUT,
            tokio::process::Command::new(&self.binary)
                .args(args)
                .output(),
        )
        .await;
        match result {
            Ok(Ok(output)) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                tracing::debug!("vpn command {:?} exited with {}", args, output.status);
                None
            }
            Ok(Err(e)) => {
                tracing::debug!("vpn command {:?} could not run: {}", args, e);
                None
            }
            Err(_) => {
                tracing::debug!("vpn command {:?} timed out", args);
                None
            }
        }
    }

    /// Query the daemon's status. `None` when the binary is missing, the
    /// daemon is down, or the JSON does not parse.
    pub async fn daemon_status(&self) -> Option<VpnStatus> {
        let stdout = self.run(&["status", "--json"]).await?;
        let raw: RawStatus = serde_json::from_str(&stdout).ok()?;
        Some(VpnStatus {
            backend_state: raw.backend_state,
            self_ips: raw.self_node.map(|s| s.ips).unwrap_or_default(),
            version: raw.version,
        })
    }

    /// The host's IPv4 tailnet address, if connected.
    pub async fn host_address(&self) -> Option<String> {
        let stdout = self.run(&["ip", "-4"]).await?;
        let addr = stdout.lines().next()?.trim();
        if addr.is_empty() {
            None
        } else {
            Some(addr.to_string())
        }
    }

    /// The tailnet address as seen from inside the VPN sidecar container.
    ///
    /// Used when the host has no tailscale client of its own and remote
    /// access is carried entirely by the sidecar.
    pub async fn container_address(&self, docker: &DockerClient, container: &str) -> Option<String> {
        let stdout = docker
            .exec_capture(container, &["tailscale", "ip", "-4"], PROBE_TIMEOUT)
            .await?;
        let addr = stdout.lines().next()?.trim();
        if addr.is_empty() {
            None
        } else {
            Some(addr.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_json_parses() {
        let payload = r#"{
            "Version": "1.66.4",
            "BackendState": "Running",
            "Self": {"HostName": "devbox", "TailscaleIPs": ["100.64.0.7", "fd7a::7"]}
        }"#;
        let raw: RawStatus = serde_json::from_str(payload).unwrap();
        assert_eq!(raw.backend_state, "Running");
        assert_eq!(raw.self_node.unwrap().ips[0], "100.64.0.7");
    }

    #[test]
    fn backend_state_case_insensitive() {
        let status = VpnStatus {
            backend_state: "running".into(),
            self_ips: vec![],
            version: String::new(),
        };
        assert!(status.is_running());
        let stopped = VpnStatus {
            backend_state: "NeedsLogin".into(),
            self_ips: vec![],
            version: String::new(),
        };
        assert!(!stopped.is_running());
    }

    #[tokio::test]
    async fn missing_binary_yields_none() {
        let client = VpnClient::with_binary("deckhand-no-such-vpn-binary");
        assert!(client.daemon_status().await.is_none());
        assert!(client.host_address().await.is_none());
    }
}
