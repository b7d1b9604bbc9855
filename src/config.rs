//! Stack configuration.
//!
//! Everything the engine needs to know about the stack is carried in an
//! immutable [`StackConfig`] handed over at construction: canonical container
//! names, target ports, probe lists, timeouts. There are no package-level
//! mutable globals; two engines with different configs can coexist in one
//! process.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// The fixed logical positions in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The browser-based IDE (code-server).
    Workbench,
    /// The VPN sidecar carrying remote access.
    Vpn,
    /// The AI assistant container.
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Workbench => "workbench",
            Role::Vpn => "vpn",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One role's placement in the stack: which container carries it, which
/// compose service it maps to, and the host port it should be published on
/// (if any — the VPN sidecar has no TCP port of its own).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub role: Role,
    /// Canonical container name, e.g. `deckhand-code`.
    pub container: String,
    /// Service name inside the compose file.
    pub compose_service: String,
    /// Requested host port, if the role listens on one.
    pub port: Option<u16>,
}

/// Immutable engine configuration.
///
/// `StackConfig::default()` carries the standard three-role layout; callers
/// override paths and ports before constructing the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Compose definition the engine starts and stops.
    pub compose_file: PathBuf,
    /// Compose project name (`-p`), keeping our containers in one namespace.
    pub project_name: String,
    /// Directory for durable logs and migration backups.
    pub state_dir: PathBuf,
    /// `.env`-style config file backed up before upgrades, if present.
    pub env_file: Option<PathBuf>,

    /// The fixed role table.
    pub roles: Vec<RoleSpec>,
    /// Label marking containers as ours, e.g. `io.deckhand.managed`.
    pub managed_label: String,
    /// Substring identifying a foreign instance of the same kind of service
    /// (matched against image and container name).
    pub same_kind_signature: String,
    /// Named volumes tarred into backups before destructive steps.
    pub data_volumes: Vec<String>,
    /// Host paths searched for migratable extensions/settings, in order.
    pub migration_search_paths: Vec<PathBuf>,
    /// In-container data root of the workbench, target of migrated data.
    pub workbench_data_path: String,

    /// Well-known ports probed during detection.
    pub probe_ports: Vec<u16>,
    /// Inclusive range scanned when suggesting an alternate port.
    pub port_scan_range: (u16, u16),

    /// Grace period for container stops during migration, seconds.
    pub stop_grace_secs: u64,
    /// Grace period when force-stopping stragglers on shutdown, seconds.
    pub force_stop_grace_secs: u64,
    /// Overall deadline for `start`/`stop`, seconds.
    pub operation_timeout_secs: u64,
    /// Per-role health polling deadline, seconds.
    pub health_deadline_secs: u64,
    /// Health polling interval, seconds.
    pub health_poll_secs: u64,
    /// Pause between stop and start during restart, seconds.
    pub restart_delay_secs: u64,

    /// Whether `start` waits for per-role health.
    pub health_checks: bool,
    /// Verbose mode: show everything, disable noise filtering.
    pub verbose: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        Self {
            compose_file: PathBuf::from("docker-compose.yml"),
            project_name: "deckhand".to_string(),
            state_dir: home.join(".local/state/deckhand"),
            env_file: Some(PathBuf::from(".env")),
            roles: vec![
                RoleSpec {
                    role: Role::Workbench,
                    container: "deckhand-code".to_string(),
                    compose_service: "code".to_string(),
                    port: Some(8443),
                },
                RoleSpec {
                    role: Role::Vpn,
                    container: "deckhand-vpn".to_string(),
                    compose_service: "vpn".to_string(),
                    port: None,
                },
                RoleSpec {
                    role: Role::Assistant,
                    container: "deckhand-assistant".to_string(),
                    compose_service: "assistant".to_string(),
                    port: Some(3080),
                },
            ],
            managed_label: "io.deckhand.managed".to_string(),
            same_kind_signature: "code-server".to_string(),
            data_volumes: vec!["deckhand-data".to_string()],
            migration_search_paths: vec![
                home.join(".local/share/code-server"),
                home.join(".vscode"),
                home.join(".config/Code/User"),
            ],
            workbench_data_path: "/home/coder/.local/share/code-server".to_string(),
            probe_ports: vec![8443, 8080, 3080],
            port_scan_range: (8000, 9000),
            stop_grace_secs: 10,
            force_stop_grace_secs: 2,
            operation_timeout_secs: 600,
            health_deadline_secs: 60,
            health_poll_secs: 2,
            restart_delay_secs: 2,
            health_checks: true,
            verbose: false,
        }
    }
}

impl StackConfig {
    /// The requested `role name -> host port` map, for conflict checks and
    /// migration planning. Roles without a TCP port are absent.
    pub fn target_ports(&self) -> BTreeMap<String, u16> {
        self.roles
            .iter()
            .filter_map(|spec| spec.port.map(|p| (spec.role.as_str().to_string(), p)))
            .collect()
    }

    /// All canonical container names, in role order.
    pub fn container_names(&self) -> Vec<&str> {
        self.roles.iter().map(|spec| spec.container.as_str()).collect()
    }

    /// Look up a role's spec.
    pub fn role(&self, role: Role) -> Option<&RoleSpec> {
        self.roles.iter().find(|spec| spec.role == role)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn health_deadline(&self) -> Duration {
        Duration::from_secs(self.health_deadline_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_secs(self.health_poll_secs)
    }

    /// Sanity-check the configuration before handing it to the engine.
    ///
    /// Does not touch the filesystem — existence of the compose file is a
    /// pre-flight check, not a construction-time one.
    pub fn validate(&self) -> Result<()> {
        if self.roles.is_empty() {
            return Err(Error::Config("role table is empty".to_string()));
        }
        let (low, high) = self.port_scan_range;
        if low == 0 || low > high {
            return Err(Error::Config(format!(
                "port scan range {}-{} is not a valid ascending range",
                low, high
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.roles {
            if !seen.insert(&spec.container) {
                return Err(Error::Config(format!(
                    "duplicate container name '{}' in role table",
                    spec.container
                )));
            }
            if spec.container.is_empty() || spec.compose_service.is_empty() {
                return Err(Error::Config(format!(
                    "role '{}' has an empty container or compose service name",
                    spec.role
                )));
            }
        }
        if self.health_poll_secs == 0 {
            return Err(Error::Config("health poll interval must be non-zero".to_string()));
        }
        Ok(())
    }
}
