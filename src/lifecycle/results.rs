//! Lifecycle operation results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::detect::ServiceState;

/// Observed state of one role, either after startup health polling or from
/// a read-only status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Role name: "workbench", "vpn", "assistant".
    pub role: String,
    /// Canonical container name.
    pub container: String,
    pub container_id: Option<String>,
    pub state: ServiceState,
    pub port: Option<u16>,
    /// Where a health probe would reach the role, for display.
    pub health_url: Option<String>,
    pub error: Option<String>,
}

impl ServiceStatus {
    pub fn is_up(&self) -> bool {
        matches!(self.state, ServiceState::Running | ServiceState::Healthy)
    }
}

/// Outcome of a `start` operation.
///
/// Partial success is first-class: health misses land in `warnings` and the
/// per-role statuses, while `success` reflects only hard errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupResult {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub services: Vec<ServiceStatus>,
    /// Reachable URLs, best transport first.
    pub access_urls: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub success: bool,
}

/// Outcome of a `stop` operation. Failures are collected, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResult {
    pub stopped_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Role name → whether its container is verified stopped/absent.
    pub stopped: BTreeMap<String, bool>,
    pub errors: Vec<String>,
    pub success: bool,
}
