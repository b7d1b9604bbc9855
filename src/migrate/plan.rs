//! Migration plan and result records.
//!
//! A plan is a value: the strategy, the detection snapshot it was computed
//! from, and an ordered list of actions. Execution never mutates the plan;
//! it produces a separate [`MigrationResult`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::detect::ServiceRecord;

/// How the engine will handle what detection found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStrategy {
    /// Nothing relevant is running; install from scratch.
    Fresh,
    /// Our own installation exists; upgrade it in place.
    Upgrade,
    /// A foreign same-kind installation exists; absorb its data.
    MigrateExternal,
    /// Unrelated occupiers hold our ports; run alongside on alternates.
    Parallel,
}

impl fmt::Display for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationStrategy::Fresh => "fresh",
            MigrationStrategy::Upgrade => "upgrade",
            MigrationStrategy::MigrateExternal => "migrate-external",
            MigrationStrategy::Parallel => "parallel",
        };
        f.write_str(s)
    }
}

/// Kind of a single migration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    Backup,
    Stop,
    Pull,
    Remove,
    MigrateData,
    Start,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Backup => "backup",
            ActionType::Stop => "stop",
            ActionType::Pull => "pull",
            ActionType::Remove => "remove",
            ActionType::MigrateData => "migrate-data",
            ActionType::Start => "start",
        };
        f.write_str(s)
    }
}

/// One numbered step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationAction {
    /// 1-based position; actions execute in ascending order.
    pub order: usize,
    pub action: ActionType,
    /// What the action operates on: a container name, a volume, a data kind.
    pub target: String,
    pub description: String,
    /// Only reversible actions are attempted during rollback.
    pub reversible: bool,
}

/// The full decision: strategy, evidence, steps, ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub strategy: MigrationStrategy,
    /// Detection snapshot the plan was computed from.
    pub detected: Vec<ServiceRecord>,
    pub actions: Vec<MigrationAction>,
    /// Role name → resolved host port.
    pub ports: BTreeMap<String, u16>,
    pub warnings: Vec<String>,
    /// Destructive-to-foreign-data plans must be confirmed by the user.
    pub requires_confirmation: bool,
}

impl MigrationPlan {
    /// Human-readable rendering for the calling layer.
    pub fn summary(&self) -> String {
        let mut out = format!("Migration plan: {}\n", self.strategy);

        if self.detected.is_empty() {
            out.push_str("Detected services: none\n");
        } else {
            out.push_str("Detected services:\n");
            for record in &self.detected {
                let port = record
                    .port
                    .map(|p| format!(", port {}", p))
                    .unwrap_or_default();
                out.push_str(&format!(
                    "  - {} ({}, {}{})\n",
                    record.name,
                    if record.managed { "managed" } else { "external" },
                    record.state,
                    port
                ));
            }
        }

        out.push_str("Actions:\n");
        for action in &self.actions {
            out.push_str(&format!(
                "  {}. [{}] {}: {}\n",
                action.order,
                if action.reversible {
                    "reversible"
                } else {
                    "one-way"
                },
                action.action,
                action.description
            ));
        }

        if !self.ports.is_empty() {
            out.push_str("Resolved ports:\n");
            for (role, port) in &self.ports {
                if *port == 0 {
                    out.push_str(&format!("  {}: (chosen by the OS)\n", role));
                } else {
                    out.push_str(&format!("  {}: {}\n", role, port));
                }
            }
        }

        for warning in &self.warnings {
            out.push_str(&format!("Warning: {}\n", warning));
        }

        if self.requires_confirmation {
            out.push_str("This plan requires confirmation before execution.\n");
        }

        out
    }
}

/// Outcome of one executed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub action: MigrationAction,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Outcome of executing a plan. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub results: Vec<ActionResult>,
    /// True only if every action succeeded.
    pub success: bool,
    /// Where backups landed, when a backup action ran.
    pub backup_location: Option<PathBuf>,
    /// The failure that aborted the plan, if any.
    pub error: Option<String>,
}
