//! Strategy selection and migration execution.
//!
//! The migrator turns a detection snapshot into exactly one strategy and an
//! ordered action plan, then executes the plan action by action. The first
//! failing action aborts the remainder; everything completed so far is
//! returned in the result. Only reversible `stop` actions are undone by
//! rollback.

mod plan;

pub use plan::{ActionResult, ActionType, MigrationAction, MigrationPlan, MigrationResult, MigrationStrategy};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Role, StackConfig};
use crate::detect::{Detector, ServiceRecord, ServiceRole};
use crate::docker::{Compose, DockerClient};
use crate::error::{Error, Result};
use crate::logging::Logger;

/// Plans and executes migrations between install states.
pub struct Migrator {
    config: Arc<StackConfig>,
    logger: Arc<Logger>,
    docker: DockerClient,
    detector: Detector,
    compose: Compose,
    dry_run: bool,
}

impl Migrator {
    pub fn new(config: Arc<StackConfig>, logger: Arc<Logger>) -> Self {
        let compose = Compose::new(config.compose_file.clone(), config.project_name.clone());
        Self {
            detector: Detector::new(config.clone(), logger.clone()),
            docker: DockerClient::new(),
            compose,
            config,
            logger,
            dry_run: false,
        }
    }

    /// Switch execution to dry-run: actions report what they would do.
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    /// Detect the current state and classify it into exactly one strategy.
    ///
    /// Priority order: our own installation wins over a same-kind external
    /// one, which wins over unrelated port occupiers, which win over the
    /// empty case.
    pub async fn analyze_existing(
        &self,
        target_ports: &BTreeMap<String, u16>,
    ) -> MigrationPlan {
        let records = self.detector.detect_existing_services().await;
        self.plan_for(records, target_ports)
    }

    /// Strategy selection and plan construction as a pure function of the
    /// detection snapshot.
    pub fn plan_for(
        &self,
        records: Vec<ServiceRecord>,
        target_ports: &BTreeMap<String, u16>,
    ) -> MigrationPlan {
        let has_managed = records.iter().any(|r| r.role == ServiceRole::Managed);
        if has_managed {
            return self.plan_upgrade(records, target_ports);
        }

        let same_kind = records
            .iter()
            .find(|r| r.role == ServiceRole::ExternalSameKind)
            .cloned();
        if let Some(external) = same_kind {
            return self.plan_migrate_external(records, external, target_ports);
        }

        let overlapping: Vec<u16> = records
            .iter()
            .filter(|r| r.is_running())
            .filter_map(|r| r.port)
            .filter(|port| target_ports.values().any(|&t| t == *port))
            .collect();
        if !overlapping.is_empty() {
            return self.plan_parallel(records, target_ports, &overlapping);
        }

        self.plan_fresh(records, target_ports)
    }

    fn plan_fresh(
        &self,
        records: Vec<ServiceRecord>,
        target_ports: &BTreeMap<String, u16>,
    ) -> MigrationPlan {
        let actions = vec![
            pull_action(1),
            start_action(2, "Start the managed stack"),
        ];
        MigrationPlan {
            strategy: MigrationStrategy::Fresh,
            detected: records,
            actions,
            ports: target_ports.clone(),
            warnings: Vec::new(),
            requires_confirmation: false,
        }
    }

    fn plan_upgrade(
        &self,
        records: Vec<ServiceRecord>,
        target_ports: &BTreeMap<String, u16>,
    ) -> MigrationPlan {
        let mut actions = vec![MigrationAction {
            order: 1,
            action: ActionType::Backup,
            target: "stack-config".to_string(),
            description: "Back up stack configuration and data volumes".to_string(),
            reversible: true,
        }];

        for record in records.iter().filter(|r| r.managed && r.is_running()) {
            let order = actions.len() + 1;
            actions.push(MigrationAction {
                order,
                action: ActionType::Stop,
                target: record.name.clone(),
                description: format!("Stop running instance {}", record.name),
                reversible: true,
            });
        }

        let order = actions.len() + 1;
        actions.push(pull_action(order));
        let order = actions.len() + 1;
        actions.push(start_action(order, "Start the upgraded stack"));

        MigrationPlan {
            strategy: MigrationStrategy::Upgrade,
            detected: records,
            actions,
            ports: target_ports.clone(),
            warnings: Vec::new(),
            requires_confirmation: false,
        }
    }

    fn plan_migrate_external(
        &self,
        records: Vec<ServiceRecord>,
        external: ServiceRecord,
        target_ports: &BTreeMap<String, u16>,
    ) -> MigrationPlan {
        let actions = vec![
            MigrationAction {
                order: 1,
                action: ActionType::Backup,
                target: external.name.clone(),
                description: format!("Back up data from external instance {}", external.name),
                reversible: true,
            },
            MigrationAction {
                order: 2,
                action: ActionType::Stop,
                target: external.name.clone(),
                description: format!("Stop external instance {}", external.name),
                reversible: true,
            },
            MigrationAction {
                order: 3,
                action: ActionType::MigrateData,
                target: "extensions".to_string(),
                description: "Copy editor extensions into the managed workbench".to_string(),
                reversible: false,
            },
            MigrationAction {
                order: 4,
                action: ActionType::MigrateData,
                target: "settings".to_string(),
                description: "Copy editor settings into the managed workbench".to_string(),
                reversible: false,
            },
            start_action(5, "Start the managed stack"),
        ];

        MigrationPlan {
            strategy: MigrationStrategy::MigrateExternal,
            detected: records,
            actions,
            ports: target_ports.clone(),
            warnings: vec![format!(
                "An external installation ({}) was found; its extensions and settings will be preserved",
                external.name
            )],
            requires_confirmation: true,
        }
    }

    fn plan_parallel(
        &self,
        records: Vec<ServiceRecord>,
        target_ports: &BTreeMap<String, u16>,
        overlapping: &[u16],
    ) -> MigrationPlan {
        let mut ports = BTreeMap::new();
        let mut warnings = Vec::new();
        for (role, &requested) in target_ports {
            if overlapping.contains(&requested) {
                let resolved = self.detector.find_free_port_excluding(overlapping);
                if resolved == 0 {
                    warnings.push(format!(
                        "no free port found for {} in the scan range; the OS will choose one",
                        role
                    ));
                } else {
                    warnings.push(format!(
                        "port {} is taken; {} will run on {} instead",
                        requested, role, resolved
                    ));
                }
                ports.insert(role.clone(), resolved);
            } else {
                ports.insert(role.clone(), requested);
            }
        }

        let actions = vec![
            pull_action(1),
            start_action(2, "Start the stack on alternate ports"),
        ];

        MigrationPlan {
            strategy: MigrationStrategy::Parallel,
            detected: records,
            actions,
            ports,
            warnings,
            requires_confirmation: false,
        }
    }

    /// Execute a plan's actions in ascending order.
    ///
    /// The first failure aborts the remainder; the partial result carries
    /// every completed action plus the wrapped error text.
    pub async fn execute(&self, plan: &MigrationPlan) -> MigrationResult {
        let mut results = Vec::with_capacity(plan.actions.len());
        let mut backup_location: Option<PathBuf> = None;

        for action in &plan.actions {
            if self.dry_run {
                self.logger.info(
                    "migrate",
                    &format!("[dry-run] {}: {}", action.action, action.description),
                );
                results.push(ActionResult {
                    action: action.clone(),
                    success: true,
                    output: format!("would execute: {}", action.description),
                    error: None,
                    duration_ms: 0,
                });
                continue;
            }

            self.logger.info(
                "migrate",
                &format!("step {}: {}", action.order, action.description),
            );
            let started = Instant::now();
            match self.run_action(action, &mut backup_location).await {
                Ok(output) => {
                    results.push(ActionResult {
                        action: action.clone(),
                        success: true,
                        output,
                        error: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    let wrapped = Error::MigrationAction {
                        order: action.order,
                        action: action.action.to_string(),
                        reason: e.to_string(),
                    };
                    self.logger.error("migrate", &wrapped.to_string());
                    results.push(ActionResult {
                        action: action.clone(),
                        success: false,
                        output: String::new(),
                        error: Some(e.to_string()),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    return MigrationResult {
                        results,
                        success: false,
                        backup_location,
                        error: Some(wrapped.to_string()),
                    };
                }
            }
        }

        MigrationResult {
            results,
            success: true,
            backup_location,
            error: None,
        }
    }

    async fn run_action(
        &self,
        action: &MigrationAction,
        backup_location: &mut Option<PathBuf>,
    ) -> Result<String> {
        match action.action {
            ActionType::Backup => {
                let dir = self.prepare_backup_dir().await?;
                let output = if action.target == "stack-config" {
                    self.backup_stack(&dir).await?
                } else {
                    self.backup_container(&action.target, &dir).await?
                };
                *backup_location = Some(dir);
                Ok(output)
            }
            ActionType::Stop => {
                self.docker
                    .stop(
                        &action.target,
                        self.config.stop_grace_secs,
                        self.config.operation_timeout(),
                    )
                    .await?;
                Ok(format!("stopped {}", action.target))
            }
            ActionType::Remove => {
                self.docker
                    .remove(&action.target, self.config.operation_timeout())
                    .await?;
                Ok(format!("removed {}", action.target))
            }
            ActionType::Pull => {
                let mut child = self.compose.spawn_pull().await?;
                let streams =
                    self.logger
                        .filter_child_streams(child.stdout.take(), child.stderr.take(), "compose");
                let waited = self
                    .compose
                    .wait("compose pull", child, self.config.operation_timeout())
                    .await;
                streams.join().await;
                waited?;
                Ok("images pulled".to_string())
            }
            ActionType::Start => {
                let mut child = self.compose.spawn_up().await?;
                let streams =
                    self.logger
                        .filter_child_streams(child.stdout.take(), child.stderr.take(), "compose");
                let waited = self
                    .compose
                    .wait("compose up", child, self.config.operation_timeout())
                    .await;
                streams.join().await;
                waited?;
                Ok("stack started".to_string())
            }
            ActionType::MigrateData => self.migrate_data(&action.target).await,
        }
    }

    async fn prepare_backup_dir(&self) -> Result<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
        let dir = self
            .config
            .state_dir
            .join("backups")
            .join(format!("backup-{}", stamp));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Backup(format!("cannot create {}: {}", dir.display(), e)))?;
        Ok(dir)
    }

    /// Back up the local config file and tar each named data volume through
    /// a disposable helper container.
    async fn backup_stack(&self, dir: &Path) -> Result<String> {
        let mut saved = Vec::new();

        if let Some(env_file) = &self.config.env_file {
            if env_file.exists() {
                let dest = dir.join(
                    env_file
                        .file_name()
                        .unwrap_or_else(|| std::ffi::OsStr::new("env")),
                );
                tokio::fs::copy(env_file, &dest)
                    .await
                    .map_err(|e| Error::Backup(format!("config copy failed: {}", e)))?;
                saved.push(env_file.display().to_string());
            }
        }

        for volume in &self.config.data_volumes {
            let archive = format!("{}.tar.gz", volume);
            self.docker
                .backup_volume(volume, dir, &archive, self.config.operation_timeout())
                .await?;
            saved.push(format!("volume {}", volume));
        }

        Ok(format!("backed up {} into {}", saved.join(", "), dir.display()))
    }

    /// Back up an external container's data directory via the container-copy
    /// primitive.
    async fn backup_container(&self, container: &str, dir: &Path) -> Result<String> {
        self.docker
            .copy_out(
                container,
                &self.config.workbench_data_path,
                dir,
                self.config.operation_timeout(),
            )
            .await?;
        Ok(format!(
            "copied {}:{} into {}",
            container,
            self.config.workbench_data_path,
            dir.display()
        ))
    }

    /// Search the well-known host config paths and copy the first match
    /// into the managed workbench container.
    async fn migrate_data(&self, kind: &str) -> Result<String> {
        let workbench = self
            .config
            .role(Role::Workbench)
            .map(|spec| spec.container.clone())
            .ok_or_else(|| Error::Config("no workbench role configured".to_string()))?;

        let relative: &[&str] = match kind {
            "extensions" => &["extensions"],
            "settings" => &["User/settings.json", "settings.json"],
            other => {
                return Err(Error::Config(format!(
                    "unknown migrate-data target '{}'",
                    other
                )))
            }
        };

        for base in &self.config.migration_search_paths {
            for rel in relative {
                let candidate = base.join(rel);
                if !candidate.exists() {
                    continue;
                }
                let dest = if kind == "extensions" {
                    self.config.workbench_data_path.clone()
                } else {
                    format!("{}/User", self.config.workbench_data_path)
                };
                // docker cp needs the destination directory to exist.
                let _ = self
                    .docker
                    .exec_capture(
                        &workbench,
                        &["mkdir", "-p", &dest],
                        std::time::Duration::from_secs(10),
                    )
                    .await;
                self.docker
                    .copy_in(&candidate, &workbench, &dest, self.config.operation_timeout())
                    .await?;
                return Ok(format!(
                    "migrated {} from {}",
                    kind,
                    candidate.display()
                ));
            }
        }

        // Nothing to migrate is an ordinary outcome, not a failure.
        Ok(format!("no migratable {} found on this host", kind))
    }

    /// Undo what can be undone, newest first.
    ///
    /// Only reversible `stop` actions are rolled back (the container is
    /// restarted). Completed `remove` actions without a prior backup are
    /// reported, not compensated.
    pub async fn rollback(&self, result: &MigrationResult) -> Vec<String> {
        let mut messages = Vec::new();
        let had_backup = result.backup_location.is_some();

        for action_result in result.results.iter().rev().filter(|r| r.success) {
            let action = &action_result.action;
            match action.action {
                ActionType::Stop if action.reversible => {
                    match self
                        .docker
                        .start(&action.target, self.config.operation_timeout())
                        .await
                    {
                        Ok(()) => {
                            self.logger
                                .info("migrate", &format!("rolled back stop of {}", action.target));
                            messages.push(format!("restarted {}", action.target));
                        }
                        Err(e) => {
                            tracing::warn!("rollback restart of {} failed: {}", action.target, e);
                            messages.push(format!(
                                "could not restart {} during rollback: {}",
                                action.target, e
                            ));
                        }
                    }
                }
                ActionType::Remove if !had_backup => {
                    messages.push(format!(
                        "remove of {} cannot be rolled back without a backup",
                        action.target
                    ));
                }
                _ => {}
            }
        }

        messages
    }
}

fn pull_action(order: usize) -> MigrationAction {
    MigrationAction {
        order,
        action: ActionType::Pull,
        target: "stack".to_string(),
        description: "Pull updated images".to_string(),
        reversible: false,
    }
}

fn start_action(order: usize, description: &str) -> MigrationAction {
    MigrationAction {
        order,
        action: ActionType::Start,
        target: "stack".to_string(),
        description: description.to_string(),
        reversible: true,
    }
}
