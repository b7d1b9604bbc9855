//! Stack lifecycle orchestration.
//!
//! The [`LifecycleManager`] is the entry point callers use: pre-flight
//! checks, migration execution, compose pull/up/down, sequential per-role
//! health polling, and access-URL resolution. Roles are polled one at a
//! time on purpose — interleaved health output from three containers is
//! harder to read than a slightly longer wait.

mod results;

pub use results::{ServiceStatus, ShutdownResult, StartupResult};

use chrono::Utc;
use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Role, RoleSpec, StackConfig};
use crate::detect::ServiceState;
use crate::docker::{Compose, ContainerState, DockerClient};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::migrate::{MigrationPlan, Migrator};
use crate::vpn::VpnClient;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestrates the managed stack from pre-flight to health.
pub struct LifecycleManager {
    config: Arc<StackConfig>,
    logger: Arc<Logger>,
    docker: DockerClient,
    vpn: VpnClient,
    compose: Compose,
    migrator: Migrator,
}

impl LifecycleManager {
    pub fn new(config: StackConfig, logger: Arc<Logger>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let compose = Compose::new(config.compose_file.clone(), config.project_name.clone());
        let migrator = Migrator::new(config.clone(), logger.clone());
        Ok(Self {
            docker: DockerClient::new(),
            vpn: VpnClient::new(),
            compose,
            migrator,
            config,
            logger,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Verify the environment and compute the migration plan.
    ///
    /// An unreachable daemon or a missing compose file is fatal; everything
    /// else becomes part of the returned plan for the caller to inspect and
    /// confirm.
    pub async fn pre_start_check(&self) -> Result<MigrationPlan> {
        if !self.docker.daemon_healthy(Duration::from_secs(5)).await {
            return Err(Error::DaemonUnavailable);
        }
        if !self.config.compose_file.is_file() {
            return Err(Error::ComposeFileMissing(self.config.compose_file.clone()));
        }

        let plan = self
            .migrator
            .analyze_existing(&self.config.target_ports())
            .await;
        self.logger.info(
            "lifecycle",
            &format!("pre-start analysis selected strategy '{}'", plan.strategy),
        );
        Ok(plan)
    }

    /// Bring the stack up, optionally executing a previously computed plan.
    ///
    /// Bounded by the overall operation timeout. Migration failure is
    /// recorded as a warning and startup continues; health misses degrade
    /// the affected role, never the whole operation.
    pub async fn start(&self, plan: Option<MigrationPlan>) -> Result<StartupResult> {
        let timeout = self.config.operation_timeout();
        match tokio::time::timeout(timeout, self.start_inner(plan)).await {
            Ok(result) => Ok(result),
            Err(_) => Err(Error::Timeout {
                operation: "start".to_string(),
                seconds: self.config.operation_timeout_secs,
            }),
        }
    }

    async fn start_inner(&self, plan: Option<MigrationPlan>) -> StartupResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if let Some(plan) = plan {
            self.logger.info(
                "lifecycle",
                &format!("executing migration plan ({})", plan.strategy),
            );
            let migration = self.migrator.execute(&plan).await;
            warnings.extend(plan.warnings.iter().cloned());
            if !migration.success {
                // Startup continues; the stack may still come up useful.
                let reason = migration
                    .error
                    .unwrap_or_else(|| "unknown migration failure".to_string());
                warnings.push(format!("migration incomplete: {}", reason));
            }
        }

        if let Err(e) = self.pull_images().await {
            errors.push(format!("image pull failed: {}", e));
        }

        if let Err(e) = self.compose_up().await {
            errors.push(format!("stack start failed: {}", e));
        }

        let mut services = Vec::new();
        if self.config.health_checks {
            for spec in &self.config.roles {
                let status = self.poll_role_health(spec).await;
                match status.state {
                    ServiceState::Healthy | ServiceState::Running => {
                        self.logger.info(
                            "lifecycle",
                            &format!("{} is {}", status.container, status.state),
                        );
                    }
                    _ => {
                        if let Some(error) = &status.error {
                            warnings.push(format!("{}: {}", status.container, error));
                        }
                    }
                }
                services.push(status);
            }
        } else {
            services = self.status().await;
        }

        let access_urls = self.resolve_access_urls().await;

        let success = errors.is_empty();
        StartupResult {
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            services,
            access_urls,
            warnings,
            errors,
            success,
        }
    }

    async fn pull_images(&self) -> Result<()> {
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
        Ok(())
    }

    async fn compose_up(&self) -> Result<()> {
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
        Ok(())
    }

    /// Poll one role's container until it is conclusively up, down, or the
    /// per-role deadline passes.
    async fn poll_role_health(&self, spec: &RoleSpec) -> ServiceStatus {
        let mut status = self.blank_status(spec);

        // A role whose container never appeared is reported stopped, with
        // the cause attached.
        match self.docker.inspect_state(&spec.container, INSPECT_TIMEOUT).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                status.state = ServiceState::Stopped;
                status.error = Some("container was not created".to_string());
                return status;
            }
            Err(e) => {
                status.state = ServiceState::Unknown;
                status.error = Some(e.to_string());
                return status;
            }
        }

        let deadline = Instant::now() + self.config.health_deadline();
        loop {
            match self.docker.inspect_state(&spec.container, INSPECT_TIMEOUT).await {
                Ok(Some(state)) => {
                    if !state.running {
                        status.state = ServiceState::Stopped;
                        status.error = Some("container is not running".to_string());
                        return status;
                    }
                    match state.health.as_ref().map(|h| h.status.as_str()) {
                        // No healthcheck defined: running is as good as it gets.
                        None => {
                            status.state = ServiceState::Running;
                            return status;
                        }
                        Some("healthy") => {
                            status.state = ServiceState::Healthy;
                            return status;
                        }
                        // "starting" / "unhealthy": keep polling until the deadline.
                        Some(_) => {}
                    }
                }
                Ok(None) => {
                    status.state = ServiceState::Stopped;
                    status.error = Some("container disappeared during health wait".to_string());
                    return status;
                }
                Err(e) => {
                    // Transient inspect failure; the deadline bounds retries.
                    self.logger.debug(
                        "lifecycle",
                        &format!("inspect of {} failed: {}", spec.container, e),
                    );
                }
            }

            if Instant::now() >= deadline {
                status.state = ServiceState::Unhealthy;
                status.error = Some(format!(
                    "did not become healthy within {}s",
                    self.config.health_deadline_secs
                ));
                return status;
            }

            self.logger.progress(
                "lifecycle",
                &format!("waiting for {} to become healthy", spec.container),
            );
            tokio::time::sleep(self.config.health_poll_interval()).await;
        }
    }

    fn blank_status(&self, spec: &RoleSpec) -> ServiceStatus {
        ServiceStatus {
            role: spec.role.as_str().to_string(),
            container: spec.container.clone(),
            container_id: None,
            state: ServiceState::Unknown,
            port: spec.port,
            health_url: spec.port.map(|p| format!("http://127.0.0.1:{}", p)),
            error: None,
        }
    }

    /// Take the stack down and verify every canonical container actually
    /// stopped, force-stopping stragglers. Failures are collected, not
    /// thrown.
    pub async fn stop(&self) -> ShutdownResult {
        let stopped_at = Utc::now();
        let clock = Instant::now();
        let mut errors = Vec::new();
        let mut stopped = BTreeMap::new();

        self.logger.info("lifecycle", "stopping the stack");
        if let Err(e) = self.compose.down(self.config.operation_timeout()).await {
            errors.push(format!("compose down failed: {}", e));
        }

        for spec in &self.config.roles {
            let role = spec.role.as_str().to_string();
            match self.docker.inspect_state(&spec.container, INSPECT_TIMEOUT).await {
                Ok(Some(state)) if state.running => {
                    self.logger.warning(
                        "lifecycle",
                        &format!("{} survived compose down, force-stopping", spec.container),
                    );
                    match self
                        .docker
                        .stop(
                            &spec.container,
                            self.config.force_stop_grace_secs,
                            Duration::from_secs(30),
                        )
                        .await
                    {
                        Ok(()) => {
                            stopped.insert(role, true);
                        }
                        Err(e) => {
                            errors.push(format!("failed to stop {}: {}", spec.container, e));
                            stopped.insert(role, false);
                        }
                    }
                }
                Ok(_) => {
                    stopped.insert(role, true);
                }
                Err(e) => {
                    errors.push(format!("could not verify {}: {}", spec.container, e));
                    stopped.insert(role, false);
                }
            }
        }

        let success = errors.is_empty();
        ShutdownResult {
            stopped_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            stopped,
            errors,
            success,
        }
    }

    /// Stop, pause briefly, then start with a fresh detection pass.
    pub async fn restart(&self) -> Result<StartupResult> {
        let shutdown = self.stop().await;
        for error in &shutdown.errors {
            self.logger.warning("lifecycle", error);
        }
        tokio::time::sleep(Duration::from_secs(self.config.restart_delay_secs)).await;
        self.start(None).await
    }

    /// Read-only poll of every role. No polling loops, no mutation.
    pub async fn status(&self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(self.config.roles.len());
        for spec in &self.config.roles {
            let mut status = self.blank_status(spec);
            match self.docker.inspect_state(&spec.container, INSPECT_TIMEOUT).await {
                Ok(state) => {
                    let (state, error) = classify_state(state.as_ref());
                    status.state = state;
                    status.error = error;
                }
                Err(e) => {
                    status.state = ServiceState::Unknown;
                    status.error = Some(e.to_string());
                }
            }
            statuses.push(status);
        }
        statuses
    }

    /// Resolve how the user reaches the stack, best transport first:
    /// host VPN address, VPN address from inside the sidecar, first
    /// non-loopback interface address, then localhost.
    async fn resolve_access_urls(&self) -> Vec<String> {
        let host = if let Some(addr) = self.vpn.host_address().await {
            self.logger
                .debug("lifecycle", "using host VPN address for access URLs");
            addr
        } else if let Some(addr) = self.sidecar_address().await {
            self.logger
                .debug("lifecycle", "using VPN sidecar address for access URLs");
            addr
        } else if let Some(addr) = local_interface_addr() {
            self.logger
                .debug("lifecycle", "using local interface address for access URLs");
            addr
        } else {
            "localhost".to_string()
        };

        self.config
            .roles
            .iter()
            .filter_map(|spec| spec.port.map(|port| format!("http://{}:{}", host, port)))
            .collect()
    }

    async fn sidecar_address(&self) -> Option<String> {
        let spec = self.config.role(Role::Vpn)?;
        self.vpn
            .container_address(&self.docker, &spec.container)
            .await
    }
}

/// Map a single inspect result onto a lifecycle state without polling.
fn classify_state(state: Option<&ContainerState>) -> (ServiceState, Option<String>) {
    match state {
        None => (ServiceState::Stopped, None),
        Some(state) if !state.running => {
            let detail = if state.status.is_empty() {
                None
            } else {
                Some(format!("container is {}", state.status))
            };
            (ServiceState::Stopped, detail)
        }
        Some(state) => match state.health.as_ref().map(|h| h.status.as_str()) {
            None => (ServiceState::Running, None),
            Some("healthy") => (ServiceState::Healthy, None),
            Some("starting") => (ServiceState::Starting, None),
            Some("unhealthy") => (ServiceState::Unhealthy, None),
            Some(other) => (
                ServiceState::Unknown,
                Some(format!("unrecognized health state '{}'", other)),
            ),
        },
    }
}

/// The first non-loopback interface address, found by the connected-UDP
/// trick (no packet is sent).
fn local_interface_addr() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    let addr = socket.local_addr().ok()?.ip();
    if addr.is_loopback() {
        None
    } else {
        Some(addr.to_string())
    }
}
