//! # deckhand
//!
//! Orchestration and migration engine for the deckhand local development
//! stack: a browser-based IDE (code-server), a VPN sidecar (tailscale), and
//! an AI-assistant container.
//!
//! The engine makes repeated installation attempts safe. It detects what is
//! already running — our own prior install, an unrelated code-server, or a
//! process squatting on a port — classifies the situation into one of four
//! strategies (fresh, upgrade, migrate-external, parallel), executes the
//! resulting plan, and reports progress and final health with minimal noise.
//!
//! ## Quick Start
//!
//! ```no_run
//! use deckhand::{LifecycleManager, Logger, StackConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), deckhand::Error> {
//! let config = StackConfig::default();
//! let logger = Arc::new(Logger::new(&config.state_dir.join("deckhand.log"), false));
//!
//! let manager = LifecycleManager::new(config, logger)?;
//!
//! // Pre-flight: verify the environment and compute a migration plan.
//! let plan = manager.pre_start_check().await?;
//! println!("{}", plan.summary());
//!
//! // Bring the stack up, executing the plan along the way.
//! let result = manager.start(Some(plan)).await?;
//! for url in &result.access_urls {
//!     println!("reachable at {}", url);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency Model
//!
//! Decision logic runs strictly sequentially — detection, conflict checks
//! and migration actions feed each other. The only concurrency is I/O: each
//! subprocess gets two reader tasks (stdout/stderr) writing through the
//! shared, mutex-guarded [`Logger`]. Operations are bounded by deadlines;
//! exceeding a per-role health deadline degrades that role instead of
//! aborting the run. No detection state is cached between calls.

pub mod config;
pub mod detect;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod migrate;
pub mod vpn;

// Re-export the types callers touch on the happy path.
pub use config::{Role, RoleSpec, StackConfig};
pub use detect::{Detector, PortConflict, ServiceRecord, ServiceRole, ServiceState};
pub use error::{Error, Result};
pub use lifecycle::{LifecycleManager, ServiceStatus, ShutdownResult, StartupResult};
pub use logging::{LogEntry, LogLevel, Logger};
pub use migrate::{
    ActionResult, ActionType, MigrationAction, MigrationPlan, MigrationResult, MigrationStrategy,
    Migrator,
};
