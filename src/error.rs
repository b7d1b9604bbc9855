use miette::Diagnostic;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::docker::DockerError;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Docker daemon is not reachable")]
    #[diagnostic(
        code(deckhand::docker::daemon),
        help("Check that Docker is running with `docker ps`")
    )]
    DaemonUnavailable,

    #[error("Compose file not found: {}", .0.display())]
    #[diagnostic(
        code(deckhand::compose::missing),
        help("Point the stack configuration at an existing docker-compose.yml")
    )]
    ComposeFileMissing(PathBuf),

    #[error("Docker error: {0}")]
    #[diagnostic(code(deckhand::docker::error))]
    Docker(#[from] DockerError),

    #[error("Migration action #{order} ({action}) failed: {reason}")]
    #[diagnostic(
        code(deckhand::migrate::action_failed),
        help("Completed actions are reported in the migration result; re-run after fixing the cause")
    )]
    MigrationAction {
        order: usize,
        action: String,
        reason: String,
    },

    #[error("Backup failed: {0}")]
    #[diagnostic(code(deckhand::migrate::backup_failed))]
    Backup(String),

    #[error("Operation '{operation}' exceeded its {seconds}s deadline")]
    #[diagnostic(
        code(deckhand::lifecycle::timeout),
        help("Increase the operation timeout in the stack configuration, or check `docker ps` for stuck containers")
    )]
    Timeout { operation: String, seconds: u64 },

    #[error("Invalid stack configuration: {0}")]
    #[diagnostic(code(deckhand::config::invalid))]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns a helpful suggestion for resolving this error, if available.
    ///
    /// The calling layer renders this beneath the error message; the engine
    /// itself never prints it.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Error::DaemonUnavailable => {
                Some("Start Docker (or the Docker daemon) and retry: docker ps".to_string())
            }
            Error::ComposeFileMissing(path) => Some(format!(
                "Expected a compose definition at {}. Run the installer first, or fix the configured path.",
                path.display()
            )),
            Error::MigrationAction { action, .. } => Some(format!(
                "The '{}' step failed; earlier steps are preserved. Inspect the migration result for per-action output.",
                action
            )),
            Error::Timeout { operation, .. } => Some(format!(
                "The '{}' operation was cut off. Containers may still be transitioning; check status before retrying.",
                operation
            )),
            Error::Config(_) => Some(
                "Review the stack configuration passed to the engine at construction".to_string(),
            ),
            _ => None,
        }
    }
}
