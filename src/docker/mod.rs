//! Docker CLI translation layer.
//!
//! All container-runtime interaction goes through this module; the rest of
//! the engine sees typed records and structured errors, never raw CLI text.
//! Swapping the parsing strategy (say, to a socket API client) would touch
//! only this module.

pub mod client;
pub mod compose;
pub mod error;

pub use client::{ContainerHealth, ContainerState, ContainerSummary, DockerClient};
pub use compose::Compose;
pub use error::DockerError;
