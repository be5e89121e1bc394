//! Supervisor error types

use thiserror::Error;

/// Errors surfaced by the supervisor runtime.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to launch tunnel binary: {0}")]
    TunnelLaunch(#[source] std::io::Error),

    #[error("Failed to read configuration: {0}")]
    Config(String),

    #[error("Event queue closed")]
    QueueClosed,
}
