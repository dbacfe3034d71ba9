//! Error types for the workload policy operator

use thiserror::Error;

/// Result type for the operator
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the operator
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Rollout did not settle within the attempt budget
    #[error("Deployment {namespace}/{name} did not finish rolling out after {attempts} attempts")]
    RolloutTimeout {
        namespace: String,
        name: String,
        attempts: u32,
    },
    /// Work interrupted by shutdown
    #[error("Cancelled: {0}")]
    Cancelled(String),
    /// A worker queue no longer accepts jobs
    #[error("{0} queue is closed")]
    QueueClosed(&'static str),
}

impl Error {
    /// Short label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::RolloutTimeout { .. } => "rollout_timeout",
            Error::Cancelled(_) => "cancelled",
            Error::QueueClosed(_) => "queue_closed",
        }
    }
}
