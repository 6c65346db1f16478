//! Error types for the orchestrator.

use chainbox_id::{IdError, InstanceKey};
use thiserror::Error;

/// Orchestrator errors with standardized reason codes.
#[derive(Debug, Error)]
pub enum Error {
    /// RPC attempted against an instance whose worker is not running.
    #[error("instance {instance} is not running")]
    NotRunning { instance: InstanceKey },

    /// RPC method outside the allow-list.
    #[error("method not allowed: {method}")]
    Forbidden { method: String },

    /// The worker never answered the readiness handshake.
    #[error("instance {instance} not ready after {attempts} attempts")]
    StartTimeout { instance: InstanceKey, attempts: u32 },

    /// Every port in the configured range is owned or in use.
    #[error("no free port in {start}..{end}")]
    PortExhausted { start: u16, end: u16 },

    /// The port lease record disagrees with the instance using the port.
    #[error("port {port} is leased to {owner:?}, not {instance}")]
    RegistryCorruption {
        instance: InstanceKey,
        port: u16,
        owner: Option<String>,
    },

    /// The caller omitted or malformed a required parameter.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Filesystem failure in a workspace or the lease directory.
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// The node could not be reached or answered with garbage.
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// The worker process could not be created or signalled.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// A historical query helper failed.
    #[error("query failed: {0}")]
    Query(String),
}

impl Error {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::NotRunning { .. } => "not_running",
            Error::Forbidden { .. } => "forbidden",
            Error::StartTimeout { .. } => "start_timeout",
            Error::PortExhausted { .. } => "port_exhausted",
            Error::RegistryCorruption { .. } => "registry_corruption",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Storage(_) => "storage_error",
            Error::Upstream(_) => "upstream_error",
            Error::Spawn(_) => "spawn_failed",
            Error::Query(_) => "query_failed",
        }
    }
}

impl From<IdError> for Error {
    fn from(err: IdError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

/// Result alias for orchestrator operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
