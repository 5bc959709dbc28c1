use thiserror::Error;

use pool_config::ConfigError;
use pool_protocol::ControlError;

/// Error taxonomy for the pool supervisor (spec §7). Background loops fold
/// every one of these into instance state (`is_healthy`, `failed_checks`,
/// alerts) and never propagate them outward; operator-invoked calls surface
/// the first fatal error, and bulk operations return a structured per-slot
/// summary instead (spec §7 "Propagation policy").
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to spawn relay child for {node_id}: {reason}")]
    SpawnFailed { node_id: String, reason: String },

    #[error("{node_id} did not bootstrap within {timeout_secs}s")]
    BootstrapTimeout { node_id: String, timeout_secs: u64 },

    #[error("control session unavailable for {node_id}: {source}")]
    ControlUnavailable { node_id: String, source: ControlError },

    #[error("control session rejected for {node_id}: {source}")]
    ControlRejected { node_id: String, source: ControlError },

    #[error("control session malformed reply for {node_id}: {source}")]
    ControlMalformed { node_id: String, source: ControlError },

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("a scale operation is already in progress")]
    ScaleInProgress,

    #[error("supervisor is shutting down")]
    Cancelled,
}

impl PoolError {
    /// Attach the owning node's id to a raw [`ControlError`] (spec §7: the
    /// three control failure modes are distinguished, but treated
    /// identically by the Health Loop).
    pub fn from_control(node_id: &str, err: ControlError) -> Self {
        match err {
            ControlError::Unavailable(_) => PoolError::ControlUnavailable {
                node_id: node_id.to_string(),
                source: err,
            },
            ControlError::Rejected(_) => PoolError::ControlRejected {
                node_id: node_id.to_string(),
                source: err,
            },
            ControlError::Malformed(_) => PoolError::ControlMalformed {
                node_id: node_id.to_string(),
                source: err,
            },
        }
    }
}

impl From<ConfigError> for PoolError {
    fn from(err: ConfigError) -> Self {
        PoolError::ConfigInvalid(err.to_string())
    }
}
