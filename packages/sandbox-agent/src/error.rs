use std::io;

use thiserror::Error;

/// Error kinds surfaced in-band to callers, carried verbatim as the `kind`
/// field of a worker/dispatcher reply. Ordering mirrors the taxonomy table.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("dependency install failed: {0}")]
    DependencyInstall(String),

    #[error("pool saturated")]
    PoolSaturated,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("worker died: {0}")]
    WorkerDied(String),

    #[error("user error: {kind}: {message}")]
    UserError {
        kind: String,
        message: String,
        trace: Option<String>,
    },

    #[error("agent internal error: {0}")]
    AgentInternal(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl AgentError {
    /// The stable string placed in the `kind` field of an in-band reply.
    pub fn kind(&self) -> String {
        match self {
            AgentError::BadRequest(_) => "BadRequest".to_string(),
            AgentError::DependencyInstall(_) => "DependencyInstall".to_string(),
            AgentError::PoolSaturated => "PoolSaturated".to_string(),
            AgentError::Timeout(_) => "Timeout".to_string(),
            AgentError::WorkerDied(_) => "WorkerDied".to_string(),
            AgentError::UserError { kind, .. } => kind.clone(),
            AgentError::AgentInternal(_) => "AgentInternal".to_string(),
            AgentError::Io(_) => "AgentInternal".to_string(),
        }
    }

    /// True for failures the dispatcher's retry loop is allowed to retry
    /// against a fresh worker handle (§7: only `WorkerDied`).
    pub fn retryable(&self) -> bool {
        matches!(self, AgentError::WorkerDied(_))
    }
}

impl From<tokio::time::error::Elapsed> for AgentError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AgentError::Timeout("deadline exceeded".to_string())
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
