//! Remote failure taxonomy

use crate::queue::item::EntityRef;
use thiserror::Error;

/// Result type for remote calls
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors returned by the remote service or the transport in front of it
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    /// Connection refused, reset, DNS failure and the like
    #[error("network error: {0}")]
    Network(String),

    /// Transport gave up waiting
    #[error("request timeout")]
    Timeout,

    /// Remote answered with an error status
    #[error("server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// Remote entities changed since the client's last known version
    #[error("version conflict on {}", format_entities(.entities))]
    VersionConflict { entities: Vec<EntityRef> },

    /// Entity does not exist remotely
    #[error("entity not found: {0}")]
    NotFound(EntityRef),

    /// Response could not be decoded
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Request URL could not be built
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

fn format_entities(entities: &[EntityRef]) -> String {
    entities
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl RemoteError {
    /// Version divergence, routed to conflict detection instead of retry
    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::VersionConflict { .. })
    }

    /// Failures expected to clear up on their own
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout => true,
            RemoteError::Server { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}
