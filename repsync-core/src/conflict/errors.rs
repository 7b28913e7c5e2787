//! Error types for conflict resolution

use crate::queue::errors::StoreError;
use crate::queue::item::EntityKind;
use crate::remote::RemoteError;
use thiserror::Error;

pub type ConflictResult<T> = Result<T, ConflictError>;

#[derive(Debug, Error)]
pub enum ConflictError {
    /// A choice was given for a conflict that is not pending
    #[error("Unknown conflict: {0}")]
    UnknownConflict(String),

    /// Merge requested for an atomic entity kind
    #[error("Merge is not supported for {kind} entities")]
    MergeUnsupported { kind: EntityKind },

    /// Data shape does not allow a merge
    #[error("Cannot merge: {0}")]
    NotMergeable(String),

    /// Resolved write was rejected by the remote
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Queue could not be updated after resolution
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
