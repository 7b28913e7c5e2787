//! Engine-level faults
//!
//! Per-item failures never surface here. A `FlushError` means the pass
//! itself could not run, for example because the queue could not be read.

use crate::queue::errors::StoreError;
use thiserror::Error;

pub type FlushResult<T> = Result<T, FlushError>;

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("queue store failure: {0}")]
    Store(#[from] StoreError),

    #[error("invalid flush configuration: {0}")]
    InvalidConfig(String),
}
