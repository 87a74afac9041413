//! Error types for the in-memory resource

use thiserror::Error;
use txn_coordinator::{ResourceError, TransactionError, TransactionId};

/// Errors from using a [`MemoryResource`](crate::MemoryResource)
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Resource {resource} is in use by transaction {current}")]
    Busy {
        resource: String,
        current: TransactionId,
    },

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Reason a vote was refused
#[derive(Debug, Clone, Error)]
pub enum Conflict {
    #[error("key {key} changed since it was read (read version {read}, now {current})")]
    Stale { key: String, read: u64, current: u64 },

    #[error("key {key} is reserved by prepared transaction {holder}")]
    Reserved { key: String, holder: TransactionId },
}

impl From<Conflict> for ResourceError {
    fn from(conflict: Conflict) -> Self {
        // Retrying in a fresh transaction reads the new state
        ResourceError::transient(conflict.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;
