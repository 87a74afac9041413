//! Error types for the coordinator
//!
//! Participant failures are attributed individually through [`ParticipantFailure`].
//! A pass over several participants that records exactly one failure reports it
//! unwrapped; more than one is reported as an [`AggregateFailure`].

use crate::id::TransactionId;
use crate::state::TransactionState;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// The pass a participant or synchronizer was in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// A before-commit hook
    BeforeCommit,
    /// Start-of-commit notification
    Begin,
    /// Finalize pending work and report readiness
    Vote,
    /// Durably apply
    Finish,
    /// Discard pending work
    Abort,
    /// Capture a savepoint token
    Savepoint,
    /// Restore a savepoint token
    Rollback,
    /// Synchronizer notification before commit
    BeforeCompletion,
    /// Synchronizer notification after the outcome settled
    AfterCompletion,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::BeforeCommit => "before-commit",
            Phase::Begin => "begin",
            Phase::Vote => "vote",
            Phase::Finish => "finish",
            Phase::Abort => "abort",
            Phase::Savepoint => "savepoint",
            Phase::Rollback => "rollback",
            Phase::BeforeCompletion => "before-completion",
            Phase::AfterCompletion => "after-completion",
        };
        f.write_str(name)
    }
}

/// Error reported by a resource manager or synchronizer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ResourceError {
    message: String,
    transient: bool,
}

impl ResourceError {
    /// Create a permanent failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    /// Create a failure the caller may retry in a fresh transaction (e.g. a write conflict)
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    /// Get the failure message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Check if this failure is transient
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// A single failure attributed to the participant that produced it
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{participant} failed during {phase}: {error}")]
pub struct ParticipantFailure {
    /// Name of the failing resource manager or synchronizer
    pub participant: String,
    /// The pass it failed in
    pub phase: Phase,
    /// The underlying failure
    #[source]
    pub error: ResourceError,
}

impl ParticipantFailure {
    pub fn new(participant: impl Into<String>, phase: Phase, error: ResourceError) -> Self {
        Self {
            participant: participant.into(),
            phase,
            error,
        }
    }
}

/// Several failures recorded during one pass, in the order they occurred
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateFailure {
    failures: Vec<ParticipantFailure>,
}

impl AggregateFailure {
    /// Get the underlying failures
    pub fn failures(&self) -> &[ParticipantFailure] {
        &self.failures
    }

    /// Names of the failing participants, in failure order
    pub fn participants(&self) -> Vec<&str> {
        self.failures
            .iter()
            .map(|f| f.participant.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for AggregateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} participants failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateFailure {}

/// Transaction error types
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid transaction state: cannot {operation} transaction {id} in state {state}")]
    InvalidState {
        id: TransactionId,
        state: TransactionState,
        operation: &'static str,
    },

    #[error("Transaction {0} is doomed and cannot be committed")]
    Doomed(TransactionId),

    #[error("Savepoint is no longer valid")]
    InvalidSavepoint,

    #[error("Savepoints are not supported by: {}", .0.join(", "))]
    SavepointsUnsupported(Vec<String>),

    #[error("Participants joined after the savepoint was taken: {}", .0.join(", "))]
    LateJoiners(Vec<String>),

    #[error("A savepoint rollback failed in transaction {0}; it can only be aborted")]
    SavepointFailed(TransactionId),

    #[error("Invalid resource manager: {0}")]
    InvalidResource(String),

    #[error("No transaction has been begun")]
    NoTransaction,

    #[error("Transaction {0} is already in progress")]
    AlreadyInTransaction(TransactionId),

    #[error(transparent)]
    Participant(#[from] ParticipantFailure),

    #[error(transparent)]
    Aggregate(#[from] AggregateFailure),

    /// Finish-phase failure: some participants may already be durably committed
    /// and the outcome is inconsistent across participants.
    #[error("Commit finished inconsistently (committed: [{}]): {source}", .committed.join(", "))]
    Heuristic {
        committed: Vec<String>,
        source: Box<TransactionError>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl TransactionError {
    /// Collapse the failures of one pass into a single error
    ///
    /// Returns `None` when the pass recorded no failures, the failure itself
    /// when there is exactly one, and an aggregate otherwise.
    pub fn from_failures(mut failures: Vec<ParticipantFailure>) -> Option<Self> {
        match failures.len() {
            0 => None,
            1 => failures.pop().map(TransactionError::Participant),
            _ => Some(TransactionError::Aggregate(AggregateFailure { failures })),
        }
    }

    /// Underlying participant failures, however they were wrapped
    pub fn failures(&self) -> Vec<&ParticipantFailure> {
        match self {
            TransactionError::Participant(failure) => vec![failure],
            TransactionError::Aggregate(aggregate) => aggregate.failures.iter().collect(),
            TransactionError::Heuristic { source, .. } => source.failures(),
            _ => Vec::new(),
        }
    }

    /// Check if this is a usage error (caller misuse, never a participant failure)
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            TransactionError::InvalidState { .. }
                | TransactionError::InvalidSavepoint
                | TransactionError::SavepointFailed(_)
                | TransactionError::InvalidResource(_)
                | TransactionError::NoTransaction
                | TransactionError::AlreadyInTransaction(_)
        )
    }

    /// Check if retrying the whole unit of work in a new transaction may succeed
    ///
    /// The coordinator never retries by itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransactionError::Heuristic { .. } => false,
            _ => {
                let failures = self.failures();
                !failures.is_empty() && failures.iter().all(|f| f.error.is_transient())
            }
        }
    }
}
