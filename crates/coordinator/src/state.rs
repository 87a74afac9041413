//! Transaction state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Accepting joins, savepoints, commit and abort
    Active,
    /// Commit will be refused; everything else behaves as `Active`
    Doomed,
    /// Two-phase commit is running
    Committing,
    /// Every participant finished
    Committed,
    /// The commit failed; terminal unless a compensating abort follows
    CommitFailed,
    /// The abort pass is running
    Aborting,
    /// Every participant was asked to abort
    Aborted,
}

impl TransactionState {
    /// Check if no further mutating operation is permitted
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::CommitFailed | TransactionState::Aborted
        )
    }

    /// Check if the transaction can still do work (join, savepoint, rollback)
    pub fn is_open(&self) -> bool {
        matches!(self, TransactionState::Active | TransactionState::Doomed)
    }

    pub fn can_doom(&self) -> bool {
        self.is_open()
    }

    pub fn can_join(&self) -> bool {
        self.is_open()
    }

    /// A doomed transaction is refused separately so the caller sees `Doomed`
    pub fn can_commit(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn can_abort(&self) -> bool {
        self.is_open()
    }

    pub fn can_savepoint(&self) -> bool {
        self.is_open()
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Active => "ACTIVE",
            TransactionState::Doomed => "DOOMED",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::CommitFailed => "COMMIT_FAILED",
            TransactionState::Aborting => "ABORTING",
            TransactionState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}
