//! Resource manager contract that participants must implement
//!
//! A resource manager stages work on behalf of a transaction and takes part in
//! two-phase commit. Relational connections, object stores and cache
//! invalidators all plug in through [`ResourceManager`].

use crate::error::{ResourceError, Result, TransactionError};
use crate::transaction::Transaction;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Shared handle to a participant; identity is handle identity
pub type ResourceHandle = Arc<dyn ResourceManager>;

/// Participant in two-phase commit
///
/// Note: All methods are synchronous. Calls within a phase are made one at a
/// time in sort-key order and may block; the coordinator imposes no timeouts.
/// Methods take `&self` because the same handle is shared by the caller and the
/// transaction; implementations own their interior locking.
pub trait ResourceManager: Send + Sync {
    /// Key that orders this participant relative to the others in every phase
    ///
    /// Must be non-empty and must not change while the participant is joined.
    fn sort_key(&self) -> String;

    /// Name used for logging and failure attribution
    fn name(&self) -> String {
        self.sort_key()
    }

    /// Start-of-commit notification
    fn begin_commit(&self, txn: &Transaction) -> std::result::Result<(), ResourceError>;

    /// Finalize and validate pending work; an error is a negative vote
    fn vote(&self, txn: &Transaction) -> std::result::Result<(), ResourceError>;

    /// Durably apply the pending work
    ///
    /// Failures here cannot be compensated: other participants may already
    /// have committed.
    fn finish_commit(&self, txn: &Transaction) -> std::result::Result<(), ResourceError>;

    /// Discard pending work
    ///
    /// Called at most once per completed transaction, whether or not commit
    /// had begun for this participant.
    fn abort(&self, txn: &Transaction) -> std::result::Result<(), ResourceError>;

    /// Capture a rollback point
    ///
    /// Returns `Ok(None)` when savepoints are not supported.
    fn savepoint(&self, _txn: &Transaction) -> std::result::Result<Option<SavepointToken>, ResourceError> {
        Ok(None)
    }

    /// Restore the state captured in `token`
    ///
    /// Only called with tokens this participant returned from [`savepoint`](Self::savepoint).
    fn rollback(&self, _token: &SavepointToken) -> std::result::Result<(), ResourceError> {
        Err(ResourceError::new(format!(
            "{} does not support savepoints",
            self.name()
        )))
    }
}

/// Opaque rollback point produced by a participant
///
/// The coordinator never inspects the contents; the participant downcasts it
/// back to its own type on rollback. Tokens are reusable: rolling back to the
/// same savepoint twice hands the same token over twice.
pub struct SavepointToken(Box<dyn Any + Send + Sync>);

impl SavepointToken {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Box::new(state))
    }

    /// Borrow the captured state as its concrete type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for SavepointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SavepointToken(..)")
    }
}

/// A joined participant with its join-time sort key
#[derive(Clone)]
pub(crate) struct Participant {
    pub resource: ResourceHandle,
    pub sort_key: String,
    pub name: String,
    /// Join sequence, breaks sort-key ties
    pub seq: u64,
}

impl Participant {
    /// Validate a resource manager and capture its ordering key
    pub fn validate(resource: ResourceHandle, seq: u64) -> Result<Self> {
        let sort_key = resource.sort_key();
        let name = resource.name();
        if sort_key.is_empty() {
            return Err(TransactionError::InvalidResource(format!(
                "{} has an empty sort key",
                if name.is_empty() { "<unnamed>" } else { name.as_str() }
            )));
        }
        Ok(Self {
            resource,
            sort_key,
            name,
            seq,
        })
    }

    /// Check if this entry refers to the given handle
    pub fn is(&self, resource: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.resource, resource)
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("name", &self.name)
            .field("sort_key", &self.sort_key)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Order participants for a phase: ascending sort key, join order on ties
///
/// Every phase of a transaction uses this same order, so two transactions
/// sharing a set of participants always contact them in the same sequence.
pub(crate) fn commit_order(participants: &[Participant]) -> Vec<Participant> {
    let mut ordered = participants.to_vec();
    ordered.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then(a.seq.cmp(&b.seq)));
    ordered
}
