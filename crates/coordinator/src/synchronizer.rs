//! Synchronizers: observers of transaction boundaries
//!
//! Synchronizers are notified when a transaction begins and after it reaches
//! a terminal state. Unlike resource managers they do no transactional work.

use crate::error::{ParticipantFailure, Phase, ResourceError};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;

/// Observer notified at transaction start and completion
pub trait Synchronizer: Send + Sync {
    /// Name used for failure attribution
    fn name(&self) -> String {
        "synchronizer".to_string()
    }

    /// A new transaction was begun by the manager
    fn new_transaction(&self, txn: &Transaction);

    /// Commit is about to start; a failure aborts the transaction
    fn before_completion(&self, _txn: &Transaction) -> Result<(), ResourceError> {
        Ok(())
    }

    /// The transaction reached a terminal state
    fn after_completion(&self, txn: &Transaction) -> Result<(), ResourceError>;
}

/// Ordered set of registered synchronizers
///
/// Cloning shares the registry, so transactions see registrations made on the
/// manager after they were begun.
#[derive(Clone, Default)]
pub struct SynchronizerRegistry {
    entries: Arc<Mutex<Vec<Arc<dyn Synchronizer>>>>,
}

impl SynchronizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronizer; registering the same handle twice is a no-op
    pub fn register(&self, synchronizer: Arc<dyn Synchronizer>) {
        let mut entries = self.entries.lock();
        if !entries.iter().any(|s| Arc::ptr_eq(s, &synchronizer)) {
            entries.push(synchronizer);
        }
    }

    /// Unregister a synchronizer, returning whether it was registered
    pub fn unregister(&self, synchronizer: &Arc<dyn Synchronizer>) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|s| !Arc::ptr_eq(s, synchronizer));
        entries.len() != before
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    // Callbacks run on a snapshot so a synchronizer may (un)register others.
    fn snapshot(&self) -> Vec<Arc<dyn Synchronizer>> {
        self.entries.lock().clone()
    }

    /// Notify every synchronizer of a new transaction, in registration order
    pub fn notify_new_transaction(&self, txn: &Transaction) {
        for synchronizer in self.snapshot() {
            synchronizer.new_transaction(txn);
        }
    }

    /// Run every `before_completion` hook; all are attempted
    pub fn before_completion(&self, txn: &Transaction) -> Vec<ParticipantFailure> {
        self.snapshot()
            .into_iter()
            .filter_map(|s| {
                s.before_completion(txn)
                    .err()
                    .map(|e| ParticipantFailure::new(s.name(), Phase::BeforeCompletion, e))
            })
            .collect()
    }

    /// Run every `after_completion` hook; all are attempted
    pub fn after_completion(&self, txn: &Transaction) -> Vec<ParticipantFailure> {
        self.snapshot()
            .into_iter()
            .filter_map(|s| {
                s.after_completion(txn)
                    .err()
                    .map(|e| ParticipantFailure::new(s.name(), Phase::AfterCompletion, e))
            })
            .collect()
    }
}
