//! Transaction manager - the current transaction of one execution context
//!
//! A manager is an ordinary value owned by the caller (one per thread or
//! task). It holds the current transaction, if any, and the synchronizer
//! registry, and offers shorthand that delegates to the current transaction.
//! Nothing here is process-global.

use crate::config::CoordinatorConfig;
use crate::error::{Result, TransactionError};
use crate::resource::ResourceHandle;
use crate::savepoint::Savepoint;
use crate::synchronizer::{Synchronizer, SynchronizerRegistry};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Holds the current transaction and the registered synchronizers
pub struct TransactionManager {
    /// Configuration handed to every transaction begun here
    config: CoordinatorConfig,

    /// Current transaction, if any
    current: Mutex<Option<Transaction>>,

    /// Observers of transaction boundaries
    synchronizers: SynchronizerRegistry,
}

impl TransactionManager {
    /// Create a new transaction manager with the default configuration
    pub fn new() -> Self {
        Self::with_config(CoordinatorConfig::default())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self {
            config,
            current: Mutex::new(None),
            synchronizers: SynchronizerRegistry::new(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // === LIFECYCLE METHODS ===

    /// Begin a new transaction and make it current
    ///
    /// An unfinished current transaction is aborted first (in explicit mode
    /// this fails with `AlreadyInTransaction` instead). Failures of that
    /// implicit abort are logged and do not prevent the new transaction.
    pub fn begin(&self) -> Result<Transaction> {
        let previous = {
            let mut current = self.current.lock();
            if self.config.explicit
                && let Some(txn) = current.as_ref()
                && !txn.state().is_terminal()
            {
                return Err(TransactionError::AlreadyInTransaction(txn.id()));
            }
            current.take()
        };

        if let Some(previous) = previous
            && previous.state().can_abort()
        {
            info!(txn = %previous.id(), "Aborting unfinished transaction before begin");
            if let Err(e) = previous.abort() {
                warn!(txn = %previous.id(), error = %e, "Implicit abort failed");
            }
        }

        let txn = Transaction::with_registry(self.config.clone(), self.synchronizers.clone());
        *self.current.lock() = Some(txn.clone());
        debug!(txn = %txn.id(), "Transaction begun");

        self.synchronizers.notify_new_transaction(&txn);
        Ok(txn)
    }

    /// Get the current transaction, beginning one if there is none
    ///
    /// In explicit mode fails with `NoTransaction` instead of beginning.
    pub fn get(&self) -> Result<Transaction> {
        if let Some(txn) = self.current() {
            return Ok(txn);
        }
        if self.config.explicit {
            return Err(TransactionError::NoTransaction);
        }
        self.begin()
    }

    /// Get the current transaction without beginning one
    ///
    /// A transaction that reached a terminal state through its own handle
    /// is no longer current.
    pub fn current(&self) -> Option<Transaction> {
        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|txn| txn.state().is_terminal()) {
            *current = None;
        }
        current.clone()
    }

    /// Commit the current transaction and clear it
    pub fn commit(&self) -> Result<()> {
        let txn = self.get()?;
        let result = txn.commit();
        self.free(&txn);
        result
    }

    /// Abort the current transaction and clear it
    pub fn abort(&self) -> Result<()> {
        let txn = self.get()?;
        let result = txn.abort();
        self.free(&txn);
        result
    }

    /// Clear the current slot if it still holds `txn` and `txn` has completed
    ///
    /// A commit refused because the transaction is doomed leaves it current so
    /// that it can still be aborted.
    fn free(&self, txn: &Transaction) {
        let mut current = self.current.lock();
        if txn.state().is_terminal() && current.as_ref().is_some_and(|c| c.ptr_eq(txn)) {
            *current = None;
        }
    }

    /// Run `f` in a fresh transaction, committing on `Ok` and aborting on `Err`
    pub fn run<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction) -> std::result::Result<T, E>,
        E: From<TransactionError>,
    {
        let txn = self.begin()?;
        let result = match f(&txn) {
            Ok(value) => txn.commit().map(|()| value).map_err(E::from),
            Err(e) => Err(e),
        };
        if txn.state().can_abort()
            && let Err(abort_err) = txn.abort()
        {
            warn!(txn = %txn.id(), error = %abort_err, "Abort after failed unit of work failed");
        }
        self.free(&txn);
        result
    }

    // === DELEGATION ===

    pub fn doom(&self) -> Result<()> {
        self.get()?.doom()
    }

    /// Check if the current transaction is doomed; never begins one
    pub fn is_doomed(&self) -> bool {
        self.current().is_some_and(|txn| txn.is_doomed())
    }

    pub fn join(&self, resource: ResourceHandle) -> Result<()> {
        self.get()?.join(resource)
    }

    pub fn savepoint(&self) -> Result<Savepoint> {
        self.get()?.savepoint()
    }

    // === SYNCHRONIZERS ===

    pub fn register_synchronizer(&self, synchronizer: Arc<dyn Synchronizer>) {
        self.synchronizers.register(synchronizer);
    }

    pub fn unregister_synchronizer(&self, synchronizer: &Arc<dyn Synchronizer>) -> bool {
        self.synchronizers.unregister(synchronizer)
    }

    pub fn clear_synchronizers(&self) {
        self.synchronizers.clear();
    }

    pub fn synchronizer_count(&self) -> usize {
        self.synchronizers.len()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
