//! Transactional connection to a [`MemoryStore`]
//!
//! A `MemoryResource` stages writes for one transaction at a time. The first
//! access on behalf of a transaction joins the resource to it. Reads are
//! validated optimistically when the transaction votes, and staged writes
//! reach the store only in the finish phase.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};
use txn_coordinator::{
    ResourceError, ResourceHandle, ResourceManager, SavepointToken, Transaction, TransactionId,
};

use crate::error::{MemoryError, Result};
use crate::store::MemoryStore;

/// Two-phase commit operations, for statistics and fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Begin,
    Vote,
    Finish,
    Abort,
    Savepoint,
    Rollback,
}

/// How often each operation was invoked by the coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub begins: u64,
    pub votes: u64,
    pub finishes: u64,
    pub aborts: u64,
    pub savepoints: u64,
    pub rollbacks: u64,
}

impl ResourceStats {
    fn record(&mut self, op: Operation) {
        let counter = match op {
            Operation::Begin => &mut self.begins,
            Operation::Vote => &mut self.votes,
            Operation::Finish => &mut self.finishes,
            Operation::Abort => &mut self.aborts,
            Operation::Savepoint => &mut self.savepoints,
            Operation::Rollback => &mut self.rollbacks,
        };
        *counter += 1;
    }
}

/// Work staged on behalf of one transaction
#[derive(Debug, Clone)]
struct Session {
    txn: TransactionId,
    /// Staged writes; `None` is a delete
    writes: BTreeMap<String, Option<Value>>,
    /// Versions observed by reads that were served from the store
    reads: BTreeMap<String, u64>,
    prepared: bool,
}

impl Session {
    fn new(txn: TransactionId) -> Self {
        Self {
            txn,
            writes: BTreeMap::new(),
            reads: BTreeMap::new(),
            prepared: false,
        }
    }
}

/// Savepoint token contents: a copy of the staged state
#[derive(Debug, Clone)]
struct Snapshot {
    txn: TransactionId,
    writes: BTreeMap<String, Option<Value>>,
    reads: BTreeMap<String, u64>,
}

/// Transactional key/value connection participating in two-phase commit
pub struct MemoryResource {
    name: String,
    store: MemoryStore,
    session: Mutex<Option<Session>>,
    stats: Mutex<ResourceStats>,
    faults: Mutex<HashSet<Operation>>,
}

impl MemoryResource {
    /// Create a resource over `store`; `name` is also its sort key
    pub fn new(name: impl Into<String>, store: MemoryStore) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            store,
            session: Mutex::new(None),
            stats: Mutex::new(ResourceStats::default()),
            faults: Mutex::new(HashSet::new()),
        })
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    // === DATA ACCESS ===

    /// Read a key as seen by `txn`
    pub fn get(self: &Arc<Self>, txn: &Transaction, key: &str) -> Result<Option<Value>> {
        self.with_session(txn, |session, store| {
            if let Some(staged) = session.writes.get(key) {
                return staged.clone();
            }
            session
                .reads
                .entry(key.to_string())
                .or_insert_with(|| store.version(key));
            store.get(key)
        })
    }

    /// Stage a write
    pub fn put(self: &Arc<Self>, txn: &Transaction, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.with_session(txn, |session, _| {
            session.writes.insert(key.to_string(), Some(value));
        })
    }

    /// Stage a delete; returns whether the key was visible to `txn`
    pub fn delete(self: &Arc<Self>, txn: &Transaction, key: &str) -> Result<bool> {
        let existed = self.get(txn, key)?.is_some();
        self.with_session(txn, |session, _| {
            session.writes.insert(key.to_string(), None);
        })?;
        Ok(existed)
    }

    /// Number of staged writes for the current transaction
    pub fn pending_writes(&self) -> usize {
        self.session
            .lock()
            .as_ref()
            .map_or(0, |session| session.writes.len())
    }

    /// Transaction this resource is currently bound to
    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.session.lock().as_ref().map(|session| session.txn)
    }

    /// Run `f` on the session for `txn`, joining `txn` on first access
    fn with_session<T>(
        self: &Arc<Self>,
        txn: &Transaction,
        f: impl FnOnce(&mut Session, &MemoryStore) -> T,
    ) -> Result<T> {
        let mut guard = self.session.lock();
        if let Some(session) = guard.as_ref()
            && session.txn != txn.id()
        {
            return Err(MemoryError::Busy {
                resource: self.name.clone(),
                current: session.txn,
            });
        }
        if guard.is_none() {
            let handle: ResourceHandle = self.clone();
            txn.join(handle)?;
            debug!(resource = %self.name, txn = %txn.id(), "Bound to transaction");
        }
        let session = guard.get_or_insert_with(|| Session::new(txn.id()));
        Ok(f(session, &self.store))
    }

    // === STATISTICS AND FAULTS ===

    pub fn stats(&self) -> ResourceStats {
        *self.stats.lock()
    }

    /// Make every future call of `op` fail
    pub fn fail_on(&self, op: Operation) {
        self.faults.lock().insert(op);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Count the call, then fail it if a fault is injected
    fn enter(&self, op: Operation) -> std::result::Result<(), ResourceError> {
        self.stats.lock().record(op);
        if self.faults.lock().contains(&op) {
            warn!(resource = %self.name, ?op, "Injected failure");
            return Err(ResourceError::new(format!(
                "{}: injected {:?} failure",
                self.name, op
            )));
        }
        Ok(())
    }

    /// Check the session belongs to `txn`; a missing session has no work
    fn check_owner(&self, session: Option<&Session>, txn: &Transaction) -> std::result::Result<(), ResourceError> {
        match session {
            Some(session) if session.txn != txn.id() => Err(ResourceError::new(format!(
                "{} is bound to transaction {}, not {}",
                self.name,
                session.txn,
                txn.id()
            ))),
            _ => Ok(()),
        }
    }

    /// End the session and drop any reservations it holds
    fn end_session(&self, txn: &Transaction) -> Option<Session> {
        let mut guard = self.session.lock();
        if guard.as_ref().is_some_and(|session| session.txn == txn.id()) {
            self.store.release(txn.id());
            return guard.take();
        }
        None
    }
}

impl ResourceManager for MemoryResource {
    fn sort_key(&self) -> String {
        self.name.clone()
    }

    fn begin_commit(&self, txn: &Transaction) -> std::result::Result<(), ResourceError> {
        self.enter(Operation::Begin)?;
        self.check_owner(self.session.lock().as_ref(), txn)
    }

    fn vote(&self, txn: &Transaction) -> std::result::Result<(), ResourceError> {
        self.enter(Operation::Vote)?;
        let mut guard = self.session.lock();
        self.check_owner(guard.as_ref(), txn)?;
        if let Some(session) = guard.as_mut() {
            self.store
                .prepare(session.txn, &session.reads, session.writes.keys())
                .inspect_err(|conflict| {
                    debug!(resource = %self.name, txn = %session.txn, %conflict, "Vote refused");
                })?;
            session.prepared = true;
        }
        Ok(())
    }

    fn finish_commit(&self, txn: &Transaction) -> std::result::Result<(), ResourceError> {
        self.enter(Operation::Finish)?;
        let mut guard = self.session.lock();
        self.check_owner(guard.as_ref(), txn)?;
        if let Some(session) = guard.take() {
            let writes = session.writes.len();
            self.store.apply(session.txn, session.writes);
            debug!(resource = %self.name, txn = %session.txn, writes, "Applied");
        }
        Ok(())
    }

    fn abort(&self, txn: &Transaction) -> std::result::Result<(), ResourceError> {
        let discarded = self.end_session(txn);
        if let Some(session) = &discarded {
            debug!(
                resource = %self.name,
                txn = %session.txn,
                writes = session.writes.len(),
                prepared = session.prepared,
                "Discarded"
            );
        }
        self.enter(Operation::Abort)
    }

    fn savepoint(&self, txn: &Transaction) -> std::result::Result<Option<SavepointToken>, ResourceError> {
        self.enter(Operation::Savepoint)?;
        let guard = self.session.lock();
        self.check_owner(guard.as_ref(), txn)?;
        let snapshot = match guard.as_ref() {
            Some(session) => Snapshot {
                txn: session.txn,
                writes: session.writes.clone(),
                reads: session.reads.clone(),
            },
            None => Snapshot {
                txn: txn.id(),
                writes: BTreeMap::new(),
                reads: BTreeMap::new(),
            },
        };
        Ok(Some(SavepointToken::new(snapshot)))
    }

    fn rollback(&self, token: &SavepointToken) -> std::result::Result<(), ResourceError> {
        self.enter(Operation::Rollback)?;
        let snapshot = token
            .downcast_ref::<Snapshot>()
            .ok_or_else(|| ResourceError::new(format!("{}: foreign savepoint token", self.name)))?;

        let mut guard = self.session.lock();
        match guard.as_mut() {
            Some(session) if session.txn == snapshot.txn => {
                session.writes = snapshot.writes.clone();
                session.reads = snapshot.reads.clone();
            }
            Some(session) => {
                return Err(ResourceError::new(format!(
                    "{}: savepoint belongs to transaction {}, bound to {}",
                    self.name, snapshot.txn, session.txn
                )));
            }
            None => {
                let mut session = Session::new(snapshot.txn);
                session.writes = snapshot.writes.clone();
                session.reads = snapshot.reads.clone();
                *guard = Some(session);
            }
        }
        debug!(resource = %self.name, txn = %snapshot.txn, "Rolled back to savepoint");
        Ok(())
    }
}
