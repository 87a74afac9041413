//! Common test utilities for coordinator tests

use crate::error::ResourceError;
use crate::id::TransactionId;
use crate::resource::{ResourceManager, SavepointToken};
use crate::state::TransactionState;
use crate::synchronizer::Synchronizer;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Participant operations, as recorded by [`RecordingResource`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Begin,
    Vote,
    Finish,
    Abort,
    Savepoint,
    Rollback,
}

/// Call log shared by several resources to check cross-participant ordering
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<(String, Op)>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(String, Op)> {
        self.0.lock().clone()
    }
}

/// Test participant that records every call and fails on demand
pub struct RecordingResource {
    key: String,
    log: CallLog,
    calls: Mutex<Vec<Op>>,
    fail: Mutex<HashSet<Op>>,
    savepoints: AtomicBool,
    value: Mutex<i64>,
    on_vote: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl RecordingResource {
    pub fn new(key: &str) -> Arc<Self> {
        Self::with_log(key, &CallLog::new())
    }

    pub fn with_log(key: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            log: log.clone(),
            calls: Mutex::new(Vec::new()),
            fail: Mutex::new(HashSet::new()),
            savepoints: AtomicBool::new(false),
            value: Mutex::new(0),
            on_vote: Mutex::new(None),
        })
    }

    /// Enable savepoint support
    pub fn with_savepoints(self: Arc<Self>) -> Arc<Self> {
        self.savepoints.store(true, Ordering::SeqCst);
        self
    }

    /// Make every future call of `op` fail
    pub fn fail_on(&self, op: Op) {
        self.fail.lock().insert(op);
    }

    /// Run `f` from inside `vote`
    pub fn on_vote(&self, f: impl Fn() + Send + Sync + 'static) {
        *self.on_vote.lock() = Some(Box::new(f));
    }

    pub fn calls(&self) -> Vec<Op> {
        self.calls.lock().clone()
    }

    /// Stand-in for the participant's pending work
    pub fn set_value(&self, value: i64) {
        *self.value.lock() = value;
    }

    pub fn value(&self) -> i64 {
        *self.value.lock()
    }

    fn record(&self, op: Op) -> Result<(), ResourceError> {
        self.calls.lock().push(op);
        self.log.0.lock().push((self.key.clone(), op));
        if self.fail.lock().contains(&op) {
            return Err(ResourceError::new(format!("{} failed {:?}", self.key, op)));
        }
        Ok(())
    }
}

impl ResourceManager for RecordingResource {
    fn sort_key(&self) -> String {
        self.key.clone()
    }

    fn begin_commit(&self, _txn: &Transaction) -> Result<(), ResourceError> {
        self.record(Op::Begin)
    }

    fn vote(&self, _txn: &Transaction) -> Result<(), ResourceError> {
        if let Some(f) = self.on_vote.lock().as_ref() {
            f();
        }
        self.record(Op::Vote)
    }

    fn finish_commit(&self, _txn: &Transaction) -> Result<(), ResourceError> {
        self.record(Op::Finish)
    }

    fn abort(&self, _txn: &Transaction) -> Result<(), ResourceError> {
        self.record(Op::Abort)
    }

    fn savepoint(&self, _txn: &Transaction) -> Result<Option<SavepointToken>, ResourceError> {
        if !self.savepoints.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.record(Op::Savepoint)?;
        Ok(Some(SavepointToken::new(self.value())))
    }

    fn rollback(&self, token: &SavepointToken) -> Result<(), ResourceError> {
        self.record(Op::Rollback)?;
        let value = token
            .downcast_ref::<i64>()
            .ok_or_else(|| ResourceError::new("foreign savepoint token"))?;
        self.set_value(*value);
        Ok(())
    }
}

/// Synchronizer event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    New(TransactionId),
    Before(TransactionId),
    After(TransactionId, TransactionState),
}

/// Test synchronizer that records notifications and fails on demand
pub struct RecordingSynchronizer {
    name: String,
    events: Mutex<Vec<SyncEvent>>,
    fail_before: AtomicBool,
    fail_after: AtomicBool,
}

impl RecordingSynchronizer {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
            fail_before: AtomicBool::new(false),
            fail_after: AtomicBool::new(false),
        })
    }

    pub fn fail_before_completion(&self) {
        self.fail_before.store(true, Ordering::SeqCst);
    }

    pub fn fail_after_completion(&self) {
        self.fail_after.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }
}

impl Synchronizer for RecordingSynchronizer {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn new_transaction(&self, txn: &Transaction) {
        self.events.lock().push(SyncEvent::New(txn.id()));
    }

    fn before_completion(&self, txn: &Transaction) -> Result<(), ResourceError> {
        self.events.lock().push(SyncEvent::Before(txn.id()));
        if self.fail_before.load(Ordering::SeqCst) {
            return Err(ResourceError::new(format!("{} refused", self.name)));
        }
        Ok(())
    }

    fn after_completion(&self, txn: &Transaction) -> Result<(), ResourceError> {
        self.events
            .lock()
            .push(SyncEvent::After(txn.id(), txn.state()));
        if self.fail_after.load(Ordering::SeqCst) {
            return Err(ResourceError::new(format!("{} failed", self.name)));
        }
        Ok(())
    }
}
