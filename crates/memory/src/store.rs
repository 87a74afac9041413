//! Shared committed key/value state
//!
//! Every committed write bumps a store-wide version counter and stamps the
//! written key with it. Deleted keys keep a tombstone so their version never
//! goes backwards, which lets vote-time validation detect a delete followed
//! by a re-insert.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use txn_coordinator::TransactionId;

use crate::error::Conflict;

/// Committed value with the version of the write that produced it
#[derive(Debug, Clone)]
struct Entry {
    value: Option<Value>,
    version: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: BTreeMap<String, Entry>,
    /// Keys held by prepared (voted, unfinished) transactions
    prepared: HashMap<String, TransactionId>,
    clock: u64,
}

/// In-memory committed store shared by any number of [`MemoryResource`]s
///
/// Cloning yields another handle to the same data.
///
/// [`MemoryResource`]: crate::MemoryResource
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of a key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .read()
            .entries
            .get(key)
            .and_then(|entry| entry.value.clone())
    }

    /// Version of the last committed write to a key (0 if never written)
    pub fn version(&self, key: &str) -> u64 {
        self.inner
            .read()
            .entries
            .get(key)
            .map_or(0, |entry| entry.version)
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .entries
            .values()
            .filter(|entry| entry.value.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of all live committed data
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.inner
            .read()
            .entries
            .iter()
            .filter_map(|(key, entry)| entry.value.clone().map(|v| (key.clone(), v)))
            .collect()
    }

    /// Whether any transaction holds prepared keys
    pub fn has_prepared(&self) -> bool {
        !self.inner.read().prepared.is_empty()
    }

    /// Validate a transaction's reads and reserve its write keys until it
    /// finishes
    ///
    /// Fails if a read key changed since it was read, or if any read or
    /// written key is reserved by another prepared transaction. Readers of
    /// the same key may prepare side by side. Nothing is reserved on failure.
    pub(crate) fn prepare<'a>(
        &self,
        txn: TransactionId,
        reads: &'a BTreeMap<String, u64>,
        writes: impl Iterator<Item = &'a String>,
    ) -> Result<(), Conflict> {
        let mut inner = self.inner.write();

        let writes: Vec<&String> = writes.collect();
        for key in reads.keys().chain(writes.iter().copied()) {
            if let Some(holder) = inner.prepared.get(key.as_str())
                && *holder != txn
            {
                return Err(Conflict::Reserved {
                    key: key.to_string(),
                    holder: *holder,
                });
            }
        }
        for (key, read_version) in reads {
            let current = inner.entries.get(key).map_or(0, |entry| entry.version);
            if current != *read_version {
                return Err(Conflict::Stale {
                    key: key.clone(),
                    read: *read_version,
                    current,
                });
            }
        }

        for key in writes {
            inner.prepared.insert(key.clone(), txn);
        }
        Ok(())
    }

    /// Atomically apply a transaction's writes and drop its reservations
    pub(crate) fn apply(&self, txn: TransactionId, writes: BTreeMap<String, Option<Value>>) {
        let mut inner = self.inner.write();
        if !writes.is_empty() {
            inner.clock += 1;
        }
        let version = inner.clock;
        for (key, value) in writes {
            inner.entries.insert(key, Entry { value, version });
        }
        inner.prepared.retain(|_, holder| *holder != txn);
    }

    /// Drop a transaction's reservations without applying anything
    pub(crate) fn release(&self, txn: TransactionId) {
        self.inner.write().prepared.retain(|_, holder| *holder != txn);
    }
}
