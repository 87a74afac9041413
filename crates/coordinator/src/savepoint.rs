//! Savepoints: partial rollback inside an open transaction
//!
//! A savepoint captures a rollback token from every participant joined at the
//! time it is taken. Savepoints form a stack: rolling back to one invalidates
//! and discards every savepoint taken after it, while the savepoint itself
//! stays valid and may be rolled back to again.
//!
//! A participant that joins after a savepoint has no token in it. Under
//! [`LateJoinPolicy::Exclude`] rolling back leaves such participants untouched
//! (their work since joining survives the rollback); under
//! [`LateJoinPolicy::Fail`] the rollback is refused. Callers can see who would
//! be affected through [`Savepoint::late_joiners`].

use crate::config::LateJoinPolicy;
use crate::error::{ParticipantFailure, Phase, Result, TransactionError};
use crate::id::TransactionId;
use crate::resource::{Participant, SavepointToken, commit_order};
use crate::state::TransactionState;
use crate::transaction::{Transaction, TransactionInner};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Handle to a rollback point of one transaction
#[derive(Clone)]
pub struct Savepoint {
    inner: Arc<SavepointInner>,
}

pub(crate) struct SavepointInner {
    transaction_id: TransactionId,
    transaction: Weak<TransactionInner>,
    /// Captured in sort-key order
    entries: Vec<SavepointEntry>,
    valid: AtomicBool,
}

struct SavepointEntry {
    participant: Participant,
    /// `None` when the participant does not support savepoints
    token: Option<SavepointToken>,
}

impl SavepointInner {
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    fn unsupported(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.token.is_none())
            .map(|e| e.participant.name.clone())
            .collect()
    }

    fn covers(&self, participant: &Participant) -> bool {
        self.entries
            .iter()
            .any(|e| e.participant.is(&participant.resource))
    }
}

impl Savepoint {
    /// Get the owning transaction's ID
    pub fn transaction_id(&self) -> TransactionId {
        self.inner.transaction_id
    }

    /// Check if this savepoint can still be rolled back to
    pub fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// Check if every captured participant supports rollback
    pub fn supports_rollback(&self) -> bool {
        self.inner.entries.iter().all(|e| e.token.is_some())
    }

    /// Participants captured without savepoint support
    pub fn unsupported(&self) -> Vec<String> {
        self.inner.unsupported()
    }

    /// Participants captured by this savepoint, in rollback order
    pub fn participants(&self) -> Vec<String> {
        self.inner
            .entries
            .iter()
            .map(|e| e.participant.name.clone())
            .collect()
    }

    /// Participants joined after this savepoint was taken
    pub fn late_joiners(&self) -> Vec<String> {
        let Some(inner) = self.inner.transaction.upgrade() else {
            return Vec::new();
        };
        let txn = Transaction::from_inner(inner);
        let data = txn.data();
        data.joined
            .iter()
            .filter(|p| !self.inner.covers(p))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Restore every captured participant to its state at this savepoint
    ///
    /// Fails without touching any participant if the savepoint is invalid, the
    /// transaction is no longer open, or a captured participant does not
    /// support savepoints. If restoring a participant fails the remaining ones
    /// are still restored, after which every savepoint of the transaction is
    /// invalidated and the transaction is doomed.
    pub fn rollback(&self) -> Result<()> {
        let inner = self
            .inner
            .transaction
            .upgrade()
            .ok_or(TransactionError::InvalidSavepoint)?;
        Transaction::from_inner(inner).rollback_savepoint(&self.inner)
    }
}

impl fmt::Debug for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Savepoint")
            .field("transaction_id", &self.inner.transaction_id)
            .field("valid", &self.is_valid())
            .field("participants", &self.participants())
            .finish()
    }
}

impl Transaction {
    /// Take a savepoint over every currently joined participant
    ///
    /// Participants without savepoint support are recorded as unsupported (or
    /// rejected up front with `strict_savepoints`).
    pub fn savepoint(&self) -> Result<Savepoint> {
        let ordered = {
            let data = self.data();
            if !data.state.can_savepoint() {
                return Err(self.invalid_state(data.state, "take a savepoint of"));
            }
            if data.savepoints.iter().any(|s| !s.is_valid()) {
                return Err(TransactionError::SavepointFailed(self.id()));
            }
            commit_order(&data.joined)
        };

        let mut entries = Vec::with_capacity(ordered.len());
        let mut failures = Vec::new();
        for participant in ordered {
            match participant.resource.savepoint(self) {
                Ok(token) => entries.push(SavepointEntry { participant, token }),
                Err(e) => failures.push(ParticipantFailure::new(
                    participant.name.clone(),
                    Phase::Savepoint,
                    e,
                )),
            }
        }
        if let Some(err) = TransactionError::from_failures(failures) {
            return Err(err);
        }

        let inner = Arc::new(SavepointInner {
            transaction_id: self.id(),
            transaction: self.downgrade(),
            entries,
            valid: AtomicBool::new(true),
        });
        let unsupported = inner.unsupported();
        if self.config().strict_savepoints && !unsupported.is_empty() {
            return Err(TransactionError::SavepointsUnsupported(unsupported));
        }

        let mut data = self.data();
        if !data.state.can_savepoint() {
            return Err(self.invalid_state(data.state, "take a savepoint of"));
        }
        data.savepoints.push(inner.clone());
        debug!(
            txn = %self.id(),
            depth = data.savepoints.len(),
            participants = inner.entries.len(),
            unsupported = unsupported.len(),
            "Savepoint taken"
        );
        Ok(Savepoint { inner })
    }

    /// Number of live savepoints on the stack
    pub fn savepoint_count(&self) -> usize {
        self.data().savepoints.len()
    }

    fn rollback_savepoint(&self, savepoint: &Arc<SavepointInner>) -> Result<()> {
        let late_joiners = {
            let mut data = self.data();
            if !data.state.is_open() {
                return Err(self.invalid_state(data.state, "roll back a savepoint of"));
            }
            if !savepoint.is_valid() {
                return Err(TransactionError::InvalidSavepoint);
            }
            let position = data
                .savepoints
                .iter()
                .position(|s| Arc::ptr_eq(s, savepoint))
                .ok_or(TransactionError::InvalidSavepoint)?;

            let unsupported = savepoint.unsupported();
            if !unsupported.is_empty() {
                return Err(TransactionError::SavepointsUnsupported(unsupported));
            }

            let late_joiners: Vec<String> = data
                .joined
                .iter()
                .filter(|p| !savepoint.covers(p))
                .map(|p| p.name.clone())
                .collect();
            if !late_joiners.is_empty() && self.config().late_joiners == LateJoinPolicy::Fail {
                return Err(TransactionError::LateJoiners(late_joiners));
            }

            for later in data.savepoints.drain(position + 1..) {
                later.invalidate();
            }
            late_joiners
        };

        if !late_joiners.is_empty() {
            warn!(
                txn = %self.id(),
                late_joiners = ?late_joiners,
                "Rolling back savepoint; participants joined after it are not rolled back"
            );
        }

        let mut failures = Vec::new();
        for entry in &savepoint.entries {
            if let Some(token) = &entry.token
                && let Err(e) = entry.participant.resource.rollback(token)
            {
                failures.push(ParticipantFailure::new(
                    entry.participant.name.clone(),
                    Phase::Rollback,
                    e,
                ));
            }
        }

        if let Some(err) = TransactionError::from_failures(failures) {
            let mut data = self.data();
            for savepoint in &data.savepoints {
                savepoint.invalidate();
            }
            data.doomed = true;
            if data.state.can_doom() {
                data.state = TransactionState::Doomed;
            }
            error!(
                txn = %self.id(),
                error = %err,
                "Savepoint rollback failed; transaction doomed"
            );
            return Err(err);
        }

        debug!(
            txn = %self.id(),
            participants = savepoint.entries.len(),
            "Rolled back to savepoint"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;
    use crate::resource::ResourceHandle;
    use crate::test_utils::{Op, RecordingResource};

    fn txn() -> Transaction {
        Transaction::new(CoordinatorConfig::default())
    }

    #[test]
    fn test_rollback_restores_captured_state() {
        let a = RecordingResource::new("a").with_savepoints();
        let txn = txn();
        txn.join(a.clone()).unwrap();

        a.set_value(1);
        let sp = txn.savepoint().unwrap();
        a.set_value(2);

        sp.rollback().unwrap();
        assert_eq!(a.value(), 1);
        assert!(sp.is_valid());

        a.set_value(3);
        sp.rollback().unwrap();
        assert_eq!(a.value(), 1);
    }

    #[test]
    fn test_rollback_invalidates_later_savepoints() {
        let a = RecordingResource::new("a").with_savepoints();
        let txn = txn();
        txn.join(a.clone()).unwrap();

        a.set_value(1);
        let first = txn.savepoint().unwrap();
        a.set_value(2);
        let second = txn.savepoint().unwrap();
        a.set_value(3);
        let third = txn.savepoint().unwrap();
        assert_eq!(txn.savepoint_count(), 3);

        first.rollback().unwrap();

        assert!(first.is_valid());
        assert!(!second.is_valid());
        assert!(!third.is_valid());
        assert_eq!(txn.savepoint_count(), 1);
        assert!(matches!(second.rollback(), Err(TransactionError::InvalidSavepoint)));
        assert!(matches!(third.rollback(), Err(TransactionError::InvalidSavepoint)));
        assert_eq!(a.value(), 1);
    }

    #[test]
    fn test_unsupported_participant_blocks_rollback_before_any_change() {
        let a = RecordingResource::new("a").with_savepoints();
        let b = RecordingResource::new("b");
        let txn = txn();
        txn.join(a.clone()).unwrap();
        txn.join(b.clone()).unwrap();

        a.set_value(1);
        let sp = txn.savepoint().unwrap();
        assert!(!sp.supports_rollback());
        assert_eq!(sp.unsupported(), vec!["b"]);
        a.set_value(2);

        let err = sp.rollback().unwrap_err();
        assert!(matches!(err, TransactionError::SavepointsUnsupported(names) if names == vec!["b"]));
        assert_eq!(a.value(), 2);
        assert!(!a.calls().contains(&Op::Rollback));
    }

    #[test]
    fn test_strict_savepoints_reject_unsupported_up_front() {
        let txn = Transaction::new(CoordinatorConfig::new().with_strict_savepoints(true));
        txn.join(RecordingResource::new("plain")).unwrap();

        let err = txn.savepoint().unwrap_err();
        assert!(matches!(err, TransactionError::SavepointsUnsupported(_)));
        assert_eq!(txn.savepoint_count(), 0);
    }

    #[test]
    fn test_late_joiner_is_excluded_by_default() {
        let a = RecordingResource::new("a").with_savepoints();
        let late = RecordingResource::new("late").with_savepoints();
        let txn = txn();
        txn.join(a.clone()).unwrap();

        let sp = txn.savepoint().unwrap();
        txn.join(late.clone()).unwrap();
        late.set_value(7);
        assert_eq!(sp.late_joiners(), vec!["late"]);

        sp.rollback().unwrap();
        assert_eq!(late.value(), 7);
        assert!(!late.calls().contains(&Op::Rollback));
        assert_eq!(txn.participants(), vec!["a", "late"]);
    }

    #[test]
    fn test_late_joiner_fails_rollback_when_configured() {
        let a = RecordingResource::new("a").with_savepoints();
        let txn = Transaction::new(CoordinatorConfig::new().with_late_joiners(LateJoinPolicy::Fail));
        txn.join(a.clone()).unwrap();

        let sp = txn.savepoint().unwrap();
        txn.join(RecordingResource::new("late")).unwrap();

        let err = sp.rollback().unwrap_err();
        assert!(matches!(err, TransactionError::LateJoiners(names) if names == vec!["late"]));
        assert!(!a.calls().contains(&Op::Rollback));
        assert!(sp.is_valid());
    }

    #[test]
    fn test_failed_rollback_dooms_and_poisons() {
        let a = RecordingResource::new("a").with_savepoints();
        let b = RecordingResource::new("b").with_savepoints();
        a.fail_on(Op::Rollback);
        let txn = txn();
        txn.join(a.clone()).unwrap();
        txn.join(b.clone()).unwrap();

        b.set_value(1);
        let sp = txn.savepoint().unwrap();
        b.set_value(2);

        let err = sp.rollback().unwrap_err();
        assert!(matches!(&err, TransactionError::Participant(f) if f.phase == Phase::Rollback));
        assert_eq!(b.value(), 1);
        assert!(!sp.is_valid());
        assert!(txn.is_doomed());
        assert!(matches!(txn.savepoint(), Err(TransactionError::SavepointFailed(_))));
        assert!(matches!(txn.commit(), Err(TransactionError::Doomed(_))));
        txn.abort().unwrap();
    }

    #[test]
    fn test_savepoint_on_doomed_transaction() {
        let a = RecordingResource::new("a").with_savepoints();
        let txn = txn();
        txn.join(a.clone()).unwrap();
        txn.doom().unwrap();

        a.set_value(4);
        let sp = txn.savepoint().unwrap();
        a.set_value(5);
        sp.rollback().unwrap();
        assert_eq!(a.value(), 4);
        assert_eq!(txn.state(), TransactionState::Doomed);
    }

    #[test]
    fn test_rollback_after_completion_fails() {
        let a = RecordingResource::new("a").with_savepoints();
        let txn = txn();
        txn.join(a.clone()).unwrap();
        let sp = txn.savepoint().unwrap();
        txn.commit().unwrap();

        assert!(!sp.is_valid());
        assert!(sp.rollback().unwrap_err().is_usage_error());
        assert!(!a.calls().contains(&Op::Rollback));
    }

    #[test]
    fn test_rollback_after_transaction_dropped() {
        let sp = {
            let txn = txn();
            let a: ResourceHandle = RecordingResource::new("a").with_savepoints();
            txn.join(a).unwrap();
            txn.savepoint().unwrap()
        };
        assert!(matches!(sp.rollback(), Err(TransactionError::InvalidSavepoint)));
        assert!(sp.late_joiners().is_empty());
    }

    #[test]
    fn test_savepoint_failure_is_reported() {
        let a = RecordingResource::new("a").with_savepoints();
        a.fail_on(Op::Savepoint);
        let txn = txn();
        txn.join(a).unwrap();

        let err = txn.savepoint().unwrap_err();
        assert!(matches!(err, TransactionError::Participant(f) if f.phase == Phase::Savepoint));
        assert_eq!(txn.savepoint_count(), 0);
    }
}
