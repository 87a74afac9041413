//! Transaction handle and two-phase commit driver
//!
//! The Transaction owns the join list, doom flag, savepoint stack and metadata,
//! and drives joined resource managers through begin, vote and finish. Every
//! pass contacts participants one at a time in sort-key order. The lock on the
//! transaction data is never held while a participant is called, so
//! participants may call back into the transaction (and get a usage error if
//! the state does not allow what they ask for).

use crate::config::{CoordinatorConfig, VoteMode};
use crate::error::{ParticipantFailure, Phase, ResourceError, Result, TransactionError};
use crate::id::TransactionId;
use crate::resource::{Participant, ResourceHandle, commit_order};
use crate::savepoint::SavepointInner;
use crate::state::TransactionState;
use crate::synchronizer::SynchronizerRegistry;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

type BeforeCommitHook =
    Box<dyn FnOnce(&Transaction) -> std::result::Result<(), ResourceError> + Send>;
type AfterCommitHook = Box<dyn FnOnce(&Transaction, bool) + Send>;

/// Unit of work spanning any number of resource managers
///
/// Cloning yields another handle to the same transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

pub(crate) struct TransactionInner {
    id: TransactionId,
    config: CoordinatorConfig,
    synchronizers: SynchronizerRegistry,
    data: Mutex<TransactionData>,
}

pub(crate) struct TransactionData {
    pub state: TransactionState,
    pub doomed: bool,
    /// Join order
    pub joined: Vec<Participant>,
    next_seq: u64,
    /// Stack of live savepoints, oldest first
    pub savepoints: Vec<Arc<SavepointInner>>,
    metadata: BTreeMap<String, Value>,
    user: Option<String>,
    description: String,
    before_commit: Vec<BeforeCommitHook>,
    after_commit: Vec<AfterCommitHook>,
    /// Failures recorded while the transaction was already failing
    secondary_failures: Vec<ParticipantFailure>,
    /// Set while `commit()` runs hooks, before the state leaves `Active`
    commit_started: bool,
}

impl TransactionData {
    /// Invalidate and drop every savepoint
    pub fn retire_savepoints(&mut self) {
        for savepoint in self.savepoints.drain(..) {
            savepoint.invalidate();
        }
    }
}

impl Transaction {
    /// Create a standalone transaction with no synchronizers
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::with_registry(config, SynchronizerRegistry::new())
    }

    pub(crate) fn with_registry(config: CoordinatorConfig, synchronizers: SynchronizerRegistry) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: TransactionId::new(),
                config,
                synchronizers,
                data: Mutex::new(TransactionData {
                    state: TransactionState::Active,
                    doomed: false,
                    joined: Vec::new(),
                    next_seq: 0,
                    savepoints: Vec::new(),
                    metadata: BTreeMap::new(),
                    user: None,
                    description: String::new(),
                    before_commit: Vec::new(),
                    after_commit: Vec::new(),
                    secondary_failures: Vec::new(),
                    commit_started: false,
                }),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<TransactionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<TransactionInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, TransactionData> {
        self.inner.data.lock()
    }

    pub(crate) fn invalid_state(&self, state: TransactionState, operation: &'static str) -> TransactionError {
        TransactionError::InvalidState {
            id: self.inner.id,
            state,
            operation,
        }
    }

    /// Get the transaction ID
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// Get the current transaction state
    pub fn state(&self) -> TransactionState {
        self.data().state
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Check if both handles refer to the same transaction
    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // === DOOM ===

    /// Refuse any future commit without raising now
    ///
    /// Idempotent. No participant is contacted.
    pub fn doom(&self) -> Result<()> {
        let mut data = self.data();
        if !data.state.can_doom() {
            return Err(self.invalid_state(data.state, "doom"));
        }
        if !data.doomed {
            debug!(txn = %self.inner.id, "Transaction doomed");
        }
        data.doomed = true;
        data.state = TransactionState::Doomed;
        Ok(())
    }

    pub fn is_doomed(&self) -> bool {
        self.data().doomed
    }

    // === JOIN ===

    /// Join a resource manager to this transaction
    ///
    /// Joining a handle that is already joined is a no-op.
    pub fn join(&self, resource: ResourceHandle) -> Result<()> {
        // Query the participant before taking the lock
        let mut participant = Participant::validate(resource, 0)?;

        let mut data = self.data();
        if !data.state.can_join() {
            return Err(self.invalid_state(data.state, "join"));
        }
        if data.joined.iter().any(|p| p.is(&participant.resource)) {
            return Ok(());
        }
        if let Some(existing) = data
            .joined
            .iter()
            .find(|p| p.sort_key == participant.sort_key)
        {
            warn!(
                txn = %self.inner.id,
                sort_key = %participant.sort_key,
                existing = %existing.name,
                joining = %participant.name,
                "Participants share a sort key; ordering falls back to join order"
            );
        }

        participant.seq = data.next_seq;
        data.next_seq += 1;
        debug!(
            txn = %self.inner.id,
            participant = %participant.name,
            sort_key = %participant.sort_key,
            "Participant joined"
        );
        data.joined.push(participant);
        Ok(())
    }

    /// Names of joined participants, in join order
    pub fn participants(&self) -> Vec<String> {
        self.data().joined.iter().map(|p| p.name.clone()).collect()
    }

    /// Names of joined participants, in the order every phase contacts them
    pub fn commit_order(&self) -> Vec<String> {
        commit_order(&self.data().joined)
            .into_iter()
            .map(|p| p.name)
            .collect()
    }

    // === COMMIT ===

    /// Commit this transaction using two-phase commit
    ///
    /// Fails with [`TransactionError::Doomed`] without contacting anyone if the
    /// transaction is doomed. A failure before the finish phase aborts every
    /// participant and returns the triggering failure. A failure during the
    /// finish phase is [`TransactionError::Heuristic`]: some participants may
    /// already be durably committed and nothing is undone. Participants whose
    /// finish failed are then sent abort so they can release their pending
    /// work; committed participants are left alone.
    ///
    /// Calling `commit()` from a before-commit hook or synchronizer of the
    /// same transaction is a usage error.
    pub fn commit(&self) -> Result<()> {
        {
            let mut data = self.data();
            if data.doomed {
                return Err(TransactionError::Doomed(self.inner.id));
            }
            if data.commit_started {
                return Err(self.invalid_state(data.state, "commit (already committing)"));
            }
            if !data.state.can_commit() {
                return Err(self.invalid_state(data.state, "commit"));
            }
            data.commit_started = true;
        }

        // Hooks run while still active so they may join more participants
        if let Err(failure) = self.run_before_commit_hooks() {
            return self.fail_before_finish(failure.into());
        }
        let failures = self.inner.synchronizers.before_completion(self);
        if let Some(err) = TransactionError::from_failures(failures) {
            return self.fail_before_finish(err);
        }

        let ordered = {
            let mut data = self.data();
            if data.doomed {
                data.commit_started = false;
                return Err(TransactionError::Doomed(self.inner.id));
            }
            if !data.state.can_commit() {
                data.commit_started = false;
                return Err(self.invalid_state(data.state, "commit"));
            }
            data.state = TransactionState::Committing;
            commit_order(&data.joined)
        };
        debug!(
            txn = %self.inner.id,
            participants = ordered.len(),
            "Starting two-phase commit"
        );

        // Phase 1: begin, then vote
        for participant in &ordered {
            if let Err(e) = participant.resource.begin_commit(self) {
                let failure = ParticipantFailure::new(participant.name.clone(), Phase::Begin, e);
                return self.fail_before_finish(failure.into());
            }
        }

        let failures = self.vote(&ordered);
        if let Some(err) = TransactionError::from_failures(failures) {
            return self.fail_before_finish(err);
        }

        // Phase 2: finish. Every participant is attempted.
        let mut committed = Vec::with_capacity(ordered.len());
        let mut unfinished = Vec::new();
        let mut failures = Vec::new();
        for participant in &ordered {
            match participant.resource.finish_commit(self) {
                Ok(()) => committed.push(participant.name.clone()),
                Err(e) => {
                    failures.push(ParticipantFailure::new(
                        participant.name.clone(),
                        Phase::Finish,
                        e,
                    ));
                    unfinished.push(participant.clone());
                }
            }
        }

        if let Some(source) = TransactionError::from_failures(failures) {
            {
                let mut data = self.data();
                data.state = TransactionState::CommitFailed;
                data.retire_savepoints();
            }
            error!(
                txn = %self.inner.id,
                committed = ?committed,
                error = %source,
                "Finish phase failed; participants are inconsistent"
            );
            // Cleanup: only the participants that did not commit are aborted
            let cleanup_failures = self.abort_pass(&unfinished);
            self.record_secondary(cleanup_failures);
            self.run_after_commit_hooks(false);
            let sync_failures = self.inner.synchronizers.after_completion(self);
            self.record_secondary(sync_failures);
            return Err(TransactionError::Heuristic {
                committed,
                source: Box::new(source),
            });
        }

        {
            let mut data = self.data();
            data.state = TransactionState::Committed;
            data.retire_savepoints();
        }
        info!(
            txn = %self.inner.id,
            participants = ordered.len(),
            "Transaction committed"
        );
        self.run_after_commit_hooks(true);

        let failures = self.inner.synchronizers.after_completion(self);
        match TransactionError::from_failures(failures) {
            Some(err) => {
                warn!(txn = %self.inner.id, error = %err, "Synchronizer failed after commit");
                Err(err)
            }
            None => Ok(()),
        }
    }

    fn vote(&self, ordered: &[Participant]) -> Vec<ParticipantFailure> {
        let mut failures = Vec::new();
        for participant in ordered {
            if let Err(e) = participant.resource.vote(self) {
                debug!(
                    txn = %self.inner.id,
                    participant = %participant.name,
                    error = %e,
                    "Negative vote"
                );
                failures.push(ParticipantFailure::new(
                    participant.name.clone(),
                    Phase::Vote,
                    e,
                ));
                if self.inner.config.vote_mode == VoteMode::FailFast {
                    break;
                }
            }
        }
        failures
    }

    /// Abort every participant after a failure before the finish phase
    ///
    /// The transaction passes through `CommitFailed` and ends `Aborted`.
    /// The triggering failure is returned; anything that fails while
    /// compensating is logged and kept as a secondary failure.
    fn fail_before_finish(&self, cause: TransactionError) -> Result<()> {
        let ordered = {
            let mut data = self.data();
            if data.state.is_terminal() {
                return Err(cause);
            }
            data.state = TransactionState::CommitFailed;
            commit_order(&data.joined)
        };
        warn!(
            txn = %self.inner.id,
            error = %cause,
            "Commit failed before finish; aborting participants"
        );

        let failures = self.abort_pass(&ordered);
        if let Some(err) = TransactionError::from_failures(failures.clone()) {
            warn!(txn = %self.inner.id, error = %err, "Compensating abort failed");
        }
        {
            let mut data = self.data();
            data.state = TransactionState::Aborted;
            data.retire_savepoints();
        }
        self.record_secondary(failures);

        self.run_after_commit_hooks(false);
        let sync_failures = self.inner.synchronizers.after_completion(self);
        self.record_secondary(sync_failures);
        Err(cause)
    }

    fn run_before_commit_hooks(&self) -> std::result::Result<(), ParticipantFailure> {
        let mut index = 0;
        loop {
            // Hooks may register more hooks
            let hooks = std::mem::take(&mut self.data().before_commit);
            if hooks.is_empty() {
                return Ok(());
            }
            for hook in hooks {
                hook(self).map_err(|e| {
                    ParticipantFailure::new(
                        format!("before-commit hook {}", index),
                        Phase::BeforeCommit,
                        e,
                    )
                })?;
                index += 1;
            }
        }
    }

    fn run_after_commit_hooks(&self, success: bool) {
        let hooks = std::mem::take(&mut self.data().after_commit);
        for hook in hooks {
            hook(self, success);
        }
    }

    // === ABORT ===

    /// Abort this transaction
    ///
    /// Every joined participant is asked to abort, in sort-key order, even if
    /// earlier ones fail. The transaction always ends `Aborted`; participant
    /// and synchronizer failures are then reported together.
    pub fn abort(&self) -> Result<()> {
        let ordered = {
            let mut data = self.data();
            if !data.state.can_abort() {
                return Err(self.invalid_state(data.state, "abort"));
            }
            data.state = TransactionState::Aborting;
            data.before_commit.clear();
            data.after_commit.clear();
            commit_order(&data.joined)
        };
        debug!(
            txn = %self.inner.id,
            participants = ordered.len(),
            "Aborting transaction"
        );

        let mut failures = self.abort_pass(&ordered);
        {
            let mut data = self.data();
            data.state = TransactionState::Aborted;
            data.retire_savepoints();
        }
        info!(
            txn = %self.inner.id,
            failures = failures.len(),
            "Transaction aborted"
        );

        failures.extend(self.inner.synchronizers.after_completion(self));
        match TransactionError::from_failures(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn abort_pass(&self, ordered: &[Participant]) -> Vec<ParticipantFailure> {
        ordered
            .iter()
            .filter_map(|participant| {
                participant.resource.abort(self).err().map(|e| {
                    ParticipantFailure::new(participant.name.clone(), Phase::Abort, e)
                })
            })
            .collect()
    }

    fn record_secondary(&self, failures: Vec<ParticipantFailure>) {
        if failures.is_empty() {
            return;
        }
        for failure in &failures {
            warn!(txn = %self.inner.id, %failure, "Secondary failure");
        }
        self.data().secondary_failures.extend(failures);
    }

    /// Failures recorded while the transaction was already failing
    ///
    /// These are the compensating-abort and synchronizer failures that were not
    /// returned because a different failure was reported to the caller.
    pub fn secondary_failures(&self) -> Vec<ParticipantFailure> {
        self.data().secondary_failures.clone()
    }

    // === HOOKS ===

    /// Register a hook to run at the start of `commit()`
    ///
    /// Hooks run in registration order before any participant is contacted. A
    /// failing hook aborts the transaction.
    pub fn add_before_commit_hook<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce(&Transaction) -> std::result::Result<(), ResourceError> + Send + 'static,
    {
        let mut data = self.data();
        if !data.state.is_open() {
            return Err(self.invalid_state(data.state, "add a before-commit hook to"));
        }
        data.before_commit.push(Box::new(hook));
        Ok(())
    }

    /// Register a hook to run once the commit attempt settles
    ///
    /// The hook receives `true` if the transaction committed. It is not run
    /// when the transaction is aborted without a commit attempt.
    pub fn add_after_commit_hook<F>(&self, hook: F) -> Result<()>
    where
        F: FnOnce(&Transaction, bool) + Send + 'static,
    {
        let mut data = self.data();
        if !data.state.is_open() {
            return Err(self.invalid_state(data.state, "add an after-commit hook to"));
        }
        data.after_commit.push(Box::new(hook));
        Ok(())
    }

    // === METADATA ===

    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data().metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.data().metadata.get(key).cloned()
    }

    pub fn metadata_snapshot(&self) -> BTreeMap<String, Value> {
        self.data().metadata.clone()
    }

    /// Append a line to the description
    pub fn note(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let mut data = self.data();
        if !data.description.is_empty() {
            data.description.push('\n');
        }
        data.description.push_str(text);
    }

    pub fn description(&self) -> String {
        self.data().description.clone()
    }

    pub fn set_user(&self, user: impl Into<String>) {
        self.data().user = Some(user.into());
    }

    pub fn user(&self) -> Option<String> {
        self.data().user.clone()
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("state", &data.state)
            .field("doomed", &data.doomed)
            .field("participants", &data.joined.len())
            .field("savepoints", &data.savepoints.len())
            .finish()
    }
}
