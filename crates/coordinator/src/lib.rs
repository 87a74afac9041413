//! In-process two-phase commit coordinator
//!
//! This crate lets several independent resource managers (a relational
//! connection, an object store, a cache invalidator, ...) take part in one
//! atomic unit of work. It owns no durable state: it drives the participants
//! through begin, vote and finish (or abort) and reports a single consistent
//! outcome.
//!
//! ## Architecture
//!
//! - [`ResourceManager`]: the contract every participant implements
//! - [`Transaction`]: join list, doom flag, savepoints, and the 2PC driver
//! - [`Savepoint`]: partial rollback inside an open transaction
//! - [`TransactionManager`]: the current transaction of one execution context
//! - [`Synchronizer`]: observers of transaction start and completion
//!
//! Participants are always contacted one at a time in sort-key order, the
//! same order for every phase. The coordinator never retries and never
//! imposes timeouts.
//!
//! ## Failure model
//!
//! A failure before the finish phase aborts every participant. A failure
//! during the finish phase cannot be compensated: some participants may
//! already have committed durably. It is reported as
//! [`TransactionError::Heuristic`] and logged at error level.

pub mod config;
pub mod error;
pub mod id;
pub mod manager;
pub mod resource;
pub mod savepoint;
pub mod state;
pub mod synchronizer;
pub mod transaction;

#[cfg(test)]
mod test_utils;

pub use config::{CoordinatorConfig, LateJoinPolicy, VoteMode};
pub use error::{
    AggregateFailure, ParticipantFailure, Phase, ResourceError, Result, TransactionError,
};
pub use id::TransactionId;
pub use manager::TransactionManager;
pub use resource::{ResourceHandle, ResourceManager, SavepointToken};
pub use savepoint::Savepoint;
pub use state::TransactionState;
pub use synchronizer::{Synchronizer, SynchronizerRegistry};
pub use transaction::Transaction;
