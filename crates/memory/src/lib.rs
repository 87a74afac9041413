//! In-memory key/value resource manager
//!
//! A reference participant for `txn-coordinator`. A [`MemoryStore`] holds
//! committed data shared by any number of [`MemoryResource`] connections.
//! Each connection stages writes for one transaction at a time, validates
//! its reads when the transaction votes, and applies everything atomically in
//! the finish phase.
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let accounts = MemoryResource::new("accounts", store.clone());
//! let manager = TransactionManager::new();
//!
//! manager.run(|txn| -> Result<(), MemoryError> {
//!     accounts.put(txn, "alice", 90)?;
//!     accounts.put(txn, "bob", 110)?;
//!     Ok(())
//! })?;
//! ```

pub mod error;
pub mod resource;
pub mod store;

pub use error::{Conflict, MemoryError, Result};
pub use resource::{MemoryResource, Operation, ResourceStats};
pub use store::MemoryStore;
