//! Persistent state behind one transactional store.
//!
//! Server descriptors, tokens, projects, policy rules, approval history,
//! audit events, and the built-in memory entries all live here. The engine
//! is a single-host in-memory table set behind a `RwLock`; writes that span
//! rows run inside [`MemoryStore::transaction`] so partial updates are
//! never observable. Swapping in a durable engine means reimplementing this
//! crate's surface, nothing else.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod error;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use memory::{MemoryEntry, MemoryPage};
pub use store::{MemoryStore, Tables};
