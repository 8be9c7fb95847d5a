//! Built-in memory entries.
//!
//! The gateway exposes a handful of memory primitives as built-in tools;
//! the entries are plain rows scoped per client. Retrieval is paged so
//! callers can iterate lazily over a page-fetch function instead of
//! loading everything.

use mcpr_core::{ClientId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One stored memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Owner client.
    pub client_id: ClientId,
    /// Key, unique per client.
    pub key: String,
    /// Stored value.
    pub value: Value,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last write time.
    pub updated_at: Timestamp,
}

/// One page of a memory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPage {
    /// Entries in this page, ordered by key.
    pub entries: Vec<MemoryEntry>,
    /// Offset to pass for the next page; `None` when exhausted.
    pub next_offset: Option<usize>,
}
