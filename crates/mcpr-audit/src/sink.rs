//! The audit sink.

use async_trait::async_trait;
use mcpr_core::{ClientId, Timestamp};
use std::sync::Mutex;
use tracing::trace;

use crate::event::{AuditEvent, AuditEventType};

/// Query filter for reading events back.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Restrict to one event type.
    pub event_type: Option<AuditEventType>,
    /// Restrict to one client.
    pub client_id: Option<ClientId>,
    /// Only events at or after this time.
    pub since: Option<Timestamp>,
    /// Cap on returned events (newest first).
    pub limit: Option<usize>,
}

impl AuditFilter {
    /// Whether an event passes this filter.
    #[must_use]
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if self.event_type.is_some_and(|t| t != event.event_type) {
            return false;
        }
        if let Some(client) = &self.client_id {
            if event.client_id.as_ref() != Some(client) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        true
    }
}

/// Where audit events go. Append-only: implementations never mutate or
/// delete what was written. All pipeline stages write through one sink,
/// which serializes the appends.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one event.
    async fn append(&self, event: AuditEvent);

    /// Read events back, newest first.
    async fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent>;
}

/// In-memory sink; the single-host default and the test double.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.lock().expect("audit log poisoned").len()
    }

    /// Whether the sink is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: AuditEvent) {
        trace!(event = %event.event_type, success = event.success, "audit");
        self.events.lock().expect("audit log poisoned").push(event);
    }

    async fn query(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let events = self.events.lock().expect("audit log poisoned");
        let mut matched: Vec<AuditEvent> = events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.reverse();
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }
}
