//! The pending map and its wait/notify mechanics.

use mcpr_core::{ApprovalId, Timestamp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::request::{ApprovalRequest, ApprovalResponse, ApprovalStatus};

/// Result alias for queue operations.
pub type ApprovalResult<T> = Result<T, ApprovalError>;

/// Queue operation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// No request with this id.
    #[error("unknown approval request")]
    NotFound,
    /// The request already reached a terminal state.
    #[error("approval request is {status}, not pending")]
    InvalidState {
        /// The terminal status encountered.
        status: ApprovalStatus,
    },
    /// `wait` was called twice for the same id.
    #[error("approval request already has a waiter")]
    AlreadyWaited,
}

/// How a wait concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitOutcome {
    /// Whether the call may proceed.
    pub approved: bool,
    /// `"rejected"`, `"expired"`, `"cancelled"`, or a responder note.
    pub reason: Option<String>,
}

impl WaitOutcome {
    fn approved(reason: Option<String>) -> Self {
        Self {
            approved: true,
            reason,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
        }
    }

    /// Whether the wait ended by expiry (timeout) rather than a decision.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        !self.approved && self.reason.as_deref() == Some("expired")
    }

    /// Whether the wait ended by cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        !self.approved && self.reason.as_deref() == Some("cancelled")
    }
}

struct Waiter {
    tx: Option<oneshot::Sender<WaitOutcome>>,
    rx: Option<oneshot::Receiver<WaitOutcome>>,
    expiry_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<ApprovalId, ApprovalRequest>,
    waiters: HashMap<ApprovalId, Waiter>,
}

/// The approval rendezvous service.
///
/// Cheap to clone; all clones share one pending map. The map has a single
/// owner (this service); locks are never held across await points.
#[derive(Clone, Default)]
pub struct ApprovalQueue {
    inner: Arc<Mutex<Inner>>,
}

impl ApprovalQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and arm its expiry timer.
    ///
    /// The caller builds the record via [`ApprovalRequest::open`]; the queue
    /// owns it from here.
    pub fn open(&self, request: ApprovalRequest) -> ApprovalRequest {
        let id = request.id.clone();
        let ttl = remaining(&request.expires_at);
        let (tx, rx) = oneshot::channel();

        let expiry_queue = self.clone();
        let expiry_id = id.clone();
        let expiry_task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            expiry_queue.expire(&expiry_id, "expired");
        });

        let mut inner = self.inner.lock().expect("approval map poisoned");
        inner.records.insert(id.clone(), request.clone());
        inner.waiters.insert(
            id.clone(),
            Waiter {
                tx: Some(tx),
                rx: Some(rx),
                expiry_task: Some(expiry_task),
            },
        );
        debug!(approval = %id, tool = %request.tool_name, "approval opened");
        request
    }

    /// Await the resolution of a pending request.
    ///
    /// The caller-level `timeout` composes with the record's expiry; the
    /// earlier deadline wins and both resolve the record to `Expired`.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] for unknown ids and
    /// [`ApprovalError::AlreadyWaited`] when a second waiter shows up - only
    /// one waiter per request is permitted.
    pub async fn wait(
        &self,
        id: &ApprovalId,
        timeout: Option<Duration>,
    ) -> ApprovalResult<WaitOutcome> {
        let rx = {
            let mut inner = self.inner.lock().expect("approval map poisoned");
            if !inner.records.contains_key(id) {
                return Err(ApprovalError::NotFound);
            }
            let waiter = inner.waiters.get_mut(id).ok_or(ApprovalError::AlreadyWaited)?;
            let rx = waiter.rx.take().ok_or(ApprovalError::AlreadyWaited)?;
            // Once both ends are claimed the entry has nothing left to hand out.
            if waiter.tx.is_none() {
                inner.waiters.remove(id);
            }
            rx
        };

        let outcome = match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    // Caller deadline beat the record expiry.
                    self.expire(id, "expired");
                    None
                }
            },
            None => rx.await.ok(),
        };

        Ok(outcome.unwrap_or_else(|| WaitOutcome::denied("expired")))
    }

    /// Resolve a pending request with a human decision.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] for unknown ids,
    /// [`ApprovalError::InvalidState`] when the request already reached a
    /// terminal state - terminal states are immutable.
    pub fn respond(
        &self,
        id: &ApprovalId,
        response: &ApprovalResponse,
    ) -> ApprovalResult<ApprovalRequest> {
        let mut inner = self.inner.lock().expect("approval map poisoned");
        let record = inner.records.get_mut(id).ok_or(ApprovalError::NotFound)?;

        if !record.status.is_pending() {
            return Err(ApprovalError::InvalidState {
                status: record.status,
            });
        }

        record.status = if response.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        record.responded_at = Some(Timestamp::now());
        record.responded_by.clone_from(&response.responded_by);
        record.response_note.clone_from(&response.note);
        let resolved = record.clone();

        let outcome = if response.approved {
            WaitOutcome::approved(response.note.clone())
        } else {
            WaitOutcome::denied(response.note.clone().unwrap_or_else(|| "rejected".to_string()))
        };
        Self::resolve_waiter(&mut inner, id, outcome);

        debug!(approval = %id, approved = response.approved, "approval resolved");
        Ok(resolved)
    }

    /// Cancel a pending request (caller went away). Pending requests move to
    /// `Expired` with reason `"cancelled"`; anything else is a no-op.
    pub fn cancel(&self, id: &ApprovalId) {
        self.expire(id, "cancelled");
    }

    /// Mark every overdue pending record expired. Covers records whose
    /// expiry timer never fired (restart recovery boundary).
    ///
    /// Returns how many records were transitioned.
    pub fn cleanup_expired(&self) -> usize {
        let overdue: Vec<ApprovalId> = {
            let inner = self.inner.lock().expect("approval map poisoned");
            inner
                .records
                .values()
                .filter(|r| r.status.is_pending() && r.expires_at.is_past())
                .map(|r| r.id.clone())
                .collect()
        };
        let count = overdue.len();
        for id in overdue {
            self.expire(&id, "expired");
        }
        if count > 0 {
            warn!(count, "expired overdue approval requests");
        }
        count
    }

    /// Fetch a record by id.
    #[must_use]
    pub fn get(&self, id: &ApprovalId) -> Option<ApprovalRequest> {
        self.inner
            .lock()
            .expect("approval map poisoned")
            .records
            .get(id)
            .cloned()
    }

    /// All records currently pending.
    #[must_use]
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        self.inner
            .lock()
            .expect("approval map poisoned")
            .records
            .values()
            .filter(|r| r.status.is_pending())
            .cloned()
            .collect()
    }

    fn expire(&self, id: &ApprovalId, reason: &str) {
        let mut inner = self.inner.lock().expect("approval map poisoned");
        let Some(record) = inner.records.get_mut(id) else {
            return;
        };
        if !record.status.is_pending() {
            return;
        }
        record.status = ApprovalStatus::Expired;
        record.responded_at = Some(Timestamp::now());
        debug!(approval = %id, reason, "approval expired");
        Self::resolve_waiter(&mut inner, id, WaitOutcome::denied(reason));
    }

    fn resolve_waiter(inner: &mut Inner, id: &ApprovalId, outcome: WaitOutcome) {
        let Some(waiter) = inner.waiters.get_mut(id) else {
            return;
        };
        if let Some(task) = waiter.expiry_task.take() {
            task.abort();
        }
        if let Some(tx) = waiter.tx.take() {
            // The receiver may be claimed later (wait after respond) or be
            // gone already; either way the send outcome is informational.
            let _ = tx.send(outcome);
        }
        // Keep the entry while its receiver is unclaimed so a late wait
        // still observes the outcome; drop it once both ends are gone.
        if waiter.rx.is_none() {
            inner.waiters.remove(id);
        }
    }
}

impl std::fmt::Debug for ApprovalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("approval map poisoned");
        f.debug_struct("ApprovalQueue")
            .field("records", &inner.records.len())
            .field("pending_waiters", &inner.waiters.len())
            .finish()
    }
}

fn remaining(expires_at: &Timestamp) -> Duration {
    let ms = (expires_at.0 - Timestamp::now().0).num_milliseconds();
    Duration::from_millis(ms.max(0) as u64)
}
