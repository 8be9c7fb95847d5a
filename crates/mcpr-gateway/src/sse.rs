//! SSE sessions for server-to-client notifications.
//!
//! Each `GET /mcp/sse` connection gets a stable session id. The first frame
//! is an `endpoint` event naming where to POST client-to-server messages;
//! replies and notifications flow back as `message` events.

use axum::response::sse::{Event, KeepAlive, Sse};
use dashmap::DashMap;
use futures::stream::Stream;
use mcpr_core::SessionId;
use mcpr_protocol::JsonRpcMessage;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// The live session table.
#[derive(Debug, Clone, Default)]
pub struct SseSessions {
    inner: Arc<DashMap<SessionId, mpsc::UnboundedSender<Event>>>,
}

impl SseSessions {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session: returns its id and the response stream, with the
    /// `endpoint` event already queued.
    #[must_use]
    pub fn open(&self) -> (SessionId, Sse<impl Stream<Item = Result<Event, Infallible>> + use<>>) {
        let session_id = SessionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let endpoint = Event::default()
            .event("endpoint")
            .data(format!("/mcp/messages?sessionId={}", session_id.0));
        let _ = tx.send(endpoint);

        self.inner.insert(session_id.clone(), tx);
        debug!(session = %session_id, "sse session opened");

        let stream = futures::stream::poll_fn(move |cx| match rx.poll_recv(cx) {
            std::task::Poll::Ready(Some(event)) => std::task::Poll::Ready(Some(Ok(event))),
            std::task::Poll::Ready(None) => std::task::Poll::Ready(None),
            std::task::Poll::Pending => std::task::Poll::Pending,
        });

        (
            session_id,
            Sse::new(stream).keep_alive(KeepAlive::default()),
        )
    }

    /// Deliver a JSON-RPC message to one session.
    ///
    /// Returns `false` when the session does not exist or has gone away; a
    /// dead session is dropped from the table on the failed send.
    pub fn send(&self, session_id: &SessionId, message: &JsonRpcMessage) -> bool {
        let Some(tx) = self.inner.get(session_id) else {
            return false;
        };
        let Ok(wire) = message.to_wire() else {
            return false;
        };
        let delivered = tx.send(Event::default().event("message").data(wire)).is_ok();
        drop(tx);
        if !delivered {
            self.inner.remove(session_id);
            debug!(session = %session_id, "sse session closed");
        }
        delivered
    }

    /// Broadcast a notification to every session.
    pub fn broadcast(&self, message: &JsonRpcMessage) {
        let Ok(wire) = message.to_wire() else {
            return;
        };
        self.inner.retain(|_, tx| {
            tx.send(Event::default().event("message").data(wire.clone()))
                .is_ok()
        });
    }

    /// Whether a session exists.
    #[must_use]
    pub fn exists(&self, session_id: &SessionId) -> bool {
        self.inner.contains_key(session_id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether no sessions are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
