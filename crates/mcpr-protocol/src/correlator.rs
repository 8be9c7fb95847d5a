//! JSON-RPC request/reply correlator.
//!
//! One correlator sits between an outbound message sink and an inbound
//! message stream (a transport). Callers issue requests and get a future
//! for the matching reply; inbound requests and notifications from the
//! remote side are handed to an [`InboundHandler`].
//!
//! Liveness: every request resolves through exactly one of reply, timeout,
//! or [`Correlator::close`]. Replies arriving for ids that are no longer
//! pending (late replies after cancellation, or ids we never issued) are
//! logged and dropped.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{ProtocolError, ProtocolResult};
use crate::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    error_codes,
};

/// Handler for messages initiated by the remote side.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle an inbound request; the returned response is written back out.
    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "Method not found"),
        )
    }

    /// Handle an inbound notification.
    async fn handle_notification(&self, notification: JsonRpcNotification) {
        trace!(method = %notification.method, "unhandled notification");
    }
}

/// Handler that answers every request with method-not-found.
#[derive(Debug, Default)]
pub struct NullInboundHandler;

#[async_trait]
impl InboundHandler for NullInboundHandler {}

struct PendingEntry {
    tx: oneshot::Sender<Result<Value, JsonRpcError>>,
}

/// Maps outbound request ids to their pending reply futures.
///
/// The pending map has a single writer (this type); lock scopes never cross
/// an await point.
pub struct Correlator {
    sink: mpsc::UnboundedSender<JsonRpcMessage>,
    pending: Arc<Mutex<HashMap<RequestId, PendingEntry>>>,
    counter: AtomicU64,
    suffix: String,
    handler: Arc<dyn InboundHandler>,
    closed: AtomicBool,
}

impl Correlator {
    /// Create a correlator writing outbound messages to `sink`.
    #[must_use]
    pub fn new(sink: mpsc::UnboundedSender<JsonRpcMessage>, handler: Arc<dyn InboundHandler>) -> Self {
        use rand::Rng;
        const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        let suffix: String = (0..6)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();

        Self {
            sink,
            pending: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            suffix,
            handler,
            closed: AtomicBool::new(false),
        }
    }

    /// Next request id: monotonic counter plus a per-correlator random
    /// suffix, so ids are never reused even across reconnects of the same
    /// server.
    fn next_id(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        RequestId::String(format!("{n}-{}", self.suffix))
    }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }

    /// Issue a request and await its reply.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Timeout`] when no reply arrives within `timeout`.
    /// - [`ProtocolError::Closed`] when [`Correlator::close`] runs first.
    /// - [`ProtocolError::Remote`] when the remote answers with an error.
    /// - [`ProtocolError::SinkClosed`] when the transport is gone.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ProtocolResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::Closed {
                method: method.to_string(),
            });
        }

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.insert(id.clone(), PendingEntry { tx });
        }

        let request = JsonRpcRequest::new(id.clone(), method, params);
        if self.sink.send(request.into()).is_err() {
            self.remove_pending(&id);
            return Err(ProtocolError::SinkClosed);
        }

        trace!(%id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(ProtocolError::Remote {
                code: err.code,
                message: err.message,
                data: err.data,
            }),
            // The waiter was dropped without a reply: close() ran.
            Ok(Err(_)) => Err(ProtocolError::Closed {
                method: method.to_string(),
            }),
            Err(_) => {
                self.remove_pending(&id);
                Err(ProtocolError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification. No id, no bookkeeping, no reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SinkClosed`] when the transport is gone.
    pub fn send_notification(&self, method: &str, params: Option<Value>) -> ProtocolResult<()> {
        let note = JsonRpcNotification::new(method, params);
        self.sink
            .send(note.into())
            .map_err(|_| ProtocolError::SinkClosed)
    }

    /// Feed one inbound message through the correlator.
    pub async fn handle_inbound(&self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.complete(response),
            JsonRpcMessage::Request(request) => {
                let reply = self.handler.handle_request(request).await;
                if self.sink.send(reply.into()).is_err() {
                    debug!("dropping reply to remote request: sink closed");
                }
            }
            JsonRpcMessage::Notification(note) => {
                self.handler.handle_notification(note).await;
            }
        }
    }

    fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            warn!("dropping response with null id");
            return;
        };

        let entry = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.remove(&id)
        };

        let Some(entry) = entry else {
            warn!(%id, "dropping response for unknown or cancelled request");
            return;
        };

        let outcome = match (response.result, response.error) {
            (_, Some(err)) => Err(err),
            (Some(result), None) => Ok(result),
            // `{"id": x}` with neither field: treat as null result.
            (None, None) => Ok(Value::Null),
        };

        if entry.tx.send(outcome).is_err() {
            trace!(%id, "reply arrived after caller went away");
        }
    }

    /// Fail every pending request with *handler closed* and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().collect()
        };
        // Dropping the senders resolves every waiter with Closed.
        let count = drained.len();
        if count > 0 {
            debug!(count, "failing pending requests: correlator closed");
        }
    }

    fn remove_pending(&self, id: &RequestId) {
        let mut pending = self.pending.lock().expect("pending map poisoned");
        pending.remove(id);
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Arc<Correlator>, mpsc::UnboundedReceiver<JsonRpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let correlator = Arc::new(Correlator::new(tx, Arc::new(NullInboundHandler)));
        (correlator, rx)
    }

    #[tokio::test]
    async fn test_reply_completes_request() {
        let (correlator, mut outbound) = setup();

        let c = Arc::clone(&correlator);
        let task = tokio::spawn(async move {
            c.send_request("tools/list", None, Duration::from_secs(5))
                .await
        });

        let JsonRpcMessage::Request(req) = outbound.recv().await.unwrap() else {
            panic!("expected request on the wire");
        };
        assert_eq!(req.method, "tools/list");

        correlator
            .handle_inbound(JsonRpcResponse::success(req.id, json!({"tools": []})).into())
            .await;

        let result = task.await.unwrap().unwrap();
        assert_eq!(result, json!({"tools": []}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_error_propagates_verbatim() {
        let (correlator, mut outbound) = setup();

        let c = Arc::clone(&correlator);
        let task = tokio::spawn(async move {
            c.send_request("tools/call", None, Duration::from_secs(5))
                .await
        });

        let JsonRpcMessage::Request(req) = outbound.recv().await.unwrap() else {
            panic!("expected request");
        };
        let err = JsonRpcError::new(-32050, "tool exploded").with_data(json!({"detail": 7}));
        correlator
            .handle_inbound(JsonRpcResponse::error(req.id, err).into())
            .await;

        let failure = task.await.unwrap().unwrap_err();
        let ProtocolError::Remote {
            code,
            message,
            data,
        } = failure
        else {
            panic!("expected remote error, got {failure}");
        };
        assert_eq!(code, -32050);
        assert_eq!(message, "tool exploded");
        assert_eq!(data, Some(json!({"detail": 7})));
    }

    #[tokio::test]
    async fn test_timeout_clears_pending() {
        let (correlator, _outbound) = setup();

        let err = correlator
            .send_request("slow/thing", None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { .. }));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let (correlator, mut outbound) = setup();

        let c = Arc::clone(&correlator);
        let task = tokio::spawn(async move {
            c.send_request("tools/list", None, Duration::from_secs(30))
                .await
        });
        // Wait for the request to actually be pending.
        let _ = outbound.recv().await.unwrap();

        correlator.close();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::Closed { .. }));

        // New requests are refused outright.
        let err = correlator
            .send_request("ping", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Closed { .. }));
    }

    #[tokio::test]
    async fn test_unknown_id_dropped() {
        let (correlator, _outbound) = setup();

        // Must not panic or disturb anything.
        correlator
            .handle_inbound(
                JsonRpcResponse::success(RequestId::from("never-issued"), json!(1)).into(),
            )
            .await;
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_notification_has_no_bookkeeping() {
        let (correlator, mut outbound) = setup();

        correlator
            .send_notification("notifications/initialized", None)
            .unwrap();
        assert_eq!(correlator.pending_count(), 0);

        let JsonRpcMessage::Notification(note) = outbound.recv().await.unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(note.method, "notifications/initialized");
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_monotonic() {
        let (correlator, _outbound) = setup();
        let a = correlator.next_id();
        let b = correlator.next_id();
        assert_ne!(a, b);

        let RequestId::String(a) = a else {
            panic!("string id expected")
        };
        let RequestId::String(b) = b else {
            panic!("string id expected")
        };
        let a_n: u64 = a.split('-').next().unwrap().parse().unwrap();
        let b_n: u64 = b.split('-').next().unwrap().parse().unwrap();
        assert!(b_n > a_n);
    }

    #[tokio::test]
    async fn test_inbound_request_gets_answered() {
        struct PingHandler;

        #[async_trait]
        impl InboundHandler for PingHandler {
            async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
                JsonRpcResponse::success(request.id, json!({}))
            }
        }

        let (tx, mut outbound) = mpsc::unbounded_channel();
        let correlator = Correlator::new(tx, Arc::new(PingHandler));

        correlator
            .handle_inbound(JsonRpcRequest::new(RequestId::Number(9), "ping", None).into())
            .await;

        let JsonRpcMessage::Response(resp) = outbound.recv().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.id, Some(RequestId::Number(9)));
        assert!(resp.is_success());
    }
}
