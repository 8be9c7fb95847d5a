//! Protocol-layer errors.

use serde_json::Value;
use thiserror::Error;

/// Result alias for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Failures the protocol layer can surface to a caller.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// No reply arrived before the per-request deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Method that was awaiting a reply.
        method: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The correlator (or its transport) closed while requests were pending.
    #[error("handler closed while awaiting '{method}'")]
    Closed {
        /// Method that was awaiting a reply.
        method: String,
    },

    /// The remote answered with a JSON-RPC error object; propagated verbatim.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Remote error code.
        code: i64,
        /// Remote error message.
        message: String,
        /// Remote structured detail, if any.
        data: Option<Value>,
    },

    /// A message could not be serialized or deserialized.
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The outbound sink rejected a message (transport gone).
    #[error("transport sink closed")]
    SinkClosed,
}

impl ProtocolError {
    /// Whether this failure came from the remote end rather than locally.
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}
