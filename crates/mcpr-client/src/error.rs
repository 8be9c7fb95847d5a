//! Client-layer errors.

use mcpr_protocol::ProtocolError;
use mcpr_transport::TransportError;
use serde_json::Value;
use thiserror::Error;

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Failures a per-server client surfaces to callers.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An operation was attempted before the handshake completed (or after
    /// the client failed).
    #[error("client is not connected (state: {state})")]
    NotConnected {
        /// State the client was in.
        state: String,
    },

    /// The handshake or a reply violated the MCP protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The request timed out waiting for a reply.
    #[error("request '{method}' timed out")]
    Timeout {
        /// Method that timed out.
        method: String,
    },

    /// The downstream server returned a JSON-RPC error; carried verbatim.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Remote error code.
        code: i64,
        /// Remote error message.
        message: String,
        /// Remote structured detail, if any.
        data: Option<Value>,
    },

    /// The transport could not be created or died underneath the client.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Timeout { method, .. } => Self::Timeout { method },
            ProtocolError::Remote {
                code,
                message,
                data,
            } => Self::Remote {
                code,
                message,
                data,
            },
            ProtocolError::Closed { method } => Self::NotConnected {
                state: format!("closed while awaiting '{method}'"),
            },
            ProtocolError::Serialization(e) => Self::Protocol(e.to_string()),
            ProtocolError::SinkClosed => Self::NotConnected {
                state: "transport sink closed".to_string(),
            },
        }
    }
}
