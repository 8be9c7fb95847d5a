//! Transport errors.

use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures at the byte-moving layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The child process could not be spawned.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        /// Command that failed.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The child was spawned without the required pipes.
    #[error("child process is missing a piped {stream}")]
    MissingPipe {
        /// Which stream was absent.
        stream: &'static str,
    },

    /// Reading or writing a stream failed.
    #[error("transport i/o: {0}")]
    Io(#[from] std::io::Error),

    /// An HTTP round trip failed at the wire level.
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote answered with a non-success HTTP status.
    #[error("http status {status}")]
    HttpStatus {
        /// The status code received.
        status: u16,
    },

    /// An HTTP response body was not a JSON-RPC message.
    #[error("invalid response body: {0}")]
    InvalidBody(#[from] serde_json::Error),

    /// The SSE stream dropped and every reconnect attempt failed.
    #[error("sse reconnect gave up after {attempts} attempts")]
    ReconnectExhausted {
        /// How many attempts were made.
        attempts: u32,
    },

    /// The transport was closed and cannot carry further messages.
    #[error("transport closed")]
    Closed,
}
