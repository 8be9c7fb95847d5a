//! Transports to downstream MCP servers.
//!
//! All three flavors - child-process stdio, request/response HTTP, and SSE
//! streaming - present the same duplex interface: an outbound message sink
//! and an inbound message stream, which is exactly what the correlator
//! consumes. Byte-level differences stay inside this crate.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod error;
mod http;
mod sse;
mod stdio;

pub use error::{TransportError, TransportResult};
pub use http::HttpTransport;
pub use sse::{SseConfig, SseTransport, sse_parse};
pub use stdio::StdioTransport;

use mcpr_protocol::JsonRpcMessage;
use tokio::sync::mpsc;

/// The duplex face every transport presents to its correlator.
#[derive(Debug)]
pub struct TransportChannels {
    /// Messages to deliver to the remote side.
    pub outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    /// Messages arriving from the remote side.
    pub inbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
}
