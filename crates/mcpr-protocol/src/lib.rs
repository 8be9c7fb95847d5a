//! MCP protocol layer: JSON-RPC 2.0 codec, MCP types, and the correlator.
//!
//! Both faces of the gateway speak JSON-RPC 2.0 - client applications on the
//! front-end and downstream MCP servers behind the transports. This crate
//! owns the wire types, the MCP 2024-11-05 domain types, and the
//! [`Correlator`] that matches replies to in-flight requests.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod correlator;
mod error;
mod jsonrpc;
pub mod methods;
mod types;

pub use correlator::{Correlator, InboundHandler, NullInboundHandler};
pub use error::{ProtocolError, ProtocolResult};
pub use jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcVersion, RequestId, error_codes,
};
pub use types::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, Prompt,
    PromptArgument, PromptMessage, PromptResult, Resource, ResourceContents, ServerCapabilities,
    Tool, ToolCallResult, ToolContent,
};

/// MCP protocol revision the gateway negotiates.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
