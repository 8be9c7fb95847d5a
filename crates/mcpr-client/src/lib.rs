//! Per-server MCP client.
//!
//! One [`McpClient`] per downstream server descriptor. It owns the server's
//! transport exclusively, runs the initialize handshake, caches the
//! negotiated capabilities, and exposes typed tool/resource/prompt
//! operations over the correlator.
//!
//! A client that has entered [`ConnectionState::Failed`] is never reused;
//! the supervisor replaces it with a fresh instance.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod client;
mod error;

pub use client::{ClientConfig, ConnectionState, McpClient};
pub use error::{ClientError, ClientResult};
