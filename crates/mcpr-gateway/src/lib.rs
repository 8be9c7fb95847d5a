//! The HTTP front-end.
//!
//! A loopback-bound axum server carrying the client-facing MCP surface:
//! `POST /mcp` for JSON-RPC, an SSE session pair for server-to-client
//! notifications, unauthenticated health endpoints, and a small approvals
//! surface for the actor resolving rendezvous requests.

#![deny(unsafe_code)]
#![warn(unreachable_pub)]

pub mod boot;
pub mod middleware;
pub mod routes;
pub mod sse;
pub mod state;
