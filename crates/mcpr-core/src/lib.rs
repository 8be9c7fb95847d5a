//! Shared foundation types for the mcpr gateway.
//!
//! This crate holds the identifiers, timestamps, and server descriptors
//! every other crate agrees on. It has no I/O and no async surface.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod id;
mod project;
mod server;
mod slug;
mod time;

pub use id::{
    ApprovalId, AuditEventId, ClientId, PolicyRuleId, ProjectId, ServerId, SessionId, TokenId,
};
pub use project::Project;
pub use server::{ServerDescriptor, ServerStatus, TransportKind};
pub use slug::slugify;
pub use time::Timestamp;
