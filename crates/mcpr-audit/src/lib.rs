//! Audit events.
//!
//! Every terminal outcome of the request pipeline - success or any
//! rejection class - produces exactly one audit event. Events are
//! append-only: the sink never mutates or deletes.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod event;
mod sink;

pub use event::{AuditEvent, AuditEventType};
pub use sink::{AuditFilter, AuditSink, MemoryAuditSink};
