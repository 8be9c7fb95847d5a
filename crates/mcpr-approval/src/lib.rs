//! Approval rendezvous.
//!
//! Turns a policy verdict of *require approval* into a wait that another
//! actor resolves asynchronously. One waiter per request; terminal states
//! (approved, rejected, expired) are final. Cancellation reuses the
//! `Expired` status with reason `"cancelled"`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod queue;
mod request;

pub use queue::{ApprovalError, ApprovalQueue, ApprovalResult, WaitOutcome};
pub use request::{ApprovalRequest, ApprovalResponse, ApprovalStatus};
