//! Process supervision for stdio MCP servers.
//!
//! The supervisor watches crash reports and heartbeats. Crashes inside the
//! restart quota schedule a restart after the current backoff; exhausting
//! the quota opens the circuit (`Failed`) until an operator reset. A
//! periodic checker flips silent servers unhealthy after two heartbeat
//! intervals.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod supervisor;

pub use supervisor::{
    Health, RestartHandler, Supervisor, SupervisorEvent, SupervisorPolicy, SupervisorSnapshot,
};
