//! Gateway configuration.
//!
//! Loaded from a TOML file; every section has defaults so a missing file
//! yields a runnable local gateway. `LOG_LEVEL` in the environment
//! overrides the configured log level. No secrets are read from the
//! environment.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod loader;
mod types;
mod validate;

pub use loader::{load, load_or_default, ConfigError, ConfigResult};
pub use types::{
    AggregatorConfig, ApprovalConfig, DatabaseConfig, GatewayConfig, HttpConfig, RateLimitConfig,
    RateLimitSection, ServerEntry, SupervisorConfig,
};
pub use validate::validate;
