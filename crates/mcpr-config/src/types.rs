//! Configuration types.

use mcpr_core::{ServerDescriptor, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One token-bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity in tokens.
    pub capacity: f64,
    /// Refill rate in tokens per second.
    pub refill_rate: f64,
}

impl RateLimitConfig {
    /// A bucket allowing `per_minute` calls per minute with matching burst.
    #[must_use]
    pub fn per_minute(per_minute: f64) -> Self {
        Self {
            capacity: per_minute,
            refill_rate: per_minute / 60.0,
        }
    }
}

/// Rate limits applied by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Global per-caller bucket at the HTTP layer.
    #[serde(default = "default_global_rate")]
    pub global: RateLimitConfig,
    /// Per client+server bucket inside the pipeline.
    #[serde(default = "default_mcp_rate")]
    pub mcp: RateLimitConfig,
}

fn default_global_rate() -> RateLimitConfig {
    RateLimitConfig::per_minute(600.0)
}

fn default_mcp_rate() -> RateLimitConfig {
    RateLimitConfig::per_minute(120.0)
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            global: default_global_rate(),
            mcp: default_mcp_rate(),
        }
    }
}

/// HTTP front-end settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen port; the bind address is always loopback.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Exact-origin CORS allowlist. Same-origin requests (no `Origin`
    /// header) are always permitted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Request body size cap in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// Rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitSection,
}

fn default_port() -> u16 {
    8787
}

fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            allowed_origins: Vec::new(),
            body_limit_bytes: default_body_limit(),
            rate_limit: RateLimitSection::default(),
        }
    }
}

/// Store location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// On-disk path for a durable engine; unused by the in-memory engine.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Process supervision tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Restart quota within the window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Sliding window for the quota, seconds.
    #[serde(default = "default_restart_window")]
    pub restart_window_secs: u64,
    /// First restart delay, milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Backoff multiplier per restart.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Backoff ceiling, milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Heartbeat interval, seconds; silence for twice this flips a server
    /// unhealthy.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_max_restarts() -> u32 {
    5
}
fn default_restart_window() -> u64 {
    60
}
fn default_initial_backoff() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_heartbeat_interval() -> u64 {
    30
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window(),
            initial_backoff_ms: default_initial_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

/// Approval rendezvous tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Default wait before a pending approval expires, milliseconds.
    #[serde(default = "default_approval_timeout")]
    pub default_timeout_ms: u64,
}

fn default_approval_timeout() -> u64 {
    5 * 60 * 1_000
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_approval_timeout(),
        }
    }
}

/// Aggregator cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Merged-list cache TTL, milliseconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,
}

fn default_cache_ttl() -> u64 {
    5 * 60 * 1_000
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_cache_ttl(),
        }
    }
}

/// One `[servers.<name>]` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// `"stdio"`, `"http"`, or `"sse"`. Defaults to stdio when a command is
    /// present, http otherwise.
    #[serde(default)]
    pub transport: Option<String>,
    /// Command for stdio servers.
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment for the child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// URL for http/sse servers.
    #[serde(default)]
    pub url: Option<String>,
    /// Extra headers for http/sse servers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Start the server when the gateway boots.
    #[serde(default)]
    pub auto_start: bool,
}

impl ServerEntry {
    /// Turn a config block into a server descriptor.
    ///
    /// Returns `None` for blocks that name neither a command nor a URL.
    #[must_use]
    pub fn to_descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        let transport = match self.transport.as_deref() {
            Some("stdio") | None if self.command.is_some() => TransportKind::Stdio {
                command: self.command.clone()?,
                args: self.args.clone(),
                env: self.env.clone(),
                cwd: self.cwd.clone(),
            },
            Some("sse") => TransportKind::Sse {
                url: self.url.clone()?,
                headers: self.headers.clone(),
            },
            Some("http") | None => TransportKind::Http {
                url: self.url.clone()?,
                headers: self.headers.clone(),
            },
            Some(_) => return None,
        };
        Some(ServerDescriptor::new(name, transport))
    }
}

/// The whole gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP front-end.
    #[serde(default)]
    pub http: HttpConfig,
    /// Store location.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Process supervision.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Approval rendezvous.
    #[serde(default)]
    pub approval: ApprovalConfig,
    /// Aggregator cache.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Minimum log level ("trace" ... "error").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Configured downstream servers.
    #[serde(default)]
    pub servers: HashMap<String, ServerEntry>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            supervisor: SupervisorConfig::default(),
            approval: ApprovalConfig::default(),
            aggregator: AggregatorConfig::default(),
            log_level: default_log_level(),
            servers: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.http.port, 8787);
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.supervisor.initial_backoff_ms, 1_000);
        assert_eq!(config.aggregator.cache_ttl_ms, 300_000);
        assert_eq!(config.approval.default_timeout_ms, 300_000);
    }

    #[test]
    fn test_server_entry_stdio() {
        let entry = ServerEntry {
            command: Some("mcp-server-filesystem".to_string()),
            args: vec!["/tmp".to_string()],
            ..ServerEntry::default()
        };
        let descriptor = entry.to_descriptor("Filesystem").unwrap();
        assert!(matches!(descriptor.transport, TransportKind::Stdio { .. }));
        assert_eq!(descriptor.slug(), "filesystem");
    }

    #[test]
    fn test_server_entry_sse() {
        let entry = ServerEntry {
            transport: Some("sse".to_string()),
            url: Some("http://localhost:9000/sse".to_string()),
            ..ServerEntry::default()
        };
        let descriptor = entry.to_descriptor("Remote").unwrap();
        assert!(matches!(descriptor.transport, TransportKind::Sse { .. }));
    }

    #[test]
    fn test_server_entry_incomplete() {
        assert!(ServerEntry::default().to_descriptor("empty").is_none());
    }
}
