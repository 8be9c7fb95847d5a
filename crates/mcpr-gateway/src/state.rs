//! Shared application state.

use mcpr_config::GatewayConfig;
use mcpr_router::{Aggregator, ClientRegistry, Pipeline, RateLimiter, ServerManager};
use mcpr_storage::MemoryStore;
use mcpr_supervisor::Supervisor;
use std::sync::Arc;
use tokio::time::Instant;

use crate::sse::SseSessions;

/// Everything the handlers need, assembled once by the composition root.
pub struct AppState {
    /// The request pipeline.
    pub pipeline: Arc<Pipeline>,
    /// Server lifecycle manager.
    pub manager: ServerManager,
    /// The store.
    pub store: Arc<MemoryStore>,
    /// The live client registry.
    pub registry: Arc<ClientRegistry>,
    /// The aggregator (status and cache control).
    pub aggregator: Arc<Aggregator>,
    /// The supervisor (health snapshots).
    pub supervisor: Supervisor,
    /// Front-end global rate limiter (keyed by bearer or peer address).
    pub global_limiter: Arc<RateLimiter>,
    /// Live SSE sessions.
    pub sse: SseSessions,
    /// Loaded configuration.
    pub config: GatewayConfig,
    /// Boot time, for /status uptime.
    pub started_at: Instant,
}

/// Handler-facing alias.
pub type SharedState = Arc<AppState>;
