//! Composition root.
//!
//! Components are assembled in dependency order with explicit constructor
//! wiring; nothing global beyond the logger and the loaded config. The
//! returned state is shared by every handler and background task.

use anyhow::Context;
use mcpr_approval::ApprovalQueue;
use mcpr_audit::AuditSink;
use mcpr_auth::Token;
use mcpr_client::ClientConfig;
use mcpr_config::GatewayConfig;
use mcpr_core::{ClientId, ServerId};
use mcpr_protocol::{methods, JsonRpcNotification};
use mcpr_router::{
    Aggregator, BucketConfig, BuiltinTools, ClientRegistry, ManagerRestartHandler, Pipeline,
    PipelineConfig, RateLimiter, ServerManager,
};
use mcpr_storage::MemoryStore;
use mcpr_supervisor::{Supervisor, SupervisorEvent, SupervisorPolicy};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

use crate::middleware;
use crate::routes;
use crate::sse::SseSessions;
use crate::state::{AppState, SharedState};

/// Build the full application state from configuration.
pub async fn build(config: GatewayConfig) -> anyhow::Result<SharedState> {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ClientRegistry::new());

    let aggregator = Arc::new(Aggregator::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Duration::from_millis(config.aggregator.cache_ttl_ms),
    ));

    let supervisor = Supervisor::new(SupervisorPolicy {
        max_restarts: config.supervisor.max_restarts,
        restart_window: Duration::from_secs(config.supervisor.restart_window_secs),
        initial_backoff: Duration::from_millis(config.supervisor.initial_backoff_ms),
        backoff_multiplier: config.supervisor.backoff_multiplier,
        max_backoff: Duration::from_millis(config.supervisor.max_backoff_ms),
        heartbeat_interval: Duration::from_secs(config.supervisor.heartbeat_interval_secs),
    });

    let audit: Arc<dyn AuditSink> = store.clone();

    let manager = ServerManager::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&aggregator),
        supervisor.clone(),
        Arc::clone(&audit),
        ClientConfig::default(),
    );
    supervisor.set_restart_handler(Arc::new(ManagerRestartHandler(manager.clone())));

    let mcp_rate = BucketConfig {
        capacity: config.http.rate_limit.mcp.capacity,
        refill_rate: config.http.rate_limit.mcp.refill_rate,
    };
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&store),
        Arc::new(RateLimiter::new(mcp_rate)),
        ApprovalQueue::new(),
        Arc::clone(&aggregator),
        BuiltinTools::new(Arc::clone(&store)),
        audit,
        PipelineConfig {
            approval_timeout: Duration::from_millis(config.approval.default_timeout_ms),
        },
    ));

    let global_rate = BucketConfig {
        capacity: config.http.rate_limit.global.capacity,
        refill_rate: config.http.rate_limit.global.refill_rate,
    };

    Ok(Arc::new(AppState {
        pipeline,
        manager,
        store,
        registry,
        aggregator,
        supervisor,
        global_limiter: Arc::new(RateLimiter::new(global_rate)),
        sse: SseSessions::new(),
        config,
        started_at: Instant::now(),
    }))
}

/// The route table with the middleware stack layered outermost-first:
/// security headers, origin allowlist, global rate limit, body cap,
/// request-id, access log.
pub fn app(state: SharedState) -> axum::Router {
    routes::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(middleware::access_log))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .layer(RequestBodyLimitLayer::new(state.config.http.body_limit_bytes))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::global_rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::enforce_origin,
        ))
        .layer(axum::middleware::from_fn(middleware::security_headers))
}

/// Insert the configured `[servers.*]` blocks into the store. Returns the
/// ids of servers marked auto-start.
pub async fn seed_servers(state: &SharedState) -> Vec<ServerId> {
    let mut auto_start = Vec::new();
    for (name, entry) in &state.config.servers {
        let Some(descriptor) = entry.to_descriptor(name) else {
            warn!(server = name, "skipping incomplete server block");
            continue;
        };
        let id = descriptor.id.clone();
        state.store.upsert_server(descriptor).await;
        if entry.auto_start {
            auto_start.push(id);
        }
    }
    auto_start
}

/// First-boot convenience: with no tokens in the store, issue one granting
/// access to every configured server and hand it to the operator on stdout.
/// The token value is printed exactly once and never logged.
pub async fn bootstrap_token(state: &SharedState) -> anyhow::Result<()> {
    if !state.store.tokens().await.is_empty() {
        return Ok(());
    }

    let mut token = Token::issue(ClientId::from("local"), "bootstrap", None);
    for server in state.store.servers().await {
        token.server_access.insert(server.id.clone(), true);
    }
    let value = token.id.as_str().to_string();
    state
        .store
        .insert_token(token)
        .await
        .context("bootstrap token insert")?;

    println!("bootstrap token (save this, it is not shown again): {value}");
    Ok(())
}

/// Spawn the long-running background tasks.
pub fn spawn_background_tasks(state: &SharedState) {
    // Supervisor-side liveness checking plus active pings from the manager.
    let _ = state.supervisor.spawn_heartbeat_checker();
    let _ = state.manager.spawn_heartbeat_loop(Duration::from_secs(
        state.config.supervisor.heartbeat_interval_secs,
    ));

    // Sweep approvals whose timers never fired (restart recovery boundary).
    let cleanup_state = Arc::clone(state);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            cleanup_state.pipeline.cleanup_expired_approvals().await;
        }
    });

    // Supervision events fan out to SSE clients as list-changed
    // notifications (caches were already invalidated on the event path).
    let events_state = Arc::clone(state);
    let mut events = state.supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SupervisorEvent::Restarted { server_id, .. } => {
                    info!(server = %server_id, "notifying clients after restart");
                    events_state.sse.broadcast(
                        &JsonRpcNotification::new(methods::TOOLS_LIST_CHANGED, None).into(),
                    );
                }
                SupervisorEvent::HealthChanged { .. } => {}
            }
        }
    });
}

/// Run the gateway until ctrl-c.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let state = build(config).await?;

    let auto_start = seed_servers(&state).await;
    bootstrap_token(&state).await?;
    spawn_background_tasks(&state);

    if !auto_start.is_empty() {
        let started = state.manager.start_configured(&auto_start).await;
        info!(started, requested = auto_start.len(), "auto-start complete");
    }

    // Loopback only; this gateway has no business on the network.
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, state.config.http.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "gateway listening");

    let app = app(Arc::clone(&state))
        .into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("shutting down");
    state.manager.stop_all().await;
    state.supervisor.dispose();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
