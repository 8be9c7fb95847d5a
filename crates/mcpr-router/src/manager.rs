//! Server lifecycle management.
//!
//! The manager is the only writer of the client registry: it connects
//! clients on start, swaps them on restart, and removes them on stop. A
//! stdio client's exit is observed here and handed to the supervisor, which
//! calls back through [`ManagerRestartHandler`] to respawn.

use async_trait::async_trait;
use mcpr_audit::{AuditEvent, AuditEventType, AuditSink};
use mcpr_client::{ClientConfig, ConnectionState, McpClient};
use mcpr_core::{ServerId, ServerStatus};
use mcpr_protocol::NullInboundHandler;
use mcpr_storage::MemoryStore;
use mcpr_supervisor::{Health, RestartHandler, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::builtin::BUILTIN_SLUG;
use crate::error::{RouterError, RouterResult};
use crate::registry::ClientRegistry;

/// A server's descriptor joined with its runtime state.
#[derive(Debug, Clone)]
pub struct ServerStatusView {
    /// The descriptor as stored.
    pub server: mcpr_core::ServerDescriptor,
    /// Supervision health, when supervised.
    pub health: Option<Health>,
    /// Connection state of the live client, when one exists.
    pub connection: Option<String>,
    /// Pid of the child process, for stdio servers.
    pub pid: Option<u32>,
}

struct Shared {
    store: Arc<MemoryStore>,
    registry: Arc<ClientRegistry>,
    aggregator: Arc<Aggregator>,
    supervisor: Supervisor,
    audit: Arc<dyn AuditSink>,
    client_config: ClientConfig,
}

/// Starts, stops, and restarts downstream servers. Cheap to clone; all
/// clones share state.
#[derive(Clone)]
pub struct ServerManager {
    shared: Arc<Shared>,
}

impl ServerManager {
    /// Wire up a manager. The caller also installs it as the supervisor's
    /// restart handler via [`ManagerRestartHandler`].
    #[must_use]
    pub fn new(
        store: Arc<MemoryStore>,
        registry: Arc<ClientRegistry>,
        aggregator: Arc<Aggregator>,
        supervisor: Supervisor,
        audit: Arc<dyn AuditSink>,
        client_config: ClientConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                registry,
                aggregator,
                supervisor,
                audit,
                client_config,
            }),
        }
    }

    /// Start a server and connect to it.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] for unknown ids,
    /// [`RouterError::ServerUnavailable`] when spawn/handshake fails. The
    /// descriptor's status and last error reflect the failure either way.
    pub async fn start(&self, server_id: &ServerId) -> RouterResult<()> {
        self.start_inner(server_id, true).await.map(|_pid| ())
    }

    async fn start_inner(
        &self,
        server_id: &ServerId,
        register_supervision: bool,
    ) -> RouterResult<Option<u32>> {
        let shared = &self.shared;
        let server = shared
            .store
            .server(server_id)
            .await
            .ok_or(RouterError::ServerNotFound)?;

        let slug = server.slug();
        if slug == BUILTIN_SLUG || slug.is_empty() {
            let detail = format!("server name '{}' yields reserved or empty slug", server.name);
            self.fail_start(server_id, &detail).await;
            return Err(RouterError::Internal { detail });
        }
        let slug_taken = shared
            .store
            .servers()
            .await
            .iter()
            .any(|other| other.id != server.id && other.slug() == slug);
        if slug_taken {
            let detail = format!("namespace slug '{slug}' is already in use");
            self.fail_start(server_id, &detail).await;
            return Err(RouterError::Internal { detail });
        }

        // Replace any stale client from a previous lifetime.
        if let Some(old) = shared.registry.remove(server_id) {
            old.disconnect().await;
        }

        let _ = shared
            .store
            .set_server_status(server_id, ServerStatus::Starting, None)
            .await;

        let client = match McpClient::connect(
            server_id.clone(),
            &server.name,
            &server.transport,
            shared.client_config.clone(),
            Arc::new(NullInboundHandler),
        )
        .await
        {
            Ok(client) => Arc::new(client),
            Err(error) => {
                self.fail_start(server_id, &error.to_string()).await;
                return Err(RouterError::ServerUnavailable);
            }
        };

        let pid = client.pid();
        shared.registry.insert(Arc::clone(&client));
        let _ = shared
            .store
            .set_server_status(server_id, ServerStatus::Running, None)
            .await;
        if register_supervision && server.transport.is_supervised() {
            shared.supervisor.register(server_id.clone(), pid);
        }
        self.watch_exit(server_id.clone(), &client);
        shared.aggregator.invalidate(server_id);

        info!(server = %server.name, ?pid, "server started");
        shared
            .audit
            .append(
                AuditEvent::new(AuditEventType::ServerStart)
                    .server(server_id.clone())
                    .metadata(serde_json::json!({ "transport": server.transport.name() })),
            )
            .await;
        Ok(pid)
    }

    /// Gracefully stop a server.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] for unknown ids.
    pub async fn stop(&self, server_id: &ServerId) -> RouterResult<()> {
        let shared = &self.shared;
        let server = shared
            .store
            .server(server_id)
            .await
            .ok_or(RouterError::ServerNotFound)?;

        shared.supervisor.deregister(server_id);
        let _ = shared
            .store
            .set_server_status(server_id, ServerStatus::Stopping, None)
            .await;

        // Removing from the registry first marks the close as intentional
        // for the exit watcher.
        if let Some(client) = shared.registry.remove(server_id) {
            client.disconnect().await;
        }

        let _ = shared
            .store
            .set_server_status(server_id, ServerStatus::Stopped, None)
            .await;
        shared.aggregator.invalidate(server_id);

        info!(server = %server.name, "server stopped");
        shared
            .audit
            .append(AuditEvent::new(AuditEventType::ServerStop).server(server_id.clone()))
            .await;
        Ok(())
    }

    /// Stop every running server (gateway shutdown).
    pub async fn stop_all(&self) {
        for server in self.shared.store.servers().await {
            if server.status == ServerStatus::Running || server.status == ServerStatus::Starting {
                if let Err(error) = self.stop(&server.id).await {
                    warn!(server = %server.name, %error, "stop failed during shutdown");
                }
            }
        }
    }

    /// Start the given servers (gateway boot), tolerating individual
    /// failures. Returns how many came up.
    pub async fn start_configured(&self, ids: &[ServerId]) -> usize {
        let mut started = 0;
        for id in ids {
            match self.start(id).await {
                Ok(()) => started += 1,
                Err(error) => warn!(server = %id, %error, "auto-start failed"),
            }
        }
        started
    }

    /// Runtime view of every configured server.
    pub async fn statuses(&self) -> Vec<ServerStatusView> {
        let snapshots = self.shared.supervisor.snapshot();
        self.shared
            .store
            .servers()
            .await
            .into_iter()
            .map(|server| {
                let health = snapshots
                    .iter()
                    .find(|s| s.server_id == server.id)
                    .map(|s| s.health);
                let client = self.shared.registry.get(&server.id);
                ServerStatusView {
                    health,
                    connection: client.as_ref().map(|c| c.state().to_string()),
                    pid: client.as_ref().and_then(|c| c.pid()),
                    server,
                }
            })
            .collect()
    }

    /// Ping every ready client and report heartbeats to the supervisor.
    pub async fn heartbeat_pass(&self) {
        for server in self.shared.store.servers().await {
            if let Some(client) = self.shared.registry.get_ready(&server.id) {
                match client.ping().await {
                    Ok(()) => self.shared.supervisor.report_heartbeat(&server.id),
                    Err(error) => debug!(server = %server.name, %error, "ping failed"),
                }
            }
        }
    }

    /// Run heartbeat passes forever at `interval`.
    pub fn spawn_heartbeat_loop(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                manager.heartbeat_pass().await;
            }
        })
    }

    async fn fail_start(&self, server_id: &ServerId, detail: &str) {
        warn!(server = %server_id, detail, "server start failed");
        let _ = self
            .shared
            .store
            .set_server_status(server_id, ServerStatus::Error, Some(detail.to_string()))
            .await;
        self.shared.aggregator.invalidate(server_id);
        self.shared
            .audit
            .append(
                AuditEvent::new(AuditEventType::ServerError)
                    .server(server_id.clone())
                    .failed(detail),
            )
            .await;
    }

    /// Observe a stdio client's process exit. An exit while the client is
    /// still registered is a crash; a graceful stop removes the client from
    /// the registry first and the watcher stays quiet.
    fn watch_exit(&self, server_id: ServerId, client: &Arc<McpClient>) {
        let Some(mut exit_watch) = client.exit_watch() else {
            return;
        };
        let manager = self.clone();
        let watched = Arc::clone(client);
        tokio::spawn(async move {
            let _ = exit_watch.wait_for(|code| code.is_some()).await;
            let exit_code = *exit_watch.borrow();

            let still_registered = manager
                .shared
                .registry
                .get(&server_id)
                .is_some_and(|current| Arc::ptr_eq(&current, &watched));
            if !still_registered || watched.state() == ConnectionState::Closing {
                return;
            }

            warn!(server = %server_id, ?exit_code, "server process exited unexpectedly");
            manager.shared.registry.remove(&server_id);
            let detail = format!("process exited with code {}", exit_code.unwrap_or(-1));
            let _ = manager
                .shared
                .store
                .set_server_status(&server_id, ServerStatus::Error, Some(detail.clone()))
                .await;
            manager.shared.aggregator.invalidate(&server_id);
            manager
                .shared
                .audit
                .append(
                    AuditEvent::new(AuditEventType::ServerError)
                        .server(server_id.clone())
                        .failed(detail),
                )
                .await;
            manager.shared.supervisor.report_crash(&server_id, exit_code);
        });
    }
}

/// Installs a [`ServerManager`] as the supervisor's restart callback.
pub struct ManagerRestartHandler(pub ServerManager);

#[async_trait]
impl RestartHandler for ManagerRestartHandler {
    async fn restart(&self, server_id: &ServerId) -> Result<u32, String> {
        // Restart keeps the existing supervision record so the quota window
        // and backoff survive the respawn.
        let pid = self
            .0
            .start_inner(server_id, false)
            .await
            .map_err(|e| e.to_string())?;
        self.0
            .shared
            .audit
            .append(AuditEvent::new(AuditEventType::ServerRestart).server(server_id.clone()))
            .await;
        Ok(pid.unwrap_or(0))
    }
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("clients", &self.shared.registry.len())
            .finish_non_exhaustive()
    }
}
