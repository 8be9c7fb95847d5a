//! The per-server client registry.

use dashmap::DashMap;
use mcpr_client::{ConnectionState, McpClient};
use mcpr_core::ServerId;
use std::sync::Arc;

/// Owns the live [`McpClient`] instances, keyed by server id.
///
/// The manager writes (insert on start, swap on restart, remove on stop);
/// everyone else resolves ids through it and holds no client references of
/// their own across calls.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ServerId, Arc<McpClient>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or atomically replace) the client for a server.
    pub fn insert(&self, client: Arc<McpClient>) {
        self.clients.insert(client.server_id().clone(), client);
    }

    /// The client for a server, whatever its state.
    #[must_use]
    pub fn get(&self, server_id: &ServerId) -> Option<Arc<McpClient>> {
        self.clients.get(server_id).map(|entry| Arc::clone(&entry))
    }

    /// The client for a server, only if it is ready for requests.
    #[must_use]
    pub fn get_ready(&self, server_id: &ServerId) -> Option<Arc<McpClient>> {
        self.get(server_id)
            .filter(|c| c.state() == ConnectionState::Ready)
    }

    /// Remove a server's client.
    pub fn remove(&self, server_id: &ServerId) -> Option<Arc<McpClient>> {
        self.clients.remove(server_id).map(|(_, client)| client)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
