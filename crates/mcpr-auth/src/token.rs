//! The token model.

use mcpr_core::{ClientId, ServerId, TokenId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A bearer token issued to a client application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Opaque random id; doubles as the bearer credential.
    pub id: TokenId,
    /// Client the token was issued to.
    pub client_id: ClientId,
    /// Operator-facing label.
    pub name: String,
    /// Issue time.
    pub issued_at: Timestamp,
    /// Expiry; `None` means non-expiring.
    pub expires_at: Option<Timestamp>,
    /// Last successful validation, if any.
    pub last_used_at: Option<Timestamp>,
    /// Coarse-grained scopes ("mcp", "admin", ...).
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Per-server access map. Absent or `false` means denied.
    #[serde(default)]
    pub server_access: HashMap<ServerId, bool>,
    /// Whether the token has been revoked.
    #[serde(default)]
    pub revoked: bool,
}

impl Token {
    /// Issue a new token for `client_id`, expiring at `expires_at`.
    #[must_use]
    pub fn issue(
        client_id: ClientId,
        name: impl Into<String>,
        expires_at: Option<Timestamp>,
    ) -> Self {
        Self {
            id: TokenId::generate(),
            client_id,
            name: name.into(),
            issued_at: Timestamp::now(),
            expires_at,
            last_used_at: None,
            scopes: vec!["mcp".to_string()],
            server_access: HashMap::new(),
            revoked: false,
        }
    }

    /// Grant access to a server.
    #[must_use]
    pub fn with_server_access(mut self, server_id: ServerId) -> Self {
        self.server_access.insert(server_id, true);
        self
    }

    /// Whether the token has passed its expiry.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|t| t.is_past())
    }

    /// Whether this token may touch `server_id`.
    #[must_use]
    pub fn allows_server(&self, server_id: &ServerId) -> bool {
        self.server_access.get(server_id).copied().unwrap_or(false)
    }

    /// Revoke the token.
    pub fn revoke(&mut self) {
        self.revoked = true;
    }
}
