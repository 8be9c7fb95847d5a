//! Token validation.

use async_trait::async_trait;
use mcpr_core::{ServerId, TokenId, Timestamp};
use thiserror::Error;
use tracing::debug;

use crate::token::Token;

/// Result alias for validation.
pub type AuthResult<T> = Result<T, AuthError>;

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token with this id exists.
    #[error("unknown token")]
    NotFound,
    /// The token exists but has expired.
    #[error("token expired")]
    Expired,
    /// The token was revoked by an operator.
    #[error("token revoked")]
    Revoked,
    /// The token is valid but does not grant access to the server.
    #[error("token not authorized for server")]
    ServerAccessDenied {
        /// The server that was requested.
        server_id: ServerId,
    },
}

/// Where the validator finds tokens. Implemented by the store.
#[async_trait]
pub trait TokenLookup: Send + Sync {
    /// Fetch a token by id.
    async fn token(&self, id: &TokenId) -> Option<Token>;

    /// Record a successful use of the token.
    async fn touch_token(&self, id: &TokenId, at: Timestamp);
}

/// Validates bearer tokens against the store.
pub struct TokenValidator<L> {
    lookup: L,
}

impl<L: TokenLookup> TokenValidator<L> {
    /// Create a validator over a token source.
    #[must_use]
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Validate a token: it must exist, be unexpired, and be unrevoked.
    ///
    /// Updates `last_used_at` on success.
    ///
    /// # Errors
    ///
    /// Returns the applicable [`AuthError`]. The error never contains token
    /// content.
    pub async fn validate(&self, token_id: &TokenId) -> AuthResult<Token> {
        let Some(token) = self.lookup.token(token_id).await else {
            debug!(token = %token_id, "validation failed: unknown token");
            return Err(AuthError::NotFound);
        };

        if token.revoked {
            debug!(token = %token_id, "validation failed: revoked");
            return Err(AuthError::Revoked);
        }
        if token.is_expired() {
            debug!(token = %token_id, "validation failed: expired");
            return Err(AuthError::Expired);
        }

        self.lookup.touch_token(token_id, Timestamp::now()).await;
        Ok(token)
    }

    /// Validate a token *for a server*: all of [`Self::validate`] plus an
    /// explicit `true` in the server-access map.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::ServerAccessDenied`] when the token is valid but
    /// unscoped for the server, or the underlying validation error.
    pub async fn validate_for_server(
        &self,
        token_id: &TokenId,
        server_id: &ServerId,
    ) -> AuthResult<Token> {
        let token = self.validate(token_id).await?;
        if token.allows_server(server_id) {
            Ok(token)
        } else {
            debug!(token = %token_id, server = %server_id, "validation failed: server access denied");
            Err(AuthError::ServerAccessDenied {
                server_id: server_id.clone(),
            })
        }
    }
}

impl<L> std::fmt::Debug for TokenValidator<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator").finish_non_exhaustive()
    }
}
