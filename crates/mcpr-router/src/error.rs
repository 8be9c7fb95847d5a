//! The router's failure kinds and their wire mapping.

use mcpr_client::ClientError;
use mcpr_core::PolicyRuleId;
use mcpr_protocol::{error_codes, JsonRpcError};
use serde_json::{json, Value};
use thiserror::Error;

/// Result alias for router operations.
pub type RouterResult<T> = Result<T, RouterError>;

/// Every way a pipeline invocation can fail.
///
/// User-visible messages are deliberately uniform: a denial reads the same
/// whether a global or a server-scoped rule matched. The distinguishing
/// detail (rule ids, internal errors) goes to logs and audit metadata only.
#[derive(Debug, Error)]
pub enum RouterError {
    /// Missing, expired, revoked, or unscoped token.
    #[error("Invalid or expired token")]
    Unauthorized,

    /// The referenced server does not exist (unknown id or namespace slug).
    #[error("Server not found")]
    ServerNotFound,

    /// The project header referenced an unknown project.
    #[error("Project not found")]
    ProjectNotFound,

    /// The project exists but is inactive.
    #[error("Project is inactive")]
    ProjectInactive,

    /// The rate limit for this key is exhausted.
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Milliseconds until a token will be available.
        retry_after_ms: u64,
    },

    /// A policy rule (or the closed-by-default fallback) denied the call.
    #[error("Denied by policy")]
    DeniedByPolicy {
        /// The matching rule, absent for the default deny.
        rule_id: Option<PolicyRuleId>,
    },

    /// A human rejected the approval request.
    #[error("Approval rejected")]
    ApprovalRejected {
        /// Responder note, when present.
        reason: Option<String>,
    },

    /// The approval request expired unanswered.
    #[error("Approval timed out")]
    ApprovalTimeout,

    /// The target server is not running.
    #[error("Server is not running")]
    ServerNotRunning,

    /// The transport to the server failed mid-call.
    #[error("Server is unavailable")]
    ServerUnavailable,

    /// The downstream server answered with a JSON-RPC error; carried
    /// verbatim to the caller.
    #[error("{message}")]
    Remote {
        /// Remote code.
        code: i64,
        /// Remote message.
        message: String,
        /// Remote detail.
        data: Option<Value>,
    },

    /// The caller cancelled the request.
    #[error("Request cancelled")]
    Cancelled,

    /// The request itself was malformed (bad params, wrong state).
    #[error("{message}")]
    InvalidRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// A bug or invariant breach; details are logged, never surfaced.
    #[error("Internal error")]
    Internal {
        /// Logged detail, excluded from every user-facing surface.
        detail: String,
    },
}

impl RouterError {
    /// Map onto the application error-code registry.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Unauthorized => error_codes::INVALID_TOKEN,
            Self::ServerNotFound | Self::ProjectNotFound => error_codes::SERVER_NOT_FOUND,
            Self::ProjectInactive | Self::DeniedByPolicy { .. } => error_codes::DENIED_BY_POLICY,
            Self::RateLimited { .. } => error_codes::RATE_LIMITED,
            Self::ApprovalRejected { .. } => error_codes::APPROVAL_REJECTED,
            Self::ApprovalTimeout => error_codes::APPROVAL_TIMEOUT,
            Self::ServerNotRunning => error_codes::SERVER_NOT_RUNNING,
            Self::ServerUnavailable | Self::Cancelled => error_codes::TRANSPORT_ERROR,
            Self::Remote { code, .. } => *code,
            Self::InvalidRequest { .. } => error_codes::INVALID_PARAMS,
            Self::Internal { .. } => error_codes::INTERNAL_ERROR,
        }
    }

    /// The uniform user-facing message.
    #[must_use]
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Convert to a JSON-RPC error object.
    #[must_use]
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let mut error = JsonRpcError::new(self.code(), self.user_message());
        match self {
            Self::RateLimited { retry_after_ms } => {
                error = error.with_data(json!({ "retryAfter": retry_after_ms }));
            }
            Self::Remote { data: Some(data), .. } => {
                error = error.with_data(data.clone());
            }
            _ => {}
        }
        error
    }
}

impl From<ClientError> for RouterError {
    fn from(err: ClientError) -> Self {
        match err {
            // Remote errors pass through verbatim; everything else at the
            // client layer means the server cannot serve.
            ClientError::Remote {
                code,
                message,
                data,
            } => Self::Remote {
                code,
                message,
                data,
            },
            ClientError::Timeout { .. }
            | ClientError::NotConnected { .. }
            | ClientError::Transport(_) => Self::ServerUnavailable,
            ClientError::Protocol(detail) => Self::Internal { detail },
        }
    }
}
