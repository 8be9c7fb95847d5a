//! Approval request records.

use mcpr_core::{ApprovalId, ClientId, PolicyRuleId, ServerId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle of an approval request.
///
/// `Pending` is the only non-terminal state. Cancellation maps onto
/// `Expired`; the distinction lives in the resolution reason, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved; the call proceeded.
    Approved,
    /// Rejected; the call was refused.
    Rejected,
    /// Timed out or was cancelled before a decision.
    Expired,
}

impl ApprovalStatus {
    /// Whether this status can still change.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// A pending (or resolved) request for human approval of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique id.
    pub id: ApprovalId,
    /// Client whose call is blocked.
    pub client_id: ClientId,
    /// Server the call targets.
    pub server_id: ServerId,
    /// Original (un-namespaced) tool name.
    pub tool_name: String,
    /// Frozen snapshot of the call arguments.
    pub arguments: Value,
    /// Rule that demanded approval.
    pub policy_rule_id: Option<PolicyRuleId>,
    /// Current status.
    pub status: ApprovalStatus,
    /// When the request was opened.
    pub requested_at: Timestamp,
    /// When a human responded, if they did.
    pub responded_at: Option<Timestamp>,
    /// Who responded.
    pub responded_by: Option<String>,
    /// Free-form note from the responder.
    pub response_note: Option<String>,
    /// Hard expiry.
    pub expires_at: Timestamp,
}

impl ApprovalRequest {
    /// Open a new pending request expiring after `ttl_ms` milliseconds.
    #[must_use]
    pub fn open(
        client_id: ClientId,
        server_id: ServerId,
        tool_name: impl Into<String>,
        arguments: Value,
        policy_rule_id: Option<PolicyRuleId>,
        ttl_ms: i64,
    ) -> Self {
        Self {
            id: ApprovalId::new(),
            client_id,
            server_id,
            tool_name: tool_name.into(),
            arguments,
            policy_rule_id,
            status: ApprovalStatus::Pending,
            requested_at: Timestamp::now(),
            responded_at: None,
            responded_by: None,
            response_note: None,
            expires_at: Timestamp::in_millis(ttl_ms),
        }
    }
}

/// A human decision on a pending request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Approve or reject.
    pub approved: bool,
    /// Who decided.
    pub responded_by: Option<String>,
    /// Free-form note.
    pub note: Option<String>,
}

impl ApprovalResponse {
    /// An approval.
    #[must_use]
    pub fn approve(responded_by: impl Into<String>) -> Self {
        Self {
            approved: true,
            responded_by: Some(responded_by.into()),
            note: None,
        }
    }

    /// A rejection.
    #[must_use]
    pub fn reject(responded_by: impl Into<String>) -> Self {
        Self {
            approved: false,
            responded_by: Some(responded_by.into()),
            note: None,
        }
    }

    /// Attach a note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}
