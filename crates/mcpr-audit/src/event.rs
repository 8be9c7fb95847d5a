//! The audit event model.

use mcpr_core::{AuditEventId, ClientId, ServerId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// A tool call completed (successfully or not).
    #[serde(rename = "tool.call")]
    ToolCall,
    /// A tool call failed downstream.
    #[serde(rename = "tool.error")]
    ToolError,
    /// A token was validated (or failed validation).
    #[serde(rename = "token.validate")]
    TokenValidate,
    /// A policy decision was made.
    #[serde(rename = "policy.evaluate")]
    PolicyEvaluate,
    /// An approval request was opened.
    #[serde(rename = "approval.requested")]
    ApprovalRequested,
    /// A human responded to an approval request.
    #[serde(rename = "approval.responded")]
    ApprovalResponded,
    /// An approval request expired or was cancelled.
    #[serde(rename = "approval.expired")]
    ApprovalExpired,
    /// A server was started.
    #[serde(rename = "server.start")]
    ServerStart,
    /// A server was stopped.
    #[serde(rename = "server.stop")]
    ServerStop,
    /// A server failed.
    #[serde(rename = "server.error")]
    ServerError,
    /// A server was restarted by the supervisor.
    #[serde(rename = "server.restart")]
    ServerRestart,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ToolCall => "tool.call",
            Self::ToolError => "tool.error",
            Self::TokenValidate => "token.validate",
            Self::PolicyEvaluate => "policy.evaluate",
            Self::ApprovalRequested => "approval.requested",
            Self::ApprovalResponded => "approval.responded",
            Self::ApprovalExpired => "approval.expired",
            Self::ServerStart => "server.start",
            Self::ServerStop => "server.stop",
            Self::ServerError => "server.error",
            Self::ServerRestart => "server.restart",
        };
        f.write_str(s)
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique id.
    pub id: AuditEventId,
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    /// Client involved, when one exists.
    pub client_id: Option<ClientId>,
    /// Server involved, when one exists.
    pub server_id: Option<ServerId>,
    /// Tool involved, when one exists (original, un-namespaced name).
    pub tool_name: Option<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Wall-clock duration, for operations that have one.
    pub duration_ms: Option<u64>,
    /// Structured detail; failure events carry `metadata.error`.
    pub metadata: Option<Value>,
    /// When the event was recorded.
    pub timestamp: Timestamp,
}

impl AuditEvent {
    /// Start a successful event of the given type.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            id: AuditEventId::new(),
            event_type,
            client_id: None,
            server_id: None,
            tool_name: None,
            success: true,
            duration_ms: None,
            metadata: None,
            timestamp: Timestamp::now(),
        }
    }

    /// Attach the client.
    #[must_use]
    pub fn client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Attach the server.
    #[must_use]
    pub fn server(mut self, server_id: ServerId) -> Self {
        self.server_id = Some(server_id);
        self
    }

    /// Attach the tool name.
    #[must_use]
    pub fn tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Attach the duration.
    #[must_use]
    pub fn duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Mark the event failed with an error string in the metadata.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        let error = Value::String(error.into());
        match &mut self.metadata {
            Some(Value::Object(map)) => {
                map.insert("error".to_string(), error);
            }
            _ => {
                self.metadata = Some(serde_json::json!({ "error": error }));
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_wire_names() {
        assert_eq!(
            serde_json::to_value(AuditEventType::ToolCall).unwrap(),
            json!("tool.call")
        );
        assert_eq!(
            serde_json::to_value(AuditEventType::ApprovalExpired).unwrap(),
            json!("approval.expired")
        );
    }

    #[test]
    fn test_builder_success() {
        let event = AuditEvent::new(AuditEventType::ToolCall)
            .client(ClientId::from("c1"))
            .server(ServerId::new())
            .tool("read_file")
            .duration(42);

        assert!(event.success);
        assert_eq!(event.duration_ms, Some(42));
        assert_eq!(event.tool_name.as_deref(), Some("read_file"));
    }

    #[test]
    fn test_failed_sets_error_metadata() {
        let event = AuditEvent::new(AuditEventType::ToolCall)
            .metadata(json!({"args": {"path": "/x"}}))
            .failed("Denied by policy");

        assert!(!event.success);
        let meta = event.metadata.unwrap();
        assert_eq!(meta["error"], "Denied by policy");
        // Existing metadata keys survive.
        assert_eq!(meta["args"]["path"], "/x");
    }
}
