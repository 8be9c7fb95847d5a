//! JSON-RPC 2.0 wire types.
//!
//! One message enum covers both directions: requests (id + method),
//! responses (id + result|error), and notifications (method, no id).
//! Batches are not part of the MCP profile and are rejected at parse time
//! by falling through to `InvalidMessage`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

/// The only JSON-RPC version this gateway speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Marker type that serializes as the literal `"2.0"` and refuses anything else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonRpcVersion;

impl Serialize for JsonRpcVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for JsonRpcVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(Self)
        } else {
            Err(serde::de::Error::custom(format!(
                "invalid JSON-RPC version: expected '{JSONRPC_VERSION}', got '{version}'"
            )))
        }
    }
}

/// A JSON-RPC request id. JSON-RPC 2.0 allows strings and integers; both
/// sides of the gateway may use either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String id (the correlator always generates these).
    String(String),
    /// Integer id (common from client applications).
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A JSON-RPC request: expects a response with the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Request id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Parameters, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification: no id, no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Method name.
    pub method: String,
    /// Parameters, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Short human-readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error object without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// A JSON-RPC response carrying either a result or an error, never both.
///
/// Responses to unparseable requests carry `id: null`, hence the `Option`.
/// Unknown fields are rejected: with every field optional, a tolerant
/// deserializer would swallow notifications during untagged classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonRpcResponse {
    /// Version marker.
    pub jsonrpc: JsonRpcVersion,
    /// Id of the request being answered; `None` for parse errors.
    pub id: Option<RequestId>,
    /// Successful result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// A successful response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// An error response.
    #[must_use]
    pub fn error(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// A parse-error response with a null id.
    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JsonRpcVersion,
            id: None,
            result: None,
            error: Some(JsonRpcError::new(error_codes::PARSE_ERROR, message)),
        }
    }

    /// Whether this response carries a result.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Any JSON-RPC message, classified on parse.
///
/// The untagged order matters: a request (id + method) must be tried before
/// a notification (method only), and a response (id + result|error) before
/// both, so each shape lands on the right variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request (id + method).
    Request(JsonRpcRequest),
    /// Response (id + result or error).
    Response(JsonRpcResponse),
    /// Notification (method, no id).
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Parse a message from its wire form.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error for malformed JSON or a JSON value
    /// that fits none of the three shapes.
    pub fn from_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize a message to its wire form.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error (practically unreachable for these
    /// types).
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(r: JsonRpcRequest) -> Self {
        Self::Request(r)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(r: JsonRpcResponse) -> Self {
        Self::Response(r)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(n: JsonRpcNotification) -> Self {
        Self::Notification(n)
    }
}

/// JSON-RPC and gateway application error codes.
pub mod error_codes {
    /// Malformed JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// Unknown method.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Parameters do not match the method.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error; details are logged, never surfaced.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Generic transport failure.
    pub const TRANSPORT_ERROR: i64 = -32000;
    /// Missing, expired, or revoked token.
    pub const INVALID_TOKEN: i64 = -32001;
    /// No server with the requested id or slug.
    pub const SERVER_NOT_FOUND: i64 = -32002;
    /// A policy rule (or the default) denied the call.
    pub const DENIED_BY_POLICY: i64 = -32003;
    /// A human rejected the approval request.
    pub const APPROVAL_REJECTED: i64 = -32004;
    /// The approval request expired unanswered.
    pub const APPROVAL_TIMEOUT: i64 = -32005;
    /// The target server is not running.
    pub const SERVER_NOT_RUNNING: i64 = -32006;
    /// Rate limit exceeded; `data.retryAfter` carries the wait in ms.
    pub const RATE_LIMITED: i64 = -32029;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_guard() {
        let ok: Result<JsonRpcVersion, _> = serde_json::from_str("\"2.0\"");
        assert!(ok.is_ok());
        let bad: Result<JsonRpcVersion, _> = serde_json::from_str("\"1.0\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_request_roundtrip() {
        let req = JsonRpcRequest::new(
            RequestId::from("7-abc123"),
            "tools/call",
            Some(json!({"name": "read_file"})),
        );
        let wire = serde_json::to_string(&req).unwrap();
        let back: JsonRpcRequest = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.id, req.id);
        assert_eq!(back.method, "tools/call");
        assert_eq!(back.params, req.params);
    }

    #[test]
    fn test_message_classification() {
        let req = JsonRpcMessage::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let note =
            JsonRpcMessage::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
                .unwrap();
        assert!(matches!(note, JsonRpcMessage::Notification(_)));

        let resp = JsonRpcMessage::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(_)));

        let err_resp = JsonRpcMessage::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"no"}}"#,
        )
        .unwrap();
        let JsonRpcMessage::Response(r) = err_resp else {
            panic!("expected response");
        };
        assert!(!r.is_success());
        assert_eq!(r.error.unwrap().code, -32601);
    }

    #[test]
    fn test_numeric_and_string_ids() {
        let num = JsonRpcMessage::from_str(r#"{"jsonrpc":"2.0","id":42,"method":"ping"}"#).unwrap();
        let JsonRpcMessage::Request(r) = num else {
            panic!("expected request");
        };
        assert_eq!(r.id, RequestId::Number(42));

        let s =
            JsonRpcMessage::from_str(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
        let JsonRpcMessage::Request(r) = s else {
            panic!("expected request");
        };
        assert_eq!(r.id, RequestId::from("abc"));
    }

    #[test]
    fn test_parse_error_has_null_id() {
        let resp = JsonRpcResponse::parse_error("bad json");
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire["id"], Value::Null);
        assert_eq!(wire["error"]["code"], json!(error_codes::PARSE_ERROR));
    }

    #[test]
    fn test_error_with_data() {
        let err = JsonRpcError::new(error_codes::RATE_LIMITED, "Rate limit exceeded")
            .with_data(json!({"retryAfter": 1200}));
        let wire = serde_json::to_value(&err).unwrap();
        assert_eq!(wire["data"]["retryAfter"], 1200);
    }

    #[test]
    fn test_batch_is_rejected() {
        let raw = r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#;
        assert!(JsonRpcMessage::from_str(raw).is_err());
    }
}
