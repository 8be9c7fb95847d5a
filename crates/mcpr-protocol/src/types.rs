//! MCP 2024-11-05 domain types.
//!
//! Only the slices of the MCP schema the gateway relays are modelled;
//! unknown capability fields ride along in `extra` maps so a newer server
//! does not break the handshake.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A tool as advertised by a downstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Tool name, unique within its server.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema describing the arguments object.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A resource as advertised by a downstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource URI, unique within its server.
    pub uri: String,
    /// Human-readable name.
    pub name: String,
    /// MIME type, when known.
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Contents of a read resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContents {
    /// URI the contents belong to.
    pub uri: String,
    /// MIME type, when known.
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Text payload, for textual resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 payload, for binary resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// An argument a prompt accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
}

/// A prompt as advertised by a downstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    /// Prompt name, unique within its server.
    pub name: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Arguments the prompt accepts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// One message of a rendered prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    /// Speaker role ("user" or "assistant").
    pub role: String,
    /// Message content (MCP content object).
    pub content: Value,
}

/// Result of `prompts/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResult {
    /// Prompt description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Rendered messages.
    pub messages: Vec<PromptMessage>,
}

/// One content block of a tool call result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Inline image.
    Image {
        /// Base64 image data.
        data: String,
        /// Image MIME type.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// Embedded resource contents.
    Resource {
        /// The embedded resource.
        resource: ResourceContents,
    },
}

/// Result of `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Content blocks produced by the tool.
    pub content: Vec<ToolContent>,
    /// Whether the tool itself reported failure.
    #[serde(rename = "isError", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Name and version of one protocol participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    /// Participant name.
    pub name: String,
    /// Participant version.
    pub version: String,
}

/// Capabilities the gateway announces as an MCP client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// Roots capability: `{ "listChanged": bool }`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,
    /// Sampling capability (empty object when present).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

impl ClientCapabilities {
    /// The capability set the gateway sends on every handshake.
    #[must_use]
    pub fn gateway() -> Self {
        Self {
            roots: Some(serde_json::json!({ "listChanged": true })),
            sampling: Some(serde_json::json!({})),
        }
    }
}

/// Capabilities a downstream server announced during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Tools capability, when the server exposes tools.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    /// Resources capability, when the server exposes resources.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    /// Prompts capability, when the server exposes prompts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    /// Anything else the server declared.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerCapabilities {
    /// Whether the server exposes tools.
    #[must_use]
    pub fn has_tools(&self) -> bool {
        self.tools.is_some()
    }

    /// Whether the server exposes resources.
    #[must_use]
    pub fn has_resources(&self) -> bool {
        self.resources.is_some()
    }

    /// Whether the server exposes prompts.
    #[must_use]
    pub fn has_prompts(&self) -> bool {
        self.prompts.is_some()
    }
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol revision the client proposes.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client capabilities.
    pub capabilities: ClientCapabilities,
    /// Client identity.
    #[serde(rename = "clientInfo")]
    pub client_info: Implementation,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol revision the server accepted.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server capabilities.
    pub capabilities: ServerCapabilities,
    /// Server identity.
    #[serde(rename = "serverInfo")]
    pub server_info: Implementation,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_wire_shape() {
        let tool = Tool {
            name: "read_file".to_string(),
            description: Some("Read a file".to_string()),
            input_schema: json!({"type": "object"}),
        };
        let wire = serde_json::to_value(&tool).unwrap();
        assert_eq!(wire["inputSchema"]["type"], "object");
        assert!(wire.get("input_schema").is_none());
    }

    #[test]
    fn test_tool_content_tagging() {
        let content = ToolContent::Text {
            text: "hello".to_string(),
        };
        let wire = serde_json::to_value(&content).unwrap();
        assert_eq!(wire["type"], "text");

        let back: ToolContent = serde_json::from_value(json!({
            "type": "image", "data": "aGk=", "mimeType": "image/png"
        }))
        .unwrap();
        assert!(matches!(back, ToolContent::Image { .. }));
    }

    #[test]
    fn test_tool_result_text() {
        let result = ToolCallResult {
            content: vec![
                ToolContent::Text {
                    text: "line one".to_string(),
                },
                ToolContent::Image {
                    data: "aGk=".to_string(),
                    mime_type: "image/png".to_string(),
                },
                ToolContent::Text {
                    text: "line two".to_string(),
                },
            ],
            is_error: false,
        };
        assert_eq!(result.text(), "line one\nline two");
    }

    #[test]
    fn test_initialize_wire_shape() {
        let params = InitializeParams {
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::gateway(),
            client_info: Implementation {
                name: "mcpr".to_string(),
                version: "0.1.0".to_string(),
            },
        };
        let wire = serde_json::to_value(&params).unwrap();
        assert_eq!(wire["protocolVersion"], "2024-11-05");
        assert_eq!(wire["clientInfo"]["name"], "mcpr");
        assert_eq!(wire["capabilities"]["roots"]["listChanged"], true);
    }

    #[test]
    fn test_server_capabilities_preserve_unknown() {
        let raw = json!({
            "tools": {"listChanged": true},
            "experimental": {"streams": {}}
        });
        let caps: ServerCapabilities = serde_json::from_value(raw.clone()).unwrap();
        assert!(caps.has_tools());
        assert!(!caps.has_prompts());
        assert_eq!(
            serde_json::to_value(&caps).unwrap()["experimental"],
            raw["experimental"]
        );
    }
}
