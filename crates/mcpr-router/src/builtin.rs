//! Built-in memory tools.
//!
//! A few memory primitives ship with the gateway itself. They ride the same
//! pipeline as downstream tools (auth, policy, rate limit, audit) but
//! resolve in-process against the store; no transport is involved. Their
//! namespace slug is reserved - a configured server named "memory" would
//! shadow them and is rejected at startup.

use mcpr_core::ClientId;
use mcpr_protocol::{Tool, ToolCallResult, ToolContent};
use mcpr_storage::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{RouterError, RouterResult};

/// Namespace slug of the built-in tools.
pub const BUILTIN_SLUG: &str = "memory";

/// The in-process memory tool set.
#[derive(Debug, Clone)]
pub struct BuiltinTools {
    store: Arc<MemoryStore>,
    page_size: usize,
}

impl BuiltinTools {
    /// Create the built-in tool set over the store.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            page_size: 50,
        }
    }

    /// Tool descriptors, already namespaced under [`BUILTIN_SLUG`].
    #[must_use]
    pub fn tools(&self) -> Vec<Tool> {
        vec![
            Tool {
                name: format!("{BUILTIN_SLUG}.store"),
                description: Some("Store a value under a key in gateway memory".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "key": { "type": "string" },
                        "value": {}
                    },
                    "required": ["key", "value"]
                }),
            },
            Tool {
                name: format!("{BUILTIN_SLUG}.retrieve"),
                description: Some("Retrieve a value from gateway memory".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": { "key": { "type": "string" } },
                    "required": ["key"]
                }),
            },
            Tool {
                name: format!("{BUILTIN_SLUG}.list"),
                description: Some("List stored keys, one page at a time".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": { "offset": { "type": "integer", "minimum": 0 } }
                }),
            },
        ]
    }

    /// Invoke a built-in by its original (un-namespaced) name.
    ///
    /// # Errors
    ///
    /// Unknown names map to [`RouterError::ServerNotFound`] the same way an
    /// unknown namespace slug does; malformed arguments surface as a failed
    /// tool result, matching how downstream tools report argument errors.
    pub async fn call(
        &self,
        client_id: &ClientId,
        name: &str,
        arguments: &Value,
    ) -> RouterResult<ToolCallResult> {
        match name {
            "store" => {
                let Some(key) = arguments.get("key").and_then(Value::as_str) else {
                    return Ok(error_result("missing required argument: key"));
                };
                let Some(value) = arguments.get("value") else {
                    return Ok(error_result("missing required argument: value"));
                };
                self.store
                    .memory_put(client_id.clone(), key, value.clone())
                    .await;
                Ok(text_result(format!("stored '{key}'")))
            }
            "retrieve" => {
                let Some(key) = arguments.get("key").and_then(Value::as_str) else {
                    return Ok(error_result("missing required argument: key"));
                };
                match self.store.memory_get(client_id, key).await {
                    Some(entry) => Ok(text_result(entry.value.to_string())),
                    None => Ok(error_result(format!("no entry for '{key}'"))),
                }
            }
            "list" => {
                let offset = arguments
                    .get("offset")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                let page = self
                    .store
                    .memory_list(client_id, offset, self.page_size)
                    .await;
                let body = json!({
                    "keys": page.entries.iter().map(|e| e.key.clone()).collect::<Vec<_>>(),
                    "nextOffset": page.next_offset,
                });
                Ok(text_result(body.to_string()))
            }
            _ => Err(RouterError::ServerNotFound),
        }
    }
}

fn text_result(text: String) -> ToolCallResult {
    ToolCallResult {
        content: vec![ToolContent::Text { text }],
        is_error: false,
    }
}

fn error_result(text: impl Into<String>) -> ToolCallResult {
    ToolCallResult {
        content: vec![ToolContent::Text { text: text.into() }],
        is_error: true,
    }
}
