//! Namespaced aggregation across downstream servers.
//!
//! Outward-facing identifiers are rewritten so names can never collide
//! across servers: tools and prompts become `<slug>.<original>`, resources
//! become `mcpr://<slug>/<original-uri>`. The reverse mapping splits on the
//! first `.` (or the URI authority), which forbids `.` inside original tool
//! and prompt names.

use mcpr_auth::Token;
use mcpr_core::{ServerDescriptor, ServerId, ServerStatus};
use mcpr_protocol::{Prompt, PromptResult, Resource, ResourceContents, Tool, ToolCallResult};
use mcpr_storage::MemoryStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{RouterError, RouterResult};
use crate::registry::ClientRegistry;

/// A tool tagged with the server it came from.
#[derive(Debug, Clone)]
pub struct NamespacedTool {
    /// The tool, name rewritten to `<slug>.<original>`.
    pub tool: Tool,
    /// Originating server.
    pub server_id: ServerId,
    /// Originating server's human name.
    pub server_name: String,
}

/// A resource tagged with the server it came from.
#[derive(Debug, Clone)]
pub struct NamespacedResource {
    /// The resource, URI rewritten to `mcpr://<slug>/<original>`.
    pub resource: Resource,
    /// Originating server.
    pub server_id: ServerId,
    /// Originating server's human name.
    pub server_name: String,
}

/// A prompt tagged with the server it came from.
#[derive(Debug, Clone)]
pub struct NamespacedPrompt {
    /// The prompt, name rewritten to `<slug>.<original>`.
    pub prompt: Prompt,
    /// Originating server.
    pub server_id: ServerId,
    /// Originating server's human name.
    pub server_name: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
    fetched_at: Instant,
}

/// Merges per-server lists into one namespaced view, with a TTL cache.
pub struct Aggregator {
    store: Arc<MemoryStore>,
    registry: Arc<ClientRegistry>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<ServerId, CacheEntry>>,
}

impl Aggregator {
    /// Create an aggregator with the given cache TTL.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>, registry: Arc<ClientRegistry>, cache_ttl: Duration) -> Self {
        Self {
            store,
            registry,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Rewrite a tool or prompt name into its namespaced form.
    #[must_use]
    pub fn namespace_name(slug: &str, original: &str) -> String {
        format!("{slug}.{original}")
    }

    /// Rewrite a resource URI into its namespaced form.
    #[must_use]
    pub fn namespace_uri(slug: &str, original: &str) -> String {
        format!("mcpr://{slug}/{original}")
    }

    /// Split a namespaced tool/prompt name into `(slug, original)`.
    #[must_use]
    pub fn split_name(namespaced: &str) -> Option<(&str, &str)> {
        let (slug, original) = namespaced.split_once('.')?;
        (!slug.is_empty() && !original.is_empty()).then_some((slug, original))
    }

    /// Split a namespaced resource URI into `(slug, original)`.
    #[must_use]
    pub fn split_uri(namespaced: &str) -> Option<(&str, &str)> {
        let rest = namespaced.strip_prefix("mcpr://")?;
        let (slug, original) = rest.split_once('/')?;
        (!slug.is_empty() && !original.is_empty()).then_some((slug, original))
    }

    /// Resolve a namespace slug to its server descriptor.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotFound`] when no server's slug matches.
    pub async fn server_by_slug(&self, slug: &str) -> RouterResult<ServerDescriptor> {
        self.store
            .servers()
            .await
            .into_iter()
            .find(|s| s.slug() == slug)
            .ok_or(RouterError::ServerNotFound)
    }

    /// Merged tool list for a token: every running server the token may
    /// access contributes its (cached) tools, namespaced and tagged.
    ///
    /// A failing server is logged and skipped; its tools are simply absent.
    pub async fn list_tools(&self, token: &Token) -> Vec<NamespacedTool> {
        let mut merged = Vec::new();
        for server in self.accessible_servers(token).await {
            let Some(entry) = self.entry_for(&server).await else {
                continue;
            };
            let slug = server.slug();
            merged.extend(
                entry
                    .tools
                    .into_iter()
                    .filter(|tool| server.tool_permitted(&tool.name))
                    .map(|mut tool| {
                        tool.name = Self::namespace_name(&slug, &tool.name);
                        NamespacedTool {
                            tool,
                            server_id: server.id.clone(),
                            server_name: server.name.clone(),
                        }
                    }),
            );
        }
        merged
    }

    /// Merged resource list for a token.
    pub async fn list_resources(&self, token: &Token) -> Vec<NamespacedResource> {
        let mut merged = Vec::new();
        for server in self.accessible_servers(token).await {
            let Some(entry) = self.entry_for(&server).await else {
                continue;
            };
            let slug = server.slug();
            merged.extend(entry.resources.into_iter().map(|mut resource| {
                resource.uri = Self::namespace_uri(&slug, &resource.uri);
                NamespacedResource {
                    resource,
                    server_id: server.id.clone(),
                    server_name: server.name.clone(),
                }
            }));
        }
        merged
    }

    /// Merged prompt list for a token.
    pub async fn list_prompts(&self, token: &Token) -> Vec<NamespacedPrompt> {
        let mut merged = Vec::new();
        for server in self.accessible_servers(token).await {
            let Some(entry) = self.entry_for(&server).await else {
                continue;
            };
            let slug = server.slug();
            merged.extend(entry.prompts.into_iter().map(|mut prompt| {
                prompt.name = Self::namespace_name(&slug, &prompt.name);
                NamespacedPrompt {
                    prompt,
                    server_id: server.id.clone(),
                    server_name: server.name.clone(),
                }
            }));
        }
        merged
    }

    /// Dispatch a tool call to a server by id.
    ///
    /// # Errors
    ///
    /// [`RouterError::ServerNotRunning`] when no ready client exists; client
    /// failures map per [`RouterError::from`].
    pub async fn call_tool(
        &self,
        server_id: &ServerId,
        original_name: &str,
        arguments: Value,
    ) -> RouterResult<ToolCallResult> {
        let client = self
            .registry
            .get_ready(server_id)
            .ok_or(RouterError::ServerNotRunning)?;
        Ok(client.call_tool(original_name, arguments).await?)
    }

    /// Read a resource from a server by id.
    pub async fn read_resource(
        &self,
        server_id: &ServerId,
        original_uri: &str,
    ) -> RouterResult<Vec<ResourceContents>> {
        let client = self
            .registry
            .get_ready(server_id)
            .ok_or(RouterError::ServerNotRunning)?;
        Ok(client.read_resource(original_uri).await?)
    }

    /// Fetch a prompt from a server by id.
    pub async fn get_prompt(
        &self,
        server_id: &ServerId,
        original_name: &str,
        arguments: Option<Value>,
    ) -> RouterResult<PromptResult> {
        let client = self
            .registry
            .get_ready(server_id)
            .ok_or(RouterError::ServerNotRunning)?;
        Ok(client.get_prompt(original_name, arguments).await?)
    }

    /// Drop one server's cached lists (start, stop, error, restart).
    pub fn invalidate(&self, server_id: &ServerId) {
        self.cache.lock().expect("cache poisoned").remove(server_id);
        debug!(server = %server_id, "aggregator cache invalidated");
    }

    /// Drop every cached list.
    pub fn invalidate_all(&self) {
        self.cache.lock().expect("cache poisoned").clear();
    }

    async fn accessible_servers(&self, token: &Token) -> Vec<ServerDescriptor> {
        self.store
            .servers()
            .await
            .into_iter()
            .filter(|s| s.status == ServerStatus::Running)
            .filter(|s| token.allows_server(&s.id))
            .collect()
    }

    /// Cached lists for one server, fetching on miss or expiry.
    async fn entry_for(&self, server: &ServerDescriptor) -> Option<CacheEntry> {
        {
            let cache = self.cache.lock().expect("cache poisoned");
            if let Some(entry) = cache.get(&server.id) {
                if entry.fetched_at.elapsed() < self.cache_ttl {
                    return Some(entry.clone());
                }
            }
        }

        let client = self.registry.get_ready(&server.id)?;
        let fetched = async {
            let tools = client.list_tools().await?;
            let resources = client.list_resources().await?;
            let prompts = client.list_prompts().await?;
            Ok::<_, mcpr_client::ClientError>(CacheEntry {
                tools,
                resources,
                prompts,
                fetched_at: Instant::now(),
            })
        }
        .await;

        match fetched {
            Ok(entry) => {
                self.cache
                    .lock()
                    .expect("cache poisoned")
                    .insert(server.id.clone(), entry.clone());
                Some(entry)
            }
            Err(error) => {
                warn!(server = %server.name, %error, "list fetch failed, omitting server");
                None
            }
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("cached_servers", &self.cache.lock().expect("cache poisoned").len())
            .finish_non_exhaustive()
    }
}
