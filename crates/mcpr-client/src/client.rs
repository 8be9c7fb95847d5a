//! Client lifecycle and typed operations.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcpr_core::{ServerId, TransportKind};
use mcpr_protocol::{
    methods, ClientCapabilities, Correlator, Implementation, InboundHandler, InitializeParams,
    InitializeResult, NullInboundHandler, Prompt, PromptResult, Resource, ResourceContents,
    ServerCapabilities, Tool, ToolCallResult, PROTOCOL_VERSION,
};
use mcpr_transport::{HttpTransport, SseConfig, SseTransport, StdioTransport, TransportChannels};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};

/// Tuning for a per-server client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-request reply deadline.
    pub request_timeout: Duration,
    /// Identity announced during the handshake.
    pub client_info: Implementation,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            client_info: Implementation {
                name: "mcpr".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Connection lifecycle. Transitions are monotonic within one client
/// lifetime; `Failed` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Constructed, not yet connecting.
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Handshake complete; operations allowed.
    Ready,
    /// Graceful shutdown in progress.
    Closing,
    /// Dead. A new client instance is required.
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

enum TransportHandle {
    Stdio(StdioTransport),
    Http(HttpTransport),
    Sse(SseTransport),
    /// Channels supplied by the caller (tests, in-process servers).
    External,
}

/// A connected MCP client for one downstream server.
pub struct McpClient {
    server_id: ServerId,
    server_name: String,
    correlator: Arc<Correlator>,
    transport: TransportHandle,
    state: Arc<Mutex<ConnectionState>>,
    capabilities: Mutex<Option<ServerCapabilities>>,
    negotiated_version: Mutex<Option<String>>,
    timeout: Duration,
}

impl McpClient {
    /// Create the transport for `kind`, run the handshake, and return a
    /// ready client.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot be created or the handshake does not
    /// complete; the client is unusable (`Failed`) in that case.
    pub async fn connect(
        server_id: ServerId,
        server_name: &str,
        kind: &TransportKind,
        config: ClientConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> ClientResult<Self> {
        let (transport, channels) = match kind {
            TransportKind::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                let (t, c) = StdioTransport::spawn(command, args, env, cwd.as_ref())?;
                (TransportHandle::Stdio(t), c)
            }
            TransportKind::Http { url, headers } => {
                let (t, c) = HttpTransport::connect(url, headers, Some(config.request_timeout))?;
                (TransportHandle::Http(t), c)
            }
            TransportKind::Sse { url, headers } => {
                let (t, c) = SseTransport::connect(url, headers, SseConfig::default())?;
                (TransportHandle::Sse(t), c)
            }
        };

        Self::handshake(server_id, server_name, transport, channels, config, handler).await
    }

    /// Build a client over caller-supplied channels (in-process servers and
    /// tests). The handshake still runs.
    ///
    /// # Errors
    ///
    /// Fails if the handshake does not complete.
    pub async fn from_channels(
        server_id: ServerId,
        server_name: &str,
        channels: TransportChannels,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        Self::handshake(
            server_id,
            server_name,
            TransportHandle::External,
            channels,
            config,
            Arc::new(NullInboundHandler),
        )
        .await
    }

    async fn handshake(
        server_id: ServerId,
        server_name: &str,
        transport: TransportHandle,
        channels: TransportChannels,
        config: ClientConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> ClientResult<Self> {
        let correlator = Arc::new(Correlator::new(channels.outbound, handler));
        let state = Arc::new(Mutex::new(ConnectionState::Connecting));

        // Pump inbound messages into the correlator until the transport ends.
        // When it ends outside a graceful close, the client is failed and
        // every pending request resolves with Closed.
        let pump_correlator = Arc::clone(&correlator);
        let pump_state = Arc::clone(&state);
        let mut inbound = channels.inbound;
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                pump_correlator.handle_inbound(message).await;
            }
            let mut state = pump_state.lock().expect("state lock poisoned");
            if *state != ConnectionState::Closing {
                *state = ConnectionState::Failed;
            }
            pump_correlator.close();
        });

        let client = Self {
            server_id,
            server_name: server_name.to_string(),
            correlator,
            transport,
            state,
            capabilities: Mutex::new(None),
            negotiated_version: Mutex::new(None),
            timeout: config.request_timeout,
        };

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::gateway(),
            client_info: config.client_info,
        };

        let init = client
            .correlator
            .send_request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params).map_err(|e| ClientError::Protocol(e.to_string()))?),
                client.timeout,
            )
            .await;

        let init: InitializeResult = match init {
            Ok(value) => serde_json::from_value(value)
                .map_err(|e| ClientError::Protocol(format!("invalid initialize result: {e}")))?,
            Err(err) => {
                client.set_state(ConnectionState::Failed);
                return Err(err.into());
            }
        };

        if init.protocol_version != PROTOCOL_VERSION {
            warn!(
                server = %server_name,
                negotiated = %init.protocol_version,
                "server negotiated a different protocol revision"
            );
        }

        *client.capabilities.lock().expect("capabilities lock poisoned") =
            Some(init.capabilities);
        *client
            .negotiated_version
            .lock()
            .expect("version lock poisoned") = Some(init.protocol_version);

        client
            .correlator
            .send_notification(methods::INITIALIZED, None)
            .map_err(|_| ClientError::NotConnected {
                state: "transport closed during handshake".to_string(),
            })?;

        client.set_state(ConnectionState::Ready);
        info!(server = %server_name, server_info = %init.server_info.name, "mcp connection ready");
        Ok(client)
    }

    /// The server this client belongs to.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// The server's human name.
    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Capabilities the server announced, once Ready.
    #[must_use]
    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities
            .lock()
            .expect("capabilities lock poisoned")
            .clone()
    }

    /// Negotiated protocol revision, once Ready.
    #[must_use]
    pub fn negotiated_version(&self) -> Option<String> {
        self.negotiated_version
            .lock()
            .expect("version lock poisoned")
            .clone()
    }

    /// Pid of the supervised child process, for stdio transports.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match &self.transport {
            TransportHandle::Stdio(t) => Some(t.pid()),
            _ => None,
        }
    }

    /// Watch that resolves with the child's exit code, for stdio transports.
    #[must_use]
    pub fn exit_watch(&self) -> Option<watch::Receiver<Option<i32>>> {
        match &self.transport {
            TransportHandle::Stdio(t) => Some(t.exit_watch()),
            _ => None,
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        // Monotonic within one lifetime: never move backwards.
        if next > *state || *state == next {
            *state = next;
        }
    }

    fn ensure_ready(&self) -> ClientResult<()> {
        let state = self.state();
        if state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(ClientError::NotConnected {
                state: state.to_string(),
            })
        }
    }

    async fn request(&self, method: &str, params: Option<Value>) -> ClientResult<Value> {
        self.ensure_ready()?;
        Ok(self
            .correlator
            .send_request(method, params, self.timeout)
            .await?)
    }

    /// List the server's tools, following pagination cursors.
    pub async fn list_tools(&self) -> ClientResult<Vec<Tool>> {
        self.ensure_ready()?;
        if !self.capabilities().is_some_and(|c| c.has_tools()) {
            return Ok(Vec::new());
        }
        self.list_paginated(methods::TOOLS_LIST, "tools").await
    }

    /// Invoke a tool by its original (un-namespaced) name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> ClientResult<ToolCallResult> {
        let params = json!({ "name": name, "arguments": arguments });
        let value = self.request(methods::TOOLS_CALL, Some(params)).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("invalid tool result: {e}")))
    }

    /// List the server's resources.
    pub async fn list_resources(&self) -> ClientResult<Vec<Resource>> {
        self.ensure_ready()?;
        if !self.capabilities().is_some_and(|c| c.has_resources()) {
            return Ok(Vec::new());
        }
        self.list_paginated(methods::RESOURCES_LIST, "resources")
            .await
    }

    /// Read one resource by its original URI.
    pub async fn read_resource(&self, uri: &str) -> ClientResult<Vec<ResourceContents>> {
        let value = self
            .request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        let contents = value.get("contents").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(contents)
            .map_err(|e| ClientError::Protocol(format!("invalid resource contents: {e}")))
    }

    /// List the server's prompts.
    pub async fn list_prompts(&self) -> ClientResult<Vec<Prompt>> {
        self.ensure_ready()?;
        if !self.capabilities().is_some_and(|c| c.has_prompts()) {
            return Ok(Vec::new());
        }
        self.list_paginated(methods::PROMPTS_LIST, "prompts").await
    }

    /// Fetch one prompt by its original name.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> ClientResult<PromptResult> {
        let mut params = json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        let value = self.request(methods::PROMPTS_GET, Some(params)).await?;
        serde_json::from_value(value)
            .map_err(|e| ClientError::Protocol(format!("invalid prompt result: {e}")))
    }

    /// Liveness probe.
    pub async fn ping(&self) -> ClientResult<()> {
        self.request(methods::PING, None).await?;
        Ok(())
    }

    async fn list_paginated<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
    ) -> ClientResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self
                .correlator
                .send_request(method, params, self.timeout)
                .await?;
            let page = value.get(key).cloned().unwrap_or(Value::Array(vec![]));
            let mut page: Vec<T> = serde_json::from_value(page)
                .map_err(|e| ClientError::Protocol(format!("invalid {key} list: {e}")))?;
            items.append(&mut page);

            match value.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(items)
    }

    /// Gracefully shut the client down: fail pending requests and close the
    /// transport. The client cannot be reused afterwards.
    pub async fn disconnect(&self) {
        self.set_state(ConnectionState::Closing);
        self.correlator.close();
        match &self.transport {
            TransportHandle::Stdio(t) => {
                let code = t.close().await;
                debug!(server = %self.server_name, ?code, "stdio transport closed");
            }
            TransportHandle::Http(t) => t.close(),
            TransportHandle::Sse(t) => t.close(),
            TransportHandle::External => {}
        }
        self.set_state(ConnectionState::Failed);
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.server_name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
