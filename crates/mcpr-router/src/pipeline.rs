//! The request pipeline.
//!
//! Stages run strictly in order - authenticate, resolve project, rate-limit,
//! policy, approval (when demanded), dispatch - and any stage short-circuits
//! with a typed failure. The terminator converts every outcome into exactly
//! one audit event; no path exits without one.
//!
//! Cancellation is cooperative: the caller's token is checked between
//! stages, a pending approval is cancelled, and a dispatched request's
//! late result is dropped by the correlator.

use async_trait::async_trait;
use mcpr_approval::{ApprovalError, ApprovalQueue, ApprovalRequest, ApprovalResponse};
use mcpr_audit::{AuditEvent, AuditEventType, AuditSink};
use mcpr_auth::{Token, TokenLookup, TokenValidator};
use mcpr_core::{ApprovalId, ClientId, Project, ServerId, Timestamp, TokenId};
use mcpr_policy::{Decision, EvaluationContext, PolicyAction, ResourceType};
use mcpr_protocol::{PromptResult, ResourceContents, ToolCallResult};
use mcpr_storage::MemoryStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::aggregator::{Aggregator, NamespacedPrompt, NamespacedResource, NamespacedTool};
use crate::builtin::BuiltinTools;
use crate::error::{RouterError, RouterResult};
use crate::rate_limit::RateLimiter;

/// Pipeline tuning.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    /// How long an opened approval waits before expiring.
    pub approval_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(300),
        }
    }
}

/// What a call is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    /// A downstream server.
    Server(ServerId),
    /// The in-process built-in tools.
    Builtin,
}

impl CallTarget {
    fn server_id(&self) -> Option<&ServerId> {
        match self {
            Self::Server(id) => Some(id),
            Self::Builtin => None,
        }
    }

    /// The id used in policy contexts and audit events. Built-ins use the
    /// nil id.
    fn effective_id(&self) -> ServerId {
        match self {
            Self::Server(id) => id.clone(),
            Self::Builtin => ServerId(Uuid::nil()),
        }
    }
}

/// One call travelling the pipeline.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Bearer token of the caller.
    pub token_id: TokenId,
    /// Raw `X-MCPR-Project` header value, when present.
    pub project: Option<String>,
    /// Where the call goes.
    pub target: CallTarget,
    /// What kind of resource is touched.
    pub resource_type: ResourceType,
    /// Original (un-namespaced) tool name, resource URI, or prompt name.
    pub name: String,
    /// Call arguments.
    pub arguments: Value,
    /// Caller-side cancellation.
    pub cancel: CancellationToken,
}

impl CallRequest {
    /// A tool call with no project scope and no cancellation wired.
    #[must_use]
    pub fn tool(token_id: TokenId, target: CallTarget, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            token_id,
            project: None,
            target,
            resource_type: ResourceType::Tool,
            name: name.into(),
            arguments,
            cancel: CancellationToken::new(),
        }
    }
}

/// Delegates token lookups to the store.
struct StoreLookup(Arc<MemoryStore>);

#[async_trait]
impl TokenLookup for StoreLookup {
    async fn token(&self, id: &TokenId) -> Option<Token> {
        self.0.token(id).await
    }

    async fn touch_token(&self, id: &TokenId, at: Timestamp) {
        self.0.touch_token(id, at).await;
    }
}

/// The pipeline orchestrator.
pub struct Pipeline {
    store: Arc<MemoryStore>,
    validator: TokenValidator<StoreLookup>,
    rate_limiter: Arc<RateLimiter>,
    approvals: ApprovalQueue,
    aggregator: Arc<Aggregator>,
    builtins: BuiltinTools,
    audit: Arc<dyn AuditSink>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Wire up the pipeline.
    #[must_use]
    pub fn new(
        store: Arc<MemoryStore>,
        rate_limiter: Arc<RateLimiter>,
        approvals: ApprovalQueue,
        aggregator: Arc<Aggregator>,
        builtins: BuiltinTools,
        audit: Arc<dyn AuditSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            validator: TokenValidator::new(StoreLookup(Arc::clone(&store))),
            store,
            rate_limiter,
            approvals,
            aggregator,
            builtins,
            audit,
            config,
        }
    }

    /// The approval queue, for the front-end's respond/pending endpoints.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalQueue {
        &self.approvals
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Execute a tool call through all stages.
    pub async fn call_tool(&self, request: CallRequest) -> RouterResult<ToolCallResult> {
        let started = Instant::now();
        let staged = self.run_stages(&request).await;
        let observed_client = staged.as_ref().ok().map(|t| t.client_id.clone());

        let result = match staged {
            Err(err) => Err(err),
            Ok(token) => match &request.target {
                CallTarget::Builtin => {
                    self.builtins
                        .call(&token.client_id, &request.name, &request.arguments)
                        .await
                }
                CallTarget::Server(server_id) => {
                    let dispatch =
                        self.aggregator
                            .call_tool(server_id, &request.name, request.arguments.clone());
                    tokio::select! {
                        () = request.cancel.cancelled() => Err(RouterError::Cancelled),
                        result = dispatch => result,
                    }
                }
            },
        };

        self.finish(&request, observed_client, started, &result).await;
        result
    }

    /// Execute a resource read through all stages.
    pub async fn read_resource(&self, request: CallRequest) -> RouterResult<Vec<ResourceContents>> {
        let started = Instant::now();
        let staged = self.run_stages(&request).await;
        let observed_client = staged.as_ref().ok().map(|t| t.client_id.clone());

        let result = match (staged, &request.target) {
            (Err(err), _) => Err(err),
            (Ok(_), CallTarget::Builtin) => Err(RouterError::ServerNotFound),
            (Ok(_), CallTarget::Server(server_id)) => {
                let dispatch = self.aggregator.read_resource(server_id, &request.name);
                tokio::select! {
                    () = request.cancel.cancelled() => Err(RouterError::Cancelled),
                    result = dispatch => result,
                }
            }
        };

        self.finish(&request, observed_client, started, &result).await;
        result
    }

    /// Execute a prompt fetch through all stages.
    pub async fn get_prompt(&self, request: CallRequest) -> RouterResult<PromptResult> {
        let started = Instant::now();
        let staged = self.run_stages(&request).await;
        let observed_client = staged.as_ref().ok().map(|t| t.client_id.clone());

        let result = match (staged, &request.target) {
            (Err(err), _) => Err(err),
            (Ok(_), CallTarget::Builtin) => Err(RouterError::ServerNotFound),
            (Ok(_), CallTarget::Server(server_id)) => {
                let arguments = (!request.arguments.is_null()).then(|| request.arguments.clone());
                let dispatch = self.aggregator.get_prompt(server_id, &request.name, arguments);
                tokio::select! {
                    () = request.cancel.cancelled() => Err(RouterError::Cancelled),
                    result = dispatch => result,
                }
            }
        };

        self.finish(&request, observed_client, started, &result).await;
        result
    }

    // -----------------------------------------------------------------------
    // Listings (authenticated, not audited per call)
    // -----------------------------------------------------------------------

    /// Merged tool list for a token, built-ins included.
    pub async fn list_tools(
        &self,
        token_id: &TokenId,
        project: Option<&str>,
    ) -> RouterResult<Vec<NamespacedTool>> {
        let (token, project) = self.authenticate_for_listing(token_id, project).await?;
        let mut tools = self.aggregator.list_tools(&token).await;
        if let Some(project) = &project {
            tools.retain(|t| project.includes_server(&t.server_id));
        }
        tools.extend(self.builtins.tools().into_iter().map(|tool| NamespacedTool {
            tool,
            server_id: ServerId(Uuid::nil()),
            server_name: "Gateway Memory".to_string(),
        }));
        Ok(tools)
    }

    /// Merged resource list for a token.
    pub async fn list_resources(
        &self,
        token_id: &TokenId,
        project: Option<&str>,
    ) -> RouterResult<Vec<NamespacedResource>> {
        let (token, project) = self.authenticate_for_listing(token_id, project).await?;
        let mut resources = self.aggregator.list_resources(&token).await;
        if let Some(project) = &project {
            resources.retain(|r| project.includes_server(&r.server_id));
        }
        Ok(resources)
    }

    /// Merged prompt list for a token.
    pub async fn list_prompts(
        &self,
        token_id: &TokenId,
        project: Option<&str>,
    ) -> RouterResult<Vec<NamespacedPrompt>> {
        let (token, project) = self.authenticate_for_listing(token_id, project).await?;
        let mut prompts = self.aggregator.list_prompts(&token).await;
        if let Some(project) = &project {
            prompts.retain(|p| project.includes_server(&p.server_id));
        }
        Ok(prompts)
    }

    // -----------------------------------------------------------------------
    // Approvals surface
    // -----------------------------------------------------------------------

    /// Resolve a pending approval (another actor's side of the rendezvous).
    pub async fn respond_approval(
        &self,
        id: &ApprovalId,
        response: ApprovalResponse,
    ) -> RouterResult<ApprovalRequest> {
        let record = self.approvals.respond(id, &response).map_err(|err| match err {
            ApprovalError::NotFound => RouterError::InvalidRequest {
                message: "unknown approval request".to_string(),
            },
            ApprovalError::InvalidState { status } => RouterError::InvalidRequest {
                message: format!("approval request is already {status}"),
            },
            ApprovalError::AlreadyWaited => RouterError::Internal {
                detail: "approval waiter state corrupted".to_string(),
            },
        })?;

        self.store.record_approval(record.clone()).await;
        self.audit
            .append(
                AuditEvent::new(AuditEventType::ApprovalResponded)
                    .client(record.client_id.clone())
                    .server(record.server_id.clone())
                    .tool(record.tool_name.clone())
                    .metadata(json!({
                        "approved": response.approved,
                        "respondedBy": response.responded_by,
                    })),
            )
            .await;
        Ok(record)
    }

    /// Expire overdue approvals and audit each one.
    pub async fn cleanup_expired_approvals(&self) -> usize {
        let before: Vec<ApprovalRequest> = self.approvals.pending();
        let count = self.approvals.cleanup_expired();
        if count > 0 {
            for record in before {
                if let Some(now) = self.approvals.get(&record.id) {
                    if !now.status.is_pending() {
                        self.store.record_approval(now.clone()).await;
                        self.audit
                            .append(
                                AuditEvent::new(AuditEventType::ApprovalExpired)
                                    .client(now.client_id.clone())
                                    .server(now.server_id.clone())
                                    .tool(now.tool_name.clone())
                                    .failed("expired"),
                            )
                            .await;
                    }
                }
            }
        }
        count
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Stages 1 through 5. Returns the validated token on success so the
    /// dispatch stage knows the caller.
    async fn run_stages(&self, request: &CallRequest) -> RouterResult<Token> {
        if request.cancel.is_cancelled() {
            return Err(RouterError::Cancelled);
        }

        // Stage 1: authenticate, server-scoped for real servers.
        let token = self.authenticate(request).await?;

        // Stage 2: resolve the project scope.
        let project = self.resolve_project(request.project.as_deref()).await?;
        if let (Some(project), Some(server_id)) = (&project, request.target.server_id()) {
            if !project.includes_server(server_id) {
                return Err(RouterError::ServerNotFound);
            }
        }

        // Stage 3: rate limit.
        let key = format!(
            "tool:{}:{}",
            token.client_id,
            request.target.effective_id()
        );
        let rate = self.rate_limiter.consume(&key, 1.0);
        if !rate.allowed {
            return Err(RouterError::RateLimited {
                retry_after_ms: rate.retry_after_ms,
            });
        }

        // Stage 4: policy.
        let decision = self.evaluate_policy(request, &token, project.as_ref()).await;
        match decision.action {
            PolicyAction::Deny => {
                return Err(RouterError::DeniedByPolicy {
                    rule_id: decision.rule_id,
                });
            }
            PolicyAction::RequireApproval => {
                // Stage 5: the rendezvous.
                self.await_approval(request, &token, &decision).await?;
            }
            PolicyAction::Allow => {}
        }

        if request.cancel.is_cancelled() {
            return Err(RouterError::Cancelled);
        }

        Ok(token)
    }

    async fn authenticate(&self, request: &CallRequest) -> RouterResult<Token> {
        let result = match &request.target {
            CallTarget::Server(server_id) => {
                self.validator
                    .validate_for_server(&request.token_id, server_id)
                    .await
            }
            CallTarget::Builtin => self.validator.validate(&request.token_id).await,
        };
        result.map_err(|err| {
            debug!(error = %err, "authentication failed");
            RouterError::Unauthorized
        })
    }

    async fn authenticate_for_listing(
        &self,
        token_id: &TokenId,
        project: Option<&str>,
    ) -> RouterResult<(Token, Option<Project>)> {
        let token = self
            .validator
            .validate(token_id)
            .await
            .map_err(|_| RouterError::Unauthorized)?;
        let project = self.resolve_project(project).await?;
        Ok((token, project))
    }

    async fn resolve_project(&self, raw: Option<&str>) -> RouterResult<Option<Project>> {
        let Some(raw) = raw else {
            return Ok(None);
        };
        let project = self
            .store
            .find_project(raw)
            .await
            .ok_or(RouterError::ProjectNotFound)?;
        if !project.active {
            return Err(RouterError::ProjectInactive);
        }
        Ok(Some(project))
    }

    async fn evaluate_policy(
        &self,
        request: &CallRequest,
        token: &Token,
        project: Option<&Project>,
    ) -> Decision {
        let rules = self.store.enabled_policies().await;
        let ctx = EvaluationContext {
            client_id: token.client_id.clone(),
            server_id: request.target.effective_id(),
            workspace_id: project.map(|p| p.id.to_string()),
            resource_type: request.resource_type,
            resource_name: request.name.clone(),
            metadata: json!({ "args": request.arguments }),
        };
        mcpr_policy::evaluate(&rules, &ctx)
    }

    async fn await_approval(
        &self,
        request: &CallRequest,
        token: &Token,
        decision: &Decision,
    ) -> RouterResult<()> {
        let record = ApprovalRequest::open(
            token.client_id.clone(),
            request.target.effective_id(),
            request.name.clone(),
            request.arguments.clone(),
            decision.rule_id.clone(),
            self.config.approval_timeout.as_millis() as i64,
        );
        let id = record.id.clone();
        let record = self.approvals.open(record);
        self.store.record_approval(record).await;

        let outcome = tokio::select! {
            () = request.cancel.cancelled() => {
                self.approvals.cancel(&id);
                self.persist_approval(&id).await;
                return Err(RouterError::Cancelled);
            }
            outcome = self.approvals.wait(&id, None) => outcome,
        };
        self.persist_approval(&id).await;

        match outcome {
            Ok(outcome) if outcome.approved => Ok(()),
            Ok(outcome) if outcome.is_expired() => Err(RouterError::ApprovalTimeout),
            Ok(outcome) if outcome.is_cancelled() => Err(RouterError::Cancelled),
            Ok(outcome) => Err(RouterError::ApprovalRejected {
                reason: outcome.reason,
            }),
            Err(err) => Err(RouterError::Internal {
                detail: format!("approval wait failed: {err}"),
            }),
        }
    }

    async fn persist_approval(&self, id: &ApprovalId) {
        if let Some(record) = self.approvals.get(id) {
            self.store.record_approval(record).await;
        }
    }

    /// The terminator: exactly one audit event per invocation.
    async fn finish<T>(
        &self,
        request: &CallRequest,
        observed_client: Option<ClientId>,
        started: Instant,
        result: &RouterResult<T>,
    ) {
        let duration = started.elapsed().as_millis() as u64;

        let mut event = match result {
            Ok(_) => AuditEvent::new(AuditEventType::ToolCall),
            Err(RouterError::Unauthorized) => {
                AuditEvent::new(AuditEventType::TokenValidate).failed("Invalid or expired token")
            }
            Err(err @ (RouterError::Remote { .. } | RouterError::ServerUnavailable)) => {
                AuditEvent::new(AuditEventType::ToolError).failed(err.user_message())
            }
            Err(RouterError::Cancelled) => {
                AuditEvent::new(AuditEventType::ToolCall).failed("cancelled")
            }
            Err(err) => {
                let mut event =
                    AuditEvent::new(AuditEventType::ToolCall).failed(err.user_message());
                if let RouterError::DeniedByPolicy {
                    rule_id: Some(rule_id),
                } = err
                {
                    event = event.metadata(json!({
                        "error": err.user_message(),
                        "ruleId": rule_id.to_string(),
                    }));
                }
                event
            }
        };

        if let Some(client_id) = observed_client {
            event = event.client(client_id);
        }
        if let Some(server_id) = request.target.server_id() {
            event = event.server(server_id.clone());
        }
        event = event.tool(request.name.clone()).duration(duration);

        self.audit.append(event).await;
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ClientRegistry;
    use crate::rate_limit::BucketConfig;
    use mcpr_approval::ApprovalStatus;
    use mcpr_audit::{AuditFilter, MemoryAuditSink};
    use mcpr_client::{ClientConfig, McpClient};
    use mcpr_core::{ServerDescriptor, ServerStatus, TransportKind};
    use mcpr_policy::PolicyRule;
    use mcpr_protocol::{JsonRpcError, JsonRpcMessage, JsonRpcResponse};
    use mcpr_transport::TransportChannels;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<ClientRegistry>,
        audit: Arc<MemoryAuditSink>,
        pipeline: Pipeline,
    }

    fn harness(rate: BucketConfig, approval_timeout: Duration) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ClientRegistry::new());
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Duration::from_secs(300),
        ));
        let audit = Arc::new(MemoryAuditSink::new());
        let pipeline = Pipeline::new(
            Arc::clone(&store),
            Arc::new(RateLimiter::new(rate)),
            ApprovalQueue::new(),
            aggregator,
            BuiltinTools::new(Arc::clone(&store)),
            audit.clone(),
            PipelineConfig { approval_timeout },
        );
        Harness {
            store,
            registry,
            audit,
            pipeline,
        }
    }

    fn default_harness() -> Harness {
        harness(
            BucketConfig {
                capacity: 100.0,
                refill_rate: 100.0,
            },
            Duration::from_secs(60),
        )
    }

    /// Fake downstream answering the handshake and tool calls.
    fn fake_server_channels() -> TransportChannels {
        let (client_out_tx, mut client_out_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
        let (server_out_tx, server_out_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();

        tokio::spawn(async move {
            while let Some(message) = client_out_rx.recv().await {
                let JsonRpcMessage::Request(req) = message else {
                    continue;
                };
                let response = match req.method.as_str() {
                    "initialize" => JsonRpcResponse::success(
                        req.id,
                        json!({
                            "protocolVersion": "2024-11-05",
                            "capabilities": { "tools": {} },
                            "serverInfo": { "name": "fake", "version": "1.0" }
                        }),
                    ),
                    "tools/list" => JsonRpcResponse::success(
                        req.id,
                        json!({ "tools": [
                            { "name": "read_file", "inputSchema": {"type": "object"} },
                            { "name": "write_file", "inputSchema": {"type": "object"} },
                            { "name": "dangerous_op", "inputSchema": {"type": "object"} }
                        ]}),
                    ),
                    "tools/call" => {
                        let name = req
                            .params
                            .as_ref()
                            .and_then(|p| p.get("name"))
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        if name == "explodes" {
                            JsonRpcResponse::error(
                                req.id,
                                JsonRpcError::new(-32050, "downstream exploded"),
                            )
                        } else {
                            JsonRpcResponse::success(
                                req.id,
                                json!({ "content": [
                                    { "type": "text", "text": format!("ran {name}") }
                                ]}),
                            )
                        }
                    }
                    _ => JsonRpcResponse::success(req.id, json!({})),
                };
                if server_out_tx.send(response.into()).is_err() {
                    break;
                }
            }
        });

        TransportChannels {
            outbound: client_out_tx,
            inbound: server_out_rx,
        }
    }

    /// Register a running fake server plus a token that may use it.
    async fn running_server(h: &Harness) -> (ServerId, TokenId) {
        let mut server = ServerDescriptor::new(
            "Filesystem",
            TransportKind::Stdio {
                command: "unused".to_string(),
                args: vec![],
                env: HashMap::new(),
                cwd: None,
            },
        );
        server.set_status(ServerStatus::Running);
        let server_id = server.id.clone();
        h.store.upsert_server(server).await;

        let client = McpClient::from_channels(
            server_id.clone(),
            "Filesystem",
            fake_server_channels(),
            ClientConfig::default(),
        )
        .await
        .unwrap();
        h.registry.insert(Arc::new(client));

        let token = Token::issue(ClientId::from("c1"), "test", None)
            .with_server_access(server_id.clone());
        let token_id = token.id.clone();
        h.store.insert_token(token).await.unwrap();

        (server_id, token_id)
    }

    fn allow_all() -> PolicyRule {
        PolicyRule::global("allow-all", ResourceType::Tool, "*", PolicyAction::Allow, 0)
    }

    async fn tool_call_events(audit: &MemoryAuditSink) -> Vec<AuditEvent> {
        audit
            .query(&AuditFilter {
                event_type: Some(AuditEventType::ToolCall),
                ..Default::default()
            })
            .await
    }

    #[tokio::test]
    async fn test_happy_path_tool_call() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;

        let result = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id.clone()),
                "read_file",
                json!({"path": "/a"}),
            ))
            .await
            .unwrap();
        assert_eq!(result.text(), "ran read_file");

        let events = tool_call_events(&h.audit).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.success);
        assert_eq!(event.server_id.as_ref(), Some(&server_id));
        assert_eq!(event.tool_name.as_deref(), Some("read_file"));
        assert_eq!(event.client_id.as_ref().map(ClientId::as_str), Some("c1"));
        assert!(event.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_unauthorized_token_never_dispatches() {
        let h = default_harness();
        let (server_id, _token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                TokenId::new("not-a-token"),
                CallTarget::Server(server_id),
                "read_file",
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Unauthorized));

        // Audit is a token.validate failure, and exactly one event exists.
        let events = h
            .audit
            .query(&AuditFilter {
                event_type: Some(AuditEventType::TokenValidate),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        assert!(tool_call_events(&h.audit).await.is_empty());
    }

    #[tokio::test]
    async fn test_server_access_false_is_unauthorized() {
        let h = default_harness();
        let (server_id, _) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;

        // A valid token without access to this server.
        let token = Token::issue(ClientId::from("c2"), "other", None);
        let token_id = token.id.clone();
        h.store.insert_token(token).await.unwrap();

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "read_file",
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Unauthorized));
    }

    #[tokio::test]
    async fn test_policy_denial() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;
        h.store
            .upsert_policy(PolicyRule::global(
                "no-writes",
                ResourceType::Tool,
                "write_*",
                PolicyAction::Deny,
                10,
            ))
            .await;

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "write_file",
                json!({"path": "/a"}),
            ))
            .await
            .unwrap_err();
        let RouterError::DeniedByPolicy { rule_id } = &err else {
            panic!("expected policy denial, got {err}");
        };
        assert!(rule_id.is_some());

        let events = tool_call_events(&h.audit).await;
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
        let meta = events[0].metadata.as_ref().unwrap();
        assert_eq!(meta["error"], "Denied by policy");
        assert!(meta["ruleId"].is_string());
    }

    #[tokio::test]
    async fn test_default_deny_with_no_rules() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "read_file",
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::DeniedByPolicy { rule_id: None }
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_two_then_deny() {
        let h = harness(
            BucketConfig {
                capacity: 2.0,
                refill_rate: 0.0,
            },
            Duration::from_secs(60),
        );
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;

        for _ in 0..2 {
            h.pipeline
                .call_tool(CallRequest::tool(
                    token_id.clone(),
                    CallTarget::Server(server_id.clone()),
                    "read_file",
                    json!({}),
                ))
                .await
                .unwrap();
        }

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "read_file",
                json!({}),
            ))
            .await
            .unwrap_err();
        let RouterError::RateLimited { retry_after_ms } = err else {
            panic!("expected rate limit, got {err}");
        };
        assert!(retry_after_ms > 0);

        // Two successes, one failure; three events total.
        let events = tool_call_events(&h.audit).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().filter(|e| e.success).count(), 2);
    }

    #[tokio::test]
    async fn test_approval_approved_continues() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;
        h.store
            .upsert_policy(PolicyRule::global(
                "danger-needs-human",
                ResourceType::Tool,
                "dangerous_*",
                PolicyAction::RequireApproval,
                20,
            ))
            .await;

        // Another actor approves once the request shows up.
        let approver_pipeline_queue = h.pipeline.approvals().clone();
        let approver_store = Arc::clone(&h.store);
        tokio::spawn(async move {
            loop {
                let pending = approver_pipeline_queue.pending();
                if let Some(record) = pending.first() {
                    let _ = approver_pipeline_queue
                        .respond(&record.id, &ApprovalResponse::approve("ops"));
                    // Mirror what the respond endpoint persists.
                    if let Some(updated) = approver_pipeline_queue.get(&record.id) {
                        approver_store.record_approval(updated).await;
                    }
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let result = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "dangerous_op",
                json!({"force": true}),
            ))
            .await
            .unwrap();
        assert_eq!(result.text(), "ran dangerous_op");

        // One tool.call event for the whole invocation.
        let events = tool_call_events(&h.audit).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].success);

        // The record is persisted as approved.
        let approvals = h.store.approvals().await;
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_approval_timeout_no_dispatch() {
        let h = harness(
            BucketConfig {
                capacity: 100.0,
                refill_rate: 100.0,
            },
            Duration::from_millis(40),
        );
        let (server_id, token_id) = running_server(&h).await;
        h.store
            .upsert_policy(PolicyRule::global(
                "danger-needs-human",
                ResourceType::Tool,
                "dangerous_*",
                PolicyAction::RequireApproval,
                20,
            ))
            .await;

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "dangerous_op",
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ApprovalTimeout));

        let approvals = h.store.approvals().await;
        assert_eq!(approvals[0].status, ApprovalStatus::Expired);

        let events = tool_call_events(&h.audit).await;
        assert_eq!(events.len(), 1);
        assert!(!events[0].success);
    }

    #[tokio::test]
    async fn test_approval_rejected() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store
            .upsert_policy(PolicyRule::global(
                "danger-needs-human",
                ResourceType::Tool,
                "dangerous_*",
                PolicyAction::RequireApproval,
                20,
            ))
            .await;

        let queue = h.pipeline.approvals().clone();
        tokio::spawn(async move {
            loop {
                if let Some(record) = queue.pending().first() {
                    let _ = queue.respond(
                        &record.id,
                        &ApprovalResponse::reject("ops").with_note("not today"),
                    );
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "dangerous_op",
                json!({}),
            ))
            .await
            .unwrap_err();
        let RouterError::ApprovalRejected { reason } = err else {
            panic!("expected rejection");
        };
        assert_eq!(reason.as_deref(), Some("not today"));
    }

    #[tokio::test]
    async fn test_cancellation_during_approval() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store
            .upsert_policy(PolicyRule::global(
                "danger-needs-human",
                ResourceType::Tool,
                "dangerous_*",
                PolicyAction::RequireApproval,
                20,
            ))
            .await;

        let cancel = CancellationToken::new();
        let mut request = CallRequest::tool(
            token_id,
            CallTarget::Server(server_id),
            "dangerous_op",
            json!({}),
        );
        request.cancel = cancel.clone();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = h.pipeline.call_tool(request).await.unwrap_err();
        assert!(matches!(err, RouterError::Cancelled));

        // The approval record was cancelled (expired status) and a late
        // respond is invalid-state.
        let approvals = h.store.approvals().await;
        assert_eq!(approvals[0].status, ApprovalStatus::Expired);
        let late = h
            .pipeline
            .respond_approval(&approvals[0].id, ApprovalResponse::approve("late"))
            .await;
        assert!(matches!(late, Err(RouterError::InvalidRequest { .. })));

        // Audit fired once with the cancellation recorded.
        let events = tool_call_events(&h.audit).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.as_ref().unwrap()["error"], "cancelled");
    }

    #[tokio::test]
    async fn test_remote_error_verbatim_and_tool_error_audit() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "explodes",
                json!({}),
            ))
            .await
            .unwrap_err();
        let RouterError::Remote { code, message, .. } = err else {
            panic!("expected remote error");
        };
        assert_eq!(code, -32050);
        assert_eq!(message, "downstream exploded");

        let events = h
            .audit
            .query(&AuditFilter {
                event_type: Some(AuditEventType::ToolError),
                ..Default::default()
            })
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_server_not_running() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;
        // Remove the live client: the descriptor says running, but nothing
        // is there to serve.
        h.registry.remove(&server_id);

        let err = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "read_file",
                json!({}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::ServerNotRunning));
    }

    #[tokio::test]
    async fn test_builtin_memory_through_pipeline() {
        let h = default_harness();
        let token = Token::issue(ClientId::from("c1"), "t", None);
        let token_id = token.id.clone();
        h.store.insert_token(token).await.unwrap();
        h.store.upsert_policy(allow_all()).await;

        let stored = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id.clone(),
                CallTarget::Builtin,
                "store",
                json!({"key": "note", "value": 7}),
            ))
            .await
            .unwrap();
        assert!(!stored.is_error);

        let fetched = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Builtin,
                "retrieve",
                json!({"key": "note"}),
            ))
            .await
            .unwrap();
        assert_eq!(fetched.text(), "7");

        // Built-ins audit like any other call.
        let events = tool_call_events(&h.audit).await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.success));
    }

    #[tokio::test]
    async fn test_listing_includes_builtins_and_respects_token() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;

        let tools = h.pipeline.list_tools(&token_id, None).await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.tool.name.as_str()).collect();
        assert!(names.contains(&"filesystem.read_file"));
        assert!(names.contains(&"memory.store"));

        // A token without access to the server sees only built-ins.
        let other = Token::issue(ClientId::from("c2"), "t", None);
        let other_id = other.id.clone();
        h.store.insert_token(other).await.unwrap();
        let tools = h.pipeline.list_tools(&other_id, None).await.unwrap();
        assert!(tools.iter().all(|t| t.tool.name.starts_with("memory.")));
        let _ = server_id;
    }

    #[tokio::test]
    async fn test_project_scoping() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;

        // Project that does NOT include the server.
        let project = Project::new("Other Project");
        let slug = project.slug.clone();
        h.store.upsert_project(project).await.unwrap();

        let mut request = CallRequest::tool(
            token_id.clone(),
            CallTarget::Server(server_id.clone()),
            "read_file",
            json!({}),
        );
        request.project = Some(slug);
        let err = h.pipeline.call_tool(request).await.unwrap_err();
        assert!(matches!(err, RouterError::ServerNotFound));

        // Unknown project.
        let mut request = CallRequest::tool(
            token_id.clone(),
            CallTarget::Server(server_id.clone()),
            "read_file",
            json!({}),
        );
        request.project = Some("no-such-project".to_string());
        let err = h.pipeline.call_tool(request).await.unwrap_err();
        assert!(matches!(err, RouterError::ProjectNotFound));

        // Inactive project.
        let inactive = Project::new("Sleepy").deactivated();
        let sleepy_slug = inactive.slug.clone();
        h.store.upsert_project(inactive).await.unwrap();
        let mut request = CallRequest::tool(
            token_id,
            CallTarget::Server(server_id),
            "read_file",
            json!({}),
        );
        request.project = Some(sleepy_slug);
        let err = h.pipeline.call_tool(request).await.unwrap_err();
        assert!(matches!(err, RouterError::ProjectInactive));
    }

    #[tokio::test]
    async fn test_policy_conditions_on_args() {
        let h = default_harness();
        let (server_id, token_id) = running_server(&h).await;
        h.store.upsert_policy(allow_all()).await;
        h.store
            .upsert_policy(
                PolicyRule::global(
                    "deny-root-writes",
                    ResourceType::Tool,
                    "write_*",
                    PolicyAction::Deny,
                    50,
                )
                .with_condition("args", mcpr_policy::ConditionOp::Matches, json!("")),
            )
            .await;

        // The metadata field is `args`, a JSON object - `matches` on a
        // non-string is false, so this rule never fires and the allow rule
        // wins.
        let result = h
            .pipeline
            .call_tool(CallRequest::tool(
                token_id,
                CallTarget::Server(server_id),
                "write_file",
                json!({"path": "/tmp/ok"}),
            ))
            .await;
        assert!(result.is_ok());
    }
}
