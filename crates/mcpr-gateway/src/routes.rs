//! Route handlers.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mcpr_approval::ApprovalResponse;
use mcpr_core::{Project, SessionId, TokenId};
use mcpr_policy::ResourceType;
use mcpr_protocol::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, error_codes, methods,
};
use mcpr_router::{Aggregator, BUILTIN_SLUG, CallRequest, CallTarget, RouterError};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::middleware::bearer_from_value;
use crate::state::SharedState;

/// Assemble the route table (middleware is layered in `boot`).
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/mcp", post(mcp_post))
        .route("/mcp/sse", get(sse_open))
        .route("/mcp/messages", post(sse_message))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/approvals", get(approvals_list))
        .route("/approvals/{id}", post(approvals_respond))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health & status (unauthenticated)
// ---------------------------------------------------------------------------

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn status(State(state): State<SharedState>) -> Json<Value> {
    let servers: Vec<Value> = state
        .manager
        .statuses()
        .await
        .into_iter()
        .map(|view| {
            json!({
                "id": view.server.id.to_string(),
                "name": view.server.name,
                "slug": view.server.slug(),
                "transport": view.server.transport.name(),
                "status": view.server.status.to_string(),
                "health": view.health.map(|h| h.to_string()),
                "connection": view.connection,
                "pid": view.pid,
                "lastError": view.server.last_error,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "sseSessions": state.sse.len(),
        "servers": servers,
    }))
}

// ---------------------------------------------------------------------------
// /mcp - the JSON-RPC entry point
// ---------------------------------------------------------------------------

async fn mcp_post(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(token_id) = bearer(&headers) else {
        return unauthorized();
    };

    let project = match resolve_project_header(&state, &headers).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return envelope_response(response),
    };

    let id = request.id.clone();
    let response = dispatch_method(&state, &token_id, project.as_ref(), request).await;
    let response = match response {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(err) => JsonRpcResponse::error(id, err),
    };

    let mut http = Json(response).into_response();
    if let Some(project) = project {
        if let Ok(value) = HeaderValue::from_str(&project.id.to_string()) {
            http.headers_mut().insert("X-MCPR-Project", value);
        }
    }
    http
}

/// Demultiplex one JSON-RPC method onto the pipeline.
async fn dispatch_method(
    state: &SharedState,
    token_id: &TokenId,
    project: Option<&Project>,
    request: JsonRpcRequest,
) -> Result<Value, JsonRpcError> {
    let project_ref = project.map(|p| p.id.to_string());
    let params = request.params.unwrap_or(Value::Null);

    match request.method.as_str() {
        methods::PING => Ok(json!({})),

        methods::TOOLS_LIST => {
            let tools = state
                .pipeline
                .list_tools(token_id, project_ref.as_deref())
                .await
                .map_err(|e| e.to_jsonrpc())?;
            let tools: Vec<Value> = tools
                .iter()
                .map(|t| {
                    let mut value = serde_json::to_value(&t.tool).unwrap_or_default();
                    value["serverId"] = json!(t.server_id.to_string());
                    value["serverName"] = json!(t.server_name);
                    value
                })
                .collect();
            Ok(json!({ "tools": tools }))
        }

        methods::TOOLS_CALL => {
            let (target, name) = resolve_tool_target(state, &params).await?;
            let arguments = params
                .get("arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            let mut call = CallRequest::tool(token_id.clone(), target, name, arguments);
            call.project = project_ref;
            let result = state.pipeline.call_tool(call).await.map_err(|e| e.to_jsonrpc())?;
            serde_json::to_value(&result)
                .map_err(|_| JsonRpcError::new(error_codes::INTERNAL_ERROR, "Internal error"))
        }

        methods::RESOURCES_LIST => {
            let resources = state
                .pipeline
                .list_resources(token_id, project_ref.as_deref())
                .await
                .map_err(|e| e.to_jsonrpc())?;
            let resources: Vec<Value> = resources
                .iter()
                .map(|r| {
                    let mut value = serde_json::to_value(&r.resource).unwrap_or_default();
                    value["serverId"] = json!(r.server_id.to_string());
                    value["serverName"] = json!(r.server_name);
                    value
                })
                .collect();
            Ok(json!({ "resources": resources }))
        }

        methods::RESOURCES_READ => {
            let uri = require_str(&params, "uri")?;
            let (slug, original) = Aggregator::split_uri(uri).ok_or_else(|| {
                JsonRpcError::new(error_codes::INVALID_PARAMS, "uri is not an mcpr:// uri")
            })?;
            let server = state
                .aggregator
                .server_by_slug(slug)
                .await
                .map_err(|e| e.to_jsonrpc())?;
            let mut call = CallRequest::tool(
                token_id.clone(),
                CallTarget::Server(server.id),
                original,
                Value::Null,
            );
            call.resource_type = ResourceType::Resource;
            call.project = project_ref;
            let contents = state
                .pipeline
                .read_resource(call)
                .await
                .map_err(|e| e.to_jsonrpc())?;
            Ok(json!({ "contents": contents }))
        }

        methods::PROMPTS_LIST => {
            let prompts = state
                .pipeline
                .list_prompts(token_id, project_ref.as_deref())
                .await
                .map_err(|e| e.to_jsonrpc())?;
            let prompts: Vec<Value> = prompts
                .iter()
                .map(|p| {
                    let mut value = serde_json::to_value(&p.prompt).unwrap_or_default();
                    value["serverId"] = json!(p.server_id.to_string());
                    value["serverName"] = json!(p.server_name);
                    value
                })
                .collect();
            Ok(json!({ "prompts": prompts }))
        }

        methods::PROMPTS_GET => {
            let name = require_str(&params, "name")?;
            let (slug, original) = Aggregator::split_name(name).ok_or_else(|| {
                JsonRpcError::new(error_codes::INVALID_PARAMS, "name is not namespaced")
            })?;
            let server = state
                .aggregator
                .server_by_slug(slug)
                .await
                .map_err(|e| e.to_jsonrpc())?;
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            let mut call = CallRequest::tool(
                token_id.clone(),
                CallTarget::Server(server.id),
                original,
                arguments,
            );
            call.project = project_ref;
            let prompt = state
                .pipeline
                .get_prompt(call)
                .await
                .map_err(|e| e.to_jsonrpc())?;
            serde_json::to_value(&prompt)
                .map_err(|_| JsonRpcError::new(error_codes::INTERNAL_ERROR, "Internal error"))
        }

        other => {
            debug!(method = other, "unknown method");
            Err(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                "Method not found",
            ))
        }
    }
}

/// Accept both calling conventions: an explicit `server_id` + `tool_name`
/// pair, or a single namespaced `name`.
async fn resolve_tool_target(
    state: &SharedState,
    params: &Value,
) -> Result<(CallTarget, String), JsonRpcError> {
    if let Some(server_ref) = params.get("server_id").and_then(Value::as_str) {
        let tool_name = require_str(params, "tool_name")?;
        let server = find_server(state, server_ref).await?;
        return Ok((CallTarget::Server(server), tool_name.to_string()));
    }

    let name = require_str(params, "name")?;
    let (slug, original) = Aggregator::split_name(name).ok_or_else(|| {
        JsonRpcError::new(
            error_codes::INVALID_PARAMS,
            "tool name is not namespaced as <server>.<tool>",
        )
    })?;

    if slug == BUILTIN_SLUG {
        return Ok((CallTarget::Builtin, original.to_string()));
    }
    let server = state
        .aggregator
        .server_by_slug(slug)
        .await
        .map_err(|e| e.to_jsonrpc())?;
    Ok((CallTarget::Server(server.id), original.to_string()))
}

async fn find_server(
    state: &SharedState,
    server_ref: &str,
) -> Result<mcpr_core::ServerId, JsonRpcError> {
    if let Some(id) = mcpr_core::ServerId::parse(server_ref) {
        if state.store.server(&id).await.is_some() {
            return Ok(id);
        }
    }
    // Fall back to slug resolution so clients may use either form.
    state
        .aggregator
        .server_by_slug(server_ref)
        .await
        .map(|s| s.id)
        .map_err(|e| e.to_jsonrpc())
}

// ---------------------------------------------------------------------------
// SSE pair
// ---------------------------------------------------------------------------

async fn sse_open(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if bearer(&headers).is_none() {
        return unauthorized();
    }
    let (session_id, sse) = state.sse.open();
    debug!(session = %session_id, "sse stream handed to client");
    sse.into_response()
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn sse_message(
    State(state): State<SharedState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(token_id) = bearer(&headers) else {
        return unauthorized();
    };
    let Some(session_id) = SessionId::parse(&query.session_id) else {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    };
    if !state.sse.exists(&session_id) {
        return (StatusCode::NOT_FOUND, "unknown session").into_response();
    }

    let project = match resolve_project_header(&state, &headers).await {
        Ok(project) => project,
        Err(response) => return response,
    };

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(error) => {
            state
                .sse
                .send(&session_id, &JsonRpcResponse { jsonrpc: mcpr_protocol::JsonRpcVersion, id: None, result: None, error: Some(error) }.into());
            return StatusCode::ACCEPTED.into_response();
        }
    };

    let id = request.id.clone();
    let outcome = dispatch_method(&state, &token_id, project.as_ref(), request).await;
    let response = match outcome {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(error) => JsonRpcResponse::error(id, error),
    };
    state.sse.send(&session_id, &response.into());
    StatusCode::ACCEPTED.into_response()
}

// ---------------------------------------------------------------------------
// Approvals surface
// ---------------------------------------------------------------------------

async fn approvals_list(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if bearer(&headers).is_none() {
        return unauthorized();
    }
    let pending = state.pipeline.approvals().pending();
    Json(json!({ "pending": pending })).into_response()
}

#[derive(Debug, Deserialize)]
struct RespondBody {
    approved: bool,
    #[serde(default)]
    note: Option<String>,
    #[serde(default)]
    responded_by: Option<String>,
}

async fn approvals_respond(
    State(state): State<SharedState>,
    axum::extract::Path(id): axum::extract::Path<String>,
    headers: HeaderMap,
    Json(body): Json<RespondBody>,
) -> Response {
    if bearer(&headers).is_none() {
        return unauthorized();
    }
    let Some(approval_id) = mcpr_core::ApprovalId::parse(&id) else {
        return (StatusCode::NOT_FOUND, "unknown approval").into_response();
    };

    let response = ApprovalResponse {
        approved: body.approved,
        responded_by: body.responded_by,
        note: body.note,
    };
    match state.pipeline.respond_approval(&approval_id, response).await {
        Ok(record) => Json(json!({ "approval": record })).into_response(),
        Err(RouterError::InvalidRequest { message }) => {
            (StatusCode::CONFLICT, message).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.user_message()).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn bearer(headers: &HeaderMap) -> Option<TokenId> {
    let value = headers.get("authorization")?.to_str().ok()?;
    bearer_from_value(value).map(TokenId::new)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Bearer")],
        "missing or invalid bearer token",
    )
        .into_response()
}

/// Resolve the optional `X-MCPR-Project` header. Missing means global
/// scope; unknown is 404, inactive is 403.
async fn resolve_project_header(
    state: &SharedState,
    headers: &HeaderMap,
) -> Result<Option<Project>, Response> {
    let Some(raw) = headers.get("x-mcpr-project") else {
        return Ok(None);
    };
    let Ok(raw) = raw.to_str() else {
        return Err((StatusCode::BAD_REQUEST, "invalid project header").into_response());
    };

    match state.store.find_project(raw).await {
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "PROJECT_NOT_FOUND" })),
        )
            .into_response()),
        Some(project) if !project.active => Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "PROJECT_INACTIVE" })),
        )
            .into_response()),
        Some(project) => Ok(Some(project)),
    }
}

/// Parse the body into a single JSON-RPC request. Envelope problems map to
/// the standard codes with a 2xx transport status.
fn parse_request(body: &str) -> Result<JsonRpcRequest, JsonRpcError> {
    match JsonRpcMessage::from_str(body) {
        Ok(JsonRpcMessage::Request(request)) => Ok(request),
        Ok(_) => Err(JsonRpcError::new(
            error_codes::INVALID_REQUEST,
            "expected a JSON-RPC request",
        )),
        Err(_) => Err(JsonRpcError::new(
            error_codes::INVALID_REQUEST,
            "body is not a JSON-RPC request",
        )),
    }
}

fn envelope_response(error: JsonRpcError) -> Response {
    Json(JsonRpcResponse {
        jsonrpc: mcpr_protocol::JsonRpcVersion,
        id: None,
        result: None,
        error: Some(error),
    })
    .into_response()
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, JsonRpcError> {
    params.get(key).and_then(Value::as_str).ok_or_else(|| {
        JsonRpcError::new(
            error_codes::INVALID_PARAMS,
            format!("missing required parameter: {key}"),
        )
    })
}
