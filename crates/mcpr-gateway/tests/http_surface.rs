//! End-to-end exercises of the HTTP surface against an in-process fake
//! downstream server.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use mcpr_auth::Token;
use mcpr_client::{ClientConfig, McpClient};
use mcpr_config::GatewayConfig;
use mcpr_core::{ClientId, Project, ServerDescriptor, ServerStatus, TokenId, TransportKind};
use mcpr_gateway::boot;
use mcpr_gateway::state::SharedState;
use mcpr_policy::{PolicyAction, PolicyRule, ResourceType};
use mcpr_protocol::{JsonRpcMessage, JsonRpcResponse};
use mcpr_transport::TransportChannels;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

/// A fake downstream answering initialize / tools/list / tools/call.
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
                        { "name": "read_file", "inputSchema": {"type": "object"} }
                    ]}),
                ),
                "tools/call" => JsonRpcResponse::success(
                    req.id,
                    json!({ "content": [ { "type": "text", "text": "file contents" } ] }),
                ),
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

struct TestGateway {
    state: SharedState,
    token: TokenId,
}

async fn gateway(config: GatewayConfig) -> TestGateway {
    let state = boot::build(config).await.unwrap();

    // One fake running server named Filesystem.
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
    state.store.upsert_server(server).await;

    let client = McpClient::from_channels(
        server_id.clone(),
        "Filesystem",
        fake_server_channels(),
        ClientConfig::default(),
    )
    .await
    .unwrap();
    state.registry.insert(Arc::new(client));
    state.aggregator.invalidate(&server_id);

    // Allow everything by default; individual tests add deny rules.
    state
        .store
        .upsert_policy(PolicyRule::global(
            "allow-all",
            ResourceType::Tool,
            "*",
            PolicyAction::Allow,
            0,
        ))
        .await;

    let token = Token::issue(ClientId::from("c1"), "test", None).with_server_access(server_id);
    let token_id = token.id.clone();
    state.store.insert_token(token).await.unwrap();

    TestGateway {
        state,
        token: token_id,
    }
}

async fn post_mcp(gw: &TestGateway, bearer: Option<&str>, body: Value) -> (StatusCode, Value) {
    let app = boot::app(Arc::clone(&gw.state));
    let mut request = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json");
    if let Some(bearer) = bearer {
        request = request.header("authorization", format!("Bearer {bearer}"));
    }
    let response = app
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health_is_unauthenticated() {
    let gw = gateway(GatewayConfig::default()).await;
    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_bearer_is_401() {
    let gw = gateway(GatewayConfig::default()).await;
    let (status, _) = post_mcp(
        &gw,
        None,
        json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_tools_list_merges_servers_and_builtins() {
    let gw = gateway(GatewayConfig::default()).await;
    let (status, body) = post_mcp(
        &gw,
        Some(gw.token.as_str()),
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"filesystem.read_file"));
    assert!(names.contains(&"memory.store"));
}

#[tokio::test]
async fn test_tool_call_happy_path() {
    let gw = gateway(GatewayConfig::default()).await;
    let (status, body) = post_mcp(
        &gw,
        Some(gw.token.as_str()),
        json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/call",
            "params": {"name": "filesystem.read_file", "arguments": {"path": "/a"}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 7);
    assert_eq!(body["result"]["content"][0]["text"], "file contents");
}

#[tokio::test]
async fn test_policy_denial_is_jsonrpc_error_over_200() {
    let gw = gateway(GatewayConfig::default()).await;
    gw.state
        .store
        .upsert_policy(PolicyRule::global(
            "no-writes",
            ResourceType::Tool,
            "write_*",
            PolicyAction::Deny,
            10,
        ))
        .await;

    let (status, body) = post_mcp(
        &gw,
        Some(gw.token.as_str()),
        json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "filesystem.write_file", "arguments": {}}
        }),
    )
    .await;
    // Method failures surface as JSON-RPC errors with a 2xx transport
    // status.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], -32003);
    assert_eq!(body["error"]["message"], "Denied by policy");
}

#[tokio::test]
async fn test_invalid_token_is_32001() {
    let gw = gateway(GatewayConfig::default()).await;
    let (status, body) = post_mcp(
        &gw,
        Some("not-a-real-token"),
        json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": {"name": "filesystem.read_file", "arguments": {}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], -32001);
}

#[tokio::test]
async fn test_unknown_method_is_32601() {
    let gw = gateway(GatewayConfig::default()).await;
    let (_, body) = post_mcp(
        &gw,
        Some(gw.token.as_str()),
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/destroy"}),
    )
    .await;
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn test_malformed_body_is_32600_with_null_id() {
    let gw = gateway(GatewayConfig::default()).await;
    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("authorization", format!("Bearer {}", gw.token.as_str()))
                .header("content-type", "application/json")
                .body(Body::from("this is not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn test_unknown_project_is_404() {
    let gw = gateway(GatewayConfig::default()).await;
    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("authorization", format!("Bearer {}", gw.token.as_str()))
                .header("x-mcpr-project", "no-such-project")
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_inactive_project_is_403() {
    let gw = gateway(GatewayConfig::default()).await;
    let project = Project::new("Dormant").deactivated();
    let slug = project.slug.clone();
    gw.state.store.upsert_project(project).await.unwrap();

    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("authorization", format!("Bearer {}", gw.token.as_str()))
                .header("x-mcpr-project", slug)
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_resolved_project_is_echoed() {
    let gw = gateway(GatewayConfig::default()).await;
    let project = Project::new("Active One");
    let slug = project.slug.clone();
    let id = project.id.to_string();
    gw.state.store.upsert_project(project).await.unwrap();

    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("authorization", format!("Bearer {}", gw.token.as_str()))
                .header("x-mcpr-project", slug)
                .body(Body::from(
                    json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("X-MCPR-Project").unwrap(),
        id.as_str()
    );
}

#[tokio::test]
async fn test_disallowed_origin_is_403() {
    let gw = gateway(GatewayConfig::default()).await;
    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("origin", "https://evil.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_allowed_origin_passes() {
    let mut config = GatewayConfig::default();
    config
        .http
        .allowed_origins
        .push("http://localhost:3000".to_string());
    let gw = gateway(config).await;

    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("origin", "http://localhost:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_global_rate_limit_trips() {
    let mut config = GatewayConfig::default();
    config.http.rate_limit.global.capacity = 2.0;
    config.http.rate_limit.global.refill_rate = 0.0;
    let gw = gateway(config).await;

    for _ in 0..2 {
        let (status, _) = post_mcp(
            &gw,
            Some(gw.token.as_str()),
            json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, _) = post_mcp(
        &gw,
        Some(gw.token.as_str()),
        json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_security_headers_present() {
    let gw = gateway(GatewayConfig::default()).await;
    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_status_reports_servers() {
    let gw = gateway(GatewayConfig::default()).await;
    let app = boot::app(Arc::clone(&gw.state));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["servers"][0]["slug"], "filesystem");
    assert_eq!(body["servers"][0]["status"], "running");
}
