#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for the HTTP gateway against the mock echo server.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use toolhost_core::{
    CommandSpec, InMemoryServerRegistry, ServerConfig, SourceProvisioner, ToolhostResult,
};
use toolhost_gateway::{GatewayServer, McpAdapter};
use toolhost_mcp::TransportConfig;
use toolhost_supervisor::{ProcessSupervisor, SupervisorConfig};
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn mock_config(id: &str) -> ServerConfig {
    let script = concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures/mock-echo-server.sh");
    ServerConfig::new(id, CommandSpec::Argv(vec!["sh".into(), script.into()]))
}

fn build_adapter(configs: Vec<ServerConfig>) -> Arc<McpAdapter> {
    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        start_grace_ms: 100,
        stop_grace_ms: 1_000,
        restart_pause_ms: 50,
        ..SupervisorConfig::default()
    });
    let registry = Arc::new(InMemoryServerRegistry::from_configs(configs));
    let settings = TransportConfig {
        request_timeout_secs: 5,
        handshake_timeout_secs: 5,
        ..TransportConfig::default()
    };
    Arc::new(McpAdapter::new(supervisor, registry, settings))
}

/// Serve the gateway on a random port, returning its base URL.
async fn start_test_server(adapter: Arc<McpAdapter>) -> String {
    let app = GatewayServer::build(adapter);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://127.0.0.1:{}", addr.port())
}

async fn post_json(url: &str, body: Value) -> (StatusCode, Value) {
    let resp = reqwest::Client::new().post(url).json(&body).send().await.unwrap();
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
    (status, resp.json().await.unwrap())
}

async fn oneshot(adapter: &Arc<McpAdapter>, request: Request<Body>) -> (StatusCode, Value) {
    let resp = GatewayServer::build(Arc::clone(adapter))
        .oneshot(request)
        .await
        .unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ---------------------------------------------------------------------------
// 1. Routing without a server process
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_endpoint() {
    let adapter = build_adapter(vec![]);
    let (status, body) = oneshot(
        &adapter,
        Request::get("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "toolhost");
}

#[tokio::test]
async fn unknown_server_is_not_found() {
    let adapter = build_adapter(vec![]);
    let (status, body) = oneshot(
        &adapter,
        Request::post("/servers/ghost/tools/call")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"name":"echo"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["jsonrpc"], "2.0");
    assert!(body["error"]["message"].as_str().unwrap().contains("ghost"));

    let (status, _) = oneshot(
        &adapter,
        Request::get("/servers/ghost/status").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_body_is_a_parse_error() {
    let adapter = build_adapter(vec![mock_config("s1")]);
    let (status, body) = oneshot(
        &adapter,
        Request::post("/servers/s1/rpc")
            .body(Body::from("{not json"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32700);
}

// ---------------------------------------------------------------------------
// 2. Tool calls end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_and_call_through_http() {
    let adapter = build_adapter(vec![mock_config("s1")]);
    let base = start_test_server(Arc::clone(&adapter)).await;

    let (status, body) = post_json(&format!("{base}/servers/s1/tools/list"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], Value::Null);
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools[0]["name"], "echo");
    assert!(tools[0]["inputSchema"].is_object());

    let (status, body) = post_json(
        &format!("{base}/servers/s1/tools/call"),
        json!({"name": "echo", "arguments": {"text": "hi"}}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["content"], json!(["hi"]));
    assert_eq!(body["result"]["isError"], false);

    // Raw JSON-RPC echoes the caller's id.
    let (status, body) = post_json(
        &format!("{base}/servers/s1/rpc"),
        json!({
            "jsonrpc": "2.0",
            "id": 77,
            "method": "tools/call",
            "params": {"name": "mixed", "arguments": {}}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 77);
    assert_eq!(body["result"]["content"][0], "héllo");
    assert_eq!(body["result"]["content"][1], "hi\u{fffd}");

    let status: Value = reqwest::get(format!("{base}/servers/s1/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "running");
    assert_eq!(status["connected"], true);

    adapter.cleanup("s1").await.unwrap();
}

#[tokio::test]
async fn tool_errors_are_http_200() {
    let adapter = build_adapter(vec![mock_config("s1")]);
    let base = start_test_server(Arc::clone(&adapter)).await;

    let (status, body) = post_json(
        &format!("{base}/servers/s1/tools/call"),
        json!({"name": "fail"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], -32000);
    assert_eq!(body["error"]["message"], "tool failed");
    assert_eq!(body["error"]["data"]["remoteCode"], -32001);

    let (status, body) = post_json(
        &format!("{base}/servers/s1/tools/call"),
        json!({"arguments": {"text": "no name"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32602);

    adapter.cleanup("s1").await.unwrap();
}

#[tokio::test]
async fn concurrent_first_requests_share_one_process() {
    let adapter = build_adapter(vec![mock_config("s1")]);
    let base = start_test_server(Arc::clone(&adapter)).await;

    let url = format!("{base}/servers/s1/tools/call");
    let (a, b) = tokio::join!(
        post_json(&url, json!({"name": "echo", "arguments": {"text": "a"}})),
        post_json(&url, json!({"name": "echo", "arguments": {"text": "b"}}))
    );
    assert_eq!(a.1["result"]["content"], json!(["a"]));
    assert_eq!(b.1["result"]["content"], json!(["b"]));
    assert_eq!(adapter.client_count().await, 1);
    assert_eq!(adapter.supervisor().process_count().await, 1);

    adapter.cleanup("s1").await.unwrap();
}

// ---------------------------------------------------------------------------
// 3. Lifecycle endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_then_start_over_http() {
    let adapter = build_adapter(vec![mock_config("s1")]);
    let base = start_test_server(Arc::clone(&adapter)).await;
    let call = format!("{base}/servers/s1/tools/call");
    let echo = json!({"name": "echo", "arguments": {"text": "hi"}});

    let (_, body) = post_json(&call, echo.clone()).await;
    assert_eq!(body["result"]["content"], json!(["hi"]));

    let (status, body) = post_json(&format!("{base}/servers/s1/stop"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);
    assert_eq!(body["status"], "stopped");

    // A stopped server is not restarted behind the caller's back.
    let (status, body) = post_json(&call, echo.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Not connected"));
    assert_eq!(adapter.supervisor().process_count().await, 0);

    let (status, body) = post_json(&format!("{base}/servers/s1/start"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (_, body) = post_json(&call, echo).await;
    assert_eq!(body["result"]["content"], json!(["hi"]));

    let logs: Value = reqwest::get(format!("{base}/servers/s1/logs?tail=50"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let lines = logs["lines"].as_array().unwrap();
    assert!(lines.iter().any(|l| l == "mock-echo-server listening on stdio"));

    let messages: Value = reqwest::get(format!("{base}/servers/s1/messages"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(messages["messages"].is_array());

    let resp = reqwest::Client::new()
        .delete(format!("{base}/servers/s1/client"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["disconnected"], true);
    assert_eq!(adapter.client_count().await, 0);
    // Dropping the client leaves the process running.
    assert_eq!(adapter.supervisor().process_count().await, 1);

    let servers: Value = reqwest::get(format!("{base}/servers"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(servers["servers"][0]["server_id"], "s1");
    assert_eq!(servers["servers"][0]["connected"], false);

    adapter.cleanup("s1").await.unwrap();
}

#[tokio::test]
async fn failed_start_is_a_json_rpc_error() {
    let broken = ServerConfig::new(
        "bad",
        CommandSpec::Argv(vec!["/nonexistent/mcp-server".into()]),
    );
    let adapter = build_adapter(vec![broken]);
    let base = start_test_server(Arc::clone(&adapter)).await;

    let (status, body) = post_json(&format!("{base}/servers/bad/start"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jsonrpc"], "2.0");
    assert!(body["id"].is_null());
    assert_eq!(body["error"]["code"], -32000);
    assert!(body["error"]["message"].as_str().unwrap().contains("Spawn"));

    // Same envelope as a tool route hitting the same failure.
    let (list_status, list_body) =
        post_json(&format!("{base}/servers/bad/tools/list"), json!({})).await;
    assert_eq!(list_status, status);
    assert_eq!(list_body["error"]["code"], body["error"]["code"]);

    let (status, body) = post_json(&format!("{base}/servers/ghost/stop"), json!({})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["jsonrpc"], "2.0");
}

#[tokio::test]
async fn restart_gives_new_pid() {
    let adapter = build_adapter(vec![mock_config("s1")]);
    let base = start_test_server(Arc::clone(&adapter)).await;

    let (_, first) = post_json(&format!("{base}/servers/s1/start"), json!({})).await;
    let (status, second) = post_json(&format!("{base}/servers/s1/restart"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(first["pid"], second["pid"]);

    adapter.cleanup("s1").await.unwrap();
}

// ---------------------------------------------------------------------------
// 4. Source provisioning
// ---------------------------------------------------------------------------

struct FixtureDir;

#[async_trait]
impl SourceProvisioner for FixtureDir {
    async fn ensure(&self, _server_id: &str) -> ToolhostResult<PathBuf> {
        Ok(PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../../fixtures")))
    }
}

#[tokio::test]
async fn provisioner_supplies_working_directory() {
    let supervisor = ProcessSupervisor::new(SupervisorConfig {
        start_grace_ms: 100,
        ..SupervisorConfig::default()
    });
    let registry = Arc::new(InMemoryServerRegistry::from_configs(vec![ServerConfig::new(
        "rel",
        "sh mock-echo-server.sh",
    )]));
    let adapter = Arc::new(
        McpAdapter::new(supervisor, registry, TransportConfig::default())
            .with_provisioner(Arc::new(FixtureDir)),
    );

    let tools = adapter.list_tools("rel").await.unwrap();
    assert_eq!(tools.len(), 7);

    adapter.cleanup("rel").await.unwrap();
}
