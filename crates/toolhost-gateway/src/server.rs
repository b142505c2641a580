use crate::adapter::{AdapterResponse, McpAdapter};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use toolhost_core::ToolhostError;
use tracing::{info, warn};

const DEFAULT_LOG_TAIL: usize = 100;

/// The HTTP gateway.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the router over a shared adapter.
    pub fn build(adapter: Arc<McpAdapter>) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/servers", get(list_servers))
            .route("/servers/{id}/status", get(server_status))
            .route("/servers/{id}/logs", get(server_logs))
            .route("/servers/{id}/messages", get(server_messages))
            .route("/servers/{id}/start", post(start_server))
            .route("/servers/{id}/stop", post(stop_server))
            .route("/servers/{id}/restart", post(restart_server))
            .route("/servers/{id}/client", delete(disconnect_client))
            .route("/servers/{id}/tools/list", get(rpc_handler).post(rpc_handler))
            .route("/servers/{id}/tools/call", post(rpc_handler))
            .route("/servers/{id}/rpc", post(rpc_handler))
            .with_state(adapter)
    }
}

type JsonReply = (StatusCode, Json<Value>);

/// Management routes fail with the same JSON-RPC envelope and status
/// mapping as the tool routes.
fn error_reply(err: &ToolhostError) -> JsonReply {
    let reply = AdapterResponse::from_error(Value::Null, err);
    (reply.status, Json(reply.body))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "toolhost"}))
}

async fn list_servers(State(adapter): State<Arc<McpAdapter>>) -> JsonReply {
    match adapter.overview().await {
        Ok(rows) => (StatusCode::OK, Json(json!({ "servers": rows }))),
        Err(e) => error_reply(&e),
    }
}

async fn server_status(
    State(adapter): State<Arc<McpAdapter>>,
    Path(id): Path<String>,
) -> JsonReply {
    match adapter.server_status(&id).await {
        Ok(row) => (StatusCode::OK, Json(json!(row))),
        Err(e) => error_reply(&e),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    tail: Option<usize>,
}

async fn server_logs(
    State(adapter): State<Arc<McpAdapter>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> JsonReply {
    if let Err(e) = adapter.registry().get_config(&id).await {
        return error_reply(&e);
    }
    let lines = adapter
        .supervisor()
        .get_logs(&id, query.tail.unwrap_or(DEFAULT_LOG_TAIL));
    (StatusCode::OK, Json(json!({"server_id": id, "lines": lines})))
}

async fn server_messages(
    State(adapter): State<Arc<McpAdapter>>,
    Path(id): Path<String>,
) -> JsonReply {
    if let Err(e) = adapter.registry().get_config(&id).await {
        return error_reply(&e);
    }
    let messages = adapter.supervisor().get_protocol_messages(&id).await;
    (
        StatusCode::OK,
        Json(json!({"server_id": id, "messages": messages})),
    )
}

async fn start_server(State(adapter): State<Arc<McpAdapter>>, Path(id): Path<String>) -> JsonReply {
    match adapter.start_server(&id).await {
        Ok(pid) => {
            info!(server_id = %id, pid, "Server started over HTTP");
            let status = adapter.supervisor().get_status(&id).await;
            (
                StatusCode::OK,
                Json(json!({"server_id": id, "pid": pid, "status": status})),
            )
        }
        Err(e) => {
            warn!(server_id = %id, error = %e, "Start failed");
            error_reply(&e)
        }
    }
}

async fn stop_server(State(adapter): State<Arc<McpAdapter>>, Path(id): Path<String>) -> JsonReply {
    match adapter.stop_server(&id).await {
        Ok(stopped) => {
            let status = adapter.supervisor().get_status(&id).await;
            (
                StatusCode::OK,
                Json(json!({"server_id": id, "stopped": stopped, "status": status})),
            )
        }
        Err(e) => error_reply(&e),
    }
}

async fn restart_server(
    State(adapter): State<Arc<McpAdapter>>,
    Path(id): Path<String>,
) -> JsonReply {
    match adapter.restart_server(&id).await {
        Ok(pid) => {
            let status = adapter.supervisor().get_status(&id).await;
            (
                StatusCode::OK,
                Json(json!({"server_id": id, "pid": pid, "status": status})),
            )
        }
        Err(e) => {
            warn!(server_id = %id, error = %e, "Restart failed");
            error_reply(&e)
        }
    }
}

async fn disconnect_client(
    State(adapter): State<Arc<McpAdapter>>,
    Path(id): Path<String>,
) -> JsonReply {
    let disconnected = adapter.disconnect(&id).await;
    (
        StatusCode::OK,
        Json(json!({"server_id": id, "disconnected": disconnected})),
    )
}

/// `tools/list`, `tools/call` and raw JSON-RPC. An empty body counts as `{}`.
async fn rpc_handler(
    State(adapter): State<Arc<McpAdapter>>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> JsonReply {
    let body: Value = if body.iter().all(u8::is_ascii_whitespace) {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "jsonrpc": "2.0",
                        "id": null,
                        "error": {"code": -32700, "message": format!("Parse error: {e}")}
                    })),
                )
            }
        }
    };

    let reply = adapter.handle_request(&id, &method, uri.path(), body).await;
    (reply.status, Json(reply.body))
}
